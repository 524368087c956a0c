//! Free-lists for operation bodies, so frequent load/unload cycles do not churn
//! the allocator.

use std::any::{Any, TypeId};

use crate::utils::hash::FastHashMap;

/// A body which could be put back into a clean state and reused.
pub(crate) trait Recyclable: Any + Default {
    fn reset(&mut self);
}

/// A bounded pool of recycled bodies, keyed by their type.
pub(crate) struct OperationPool {
    max_size: usize,
    pools: FastHashMap<TypeId, Vec<Box<dyn Any>>>,
}

impl OperationPool {
    pub fn new(max_size: usize) -> Self {
        OperationPool {
            max_size,
            pools: FastHashMap::default(),
        }
    }

    /// Pops a recycled body, or allocates a new one if the pool is empty.
    pub fn acquire<T: Recyclable>(&mut self) -> Box<T> {
        self.pools
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.pop())
            .and_then(|v| v.downcast::<T>().ok())
            .unwrap_or_else(|| Box::new(T::default()))
    }

    /// Resets and keeps `body` for later use. Dropped if the pool is full.
    pub fn release<T: Recyclable>(&mut self, mut body: Box<T>) {
        body.reset();

        let max_size = self.max_size;
        let pool = self.pools.entry(TypeId::of::<T>()).or_insert_with(Vec::new);
        if pool.len() < max_size {
            pool.push(body);
        }
    }

    /// Returns the number of pooled bodies of type `T`.
    pub fn len<T: Recyclable>(&self) -> usize {
        self.pools.get(&TypeId::of::<T>()).map(|v| v.len()).unwrap_or(0)
    }
}
