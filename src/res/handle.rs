//! Versioned handles to operations living inside a `ResourceManager`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

impl_handle!(OperationHandle);

impl_handle!(UpdateReceiverHandle);

/// The completion status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    /// The operation is still in flight.
    None,
    Succeeded,
    Failed,
}

impl Default for OperationStatus {
    fn default() -> Self {
        OperationStatus::None
    }
}

/// Anything that refers to an operation. Handles are plain values, copying one
/// does NOT acquire a reference, use `ResourceManager::acquire` for that.
pub trait OperationRef: Copy {
    fn operation(&self) -> OperationHandle;
    fn from_operation(handle: OperationHandle) -> Self;
    fn invalidate(&mut self);
}

impl OperationRef for OperationHandle {
    #[inline]
    fn operation(&self) -> OperationHandle {
        *self
    }

    #[inline]
    fn from_operation(handle: OperationHandle) -> Self {
        handle
    }

    #[inline]
    fn invalidate(&mut self) {
        OperationHandle::invalidate(self);
    }
}

/// A typed handle to an operation which produces a `T`.
pub struct AsyncOperationHandle<T> {
    handle: OperationHandle,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> AsyncOperationHandle<T> {
    #[inline]
    pub(crate) fn new(handle: OperationHandle) -> Self {
        AsyncOperationHandle {
            handle,
            _phantom: PhantomData,
        }
    }

    /// Constructs a nil handle which never resolves.
    #[inline]
    pub fn nil() -> Self {
        AsyncOperationHandle::new(OperationHandle::nil())
    }

    /// Returns true if this handle has been initialized. Use
    /// `ResourceManager::is_valid` to check whether it still resolves.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// Drops the type information.
    #[inline]
    pub fn untyped(&self) -> OperationHandle {
        self.handle
    }
}

impl<T> OperationRef for AsyncOperationHandle<T> {
    #[inline]
    fn operation(&self) -> OperationHandle {
        self.handle
    }

    #[inline]
    fn from_operation(handle: OperationHandle) -> Self {
        AsyncOperationHandle::new(handle)
    }

    #[inline]
    fn invalidate(&mut self) {
        self.handle.invalidate();
    }
}

impl<T> Clone for AsyncOperationHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AsyncOperationHandle<T> {}

impl<T> PartialEq for AsyncOperationHandle<T> {
    fn eq(&self, rhs: &Self) -> bool {
        self.handle == rhs.handle
    }
}

impl<T> Eq for AsyncOperationHandle<T> {}

impl<T> Hash for AsyncOperationHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

impl<T> Default for AsyncOperationHandle<T> {
    fn default() -> Self {
        AsyncOperationHandle::nil()
    }
}

impl<T> fmt::Debug for AsyncOperationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("AsyncOperationHandle")
            .field(&self.handle)
            .finish()
    }
}

impl<T> From<AsyncOperationHandle<T>> for OperationHandle {
    fn from(handle: AsyncOperationHandle<T>) -> Self {
        handle.handle
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::handle::HandleLike;

    #[test]
    fn typed() {
        let h = <OperationHandle as HandleLike>::new(2, 3);
        let t: AsyncOperationHandle<String> = AsyncOperationHandle::from_operation(h);
        assert_eq!(t.operation(), h);
        assert_eq!(OperationHandle::from(t), h);

        let mut t2 = t;
        assert_eq!(t, t2);
        t2.invalidate();
        assert!(!t2.is_valid());
        assert!(t.is_valid());
    }
}
