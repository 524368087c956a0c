use super::allocator::Recyclable;
use super::handle::OperationHandle;

/// The body of an operation which waits on a set of other operations. The
/// group owns one reference of every child and releases them on destroy.
#[derive(Default)]
pub(crate) struct GroupOperation {
    pub ops: Vec<OperationHandle>,
    /// Children which are done, tracked incrementally.
    pub loaded: usize,
}

impl Recyclable for GroupOperation {
    fn reset(&mut self) {
        self.ops.clear();
        self.loaded = 0;
    }
}

impl GroupOperation {
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded >= self.ops.len()
    }

    pub fn debug_name(&self) -> String {
        format!("Dependencies [{} of {}]", self.loaded, self.ops.len())
    }
}
