use super::allocator::Recyclable;
use super::handle::OperationHandle;
use super::manager::ResourceManager;

pub(crate) type ChainCallback = Box<dyn FnOnce(&mut ResourceManager, OperationHandle) -> OperationHandle>;

/// The body of an operation which waits for `dependency`, then creates the
/// operation it wraps and finishes with the wrapped result.
#[derive(Default)]
pub(crate) struct ChainOperation {
    pub dependency: Option<OperationHandle>,
    pub callback: Option<ChainCallback>,
    pub wrapped: Option<OperationHandle>,
}

impl Recyclable for ChainOperation {
    fn reset(&mut self) {
        self.dependency = None;
        self.callback = None;
        self.wrapped = None;
    }
}
