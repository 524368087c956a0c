//! The operation abstraction and the per-operation bookkeeping of a
//! `ResourceManager`.

use std::any::{Any, TypeId};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use smallvec::SmallVec;

use super::chain::ChainOperation;
use super::group::GroupOperation;
use super::handle::{AsyncOperationHandle, OperationHandle, OperationStatus};
use super::manager::ResourceManager;
use super::provider::ProviderOperation;
use crate::errors::*;
use crate::utils::latch::LockLatch;

/// The runtime type of the result an operation produces.
#[derive(Debug, Clone, Copy)]
pub struct ResultType {
    id: TypeId,
    name: &'static str,
}

impl ResultType {
    #[inline]
    pub fn of<T: 'static>() -> Self {
        ResultType {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The untyped request which accepts any kind of result.
    #[inline]
    pub fn any() -> Self {
        ResultType {
            id: TypeId::of::<dyn Any>(),
            name: "dyn Any",
        }
    }

    #[inline]
    pub fn id(&self) -> TypeId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn is_any(&self) -> bool {
        self.id == TypeId::of::<dyn Any>()
    }

    /// Returns true if a result of type `actual` could be handed out as `self`.
    #[inline]
    pub fn accepts(&self, actual: ResultType) -> bool {
        self.is_any() || self.id == actual.id
    }
}

impl PartialEq for ResultType {
    fn eq(&self, rhs: &Self) -> bool {
        self.id == rhs.id
    }
}

impl Eq for ResultType {}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A user-defined asynchronous operation. Once started with
/// `ResourceManager::start_operation`, `execute` is called as soon as the
/// dependency (if any) is done. The operation must eventually finish itself
/// with `ResourceManager::complete` (or `succeed`/`fail`).
pub trait AsyncOperation: 'static {
    type Output: 'static;

    /// Begins the actual work. Could complete synchronously.
    fn execute(&mut self, rm: &mut ResourceManager, handle: AsyncOperationHandle<Self::Output>);

    /// Called once after the last reference has been released.
    fn destroy(&mut self, _: &mut ResourceManager) {}

    /// The progress of a pending operation in `[0, 1]`.
    fn progress(&self) -> f32 {
        0.0
    }

    fn debug_name(&self) -> String {
        std::any::type_name::<Self>().to_owned()
    }

    fn dependencies(&self) -> Vec<OperationHandle> {
        Vec::new()
    }

    /// Opts into per-frame `update` ticks between `execute` and completion.
    fn is_update_receiver(&self) -> bool {
        false
    }

    fn update(
        &mut self,
        _: &mut ResourceManager,
        _: AsyncOperationHandle<Self::Output>,
        _delta: f32,
    ) {
    }
}

pub(crate) trait ErasedOperation {
    fn execute(&mut self, rm: &mut ResourceManager, handle: OperationHandle);
    fn destroy(&mut self, rm: &mut ResourceManager);
    fn progress(&self) -> f32;
    fn debug_name(&self) -> String;
    fn dependencies(&self) -> Vec<OperationHandle>;
    fn is_update_receiver(&self) -> bool;
    fn update(&mut self, rm: &mut ResourceManager, handle: OperationHandle, delta: f32);
}

impl<O: AsyncOperation> ErasedOperation for O {
    fn execute(&mut self, rm: &mut ResourceManager, handle: OperationHandle) {
        AsyncOperation::execute(self, rm, AsyncOperationHandle::new(handle))
    }

    fn destroy(&mut self, rm: &mut ResourceManager) {
        AsyncOperation::destroy(self, rm)
    }

    fn progress(&self) -> f32 {
        AsyncOperation::progress(self)
    }

    fn debug_name(&self) -> String {
        AsyncOperation::debug_name(self)
    }

    fn dependencies(&self) -> Vec<OperationHandle> {
        AsyncOperation::dependencies(self)
    }

    fn is_update_receiver(&self) -> bool {
        AsyncOperation::is_update_receiver(self)
    }

    fn update(&mut self, rm: &mut ResourceManager, handle: OperationHandle, delta: f32) {
        AsyncOperation::update(self, rm, AsyncOperationHandle::new(handle), delta)
    }
}

/// An operation whose outcome is known up front.
pub(crate) struct CompletedOperation {
    pub result: Option<Rc<dyn Any>>,
    pub error: Option<Error>,
}

/// The behaviour an operation carries, one variant per operation kind.
pub(crate) enum OperationBody {
    Completed(CompletedOperation),
    Custom(Box<dyn ErasedOperation>),
    Provider(Box<ProviderOperation>),
    Group(Box<GroupOperation>),
    Chain(Box<ChainOperation>),
}

pub(crate) type Callback = Box<dyn FnOnce(&mut ResourceManager, OperationHandle)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum CacheKey {
    Resource(u64),
    Group(u64),
}

/// The state of a live operation. An entry stays in the manager's pool from
/// creation until its reference count drops to zero.
pub(crate) struct Entry {
    pub rc: u32,
    pub status: OperationStatus,
    pub result: Option<Rc<dyn Any>>,
    pub error: Option<Error>,
    pub result_type: ResultType,
    /// `None` while a custom body is taken out to run.
    pub body: Option<OperationBody>,
    pub cache_key: Option<CacheKey>,
    pub completed: SmallVec<[Callback; 2]>,
    pub destroyed: SmallVec<[Callback; 1]>,
    pub waiter: Option<Arc<LockLatch<()>>>,
}

impl Entry {
    pub fn new(result_type: ResultType, body: OperationBody, cache_key: Option<CacheKey>) -> Self {
        Entry {
            rc: 1,
            status: OperationStatus::None,
            result: None,
            error: None,
            result_type,
            body: Some(body),
            cache_key,
            completed: SmallVec::new(),
            destroyed: SmallVec::new(),
            waiter: None,
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.status != OperationStatus::None
    }
}
