//! Pluggable back-ends which turn a `Location` into a typed result.

use std::any::Any;
use std::rc::Rc;
use std::sync::Arc;

use super::allocator::Recyclable;
use super::handle::{OperationHandle, OperationStatus};
use super::location::Location;
use super::manager::ResourceManager;
use super::operation::{OperationBody, ResultType};
use super::request::{CompletionSender, ProvideRequest, Request};
use crate::errors::*;
use crate::utils::latch::LockLatch;

/// Capabilities a provider could declare.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderBehaviourFlags(u32);

impl ProviderBehaviourFlags {
    pub const NONE: ProviderBehaviourFlags = ProviderBehaviourFlags(0);
    /// The provider is invoked even if some of its dependencies failed.
    pub const CAN_PROVIDE_WITH_FAILED_DEPENDENCIES: ProviderBehaviourFlags =
        ProviderBehaviourFlags(1);

    #[inline]
    pub fn contains(self, rhs: ProviderBehaviourFlags) -> bool {
        (self.0 & rhs.0) == rhs.0
    }
}

impl std::ops::BitOr for ProviderBehaviourFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        ProviderBehaviourFlags(self.0 | rhs.0)
    }
}

/// A back-end which knows how to produce results for locations.
///
/// `provide` must make sure `ProvideHandle::complete` gets called exactly once,
/// either synchronously, from a later `update` tick, or from another thread
/// through `ProvideHandle::complete_later`. Returning an error (or panicking)
/// before completing fails the operation.
pub trait ResourceProvider {
    /// The id locations refer to this provider with.
    fn provider_id(&self) -> &str;

    /// The type produced for untyped requests.
    fn default_type(&self, location: &Location) -> ResultType;

    fn can_provide(&self, ty: ResultType, location: &Location) -> bool {
        ty.is_any() || ty == self.default_type(location)
    }

    fn provide(
        &self,
        rm: &mut ResourceManager,
        handle: ProvideHandle,
    ) -> std::result::Result<(), failure::Error>;

    /// Frees whatever a successful `provide` produced.
    fn release(&self, _: &Location, _: Option<Rc<dyn Any>>) {}

    fn behaviour_flags(&self) -> ProviderBehaviourFlags {
        ProviderBehaviourFlags::NONE
    }

    /// Per-frame tick, driven by `ResourceManager::update`.
    fn update(&self, _: &mut ResourceManager, _delta: f32) {}

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// The body of an operation which loads a location with a provider.
#[derive(Default)]
pub(crate) struct ProviderOperation {
    pub provider: Option<Rc<dyn ResourceProvider>>,
    pub location: Option<Rc<Location>>,
    pub dependency: Option<OperationHandle>,
    pub requested: Option<ResultType>,
    pub provide_version: u32,
    pub progress: Option<Box<dyn Fn() -> f32>>,
}

impl Recyclable for ProviderOperation {
    fn reset(&mut self) {
        self.provider = None;
        self.location = None;
        self.dependency = None;
        self.requested = None;
        self.provide_version = 0;
        self.progress = None;
    }
}

impl ProviderOperation {
    pub fn debug_name(&self) -> String {
        match (&self.location, &self.requested) {
            (Some(location), Some(ty)) => format!("Resource<{}>({})", ty, location),
            _ => "Resource<?>".to_owned(),
        }
    }
}

/// The view a provider gets of the operation it is loading. A handle is only
/// good for one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvideHandle {
    op: OperationHandle,
    version: u32,
}

impl ProvideHandle {
    #[inline]
    pub(crate) fn new(op: OperationHandle, version: u32) -> Self {
        ProvideHandle { op, version }
    }

    /// The operation this handle completes.
    #[inline]
    pub fn operation(&self) -> OperationHandle {
        self.op
    }

    fn body<'a>(&self, rm: &'a ResourceManager) -> Result<&'a ProviderOperation> {
        match rm.entry(self.op).and_then(|v| v.body.as_ref()) {
            Some(OperationBody::Provider(p)) if p.provide_version == self.version => Ok(&**p),
            _ => Err(Error::InvalidProvideHandle),
        }
    }

    /// Returns true if this handle could still complete its operation.
    pub fn is_valid(&self, rm: &ResourceManager) -> bool {
        self.body(rm).is_ok()
    }

    pub fn location(&self, rm: &ResourceManager) -> Result<Rc<Location>> {
        self.body(rm)?
            .location
            .clone()
            .ok_or(Error::InvalidProvideHandle)
    }

    /// The type the caller asked for.
    pub fn requested_type(&self, rm: &ResourceManager) -> Result<ResultType> {
        self.body(rm)?.requested.ok_or(Error::InvalidProvideHandle)
    }

    fn dependency_handles(&self, rm: &ResourceManager) -> Result<Vec<OperationHandle>> {
        match self.body(rm)?.dependency {
            Some(dep) => match rm.entry(dep).and_then(|v| v.body.as_ref()) {
                Some(OperationBody::Group(group)) => Ok(group.ops.clone()),
                Some(_) => Ok(vec![dep]),
                None => Err(Error::InvalidHandle),
            },
            None => Ok(Vec::new()),
        }
    }

    pub fn dependency_count(&self, rm: &ResourceManager) -> Result<usize> {
        Ok(self.dependency_handles(rm)?.len())
    }

    /// Returns the result of the dependency at `index`, in the order of
    /// `Location::dependencies`.
    pub fn dependency<T: 'static>(&self, rm: &ResourceManager, index: usize) -> Result<Option<Rc<T>>> {
        let deps = self.dependency_handles(rm)?;
        let dep = deps.get(index).ok_or(Error::InvalidHandle)?;

        match rm.result_any(*dep)? {
            Some(v) => v.downcast::<T>().map(Some).map_err(|_| Error::InvalidConversion {
                from: rm.result_type(*dep).map(|t| t.name()).unwrap_or("?").to_owned(),
                to: std::any::type_name::<T>().to_owned(),
            }),
            None => Ok(None),
        }
    }

    /// Returns the results of all dependencies.
    pub fn dependencies(&self, rm: &ResourceManager) -> Result<Vec<Option<Rc<dyn Any>>>> {
        let deps = self.dependency_handles(rm)?;
        let mut results = Vec::with_capacity(deps.len());
        for dep in deps {
            results.push(rm.result_any(dep)?);
        }

        Ok(results)
    }

    /// Returns the status of the dependencies (`None` if there are none).
    pub fn dependency_status(&self, rm: &ResourceManager) -> Result<OperationStatus> {
        match self.body(rm)?.dependency {
            Some(dep) => rm.status(dep),
            None => Ok(OperationStatus::None),
        }
    }

    /// Registers a function reporting the progress of this load.
    pub fn set_progress_callback<F>(&self, rm: &mut ResourceManager, func: F) -> Result<()>
    where
        F: Fn() -> f32 + 'static,
    {
        self.body(rm)?;
        if let Some(OperationBody::Provider(p)) = rm.entry_mut(self.op).and_then(|v| v.body.as_mut()) {
            p.progress = Some(Box::new(func));
        }

        Ok(())
    }

    /// Completes the operation. Fails with `TypeMismatch` if `T` is not what
    /// was requested, in which case the operation is marked as failed too.
    pub fn complete<T: 'static>(
        &self,
        rm: &mut ResourceManager,
        result: Option<T>,
        success: bool,
        error: Option<Error>,
    ) -> Result<()> {
        let result = result.map(|v| Rc::new(v) as Rc<dyn Any>);
        rm.provider_completed(*self, result, ResultType::of::<T>(), success, error)
    }

    #[inline]
    pub fn succeed<T: 'static>(&self, rm: &mut ResourceManager, result: T) -> Result<()> {
        self.complete(rm, Some(result), true, None)
    }

    #[inline]
    pub fn fail<T: 'static, S: Into<String>>(&self, rm: &mut ResourceManager, msg: S) -> Result<()> {
        self.complete::<T>(rm, None, false, Some(Error::Provider(msg.into())))
    }

    /// Creates a sender which could be moved to another thread. The response is
    /// picked up by `ResourceManager::update` on the dispatch thread.
    pub fn complete_later<T: Send + 'static>(&self, rm: &mut ResourceManager) -> CompletionSender<T> {
        let latch = Arc::new(LockLatch::new());
        rm.add_request(Box::new(ProvideRequest::new(
            *self,
            Request::new(latch.clone()),
        )));

        CompletionSender::new(latch)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flags() {
        let flags = ProviderBehaviourFlags::CAN_PROVIDE_WITH_FAILED_DEPENDENCIES;
        assert!(flags.contains(ProviderBehaviourFlags::CAN_PROVIDE_WITH_FAILED_DEPENDENCIES));
        assert!(flags.contains(ProviderBehaviourFlags::NONE));
        assert!(!ProviderBehaviourFlags::NONE
            .contains(ProviderBehaviourFlags::CAN_PROVIDE_WITH_FAILED_DEPENDENCIES));
        assert_eq!(ProviderBehaviourFlags::NONE | flags, flags);
    }
}
