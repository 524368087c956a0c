//! The registry of operations, providers and per-frame dispatch.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::mem;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::allocator::OperationPool;
use super::chain::{ChainCallback, ChainOperation};
use super::diagnostics::{DiagnosticCallback, DiagnosticEvent, DiagnosticEventType};
use super::group::GroupOperation;
use super::handle::*;
use super::location::{dependencies_hash, Location};
use super::operation::*;
use super::provider::*;
use super::request::{PendingRequest, RequestQueue};
use crate::errors::*;
use crate::utils::hash::{hash, FastHashMap};
use crate::utils::latch::LockLatch;
use crate::utils::object_pool::ObjectPool;
use crate::utils::unwind::{halt_unwinding, panic_message};

/// Setup parameters of `ResourceManager`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagerParams {
    /// The maximum number of recycled bodies kept for each operation kind.
    pub pool_max_size: usize,
    /// The number of operation slots reserved up front.
    pub initial_capacity: usize,
    /// Operations started inside a provider's `provide` are executed by the
    /// next `update` instead of on the same call stack.
    pub defer_nested_starts: bool,
    /// Cyclic dependencies fail with `Error::CircularDependency` instead of
    /// waiting on each other forever.
    pub detect_cycles: bool,
}

impl Default for ResourceManagerParams {
    fn default() -> Self {
        ResourceManagerParams {
            pool_max_size: 1000,
            initial_capacity: 64,
            defer_nested_starts: true,
            detect_cycles: true,
        }
    }
}

/// The global sink of failed operations.
pub type ExceptionHandler = Box<dyn FnMut(OperationHandle, &Error)>;

/// Rewrites the internal id of a location before it is handed to a provider.
pub type InternalIdTransform = Box<dyn Fn(&Location) -> String>;

type UpdateReceiver = Box<dyn FnMut(&mut ResourceManager, f32)>;

/// A blocking wait on the completion of an operation. It could be sent to
/// other threads, but must never be waited on by the thread which drives the
/// `ResourceManager`, since nobody would be left to complete the operation.
#[derive(Clone)]
pub struct WaitHandle {
    latch: Arc<LockLatch<()>>,
}

impl WaitHandle {
    /// Blocks until the operation is done.
    #[inline]
    pub fn wait(&self) {
        self.latch.wait()
    }

    /// Blocks until the operation is done or `timeout` elapsed. Returns true if
    /// the operation is done.
    #[inline]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.latch.wait_timeout(timeout)
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.latch.is_set()
    }
}

#[derive(Clone, Copy)]
enum BodyKind {
    Completed,
    Custom,
    Provider,
    Group,
    Chain,
}

/// `ResourceManager` owns every operation, the provider list and the cache
/// which makes sure there is at most one operation per location and type.
///
/// Everything happens on the thread which owns the manager. Operations are
/// executed as soon as their dependencies are done, and completion callbacks
/// fire on the same call stack, except for callbacks subscribed to operations
/// which are already done; those are deferred to the next `update`.
pub struct ResourceManager {
    params: ResourceManagerParams,
    ops: ObjectPool<OperationHandle, Entry>,
    cache: FastHashMap<CacheKey, OperationHandle>,
    providers: Vec<Rc<dyn ResourceProvider>>,
    provider_memo: FastHashMap<(u64, TypeId), Option<usize>>,
    receivers: ObjectPool<UpdateReceiverHandle, Option<UpdateReceiver>>,
    updating: Vec<OperationHandle>,
    deferred_executes: Vec<OperationHandle>,
    deferred_callbacks: Vec<(OperationHandle, Callback)>,
    requests: RequestQueue,
    exception_handler: Option<ExceptionHandler>,
    internal_id_transform: Option<InternalIdTransform>,
    diagnostics: Option<DiagnosticCallback>,
    pool: OperationPool,
    resolving: Vec<CacheKey>,
    provide_depth: usize,
    disposed: bool,
}

impl Default for ResourceManager {
    fn default() -> Self {
        ResourceManager::new(ResourceManagerParams::default())
    }
}

impl ResourceManager {
    pub fn new(params: ResourceManagerParams) -> Self {
        debug!("Create resource manager with {:?}.", params);

        ResourceManager {
            params,
            ops: ObjectPool::with_capacity(params.initial_capacity),
            cache: FastHashMap::default(),
            providers: Vec::new(),
            provider_memo: FastHashMap::default(),
            receivers: ObjectPool::new(),
            updating: Vec::new(),
            deferred_executes: Vec::new(),
            deferred_callbacks: Vec::new(),
            requests: RequestQueue::default(),
            exception_handler: None,
            internal_id_transform: None,
            diagnostics: None,
            pool: OperationPool::new(params.pool_max_size),
            resolving: Vec::new(),
            provide_depth: 0,
            disposed: false,
        }
    }

    pub fn with_providers<T>(params: ResourceManagerParams, providers: T) -> Self
    where
        T: IntoIterator<Item = Rc<dyn ResourceProvider>>,
    {
        let mut rm = ResourceManager::new(params);
        for v in providers {
            rm.add_provider(v);
        }

        rm
    }

    #[inline]
    pub fn params(&self) -> &ResourceManagerParams {
        &self.params
    }

    /// Appends a provider. Earlier providers win if several could provide the
    /// same location.
    pub fn add_provider(&mut self, provider: Rc<dyn ResourceProvider>) {
        info!(
            "Add resource provider {} ({}).",
            provider.provider_id(),
            provider.name()
        );

        self.providers.push(provider);
        self.provider_memo.clear();
    }

    /// Removes the first provider with `provider_id`.
    pub fn remove_provider(&mut self, provider_id: &str) -> Option<Rc<dyn ResourceProvider>> {
        let index = self
            .providers
            .iter()
            .position(|v| v.provider_id() == provider_id)?;

        info!("Remove resource provider {}.", provider_id);
        self.provider_memo.clear();
        Some(self.providers.remove(index))
    }

    #[inline]
    pub fn providers(&self) -> &[Rc<dyn ResourceProvider>] {
        &self.providers
    }

    /// Returns the first provider whose id matches `location` and which could
    /// provide `ty`. The answer is memoised per provider id and type.
    pub fn get_resource_provider(
        &mut self,
        ty: ResultType,
        location: &Location,
    ) -> Option<Rc<dyn ResourceProvider>> {
        let key = (hash(location.provider_id.as_str()), ty.id());
        let index = match self.provider_memo.get(&key) {
            Some(&index) => index,
            None => {
                let index = self.providers.iter().position(|v| {
                    v.provider_id() == location.provider_id && v.can_provide(ty, location)
                });

                self.provider_memo.insert(key, index);
                index
            }
        };

        index.map(|i| self.providers[i].clone())
    }

    /// Loads `location` as a `T`. Requesting a location and type which is
    /// already loading (or loaded) returns the same operation with its
    /// reference count increased.
    ///
    /// Dependencies of the location are provided first and the provider is
    /// invoked once all of them are done.
    pub fn provide_resource<T: 'static>(&mut self, location: &Location) -> AsyncOperationHandle<T> {
        let location = Rc::new(location.clone());
        AsyncOperationHandle::new(self.provide_internal(location, ResultType::of::<T>()))
    }

    /// Loads `location` as whatever the matching provider produces by default.
    pub fn provide_resource_any(&mut self, location: &Location) -> OperationHandle {
        self.provide_untyped(Rc::new(location.clone()))
    }

    /// Loads all `locations` and finishes with their results in the same
    /// order. `callback` fires for every location once it is done. The
    /// operation fails if any of the locations failed, but the results of
    /// the successful ones are still available.
    pub fn provide_resources<T, F>(
        &mut self,
        locations: &[Location],
        callback: F,
    ) -> AsyncOperationHandle<Vec<Option<Rc<T>>>>
    where
        T: 'static,
        F: FnMut(&mut ResourceManager, AsyncOperationHandle<T>) + 'static,
    {
        let group = self.provide_group_cached(locations, Some(ResultType::of::<T>()));

        let callback = Rc::new(RefCell::new(callback));
        for child in self.group_children(group) {
            let callback = callback.clone();
            self.on_completed_internal(
                child,
                Box::new(move |rm: &mut ResourceManager, h| {
                    let mut callback = callback.borrow_mut();
                    (&mut *callback)(rm, AsyncOperationHandle::new(h));
                }),
            );
        }

        let chain = self.create_chain_internal(
            ResultType::of::<Vec<Option<Rc<T>>>>(),
            group,
            Box::new(|rm: &mut ResourceManager, group| {
                let results = rm
                    .group_children(group)
                    .into_iter()
                    .map(|v| rm.result_any(v).ok().and_then(|v| v))
                    .map(|v| v.and_then(|v| v.downcast::<T>().ok()))
                    .collect::<Vec<_>>();

                let error = rm.operation_exception(group).ok().and_then(|v| v);
                let ty = ResultType::of::<Vec<Option<Rc<T>>>>();
                rm.create_completed_internal(ty, Some(Rc::new(results) as Rc<dyn Any>), error)
            }),
        );

        self.release_internal(group);
        AsyncOperationHandle::new(chain)
    }

    /// Starts a user-defined operation. It executes as soon as `dependency` is
    /// done, or right away if there is none.
    pub fn start_operation<O: AsyncOperation>(
        &mut self,
        op: O,
        dependency: Option<OperationHandle>,
    ) -> AsyncOperationHandle<O::Output> {
        let ty = ResultType::of::<O::Output>();
        let handle = self.create_operation(ty, OperationBody::Custom(Box::new(op)), None);
        self.start(handle, dependency);
        AsyncOperationHandle::new(handle)
    }

    /// Creates an operation which is already done. It fails with `error_msg`
    /// unless the message is empty.
    pub fn create_completed_operation<T, S>(&mut self, result: Option<T>, error_msg: S) -> AsyncOperationHandle<T>
    where
        T: 'static,
        S: Into<String>,
    {
        let msg = error_msg.into();
        let error = if msg.is_empty() {
            None
        } else {
            Some(Error::Operation(msg))
        };

        let result = result.map(|v| Rc::new(v) as Rc<dyn Any>);
        let handle = self.create_completed_internal(ResultType::of::<T>(), result, error);
        AsyncOperationHandle::new(handle)
    }

    /// Creates an operation which waits for all `ops`. The group takes over one
    /// reference of every child, and finishes with the list of children.
    pub fn create_group_operation(
        &mut self,
        ops: Vec<OperationHandle>,
    ) -> Result<AsyncOperationHandle<Vec<OperationHandle>>> {
        if ops.iter().any(|&v| !self.ops.contains(v)) {
            return Err(Error::InvalidHandle);
        }

        Ok(AsyncOperationHandle::new(self.create_group_internal(ops, None)))
    }

    /// Creates an operation which waits for `dependency`, then calls
    /// `callback` to create the operation it finishes with.
    pub fn create_chain_operation<T, D, F>(&mut self, dependency: D, callback: F) -> Result<AsyncOperationHandle<T>>
    where
        T: 'static,
        D: OperationRef + 'static,
        F: FnOnce(&mut ResourceManager, D) -> AsyncOperationHandle<T> + 'static,
    {
        let dep = dependency.operation();
        if !self.ops.contains(dep) {
            return Err(Error::InvalidHandle);
        }

        let callback: ChainCallback =
            Box::new(move |rm: &mut ResourceManager, dep| callback(rm, D::from_operation(dep)).untyped());

        let handle = self.create_chain_internal(ResultType::of::<T>(), dep, callback);
        Ok(AsyncOperationHandle::new(handle))
    }

    /// Completes a pending operation. Completion callbacks fire right away.
    pub fn complete<T: 'static>(
        &mut self,
        handle: AsyncOperationHandle<T>,
        result: Option<T>,
        success: bool,
        error: Option<Error>,
    ) -> Result<()> {
        let h = handle.untyped();
        let expected = self.result_type(h)?;
        let actual = ResultType::of::<T>();
        if !expected.accepts(actual) {
            return Err(Error::InvalidConversion {
                from: actual.name().to_owned(),
                to: expected.name().to_owned(),
            });
        }

        let result = result.map(|v| Rc::new(v) as Rc<dyn Any>);
        self.complete_internal(h, result, success, error)
    }

    #[inline]
    pub fn succeed<T: 'static>(&mut self, handle: AsyncOperationHandle<T>, result: T) -> Result<()> {
        self.complete(handle, Some(result), true, None)
    }

    #[inline]
    pub fn fail<T, S>(&mut self, handle: AsyncOperationHandle<T>, msg: S) -> Result<()>
    where
        T: 'static,
        S: Into<String>,
    {
        self.complete(handle, None, false, Some(Error::Operation(msg.into())))
    }

    /// Increases the reference count and returns the same handle.
    pub fn acquire<H: OperationRef>(&mut self, handle: H) -> Result<H> {
        let h = handle.operation();
        let rc = {
            let entry = self.ops.get_mut(h).ok_or(Error::InvalidHandle)?;
            if entry.rc == 0 {
                return Err(Error::Destroyed(h.to_string()));
            }

            entry.rc += 1;
            entry.rc
        };

        self.post(h, DiagnosticEventType::AsyncOperationReferenceCount, rc as i32);
        Ok(handle)
    }

    /// Decreases the reference count and invalidates `handle`. The operation is
    /// destroyed once the count reaches zero.
    pub fn release<H: OperationRef>(&mut self, handle: &mut H) -> Result<()> {
        self.decrement(handle.operation())?;
        handle.invalidate();
        Ok(())
    }

    /// Returns true if `handle` still refers to a live operation.
    #[inline]
    pub fn is_valid<H: OperationRef>(&self, handle: H) -> bool {
        self.ops.contains(handle.operation())
    }

    /// Returns true if the operation is done. Invalid handles are done too.
    #[inline]
    pub fn is_done<H: OperationRef>(&self, handle: H) -> bool {
        self.ops
            .get(handle.operation())
            .map(|v| v.is_done())
            .unwrap_or(true)
    }

    pub fn status<H: OperationRef>(&self, handle: H) -> Result<OperationStatus> {
        Ok(self.get(handle.operation())?.status)
    }

    /// The progress in `[0, 1]`. Done operations report 1.
    pub fn percent_complete<H: OperationRef>(&self, handle: H) -> Result<f32> {
        self.get(handle.operation())?;
        Ok(self.progress(handle.operation()))
    }

    /// Returns the result, `None` if the operation is pending or failed.
    pub fn result<T: 'static>(&self, handle: AsyncOperationHandle<T>) -> Result<Option<Rc<T>>> {
        let entry = self.get(handle.untyped())?;
        match entry.result {
            Some(ref v) => v.clone().downcast::<T>().map(Some).map_err(|_| Error::InvalidConversion {
                from: entry.result_type.name().to_owned(),
                to: std::any::type_name::<T>().to_owned(),
            }),
            None => Ok(None),
        }
    }

    pub fn result_any<H: OperationRef>(&self, handle: H) -> Result<Option<Rc<dyn Any>>> {
        Ok(self.get(handle.operation())?.result.clone())
    }

    pub fn result_type<H: OperationRef>(&self, handle: H) -> Result<ResultType> {
        Ok(self.get(handle.operation())?.result_type)
    }

    /// The error of a failed operation.
    pub fn operation_exception<H: OperationRef>(&self, handle: H) -> Result<Option<Error>> {
        Ok(self.get(handle.operation())?.error.clone())
    }

    pub fn reference_count<H: OperationRef>(&self, handle: H) -> Result<u32> {
        Ok(self.get(handle.operation())?.rc)
    }

    pub fn debug_name<H: OperationRef>(&self, handle: H) -> Result<String> {
        let entry = self.get(handle.operation())?;
        Ok(match entry.body {
            Some(OperationBody::Completed(_)) => {
                format!("CompletedOperation<{}>", entry.result_type)
            }
            Some(OperationBody::Custom(ref op)) => op.debug_name(),
            Some(OperationBody::Provider(ref op)) => op.debug_name(),
            Some(OperationBody::Group(ref op)) => op.debug_name(),
            Some(OperationBody::Chain(ref op)) => {
                let dep = op
                    .dependency
                    .and_then(|v| self.debug_name(v).ok())
                    .unwrap_or_default();
                format!("ChainOperation<{}> - {}", entry.result_type, dep)
            }
            None => format!("Operation<{}>", entry.result_type),
        })
    }

    /// The operations this one waits on.
    pub fn dependencies<H: OperationRef>(&self, handle: H) -> Result<Vec<OperationHandle>> {
        let entry = self.get(handle.operation())?;
        Ok(match entry.body {
            Some(OperationBody::Custom(ref op)) => op.dependencies(),
            Some(OperationBody::Provider(ref op)) => op.dependency.into_iter().collect(),
            Some(OperationBody::Group(ref op)) => op.ops.clone(),
            Some(OperationBody::Chain(ref op)) => op.dependency.into_iter().collect(),
            _ => Vec::new(),
        })
    }

    /// Reinterprets an untyped handle as a typed one.
    pub fn convert<T: 'static>(&self, handle: OperationHandle) -> Result<AsyncOperationHandle<T>> {
        let ty = self.result_type(handle)?;
        if ty.accepts(ResultType::of::<T>()) {
            Ok(AsyncOperationHandle::new(handle))
        } else {
            Err(Error::InvalidConversion {
                from: ty.name().to_owned(),
                to: std::any::type_name::<T>().to_owned(),
            })
        }
    }

    /// Subscribes to the completion of an operation. Callbacks fire in
    /// subscription order. If the operation is already done, the callback is
    /// deferred to the next `update` and holds a reference until then.
    pub fn on_completed<H, F>(&mut self, handle: H, callback: F) -> Result<()>
    where
        H: OperationRef + 'static,
        F: FnOnce(&mut ResourceManager, H) + 'static,
    {
        let h = handle.operation();
        if self.get(h)?.rc == 0 {
            return Err(Error::Destroyed(h.to_string()));
        }

        self.on_completed_internal(
            h,
            Box::new(move |rm: &mut ResourceManager, v| callback(rm, H::from_operation(v))),
        );
        Ok(())
    }

    /// Subscribes to the destruction of an operation. The callback runs with the
    /// reference count at zero, so acquire and release fail, but the result
    /// could still be read.
    pub fn on_destroyed<H, F>(&mut self, handle: H, callback: F) -> Result<()>
    where
        H: OperationRef + 'static,
        F: FnOnce(&mut ResourceManager, H) + 'static,
    {
        let entry = self
            .ops
            .get_mut(handle.operation())
            .ok_or(Error::InvalidHandle)?;

        entry
            .destroyed
            .push(Box::new(move |rm: &mut ResourceManager, v| callback(rm, H::from_operation(v))));
        Ok(())
    }

    /// Returns a handle other threads could block on until the operation is
    /// done.
    pub fn wait_handle<H: OperationRef>(&mut self, handle: H) -> Result<WaitHandle> {
        let entry = self
            .ops
            .get_mut(handle.operation())
            .ok_or(Error::InvalidHandle)?;

        if entry.is_done() {
            let latch = Arc::new(LockLatch::new());
            latch.set(());
            return Ok(WaitHandle { latch });
        }

        let latch = entry
            .waiter
            .get_or_insert_with(|| Arc::new(LockLatch::new()))
            .clone();

        Ok(WaitHandle { latch })
    }

    /// Sets the sink of failed operations. Without one, failures are logged.
    pub fn set_exception_handler<F>(&mut self, handler: F)
    where
        F: FnMut(OperationHandle, &Error) + 'static,
    {
        self.exception_handler = Some(Box::new(handler));
    }

    pub fn clear_exception_handler(&mut self) {
        self.exception_handler = None;
    }

    /// Sets a function which rewrites the `internal_id` of every location
    /// before it is provided, e.g. to redirect loads to a mirror. Operations are
    /// still cached by the location as requested.
    pub fn set_internal_id_transform<F>(&mut self, transform: F)
    where
        F: Fn(&Location) -> String + 'static,
    {
        self.internal_id_transform = Some(Box::new(transform));
    }

    pub fn clear_internal_id_transform(&mut self) {
        self.internal_id_transform = None;
    }

    /// Returns the internal id `location` is provided with.
    pub fn transform_internal_id(&self, location: &Location) -> String {
        match self.internal_id_transform {
            Some(ref transform) => transform(location),
            None => location.internal_id.clone(),
        }
    }

    pub fn register_diagnostic_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&DiagnosticEvent) + 'static,
    {
        self.diagnostics = Some(Box::new(callback));
    }

    pub fn clear_diagnostics_callback(&mut self) {
        self.diagnostics = None;
    }

    /// Registers a function which is called on every `update`. It is safe to
    /// remove the receiver from inside itself.
    pub fn add_update_receiver<F>(&mut self, receiver: F) -> UpdateReceiverHandle
    where
        F: FnMut(&mut ResourceManager, f32) + 'static,
    {
        self.receivers.create(Some(Box::new(receiver)))
    }

    pub fn remove_update_receiver(&mut self, handle: UpdateReceiverHandle) -> bool {
        self.receivers.free(handle).is_some()
    }

    /// Advances one frame: ticks operations, providers and update receivers,
    /// picks up background completions, then runs deferred executions and
    /// deferred completion callbacks.
    pub fn update(&mut self, delta: f32) {
        let updating = self.updating.clone();
        for h in updating {
            self.update_operation(h, delta);
        }

        let providers = self.providers.clone();
        for v in providers {
            if let Err(payload) = halt_unwinding(|| v.update(self, delta)) {
                error!(
                    "Provider {} panicked during update. {}",
                    v.provider_id(),
                    panic_message(&*payload)
                );
            }
        }

        let receivers: Vec<_> = self.receivers.keys().collect();
        for h in receivers {
            let receiver = self.receivers.get_mut(h).and_then(|v| v.take());
            if let Some(mut receiver) = receiver {
                if let Err(payload) = halt_unwinding(|| receiver(self, delta)) {
                    error!("{} panicked. {}", h, panic_message(&*payload));
                }

                // Skipped if the receiver has been removed in the meantime.
                if let Some(slot) = self.receivers.get_mut(h) {
                    *slot = Some(receiver);
                }
            }
        }

        for request in self.requests.advance() {
            request.finish(self);
        }

        let executes = mem::replace(&mut self.deferred_executes, Vec::new());
        for h in executes {
            self.execute(h);
        }

        let callbacks = mem::replace(&mut self.deferred_callbacks, Vec::new());
        for (h, callback) in callbacks {
            self.invoke(h, callback);
            self.release_internal(h);
        }

        if self.diagnostics.is_some() {
            let pending: Vec<_> = self.ops.keys().filter(|&v| self.is_pending(v)).collect();
            for h in pending {
                let percent = (self.progress(h) * 100.0) as i32;
                self.post(h, DiagnosticEventType::AsyncOperationPercentComplete, percent);
            }
        }
    }

    /// The number of cached provider and group operations.
    #[inline]
    pub fn operation_cache_count(&self) -> usize {
        self.cache.len()
    }

    /// The number of live operations, cached or not.
    #[inline]
    pub fn operation_count(&self) -> usize {
        self.ops.len()
    }

    /// Tears down the manager. Fails with `LeakedOperations` if any operation
    /// is still alive, which means somebody did not release a handle.
    pub fn dispose(&mut self) -> Result<()> {
        self.disposed = true;
        self.receivers = ObjectPool::new();

        if self.requests.len() > 0 {
            debug!(
                "Dispose resource manager with {} background completions pending.",
                self.requests.len()
            );
        }

        let len = self.ops.len();
        if len > 0 {
            warn!("Dispose resource manager with {} operations alive.", len);
            Err(Error::LeakedOperations(len))
        } else {
            Ok(())
        }
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if !self.disposed && !self.ops.is_empty() {
            warn!(
                "Resource manager dropped with {} operations alive.",
                self.ops.len()
            );
        }
    }
}

impl ResourceManager {
    #[inline]
    pub(crate) fn entry(&self, handle: OperationHandle) -> Option<&Entry> {
        self.ops.get(handle)
    }

    #[inline]
    pub(crate) fn entry_mut(&mut self, handle: OperationHandle) -> Option<&mut Entry> {
        self.ops.get_mut(handle)
    }

    #[inline]
    pub(crate) fn add_request(&mut self, request: Box<dyn PendingRequest>) {
        self.requests.add(request);
    }

    /// Completes a provider operation, checking the result against the
    /// requested type.
    pub(crate) fn provider_completed(
        &mut self,
        handle: ProvideHandle,
        result: Option<Rc<dyn Any>>,
        actual: ResultType,
        success: bool,
        error: Option<Error>,
    ) -> Result<()> {
        let h = handle.operation();
        let (requested, provider_type, provider_id) = match self.body_mut(h) {
            Some(OperationBody::Provider(p)) if handle == ProvideHandle::new(h, p.provide_version) => {
                p.provide_version += 1;

                let requested = p.requested.unwrap_or_else(ResultType::any);
                let provider_type = p.provider.as_ref().map(|v| v.name().to_owned());
                let provider_id = p.provider.as_ref().map(|v| v.provider_id().to_owned());
                (requested, provider_type, provider_id)
            }
            _ => return Err(Error::InvalidProvideHandle),
        };

        if result.is_some() && !requested.accepts(actual) {
            let err = Error::TypeMismatch {
                provider_type: provider_type.unwrap_or_default(),
                provider_id: provider_id.unwrap_or_default(),
                actual: actual.name().to_owned(),
                requested: requested.name().to_owned(),
            };

            self.complete_internal(h, None, false, Some(err.clone()))?;
            return Err(err);
        }

        self.complete_internal(h, result, success, error)
    }

    fn get(&self, handle: OperationHandle) -> Result<&Entry> {
        self.ops.get(handle).ok_or(Error::InvalidHandle)
    }

    #[inline]
    fn body_mut(&mut self, handle: OperationHandle) -> Option<&mut OperationBody> {
        self.ops.get_mut(handle).and_then(|v| v.body.as_mut())
    }

    #[inline]
    fn is_pending(&self, handle: OperationHandle) -> bool {
        self.ops.get(handle).map(|v| !v.is_done()).unwrap_or(false)
    }

    fn group_children(&self, handle: OperationHandle) -> Vec<OperationHandle> {
        match self.ops.get(handle).and_then(|v| v.body.as_ref()) {
            Some(OperationBody::Group(group)) => group.ops.clone(),
            _ => Vec::new(),
        }
    }

    fn provide_untyped(&mut self, location: Rc<Location>) -> OperationHandle {
        let ty = self
            .get_resource_provider(ResultType::any(), &location)
            .map(|v| v.default_type(&location))
            .unwrap_or_else(ResultType::any);

        self.provide_internal(location, ty)
    }

    fn provide_internal(&mut self, location: Rc<Location>, ty: ResultType) -> OperationHandle {
        let provider = match self.get_resource_provider(ty, &location) {
            Some(provider) => provider,
            None => {
                let err = Error::UnknownProvider {
                    location: location.to_string(),
                    provider_id: location.provider_id.clone(),
                    requested: ty.name().to_owned(),
                };

                return self.create_completed_internal(ty, None, Some(err));
            }
        };

        let key = CacheKey::Resource(location.hash(ty));
        if let Some(&handle) = self.cache.get(&key) {
            if self.params.detect_cycles && self.resolving.contains(&key) {
                let err = Error::CircularDependency(location.to_string());
                return self.create_completed_internal(ty, None, Some(err));
            }

            self.increment(handle);
            return handle;
        }

        let provided = if self.internal_id_transform.is_some() {
            let mut v = (*location).clone();
            v.internal_id = self.transform_internal_id(&location);
            Rc::new(v)
        } else {
            location.clone()
        };

        let mut body = self.pool.acquire::<ProviderOperation>();
        body.provider = Some(provider);
        body.location = Some(provided);
        body.requested = Some(ty);

        let handle = self.create_operation(ty, OperationBody::Provider(body), Some(key));

        self.resolving.push(key);
        let dependency = match location.dependencies.len() {
            0 => None,
            1 => Some(self.provide_untyped(Rc::new(location.dependencies[0].clone()))),
            _ => Some(self.provide_group_cached(&location.dependencies, None)),
        };
        self.resolving.pop();

        if let Some(dep) = dependency {
            self.increment(dep);
            if let Some(OperationBody::Provider(p)) = self.body_mut(handle) {
                p.dependency = Some(dep);
            }
        }

        self.start(handle, dependency);

        if let Some(dep) = dependency {
            self.release_internal(dep);
        }

        handle
    }

    fn provide_group_cached(&mut self, locations: &[Location], ty: Option<ResultType>) -> OperationHandle {
        let key = CacheKey::Group(dependencies_hash(
            locations,
            ty.unwrap_or_else(ResultType::any),
        ));

        if let Some(&handle) = self.cache.get(&key) {
            self.increment(handle);
            return handle;
        }

        let ops = locations
            .iter()
            .map(|v| {
                let location = Rc::new(v.clone());
                match ty {
                    Some(ty) => self.provide_internal(location, ty),
                    None => self.provide_untyped(location),
                }
            })
            .collect();

        self.create_group_internal(ops, Some(key))
    }

    fn create_operation(
        &mut self,
        ty: ResultType,
        body: OperationBody,
        key: Option<CacheKey>,
    ) -> OperationHandle {
        let handle = self.ops.create(Entry::new(ty, body, key));
        if let Some(key) = key {
            self.cache.insert(key, handle);
        }

        trace!("Create {}.", handle);
        self.post(handle, DiagnosticEventType::AsyncOperationCreate, 0);
        handle
    }

    fn create_completed_internal(
        &mut self,
        ty: ResultType,
        result: Option<Rc<dyn Any>>,
        error: Option<Error>,
    ) -> OperationHandle {
        let body = OperationBody::Completed(CompletedOperation { result, error });
        let handle = self.create_operation(ty, body, None);
        self.start(handle, None);
        handle
    }

    fn create_group_internal(&mut self, ops: Vec<OperationHandle>, key: Option<CacheKey>) -> OperationHandle {
        let mut body = self.pool.acquire::<GroupOperation>();
        body.ops.extend(ops);

        let ty = ResultType::of::<Vec<OperationHandle>>();
        let handle = self.create_operation(ty, OperationBody::Group(body), key);
        self.start(handle, None);
        handle
    }

    fn create_chain_internal(
        &mut self,
        ty: ResultType,
        dependency: OperationHandle,
        callback: ChainCallback,
    ) -> OperationHandle {
        self.increment(dependency);

        let mut body = self.pool.acquire::<ChainOperation>();
        body.dependency = Some(dependency);
        body.callback = Some(callback);

        let handle = self.create_operation(ty, OperationBody::Chain(body), None);
        self.start(handle, Some(dependency));
        handle
    }

    /// Keeps the operation alive until it completes, then executes it once
    /// `dependency` is done.
    fn start(&mut self, handle: OperationHandle, dependency: Option<OperationHandle>) {
        self.increment(handle);

        match dependency {
            Some(dep) if self.is_pending(dep) => {
                self.on_completed_internal(dep, Box::new(move |rm: &mut ResourceManager, _| rm.execute_or_defer(handle)));
            }
            _ => self.execute_or_defer(handle),
        }
    }

    fn execute_or_defer(&mut self, handle: OperationHandle) {
        if self.provide_depth > 0 && self.params.defer_nested_starts {
            self.deferred_executes.push(handle);
        } else {
            self.execute(handle);
        }
    }

    fn execute(&mut self, handle: OperationHandle) {
        let kind = match self.ops.get(handle) {
            Some(entry) if !entry.is_done() => match entry.body {
                Some(OperationBody::Completed(_)) => BodyKind::Completed,
                Some(OperationBody::Custom(_)) => BodyKind::Custom,
                Some(OperationBody::Provider(_)) => BodyKind::Provider,
                Some(OperationBody::Group(_)) => BodyKind::Group,
                Some(OperationBody::Chain(_)) => BodyKind::Chain,
                None => return,
            },
            _ => return,
        };

        trace!("Execute {}.", handle);
        match kind {
            BodyKind::Completed => self.execute_completed(handle),
            BodyKind::Custom => self.execute_custom(handle),
            BodyKind::Provider => self.execute_provider(handle),
            BodyKind::Group => self.execute_group(handle),
            BodyKind::Chain => self.execute_chain(handle),
        }
    }

    fn execute_completed(&mut self, handle: OperationHandle) {
        let (result, error) = match self.body_mut(handle) {
            Some(OperationBody::Completed(op)) => (op.result.take(), op.error.take()),
            _ => return,
        };

        let success = error.is_none();
        self.finish(handle, result, success, error);
    }

    fn execute_custom(&mut self, handle: OperationHandle) {
        let mut body = match self.ops.get_mut(handle).and_then(|v| v.body.take()) {
            Some(body) => body,
            None => return,
        };

        if let OperationBody::Custom(ref mut op) = body {
            match halt_unwinding(|| op.execute(self, handle)) {
                Ok(_) => {
                    if op.is_update_receiver() && self.is_pending(handle) {
                        self.updating.push(handle);
                    }
                }
                Err(payload) => {
                    let err = Error::Operation(format!(
                        "{} panicked during execute. {}",
                        op.debug_name(),
                        panic_message(&*payload)
                    ));

                    if self.is_pending(handle) {
                        self.finish(handle, None, false, Some(err));
                    }
                }
            }
        }

        self.restore_body(handle, body);
    }

    fn execute_provider(&mut self, handle: OperationHandle) {
        let (provider, location, dependency, version) = match self.ops.get(handle).and_then(|v| v.body.as_ref()) {
            Some(OperationBody::Provider(p)) => match (&p.provider, &p.location) {
                (Some(provider), Some(location)) => {
                    (provider.clone(), location.clone(), p.dependency, p.provide_version)
                }
                _ => return,
            },
            _ => return,
        };

        if let Some(dep) = dependency {
            let flags = provider.behaviour_flags();
            if self.status(dep) != Ok(OperationStatus::Succeeded)
                && !flags.contains(ProviderBehaviourFlags::CAN_PROVIDE_WITH_FAILED_DEPENDENCIES)
            {
                let inner = self
                    .operation_exception(dep)
                    .ok()
                    .and_then(|v| v)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| format!("{} is not available.", dep));

                debug!("Skip providing {} since its dependency failed.", location);
                let h = ProvideHandle::new(handle, version);
                let err = Error::DependencyFailed(inner);
                if let Err(err) = self.provider_completed(h, None, ResultType::any(), false, Some(err)) {
                    warn!("Failed to complete {}. {}", handle, err);
                }

                return;
            }
        }

        trace!("{} provides {}.", provider.name(), location);

        let h = ProvideHandle::new(handle, version);
        self.provide_depth += 1;
        let rsp = halt_unwinding(|| provider.provide(self, h));
        self.provide_depth -= 1;

        let err = match rsp {
            Ok(Ok(_)) => return,
            Ok(Err(err)) => Error::from_provider(err),
            Err(payload) => Error::Provider(format!(
                "{} panicked while providing {}. {}",
                provider.name(),
                location,
                panic_message(&*payload)
            )),
        };

        if h.is_valid(self) {
            if let Err(err) = self.provider_completed(h, None, ResultType::any(), false, Some(err)) {
                warn!("Failed to complete {}. {}", handle, err);
            }
        } else {
            warn!("{} reported an error after completion. {}", provider.name(), err);
        }
    }

    fn execute_group(&mut self, handle: OperationHandle) {
        let ops = self.group_children(handle);

        let mut loaded = 0;
        for &v in &ops {
            if self.is_pending(v) {
                self.on_completed_internal(v, Box::new(move |rm: &mut ResourceManager, _| rm.on_group_child_completed(handle)));
            } else {
                loaded += 1;
            }
        }

        if let Some(OperationBody::Group(group)) = self.body_mut(handle) {
            group.loaded = loaded;
        }

        if loaded == ops.len() {
            self.complete_group(handle);
        }
    }

    fn on_group_child_completed(&mut self, handle: OperationHandle) {
        if !self.is_pending(handle) {
            return;
        }

        let loaded = match self.body_mut(handle) {
            Some(OperationBody::Group(group)) => {
                group.loaded += 1;
                group.is_loaded()
            }
            _ => false,
        };

        if loaded {
            self.complete_group(handle);
        }
    }

    fn complete_group(&mut self, handle: OperationHandle) {
        let ops = self.group_children(handle);

        let mut error = None;
        for &v in &ops {
            let failed = match self.status(v) {
                Ok(OperationStatus::Succeeded) => None,
                Ok(_) => Some(
                    self.operation_exception(v)
                        .ok()
                        .and_then(|v| v)
                        .unwrap_or_else(|| Error::Operation(format!("{} failed.", v))),
                ),
                Err(err) => Some(err),
            };

            if failed.is_some() {
                error = failed;
                break;
            }
        }

        let success = error.is_none();
        self.finish(handle, Some(Rc::new(ops) as Rc<dyn Any>), success, error);
    }

    fn execute_chain(&mut self, handle: OperationHandle) {
        let (callback, dependency) = match self.body_mut(handle) {
            Some(OperationBody::Chain(op)) => (op.callback.take(), op.dependency),
            _ => return,
        };

        let (callback, dependency) = match (callback, dependency) {
            (Some(callback), Some(dependency)) => (callback, dependency),
            _ => return,
        };

        let wrapped = match halt_unwinding(|| callback(self, dependency)) {
            Ok(wrapped) => wrapped,
            Err(payload) => {
                let err = Error::Operation(format!(
                    "Chain callback of {} panicked. {}",
                    handle,
                    panic_message(&*payload)
                ));

                self.finish(handle, None, false, Some(err));
                return;
            }
        };

        match self.body_mut(handle) {
            Some(OperationBody::Chain(op)) => op.wrapped = Some(wrapped),
            _ => {
                self.release_internal(wrapped);
                return;
            }
        }

        if self.is_pending(wrapped) {
            self.on_completed_internal(wrapped, Box::new(move |rm: &mut ResourceManager, _| rm.complete_chain(handle)));
        } else {
            self.complete_chain(handle);
        }
    }

    fn complete_chain(&mut self, handle: OperationHandle) {
        if !self.is_pending(handle) {
            return;
        }

        let wrapped = match self.ops.get(handle).and_then(|v| v.body.as_ref()) {
            Some(OperationBody::Chain(op)) => op.wrapped,
            _ => None,
        };

        let (result, status, error) = match wrapped.and_then(|v| self.ops.get(v)) {
            Some(entry) => (entry.result.clone(), entry.status, entry.error.clone()),
            None => (None, OperationStatus::Failed, Some(Error::InvalidHandle)),
        };

        self.finish(handle, result, status == OperationStatus::Succeeded, error);
    }

    fn update_operation(&mut self, handle: OperationHandle, delta: f32) {
        if !self.is_pending(handle) {
            return;
        }

        let mut body = match self.ops.get_mut(handle).and_then(|v| v.body.take()) {
            Some(body) => body,
            None => return,
        };

        if let OperationBody::Custom(ref mut op) = body {
            if let Err(payload) = halt_unwinding(|| op.update(self, handle, delta)) {
                let err = Error::Operation(format!(
                    "{} panicked during update. {}",
                    op.debug_name(),
                    panic_message(&*payload)
                ));

                if self.is_pending(handle) {
                    self.finish(handle, None, false, Some(err));
                }
            }
        }

        self.restore_body(handle, body);
    }

    /// Puts a taken body back, or destroys it if the operation went away while
    /// the body was out.
    fn restore_body(&mut self, handle: OperationHandle, body: OperationBody) {
        match self.ops.get_mut(handle) {
            Some(entry) => entry.body = Some(body),
            None => self.destroy_body(body, false, None),
        }
    }

    fn finish(
        &mut self,
        handle: OperationHandle,
        result: Option<Rc<dyn Any>>,
        success: bool,
        error: Option<Error>,
    ) {
        if let Err(err) = self.complete_internal(handle, result, success, error) {
            warn!("Failed to complete {}. {}", handle, err);
        }
    }

    fn complete_internal(
        &mut self,
        handle: OperationHandle,
        result: Option<Rc<dyn Any>>,
        success: bool,
        error: Option<Error>,
    ) -> Result<()> {
        let (error, waiter, callbacks) = {
            let entry = self.ops.get_mut(handle).ok_or(Error::InvalidHandle)?;
            if entry.is_done() {
                return Err(Error::AlreadyCompleted(handle.to_string()));
            }

            let error = if success {
                entry.status = OperationStatus::Succeeded;
                None
            } else {
                entry.status = OperationStatus::Failed;
                Some(error.unwrap_or_else(|| {
                    Error::Operation(format!("Unknown error in {}.", handle))
                }))
            };

            entry.result = result;
            entry.error = error.clone();

            let callbacks = mem::replace(&mut entry.completed, SmallVec::new());
            (error, entry.waiter.take(), callbacks)
        };

        self.updating.retain(|&v| v != handle);

        match error {
            Some(ref err) => {
                trace!("{} failed. {}", handle, err);
                self.post(handle, DiagnosticEventType::AsyncOperationFail, 0);
                self.raise(handle, err);
            }
            None => {
                trace!("{} succeeded.", handle);
                self.post(handle, DiagnosticEventType::AsyncOperationComplete, 100);
            }
        }

        for v in callbacks {
            self.invoke(handle, v);
        }

        if let Some(waiter) = waiter {
            waiter.set(());
        }

        self.decrement(handle)
    }

    fn on_completed_internal(&mut self, handle: OperationHandle, callback: Callback) {
        match self.ops.get_mut(handle) {
            Some(entry) => {
                if !entry.is_done() {
                    entry.completed.push(callback);
                    return;
                }
            }
            None => return,
        }

        self.increment(handle);
        self.deferred_callbacks.push((handle, callback));
    }

    fn increment(&mut self, handle: OperationHandle) {
        let rc = match self.ops.get_mut(handle) {
            Some(entry) => {
                entry.rc += 1;
                entry.rc
            }
            None => return,
        };

        self.post(handle, DiagnosticEventType::AsyncOperationReferenceCount, rc as i32);
    }

    fn decrement(&mut self, handle: OperationHandle) -> Result<()> {
        let rc = {
            let entry = self.ops.get_mut(handle).ok_or(Error::InvalidHandle)?;
            if entry.rc == 0 {
                return Err(Error::ReferenceCountUnderflow(handle.to_string()));
            }

            entry.rc -= 1;
            entry.rc
        };

        self.post(handle, DiagnosticEventType::AsyncOperationReferenceCount, rc as i32);

        if rc == 0 {
            self.destroy(handle);
        }

        Ok(())
    }

    fn release_internal(&mut self, handle: OperationHandle) {
        if let Err(err) = self.decrement(handle) {
            warn!("Failed to release {}. {}", handle, err);
        }
    }

    fn destroy(&mut self, handle: OperationHandle) {
        trace!("Destroy {}.", handle);
        self.post(handle, DiagnosticEventType::AsyncOperationDestroy, 0);

        let (body, succeeded, result, key, waiter, callbacks) = match self.ops.get_mut(handle) {
            Some(entry) => {
                entry.completed.clear();
                (
                    entry.body.take(),
                    entry.status == OperationStatus::Succeeded,
                    entry.result.clone(),
                    entry.cache_key.take(),
                    entry.waiter.take(),
                    mem::replace(&mut entry.destroyed, SmallVec::new()),
                )
            }
            None => return,
        };

        if let Some(key) = key {
            if self.cache.get(&key) == Some(&handle) {
                self.cache.remove(&key);
            }
        }

        // Custom bodies which are running are destroyed once they are put back.
        if let Some(body) = body {
            self.destroy_body(body, succeeded, result);
        }

        for v in callbacks {
            self.invoke(handle, v);
        }

        if let Some(waiter) = waiter {
            waiter.set(());
        }

        self.updating.retain(|&v| v != handle);
        self.ops.free(handle);
    }

    fn destroy_body(&mut self, body: OperationBody, succeeded: bool, result: Option<Rc<dyn Any>>) {
        match body {
            OperationBody::Completed(_) => {}
            OperationBody::Custom(mut op) => {
                if let Err(payload) = halt_unwinding(|| op.destroy(self)) {
                    error!(
                        "{} panicked during destroy. {}",
                        op.debug_name(),
                        panic_message(&*payload)
                    );
                }
            }
            OperationBody::Provider(mut op) => {
                if succeeded {
                    if let (Some(provider), Some(location)) = (&op.provider, &op.location) {
                        if let Err(payload) = halt_unwinding(|| provider.release(location, result)) {
                            error!(
                                "{} panicked while releasing {}. {}",
                                provider.name(),
                                location,
                                panic_message(&*payload)
                            );
                        }
                    }
                }

                if let Some(dep) = op.dependency.take() {
                    self.release_internal(dep);
                }

                self.pool.release(op);
            }
            OperationBody::Group(mut op) => {
                for v in op.ops.drain(..) {
                    self.release_internal(v);
                }

                self.pool.release(op);
            }
            OperationBody::Chain(mut op) => {
                if let Some(wrapped) = op.wrapped.take() {
                    self.release_internal(wrapped);
                }

                if let Some(dep) = op.dependency.take() {
                    self.release_internal(dep);
                }

                self.pool.release(op);
            }
        }
    }

    fn progress(&self, handle: OperationHandle) -> f32 {
        let entry = match self.ops.get(handle) {
            Some(entry) => entry,
            None => return 0.0,
        };

        if entry.is_done() {
            return 1.0;
        }

        let progress = match entry.body {
            Some(OperationBody::Custom(ref op)) => halt_unwinding(|| op.progress()).unwrap_or(0.0),
            Some(OperationBody::Provider(ref op)) => match op.progress {
                Some(ref func) => halt_unwinding(|| func()).unwrap_or(0.0),
                None => 0.0,
            },
            Some(OperationBody::Group(ref op)) => {
                if op.ops.is_empty() {
                    1.0
                } else {
                    let sum: f32 = op.ops.iter().map(|&v| self.progress(v)).sum();
                    sum / op.ops.len() as f32
                }
            }
            Some(OperationBody::Chain(ref op)) => match (op.wrapped, op.dependency) {
                (Some(wrapped), _) => 0.5 + 0.5 * self.progress(wrapped),
                (None, Some(dep)) => 0.5 * self.progress(dep),
                _ => 0.0,
            },
            _ => 0.0,
        };

        if progress.is_nan() {
            0.0
        } else {
            progress.max(0.0).min(1.0)
        }
    }

    fn invoke(&mut self, handle: OperationHandle, callback: Callback) {
        if let Err(payload) = halt_unwinding(|| callback(self, handle)) {
            let err = Error::CallbackPanicked(panic_message(&*payload));
            self.raise(handle, &err);
        }
    }

    fn raise(&mut self, handle: OperationHandle, err: &Error) {
        match self.exception_handler {
            Some(ref mut handler) => {
                if halt_unwinding(|| handler(handle, err)).is_err() {
                    error!("Exception handler panicked while handling {}. {}", handle, err);
                }
            }
            None => error!("{} failed. {}", handle, err),
        }
    }

    fn post(&mut self, handle: OperationHandle, kind: DiagnosticEventType, value: i32) {
        if self.diagnostics.is_none() {
            return;
        }

        let event = DiagnosticEvent {
            handle,
            kind,
            value,
            context: self.debug_name(handle).unwrap_or_default(),
        };

        if let Some(ref mut callback) = self.diagnostics {
            if halt_unwinding(|| callback(&event)).is_err() {
                error!("Diagnostic callback panicked on {:?}.", event.kind);
            }
        }
    }
}
