//! Completions which are resolved on other threads and picked up by the
//! dispatch thread.

use std::sync::Arc;

use super::manager::ResourceManager;
use super::provider::ProvideHandle;
use crate::errors::Error;
use crate::utils::latch::LockLatch;

pub type Response<T> = std::result::Result<T, failure::Error>;

/// A asynchronous loading request. You sould checks the completion status with
/// `poll` method manually. Once the polling returns true, you could fetch the
/// result by `response`.
pub enum Request<T> {
    NotReady(Arc<LockLatch<Response<T>>>),
    Ok(Response<T>),
    /// The response has been handed out.
    Taken,
}

impl<T> Request<T> {
    #[inline]
    pub fn new(latch: Arc<LockLatch<Response<T>>>) -> Self {
        Request::NotReady(latch)
    }

    /// Attempt to resolve the request to a final state, and returns true if the
    /// loading result is ready for user.
    pub fn poll(&mut self) -> bool {
        let rsp = match *self {
            Request::NotReady(ref state) => match state.take() {
                Some(rsp) => rsp,
                None => return false,
            },
            _ => return true,
        };

        *self = Request::Ok(rsp);
        true
    }

    /// Takes the response out if it is ready.
    pub fn take(&mut self) -> Option<Response<T>> {
        if !self.poll() {
            return None;
        }

        match std::mem::replace(self, Request::Taken) {
            Request::Ok(rsp) => Some(rsp),
            _ => None,
        }
    }
}

/// The sending half of a background completion. It is `Send`, so a provider
/// could move it into a worker thread.
///
/// Dropping a sender without sending anything fails the operation.
pub struct CompletionSender<T> {
    latch: Option<Arc<LockLatch<Response<T>>>>,
}

impl<T> CompletionSender<T> {
    #[inline]
    pub(crate) fn new(latch: Arc<LockLatch<Response<T>>>) -> Self {
        CompletionSender { latch: Some(latch) }
    }

    pub fn send(mut self, rsp: Response<T>) {
        if let Some(latch) = self.latch.take() {
            latch.set(rsp);
        }
    }

    #[inline]
    pub fn succeed(self, value: T) {
        self.send(Ok(value))
    }

    #[inline]
    pub fn fail<E: Into<failure::Error>>(self, err: E) {
        self.send(Err(err.into()))
    }
}

impl<T> Drop for CompletionSender<T> {
    fn drop(&mut self) {
        if let Some(latch) = self.latch.take() {
            latch.set(Err(format_err!("Completion sender dropped without a response.")));
        }
    }
}

pub(crate) trait PendingRequest {
    fn poll(&mut self) -> bool;
    fn finish(self: Box<Self>, rm: &mut ResourceManager);
}

pub(crate) struct ProvideRequest<T> {
    handle: ProvideHandle,
    request: Request<T>,
}

impl<T> ProvideRequest<T> {
    pub fn new(handle: ProvideHandle, request: Request<T>) -> Self {
        ProvideRequest { handle, request }
    }
}

impl<T: 'static> PendingRequest for ProvideRequest<T> {
    fn poll(&mut self) -> bool {
        self.request.poll()
    }

    fn finish(mut self: Box<Self>, rm: &mut ResourceManager) {
        let rsp = match self.request.take() {
            Some(rsp) => rsp,
            None => return,
        };

        let result = match rsp {
            Ok(v) => self.handle.complete(rm, Some(v), true, None),
            Err(err) => {
                let err = Error::from_provider(err);
                self.handle.complete::<T>(rm, None, false, Some(err))
            }
        };

        if let Err(err) = result {
            warn!("Failed to complete {:?} from background. {}", self.handle, err);
        }
    }
}

/// Requests which are waiting for their responses.
#[derive(Default)]
pub(crate) struct RequestQueue {
    tasks: Vec<Box<dyn PendingRequest>>,
}

impl RequestQueue {
    #[inline]
    pub fn add(&mut self, request: Box<dyn PendingRequest>) {
        self.tasks.push(request);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Removes and returns the requests which are ready, in the order they
    /// were added.
    pub fn advance(&mut self) -> Vec<Box<dyn PendingRequest>> {
        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.tasks.len() {
            if self.tasks[i].poll() {
                ready.push(self.tasks.remove(i));
            } else {
                i += 1;
            }
        }

        ready
    }
}
