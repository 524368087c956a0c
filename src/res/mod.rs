//! The `ResourceManager` loads data asynchronously through pluggable providers, and keeps track of
//! every in-flight and completed load with reference-counted operations.
//!
//! # Location
//!
//! User could locates a resource with `Location`. A `Location` consists of a primary key, an
//! internal identifier (usually a path with a shortcut prefix), the id of the provider which knows
//! how to load it, and a list of other locations it depends on.
//!
//! For example, let's say a game has all its textures in a special asset subdirectory called
//! `resources/textures`. The game would define a shortcut called `res:` pointing to that
//! directory, and a texture location would be identified like this:
//!
//! ```sh
//! "res:textures/crate.png"
//! ```
//!
//! Locations which share the internal identifier and the provider are treated as the same data,
//! no matter what their primary keys are.
//!
//! # Provider
//!
//! A `ResourceProvider` turns a location into a result of some type. It could complete right away,
//! on a later `update`, or from a background thread with `ProvideHandle::complete_later`. A few
//! built-in providers which read the local filesystem are available in `providers`.
//!
//! # Operation
//!
//! Every load is represented by an operation, and users hold them through handles. Besides loads,
//! there are user-defined operations (`AsyncOperation`), groups which wait on a set of operations,
//! and chains which start another operation once their dependency is done.
//!
//! ## Handle
//!
//! We are using a versioned `Handle` to represent an operation safely. This approach has several
//! advantages, since it helps for saving state externally. E.G.:
//!
//! 1. It allows for the operation to be destroyed without leaving dangling pointers.
//! 2. A stale handle is always detected, even if its slot has been reused.
//!
//! ## Ownership & Lifetime
//!
//! For the sake of simplicity, the reference-counting technique is used for providing shared
//! ownership of an operation.
//!
//! Everytime you start a load, the reference count of the operation is increased by 1, even if the
//! same location is already loading. And when you are done with it, its the user's responsibility
//! to `release` the handle. When the last reference is dropped, the provider releases the result and
//! the operation is destroyed, together with the dependencies it holds.
//!
//! ```rust
//! use addressable::res::prelude::*;
//!
//! let mut rm = ResourceManager::default();
//!
//! let mut h = rm.create_completed_operation(Some(42u32), "");
//! assert!(rm.is_done(h));
//! assert_eq!(rm.result(h).unwrap().map(|v| *v), Some(42));
//!
//! rm.release(&mut h).unwrap();
//! assert!(rm.dispose().is_ok());
//! ```

pub mod diagnostics;
pub mod handle;
pub mod location;
pub mod manager;
pub mod operation;
pub mod provider;
pub mod providers;
pub mod request;
pub mod shortcut;

pub(crate) mod allocator;
pub(crate) mod chain;
pub(crate) mod group;

pub mod prelude {
    pub use super::diagnostics::{DiagnosticEvent, DiagnosticEventType};
    pub use super::handle::{AsyncOperationHandle, OperationHandle, OperationRef, OperationStatus};
    pub use super::handle::UpdateReceiverHandle;
    pub use super::location::{Location, LocationKey};
    pub use super::manager::{ResourceManager, ResourceManagerParams, WaitHandle};
    pub use super::operation::{AsyncOperation, ResultType};
    pub use super::provider::{ProvideHandle, ProviderBehaviourFlags, ResourceProvider};
    pub use super::providers::{BytesProvider, JsonProvider, TextProvider};
    pub use super::request::CompletionSender;
    pub use super::shortcut::ShortcutResolver;
}
