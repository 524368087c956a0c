use std::marker::PhantomData;
use std::rc::Rc;

use serde::de::DeserializeOwned;

use crate::res::location::Location;
use crate::res::manager::ResourceManager;
use crate::res::operation::ResultType;
use crate::res::provider::{ProvideHandle, ResourceProvider};
use crate::res::shortcut::ShortcutResolver;

/// Loads JSON files and deserializes them into `T`.
///
/// Every instance serves exactly one type. Register several with different
/// ids with `JsonProvider::with_id` to load several types.
pub struct JsonProvider<T> {
    id: String,
    shortcuts: ShortcutResolver,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> JsonProvider<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub const ID: &'static str = "JsonProvider";

    pub fn new(shortcuts: ShortcutResolver) -> Self {
        JsonProvider::with_id(Self::ID, shortcuts)
    }

    pub fn with_id<S: Into<String>>(id: S, shortcuts: ShortcutResolver) -> Self {
        JsonProvider {
            id: id.into(),
            shortcuts,
            _phantom: PhantomData,
        }
    }

    #[inline]
    pub fn into_rc(self) -> Rc<dyn ResourceProvider> {
        Rc::new(self)
    }
}

impl<T> ResourceProvider for JsonProvider<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn default_type(&self, _: &Location) -> ResultType {
        ResultType::of::<T>()
    }

    fn provide(&self, rm: &mut ResourceManager, handle: ProvideHandle) -> Result<(), failure::Error> {
        super::load(rm, handle, &self.shortcuts, |bytes| {
            Ok(serde_json::from_slice::<T>(&bytes)?)
        })
    }
}
