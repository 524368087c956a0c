use std::rc::Rc;

use crate::res::location::Location;
use crate::res::manager::ResourceManager;
use crate::res::operation::ResultType;
use crate::res::provider::{ProvideHandle, ResourceProvider};
use crate::res::shortcut::ShortcutResolver;

/// Loads files as raw `Vec<u8>`.
pub struct BytesProvider {
    shortcuts: ShortcutResolver,
}

impl BytesProvider {
    pub const ID: &'static str = "BytesProvider";

    pub fn new(shortcuts: ShortcutResolver) -> Self {
        BytesProvider { shortcuts }
    }

    #[inline]
    pub fn into_rc(self) -> Rc<dyn ResourceProvider> {
        Rc::new(self)
    }
}

impl ResourceProvider for BytesProvider {
    fn provider_id(&self) -> &str {
        Self::ID
    }

    fn default_type(&self, _: &Location) -> ResultType {
        ResultType::of::<Vec<u8>>()
    }

    fn provide(&self, rm: &mut ResourceManager, handle: ProvideHandle) -> Result<(), failure::Error> {
        super::load(rm, handle, &self.shortcuts, |bytes| Ok(bytes))
    }
}
