use std::rc::Rc;

use crate::res::location::Location;
use crate::res::manager::ResourceManager;
use crate::res::operation::ResultType;
use crate::res::provider::{ProvideHandle, ResourceProvider};
use crate::res::shortcut::ShortcutResolver;

/// Loads UTF-8 files as `String`.
pub struct TextProvider {
    shortcuts: ShortcutResolver,
}

impl TextProvider {
    pub const ID: &'static str = "TextProvider";

    pub fn new(shortcuts: ShortcutResolver) -> Self {
        TextProvider { shortcuts }
    }

    #[inline]
    pub fn into_rc(self) -> Rc<dyn ResourceProvider> {
        Rc::new(self)
    }
}

impl ResourceProvider for TextProvider {
    fn provider_id(&self) -> &str {
        Self::ID
    }

    fn default_type(&self, _: &Location) -> ResultType {
        ResultType::of::<String>()
    }

    fn provide(&self, rm: &mut ResourceManager, handle: ProvideHandle) -> Result<(), failure::Error> {
        super::load(rm, handle, &self.shortcuts, |bytes| Ok(String::from_utf8(bytes)?))
    }
}
