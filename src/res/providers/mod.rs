//! Built-in providers which read locations from the local filesystem.
//!
//! The `internal_id` of a location is resolved with a `ShortcutResolver`
//! first, so `res:textures/crate.png` could point at any directory. Files are
//! read on a background thread, and the result is handed back to the
//! `ResourceManager` on its next `update`.

mod bytes;
mod json;
mod text;

pub use self::bytes::BytesProvider;
pub use self::json::JsonProvider;
pub use self::text::TextProvider;

use std::fs;
use std::io::Read;
use std::thread;

use super::manager::ResourceManager;
use super::provider::ProvideHandle;
use super::shortcut::ShortcutResolver;

/// Resolves the location of `handle` into a filesystem path.
fn resolve(
    rm: &ResourceManager,
    handle: ProvideHandle,
    shortcuts: &ShortcutResolver,
) -> Result<String, failure::Error> {
    let location = handle.location(rm)?;
    let path = shortcuts
        .resolve(&location.internal_id)
        .ok_or_else(|| format_err!("Could not resolve the shortcut of {}.", location))?;

    if path.starts_with("file://") {
        Ok(path["file://".len()..].to_owned())
    } else if path.contains("://") {
        bail!("The schema of {} has not been supported yet!", path);
    } else {
        Ok(path)
    }
}

fn read(path: &str) -> crate::errors::Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Reads the file of `handle` on a worker thread and completes the operation
/// with whatever `decode` makes of the bytes.
fn load<T, F>(
    rm: &mut ResourceManager,
    handle: ProvideHandle,
    shortcuts: &ShortcutResolver,
    decode: F,
) -> Result<(), failure::Error>
where
    T: Send + 'static,
    F: FnOnce(Vec<u8>) -> Result<T, failure::Error> + Send + 'static,
{
    let path = resolve(rm, handle, shortcuts)?;
    let sender = handle.complete_later::<T>(rm);

    trace!("Read {} on the background.", path);
    thread::Builder::new()
        .name("addressable-io".into())
        .spawn(move || sender.send(read(&path).map_err(failure::Error::from).and_then(decode)))?;

    Ok(())
}
