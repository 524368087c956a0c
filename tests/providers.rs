extern crate addressable;
extern crate serde;
extern crate uuid;

mod utils;

use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

use addressable::prelude::*;

use self::utils::*;

#[derive(Debug, PartialEq, Deserialize)]
struct Material {
    shader: String,
    textures: Vec<String>,
}

struct Sandbox {
    dir: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("addressable-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        Sandbox { dir }
    }

    fn write(&self, name: &str, contents: &[u8]) {
        fs::write(self.dir.join(name), contents).unwrap();
    }

    fn shortcuts(&self) -> ShortcutResolver {
        let mut shortcuts = ShortcutResolver::new();
        let dir = format!("file://{}/", self.dir.display());
        shortcuts.add("res:", dir).unwrap();
        shortcuts
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

#[test]
fn bytes_and_text() {
    let sandbox = Sandbox::new();
    sandbox.write("crate.bin", &[1, 2, 3]);
    sandbox.write("readme.txt", b"hello");

    let mut rm = manager(vec![
        BytesProvider::new(sandbox.shortcuts()).into_rc(),
        TextProvider::new(sandbox.shortcuts()).into_rc(),
    ]);

    let mut bytes = rm.provide_resource::<Vec<u8>>(&Location::new("crate", "res:crate.bin", BytesProvider::ID));
    let mut text = rm.provide_resource::<String>(&Location::new("readme", "res:readme.txt", TextProvider::ID));
    assert!(!rm.is_done(bytes));

    pump(&mut rm, bytes);
    pump(&mut rm, text);

    assert_eq!(rm.result(bytes).unwrap().map(|v| (*v).clone()), Some(vec![1, 2, 3]));
    assert_eq!(rm.result(text).unwrap().map(|v| (*v).clone()), Some("hello".to_owned()));

    rm.release(&mut bytes).unwrap();
    rm.release(&mut text).unwrap();
    assert!(rm.dispose().is_ok());
}

#[test]
fn json_with_dependency() {
    let sandbox = Sandbox::new();
    sandbox.write("crate.png", &[0xff; 16]);
    sandbox.write(
        "crate.mat",
        br#"{ "shader": "unlit", "textures": ["res:crate.png"] }"#,
    );

    let mut rm = manager(vec![
        BytesProvider::new(sandbox.shortcuts()).into_rc(),
        JsonProvider::<Material>::new(sandbox.shortcuts()).into_rc(),
    ]);

    let texture = Location::new("texture", "res:crate.png", BytesProvider::ID);
    let material = Location::new("material", "res:crate.mat", JsonProvider::<Material>::ID)
        .with_dependencies(vec![texture.clone()]);

    let mut h = rm.provide_resource::<Material>(&material);
    pump(&mut rm, h);

    let v = rm.result(h).unwrap().unwrap();
    assert_eq!(v.shader, "unlit");
    assert_eq!(v.textures, vec!["res:crate.png".to_owned()]);

    // The dependency is loaded and shared.
    let mut tex = rm.provide_resource::<Vec<u8>>(&texture);
    assert!(rm.is_done(tex));
    assert_eq!(rm.reference_count(tex), Ok(2));

    rm.release(&mut tex).unwrap();
    rm.release(&mut h).unwrap();
    assert_eq!(rm.operation_cache_count(), 0);
}

#[test]
fn failures() {
    let sandbox = Sandbox::new();
    sandbox.write("broken.json", b"{ not json");
    sandbox.write("binary.txt", &[0xff, 0xfe, 0xfd]);

    let mut rm = manager(vec![
        TextProvider::new(sandbox.shortcuts()).into_rc(),
        JsonProvider::<Material>::new(sandbox.shortcuts()).into_rc(),
    ]);

    let locations = vec![
        Location::new("missing", "res:missing.txt", TextProvider::ID),
        Location::new("binary", "res:binary.txt", TextProvider::ID),
        Location::new("unresolved", "unknown:readme.txt", TextProvider::ID),
    ];

    let mut handles: Vec<_> = locations
        .iter()
        .map(|v| rm.provide_resource::<String>(v))
        .collect();

    let broken = Location::new("broken", "res:broken.json", JsonProvider::<Material>::ID);
    let mut json = rm.provide_resource::<Material>(&broken);

    for h in &handles {
        pump(&mut rm, *h);
        assert_eq!(rm.status(*h), Ok(OperationStatus::Failed));
    }

    match rm.operation_exception(handles[0]) {
        Ok(Some(Error::Io(_))) => {}
        other => panic!("unexpected {:?}", other),
    }

    match rm.operation_exception(handles[1]) {
        Ok(Some(Error::Provider(_))) => {}
        other => panic!("unexpected {:?}", other),
    }

    pump(&mut rm, json);
    assert_eq!(rm.status(json), Ok(OperationStatus::Failed));

    for h in &mut handles {
        rm.release(h).unwrap();
    }

    rm.release(&mut json).unwrap();
    assert_eq!(rm.operation_count(), 0);
}
