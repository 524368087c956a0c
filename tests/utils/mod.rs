#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use addressable::prelude::*;

pub fn setup() {
    let _ = env_logger::Builder::from_default_env()
        .is_test(true)
        .try_init();
}

pub fn manager(providers: Vec<Rc<dyn ResourceProvider>>) -> ResourceManager {
    manager_with(ResourceManagerParams::default(), providers)
}

pub fn manager_with(
    params: ResourceManagerParams,
    providers: Vec<Rc<dyn ResourceProvider>>,
) -> ResourceManager {
    setup();
    ResourceManager::with_providers(params, providers)
}

/// Updates until `handle` is done, with a generous timeout for background loads.
pub fn pump<H: OperationRef>(rm: &mut ResourceManager, handle: H) {
    for _ in 0..500 {
        rm.update(0.016);
        if rm.is_done(handle) {
            return;
        }

        thread::sleep(Duration::from_millis(10));
    }

    panic!("operation did not finish in time.");
}

#[derive(Default)]
pub struct Recorder {
    pub provided: Vec<String>,
    pub released: Vec<String>,
}

pub type SharedRecorder = Rc<RefCell<Recorder>>;

/// Completes synchronously with the internal id, followed by the results of its
/// dependencies in brackets. Ids starting with `fail`, `err` or `panic` fail in
/// the corresponding way.
pub struct SyncProvider {
    pub id: String,
    pub recorder: SharedRecorder,
    pub flags: ProviderBehaviourFlags,
}

impl SyncProvider {
    pub fn new(id: &str) -> (Rc<dyn ResourceProvider>, SharedRecorder) {
        SyncProvider::with_flags(id, ProviderBehaviourFlags::NONE)
    }

    pub fn with_flags(
        id: &str,
        flags: ProviderBehaviourFlags,
    ) -> (Rc<dyn ResourceProvider>, SharedRecorder) {
        let recorder = SharedRecorder::default();
        let provider = SyncProvider {
            id: id.to_owned(),
            recorder: recorder.clone(),
            flags,
        };

        (Rc::new(provider), recorder)
    }
}

impl ResourceProvider for SyncProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn default_type(&self, _: &Location) -> ResultType {
        ResultType::of::<String>()
    }

    fn provide(&self, rm: &mut ResourceManager, handle: ProvideHandle) -> Result<(), failure::Error> {
        let location = handle.location(rm)?;
        let id = location.internal_id.clone();
        self.recorder.borrow_mut().provided.push(id.clone());

        if id.starts_with("fail") {
            handle.fail::<String, _>(rm, format!("{} is broken.", id))?;
            return Ok(());
        }

        if id.starts_with("err") {
            failure::bail!("{} could not be provided.", id);
        }

        if id.starts_with("panic") {
            panic!("{} panicked.", id);
        }

        let deps: Vec<String> = handle
            .dependencies(rm)?
            .into_iter()
            .map(|v| match v.and_then(|v| v.downcast::<String>().ok()) {
                Some(v) => (*v).clone(),
                None => "-".to_owned(),
            })
            .collect();

        let value = if deps.is_empty() {
            id
        } else {
            format!("{}[{}]", id, deps.join(","))
        };

        handle.succeed(rm, value)?;
        Ok(())
    }

    fn release(&self, location: &Location, _: Option<Rc<dyn std::any::Any>>) {
        self.recorder
            .borrow_mut()
            .released
            .push(location.internal_id.clone());
    }

    fn behaviour_flags(&self) -> ProviderBehaviourFlags {
        self.flags
    }
}

/// Never completes by itself, the provide handles are stashed for the test to
/// complete manually.
pub struct ManualProvider {
    pub id: String,
    pub handles: Rc<RefCell<Vec<ProvideHandle>>>,
    pub progress: Rc<Cell<f32>>,
}

impl ManualProvider {
    pub fn new(id: &str) -> (Rc<dyn ResourceProvider>, Rc<RefCell<Vec<ProvideHandle>>>, Rc<Cell<f32>>) {
        let handles = Rc::new(RefCell::new(Vec::new()));
        let progress = Rc::new(Cell::new(0.0));
        let provider = ManualProvider {
            id: id.to_owned(),
            handles: handles.clone(),
            progress: progress.clone(),
        };

        (Rc::new(provider), handles, progress)
    }
}

impl ResourceProvider for ManualProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn default_type(&self, _: &Location) -> ResultType {
        ResultType::of::<String>()
    }

    fn provide(&self, rm: &mut ResourceManager, handle: ProvideHandle) -> Result<(), failure::Error> {
        let progress = self.progress.clone();
        handle.set_progress_callback(rm, move || progress.get())?;
        self.handles.borrow_mut().push(handle);
        Ok(())
    }
}

/// Claims to produce strings, but hands out numbers. The outcome of the
/// completion is kept for inspection.
#[derive(Default)]
pub struct LyingProvider {
    pub outcome: Rc<RefCell<Option<Result<(), Error>>>>,
}

impl ResourceProvider for LyingProvider {
    fn provider_id(&self) -> &str {
        "liar"
    }

    fn default_type(&self, _: &Location) -> ResultType {
        ResultType::of::<String>()
    }

    fn provide(&self, rm: &mut ResourceManager, handle: ProvideHandle) -> Result<(), failure::Error> {
        let outcome = handle.succeed(rm, 42u32);
        *self.outcome.borrow_mut() = Some(outcome);
        Ok(())
    }
}

/// Reports progress by panicking, and is completed by the test.
pub struct PanickyProgressProvider {
    pub handles: Rc<RefCell<Vec<ProvideHandle>>>,
}

impl ResourceProvider for PanickyProgressProvider {
    fn provider_id(&self) -> &str {
        "panicky"
    }

    fn default_type(&self, _: &Location) -> ResultType {
        ResultType::of::<String>()
    }

    fn provide(&self, rm: &mut ResourceManager, handle: ProvideHandle) -> Result<(), failure::Error> {
        handle.set_progress_callback(rm, || -> f32 { panic!("progress is broken.") })?;
        self.handles.borrow_mut().push(handle);
        Ok(())
    }
}

/// An operation which is completed by the test.
pub struct Manual;

impl AsyncOperation for Manual {
    type Output = u32;

    fn execute(&mut self, _: &mut ResourceManager, _: AsyncOperationHandle<u32>) {}
}

/// Completes as soon as it executes.
pub struct Immediate(pub u32);

impl AsyncOperation for Immediate {
    type Output = u32;

    fn execute(&mut self, rm: &mut ResourceManager, handle: AsyncOperationHandle<u32>) {
        rm.succeed(handle, self.0).unwrap();
    }
}
