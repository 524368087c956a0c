extern crate addressable;
extern crate rand;

mod utils;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use addressable::prelude::*;

use self::utils::*;

#[test]
fn reference_count() {
    let mut rm = manager(vec![]);

    for _ in 0..16 {
        let h = rm.create_completed_operation(Some(0u8), "");
        let mut expected = 1;

        while expected > 0 {
            if rand::random::<bool>() {
                rm.acquire(h).unwrap();
                expected += 1;
            } else {
                let mut v = h;
                rm.release(&mut v).unwrap();
                expected -= 1;
            }

            if expected > 0 {
                assert_eq!(rm.reference_count(h), Ok(expected));
            }
        }

        assert!(!rm.is_valid(h));
        assert!(rm.is_done(h));
    }

    assert!(rm.dispose().is_ok());
}

#[test]
fn destroy_once() {
    let mut rm = manager(vec![]);

    let destroyed = Rc::new(Cell::new(0));
    let d2 = destroyed.clone();

    let h = rm.create_completed_operation(Some(0u8), "");
    rm.on_destroyed(h, move |_, _| d2.set(d2.get() + 1)).unwrap();

    rm.acquire(h).unwrap();
    rm.acquire(h).unwrap();
    for _ in 0..3 {
        let mut v = h;
        rm.release(&mut v).unwrap();
    }

    assert_eq!(destroyed.get(), 1);

    let mut v = h;
    assert_eq!(rm.release(&mut v), Err(Error::InvalidHandle));
    assert_eq!(rm.acquire(h), Err(Error::InvalidHandle));
    assert_eq!(destroyed.get(), 1);
}

#[test]
fn stale_handle() {
    let mut rm = manager(vec![]);

    let mut h1 = rm.create_completed_operation(Some(1u32), "");
    let mut stale = h1;
    rm.release(&mut h1).unwrap();
    assert!(!h1.is_valid());

    let mut h2 = rm.create_completed_operation(Some(2u32), "");
    assert_eq!(h2.untyped().index(), stale.untyped().index());
    assert_ne!(h2, stale);

    assert!(!rm.is_valid(stale));
    assert_eq!(rm.status(stale), Err(Error::InvalidHandle));
    assert_eq!(rm.result(stale), Err(Error::InvalidHandle));
    assert_eq!(rm.release(&mut stale), Err(Error::InvalidHandle));
    assert_eq!(rm.reference_count(h2), Ok(1));

    rm.release(&mut h2).unwrap();
}

#[test]
fn destroyed_callback() {
    let mut rm = manager(vec![]);

    let records = Rc::new(RefCell::new(Vec::new()));
    let r2 = records.clone();

    let mut h = rm.create_completed_operation(Some(7u32), "");
    rm.on_destroyed(h, move |rm, h| {
        let mut records = r2.borrow_mut();
        records.push(rm.acquire(h).map(|_| ()));

        let mut v = h;
        records.push(rm.release(&mut v));
        records.push(rm.on_completed(h, |_, _| {}));
        records.push(match rm.result(h) {
            Ok(Some(ref v)) if **v == 7 => Ok(()),
            _ => Err(Error::InvalidHandle),
        });
    })
    .unwrap();

    rm.release(&mut h).unwrap();

    let records = records.borrow();
    assert_eq!(records.len(), 4);
    assert!(match records[0] {
        Err(Error::Destroyed(_)) => true,
        _ => false,
    });
    assert!(match records[1] {
        Err(Error::ReferenceCountUnderflow(_)) => true,
        _ => false,
    });
    assert!(match records[2] {
        Err(Error::Destroyed(_)) => true,
        _ => false,
    });
    assert_eq!(records[3], Ok(()));
    assert_eq!(rm.operation_count(), 0);
}

#[test]
fn callback_order() {
    let mut rm = manager(vec![]);

    let order = Rc::new(RefCell::new(String::new()));
    let mut h = rm.start_operation(Manual, None);

    for c in &['a', 'b', 'c'] {
        let c = *c;
        let order = order.clone();
        rm.on_completed(h, move |rm, h| {
            assert!(rm.is_done(h));
            order.borrow_mut().push(c);
        })
        .unwrap();
    }

    rm.succeed(h, 1).unwrap();
    assert_eq!(order.borrow().as_str(), "abc");

    rm.release(&mut h).unwrap();
    assert_eq!(rm.operation_count(), 0);
}

#[test]
fn deferred_callback() {
    let mut rm = manager(vec![]);

    let invoked = Rc::new(Cell::new(false));
    let i2 = invoked.clone();

    let mut h = rm.create_completed_operation(Some(1u32), "");
    rm.on_completed(h, move |rm, h| {
        assert!(rm.is_valid(h));
        i2.set(true);
    })
    .unwrap();

    // The pending callback holds a reference until it is invoked.
    assert!(!invoked.get());
    assert_eq!(rm.reference_count(h), Ok(2));

    rm.release(&mut h).unwrap();
    assert_eq!(rm.operation_count(), 1);

    rm.update(0.0);
    assert!(invoked.get());
    assert_eq!(rm.operation_count(), 0);
}

#[test]
fn exception_handler() {
    let mut rm = manager(vec![]);

    let errors = Rc::new(RefCell::new(Vec::new()));
    let e2 = errors.clone();
    rm.set_exception_handler(move |h, err| e2.borrow_mut().push((h, err.clone())));

    let mut h1 = rm.start_operation(Manual, None);
    let visited = Rc::new(Cell::new(false));
    let v2 = visited.clone();

    rm.on_completed(h1, |_, _| panic!("oops")).unwrap();
    rm.on_completed(h1, move |_, _| v2.set(true)).unwrap();
    rm.fail(h1, "broken").unwrap();

    {
        let errors = errors.borrow();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], (h1.untyped(), Error::Operation("broken".to_owned())));
        assert_eq!(errors[1].0, h1.untyped());
        assert!(match errors[1].1 {
            Error::CallbackPanicked(ref msg) => msg.contains("oops"),
            _ => false,
        });
    }

    // Later callbacks still run.
    assert!(visited.get());

    rm.clear_exception_handler();
    let mut h2 = rm.create_completed_operation::<u32, _>(None, "silent");
    assert_eq!(errors.borrow().len(), 2);

    rm.release(&mut h1).unwrap();
    rm.release(&mut h2).unwrap();
    assert_eq!(rm.operation_count(), 0);
}

#[test]
fn update_receivers() {
    let mut rm = manager(vec![]);

    let ticks = Rc::new(Cell::new(0));
    let t2 = ticks.clone();
    let r1 = rm.add_update_receiver(move |_, _| t2.set(t2.get() + 1));

    let once = Rc::new(Cell::new(0));
    let me = Rc::new(Cell::new(UpdateReceiverHandle::nil()));
    let (o2, m2) = (once.clone(), me.clone());
    let r2 = rm.add_update_receiver(move |rm, _| {
        o2.set(o2.get() + 1);
        assert!(rm.remove_update_receiver(m2.get()));
    });
    me.set(r2);

    rm.update(0.1);
    rm.update(0.1);
    assert_eq!(ticks.get(), 2);
    assert_eq!(once.get(), 1);
    assert!(!rm.remove_update_receiver(r2));

    assert!(rm.remove_update_receiver(r1));
    rm.update(0.1);
    assert_eq!(ticks.get(), 2);
}

#[test]
fn diagnostics() {
    use DiagnosticEventType::*;

    let mut rm = manager(vec![]);

    let events = Rc::new(RefCell::new(Vec::new()));
    let e2 = events.clone();
    rm.register_diagnostic_callback(move |e| e2.borrow_mut().push((e.kind, e.value)));

    let mut h = rm.create_completed_operation(Some(1u32), "");
    rm.release(&mut h).unwrap();

    assert_eq!(
        *events.borrow(),
        vec![
            (AsyncOperationCreate, 0),
            (AsyncOperationReferenceCount, 2),
            (AsyncOperationComplete, 100),
            (AsyncOperationReferenceCount, 1),
            (AsyncOperationReferenceCount, 0),
            (AsyncOperationDestroy, 0),
        ]
    );

    events.borrow_mut().clear();
    let mut h = rm.start_operation(Manual, None);
    rm.update(0.0);
    assert!(events
        .borrow()
        .iter()
        .any(|v| *v == (AsyncOperationPercentComplete, 0)));

    rm.clear_diagnostics_callback();
    events.borrow_mut().clear();
    rm.fail(h, "x").unwrap();
    rm.release(&mut h).unwrap();
    assert!(events.borrow().is_empty());
}

#[test]
fn circular_dependency() {
    let (provider, recorder) = SyncProvider::new("sync");
    let mut rm = manager(vec![provider]);

    let back = Location::new("a", "a", "sync");
    let b = Location::new("b", "b", "sync").with_dependencies(vec![back]);
    let a = Location::new("a", "a", "sync").with_dependencies(vec![b]);

    let mut h = rm.provide_resource::<String>(&a);
    assert_eq!(rm.status(h), Ok(OperationStatus::Failed));
    assert!(recorder.borrow().provided.is_empty());

    match rm.operation_exception(h) {
        Ok(Some(Error::DependencyFailed(msg))) => assert!(msg.contains("Circular dependency")),
        other => panic!("unexpected {:?}", other),
    }

    rm.release(&mut h).unwrap();
    assert_eq!(rm.operation_cache_count(), 0);
    assert_eq!(rm.operation_count(), 0);
}

#[test]
fn leaked_operations() {
    let params = ResourceManagerParams {
        detect_cycles: false,
        ..ResourceManagerParams::default()
    };

    let (provider, _) = SyncProvider::new("sync");
    let mut rm = manager_with(params, vec![provider]);

    let back = Location::new("a", "a", "sync");
    let b = Location::new("b", "b", "sync").with_dependencies(vec![back]);
    let a = Location::new("a", "a", "sync").with_dependencies(vec![b]);

    // Without cycle detection the two loads wait on each other forever.
    let mut h = rm.provide_resource::<String>(&a);
    assert!(!rm.is_done(h));
    rm.update(0.0);
    assert!(!rm.is_done(h));

    rm.release(&mut h).unwrap();
    assert_eq!(rm.dispose(), Err(Error::LeakedOperations(2)));
}

struct NestedProvider {
    inner: Rc<Cell<OperationHandle>>,
}

impl ResourceProvider for NestedProvider {
    fn provider_id(&self) -> &str {
        "nested"
    }

    fn default_type(&self, _: &Location) -> ResultType {
        ResultType::of::<String>()
    }

    fn provide(&self, rm: &mut ResourceManager, handle: ProvideHandle) -> Result<(), failure::Error> {
        let inner = rm.provide_resource::<String>(&Location::new("inner", "inner", "sync"));
        self.inner.set(inner.untyped());
        handle.succeed(rm, "outer".to_owned())?;
        Ok(())
    }
}

#[test]
fn nested_starts_are_deferred() {
    let inner = Rc::new(Cell::new(OperationHandle::nil()));
    let nested = NestedProvider {
        inner: inner.clone(),
    };

    let (sync, _) = SyncProvider::new("sync");
    let mut rm = manager(vec![Rc::new(nested) as Rc<dyn ResourceProvider>, sync]);

    let mut h = rm.provide_resource::<String>(&Location::new("outer", "outer", "nested"));
    assert!(rm.is_done(h));

    let mut inner = inner.get();
    assert!(!rm.is_done(inner));

    rm.update(0.0);
    assert_eq!(rm.status(inner), Ok(OperationStatus::Succeeded));

    rm.release(&mut inner).unwrap();
    rm.release(&mut h).unwrap();
    assert_eq!(rm.operation_count(), 0);
}

#[test]
fn wait_handle() {
    let (provider, handles, _) = ManualProvider::new("manual");
    let mut rm = manager(vec![provider]);

    let mut h = rm.provide_resource::<String>(&Location::new("a", "a", "manual"));
    let wait = rm.wait_handle(h).unwrap();
    assert!(!wait.is_set());
    assert!(!wait.wait_timeout(Duration::from_millis(1)));

    let waiter = {
        let wait = wait.clone();
        thread::spawn(move || wait.wait_timeout(Duration::from_secs(5)))
    };

    let handle = handles.borrow()[0];
    handle.succeed(&mut rm, "a".to_owned()).unwrap();
    assert!(waiter.join().unwrap());
    assert!(wait.is_set());

    // Operations which are already done hand out a signalled handle.
    assert!(rm.wait_handle(h).unwrap().is_set());

    rm.release(&mut h).unwrap();
    assert!(rm.wait_handle(h).is_err());
}

#[test]
fn background_completion() {
    struct Background;

    impl ResourceProvider for Background {
        fn provider_id(&self) -> &str {
            "bg"
        }

        fn default_type(&self, _: &Location) -> ResultType {
            ResultType::of::<String>()
        }

        fn provide(&self, rm: &mut ResourceManager, handle: ProvideHandle) -> Result<(), failure::Error> {
            let id = handle.location(rm)?.internal_id.clone();
            let sender = handle.complete_later::<String>(rm);
            thread::spawn(move || {
                if id == "drop" {
                    drop(sender);
                } else {
                    sender.succeed(id);
                }
            });

            Ok(())
        }
    }

    let mut rm = manager(vec![Rc::new(Background) as Rc<dyn ResourceProvider>]);

    let mut h1 = rm.provide_resource::<String>(&Location::new("a", "a", "bg"));
    let mut h2 = rm.provide_resource::<String>(&Location::new("d", "drop", "bg"));
    assert!(!rm.is_done(h1));

    pump(&mut rm, h1);
    pump(&mut rm, h2);

    assert_eq!(rm.result(h1).unwrap().map(|v| (*v).clone()), Some("a".to_owned()));
    assert_eq!(rm.status(h2), Ok(OperationStatus::Failed));

    rm.release(&mut h1).unwrap();
    rm.release(&mut h2).unwrap();
    assert_eq!(rm.operation_count(), 0);
}
