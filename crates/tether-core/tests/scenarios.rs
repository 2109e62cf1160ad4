//! End-to-end behavior of the public API against the loopback transport.

use std::cell::{Cell, RefCell};
use std::ffi::{CStr, CString, c_char};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Wake, Waker};

use tether_core::{
    Continuation, Error, EventQueue, LoopbackTransport, OwnedHandle, Release, State, owned, wrap,
};
use tokio::sync::oneshot;

pub struct Gadget {
    _private: [u8; 0],
}

tether_core::dispatch_table! {
    pub struct GadgetListener for Gadget = "test_gadget" {
        0 reset<R>(serial: u32);
        1 named<N>(id: i32, name: *const c_char => &CStr);
        2 dropped<D>();
    }
}

#[test]
fn test_integer_handle_releases_exactly_once() {
    let calls = Rc::new(Cell::new(0));
    {
        let counter = calls.clone();
        let handle = wrap(42u32, move |_| counter.set(counter.get() + 1)).unwrap();
        assert_eq!(handle.get(), 42);
    }
    assert_eq!(calls.get(), 1);
}

#[test]
fn test_null_handle_fails_before_any_release() {
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let result = wrap(std::ptr::null_mut::<Gadget>(), move |_| {
        counter.set(counter.get() + 1)
    });

    let err = result.unwrap_err();
    assert!(matches!(err, Error::ResourceAcquisition { .. }));
    assert_eq!(err.location().unwrap().file(), file!());
    assert_eq!(calls.get(), 0);
}

#[test]
fn test_dispatch_reaches_only_the_matching_closure() {
    let transport = LoopbackTransport::new();
    let mut queue = EventQueue::new(transport.clone());
    let gadget = transport.own(transport.create::<Gadget>()).unwrap();

    let resets = Rc::new(Cell::new(0));
    let drops = Rc::new(Cell::new(0));
    let names = Rc::new(RefCell::new(Vec::new()));
    let (r, d, n) = (resets.clone(), drops.clone(), names.clone());
    queue
        .attach(
            &gadget,
            GadgetListener::handlers(
                move |_| r.set(r.get() + 1),
                move |id, name| n.borrow_mut().push((id, name.to_str().unwrap().to_owned())),
                move || d.set(d.get() + 1),
            ),
        )
        .unwrap();

    let name = CString::new("x").unwrap();
    transport.post(gadget.get(), move |table: &GadgetListener, data, proxy| unsafe {
        (table.named)(data, proxy, 7, name.as_ptr())
    });
    assert_eq!(queue.dispatch().unwrap(), 1);

    assert_eq!(*names.borrow(), vec![(7, "x".to_owned())]);
    assert_eq!(resets.get(), 0);
    assert_eq!(drops.get(), 0);
}

#[derive(Default)]
struct Parent(AtomicUsize);

impl Wake for Parent {
    fn wake(self: Arc<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_parent_sees_the_result_once() {
    let (tx, rx) = oneshot::channel();
    let mut child = Continuation::new(async move { rx.await.unwrap_or(0) });
    child.start().unwrap();
    let parent = Arc::new(Parent::default());
    child.set_parent(Waker::from(parent.clone())).unwrap();

    tx.send(99u32).unwrap();
    child.resume().unwrap();

    assert_eq!(parent.0.load(Ordering::SeqCst), 1);
    assert_eq!(child.extract_result().unwrap(), 99);
    assert!(matches!(
        child.extract_result(),
        Err(Error::InvalidContinuationState {
            state: State::Consumed,
            ..
        })
    ));
}

#[test]
fn test_round_trip_collects_state_set_by_handlers() {
    let transport = LoopbackTransport::new();
    let mut queue = EventQueue::new(transport.clone());
    let gadget = transport.own(transport.create::<Gadget>()).unwrap();

    let announced = Rc::new(RefCell::new(Vec::new()));
    let sink = announced.clone();
    queue
        .attach(
            &gadget,
            GadgetListener::handlers(
                |_| {},
                move |id, _| sink.borrow_mut().push(id),
                || {},
            ),
        )
        .unwrap();

    for id in 1..=3 {
        transport.post(gadget.get(), move |table: &GadgetListener, data, proxy| unsafe {
            (table.named)(data, proxy, id, c"g".as_ptr())
        });
    }
    let (callback, done) = queue.sync().unwrap();
    let seen = announced.clone();
    let mut round_trip = Continuation::new(async move {
        done.await.ok();
        seen.borrow().clone()
    });

    assert_eq!(queue.run_until(&mut round_trip).unwrap(), vec![1, 2, 3]);
    queue.destroy(callback);
    queue.destroy(gadget);
    assert!(queue.is_empty());
}

struct Surface;

thread_local! {
    static SURFACES_RELEASED: Cell<usize> = const { Cell::new(0) };
}

unsafe impl Release for Surface {
    unsafe fn release(raw: *mut Self) {
        drop(unsafe { Box::from_raw(raw) });
        SURFACES_RELEASED.with(|c| c.set(c.get() + 1));
    }
}

#[test]
fn test_default_release_and_into_raw() {
    let surface: OwnedHandle<*mut Surface> =
        owned!(Box::into_raw(Box::new(Surface))).unwrap();
    let raw = surface.into_raw();
    assert_eq!(SURFACES_RELEASED.with(Cell::get), 0);

    let surface = OwnedHandle::new(raw).unwrap();
    drop(surface);
    assert_eq!(SURFACES_RELEASED.with(Cell::get), 1);
}
