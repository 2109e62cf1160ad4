//! Event queue: a transport plus the closure storage of every listener
//! registered through it.
//!
//! The transport only keeps raw pointers to tables and closures, so their
//! storage has to outlive every dispatch that can reach them. The queue
//! keeps that storage in an arena keyed by proxy address. Each handle gets
//! its own slot, released when the handle is destroyed through
//! [`EventQueue::destroy`] or when the queue itself goes away.
//!
//! A handle dropped without going through the queue leaves its slot
//! behind. Addresses are reused, so a slot only counts while the transport
//! still reports its closures as the listener of that address; stale
//! slots are freed after every dispatch and whenever a new listener lands
//! on their address.

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem;
use std::ptr::NonNull;

use tracing::{debug, trace};

use crate::continuation::{Continuation, State};
use crate::error::{Error, Result};
use crate::handle::OwnedHandle;
use crate::listener::{Handlers, Interface};
use crate::transport::{Refusal, Transport};

/// Something that names a proxy of interface `I`.
pub trait AsProxy<I> {
    /// The proxy, or `None` when the handle is absent.
    fn as_proxy(&self) -> Option<NonNull<I>>;
}

impl<I, F: FnOnce(*mut I)> AsProxy<I> for OwnedHandle<*mut I, F> {
    fn as_proxy(&self) -> Option<NonNull<I>> {
        Some(self.as_non_null())
    }
}

impl<I> AsProxy<I> for *mut I {
    fn as_proxy(&self) -> Option<NonNull<I>> {
        NonNull::new(*self)
    }
}

impl<I> AsProxy<I> for NonNull<I> {
    fn as_proxy(&self) -> Option<NonNull<I>> {
        Some(*self)
    }
}

/// Heap storage of one registered listener.
struct Binding {
    interface: &'static str,
    proxy: NonNull<c_void>,
    table: NonNull<c_void>,
    closures: NonNull<c_void>,
    free: unsafe fn(NonNull<c_void>, NonNull<c_void>),
}

impl Binding {
    fn new<I: Interface, H: Handlers<I>>(proxy: NonNull<I>, handlers: H) -> Self {
        let table = NonNull::from(Box::leak(Box::new(H::table())));
        let closures = NonNull::from(Box::leak(Box::new(handlers)));
        Self {
            interface: I::NAME,
            proxy: proxy.cast(),
            table: table.cast(),
            closures: closures.cast(),
            free: free_binding::<I::Table, H>,
        }
    }
}

unsafe fn free_binding<T, H>(table: NonNull<c_void>, closures: NonNull<c_void>) {
    // SAFETY: both pointers came from `Box::leak` in `Binding::new` with
    // these exact types, and are freed only once.
    unsafe {
        drop(Box::from_raw(table.cast::<T>().as_ptr()));
        drop(Box::from_raw(closures.cast::<H>().as_ptr()));
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        trace!(interface = self.interface, "freeing listener storage");
        unsafe { (self.free)(self.table, self.closures) }
    }
}

/// A transport together with the listeners attached through it.
///
/// Dropping the queue unregisters every listener it attached before the
/// closure storage is freed.
pub struct EventQueue<T: Transport> {
    transport: T,
    bindings: HashMap<usize, Binding>,
}

impl<T: Transport> EventQueue<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            bindings: HashMap::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Number of live listener registrations.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Whether a listener is registered on `proxy`.
    pub fn is_attached<I: Interface>(&self, proxy: &impl AsProxy<I>) -> bool {
        proxy.as_proxy().is_some_and(|p| {
            self.bindings
                .get(&(p.as_ptr() as usize))
                .is_some_and(|binding| self.is_current(binding))
        })
    }

    /// Whether the transport still routes events of the binding's address
    /// into its closures.
    fn is_current(&self, binding: &Binding) -> bool {
        self.transport.listener_data(binding.proxy) == Some(binding.closures)
    }

    /// Unregisters `binding` if it is still installed, then frees it.
    fn retire(&mut self, binding: Binding) {
        if self.is_current(&binding) {
            self.transport.remove_listener(binding.proxy);
        }
        debug!(interface = binding.interface, "listener released");
    }

    /// Frees the storage of every binding whose proxy is gone.
    fn sweep(&mut self) {
        let stale: Vec<usize> = self
            .bindings
            .iter()
            .filter(|(_, binding)| !self.is_current(binding))
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            if let Some(binding) = self.bindings.remove(&key) {
                trace!(interface = binding.interface, "stale listener swept");
            }
        }
    }

    /// Routes every future event of `proxy` to the closure at its slot in
    /// `handlers`.
    ///
    /// Fails with [`Error::ResourceAcquisition`] for an absent proxy or
    /// one the transport does not know as a live `I`, and with
    /// [`Error::DuplicateRegistration`] if `proxy` already has a listener.
    /// A rejected registration leaves the first one in place.
    #[track_caller]
    pub fn attach<I, P, H>(&mut self, proxy: &P, handlers: H) -> Result<()>
    where
        I: Interface,
        P: AsProxy<I> + ?Sized,
        H: Handlers<I>,
    {
        let Some(proxy) = proxy.as_proxy() else {
            return Err(Error::acquisition(I::NAME));
        };
        let key = proxy.as_ptr() as usize;
        if let Some(previous) = self.bindings.get(&key) {
            if self.is_current(previous) {
                return Err(Error::DuplicateRegistration { interface: I::NAME });
            }
            // Left by a proxy dropped outside the queue; the address now
            // names another object.
            self.bindings.remove(&key);
        }

        let binding = Binding::new::<I, H>(proxy, handlers);
        // SAFETY: the table matches `I`, and the binding is kept in the
        // arena until the proxy is destroyed or the queue is dropped.
        let added = unsafe {
            self.transport
                .add_listener(proxy.cast(), I::NAME, binding.table, binding.closures)
        };
        match added {
            Ok(()) => {}
            Err(Refusal::Occupied) => {
                return Err(Error::DuplicateRegistration { interface: I::NAME });
            }
            Err(Refusal::InvalidObject) => return Err(Error::acquisition(I::NAME)),
        }

        debug!(interface = I::NAME, slots = I::SLOTS, "listener attached");
        self.bindings.insert(key, binding);
        Ok(())
    }

    /// Unregisters and frees the listener storage of `handle`, then
    /// releases it.
    pub fn destroy<I: Interface, F: FnOnce(*mut I)>(&mut self, handle: OwnedHandle<*mut I, F>) {
        if let Some(binding) = self.bindings.remove(&(handle.get() as usize)) {
            self.retire(binding);
        }
        handle.release();
    }

    /// Services pending events once, then frees the storage of listeners
    /// whose proxies were dropped meanwhile.
    pub fn dispatch(&mut self) -> Result<usize> {
        let dispatched = self.transport.dispatch()?;
        trace!(dispatched, "dispatch");
        self.sweep();
        Ok(dispatched)
    }

    /// Dispatches until `continuation` completes, then extracts its result.
    ///
    /// The continuation is started if it has not been. A dispatch that
    /// delivers nothing while the continuation is still waiting means the
    /// awaited event can never arrive; that is reported as a transport
    /// error rather than spinning.
    pub fn run_until<R>(&mut self, continuation: &mut Continuation<R>) -> Result<R> {
        if continuation.state() == State::Created {
            continuation.start()?;
        }
        while continuation.state() == State::Suspended {
            let dispatched = self.dispatch()?;
            if continuation.is_woken() {
                continuation.resume()?;
            } else if dispatched == 0 {
                return Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "no events pending for a suspended continuation",
                )));
            }
        }
        continuation.extract_result()
    }
}

impl<T: Transport> Drop for EventQueue<T> {
    fn drop(&mut self) {
        if !self.bindings.is_empty() {
            debug!(live = self.bindings.len(), "dropping event queue with live listeners");
        }
        for (_, binding) in mem::take(&mut self.bindings) {
            self.retire(binding);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::ffi::CString;
    use std::rc::Rc;

    use super::*;
    use crate::listener::tests::{Widget, WidgetListener, Seen, recording_handlers};
    use crate::loopback::LoopbackTransport;

    fn queue() -> (EventQueue<LoopbackTransport>, LoopbackTransport) {
        let transport = LoopbackTransport::new();
        (EventQueue::new(transport.clone()), transport)
    }

    #[test]
    fn test_dispatch_reaches_only_the_closure_of_the_slot() {
        let (mut queue, transport) = queue();
        let widget = transport.own(transport.create::<Widget>()).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue.attach(&widget, recording_handlers(&log)).unwrap();

        let text = CString::new("x").unwrap();
        transport.post(widget.get(), move |table: &WidgetListener, data, proxy| unsafe {
            (table.label)(data, proxy, 7, text.as_ptr())
        });
        assert_eq!(queue.dispatch().unwrap(), 1);

        assert_eq!(*log.borrow(), vec![Seen::Label(7, "x".into())]);
    }

    #[test]
    fn test_events_of_one_slot_arrive_in_order_and_count() {
        let (mut queue, transport) = queue();
        let widget = transport.own(transport.create::<Widget>()).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue.attach(&widget, recording_handlers(&log)).unwrap();

        for serial in [3, 1, 2] {
            transport.post(widget.get(), move |table: &WidgetListener, data, proxy| unsafe {
                (table.ping)(data, proxy, serial)
            });
        }
        assert_eq!(queue.dispatch().unwrap(), 3);
        assert_eq!(
            *log.borrow(),
            vec![Seen::Ping(3), Seen::Ping(1), Seen::Ping(2)]
        );
    }

    #[test]
    fn test_second_attach_on_a_handle_is_rejected_and_first_survives() {
        let (mut queue, transport) = queue();
        let widget = transport.own(transport.create::<Widget>()).unwrap();
        let first = Rc::new(RefCell::new(Vec::new()));
        let second = Rc::new(RefCell::new(Vec::new()));

        queue.attach(&widget, recording_handlers(&first)).unwrap();
        let err = queue.attach(&widget, recording_handlers(&second)).unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateRegistration { interface: "test_widget" }
        ));
        assert_eq!(queue.len(), 1);

        transport.post(widget.get(), |table: &WidgetListener, data, proxy| unsafe {
            (table.ping)(data, proxy, 9)
        });
        queue.dispatch().unwrap();
        assert_eq!(*first.borrow(), vec![Seen::Ping(9)]);
        assert!(second.borrow().is_empty());
        // The rejected closures were freed right away.
        assert_eq!(Rc::strong_count(&second), 1);
    }

    #[test]
    fn test_transport_refusal_is_a_duplicate_registration() {
        let (mut queue, transport) = queue();
        let raw = transport.create::<Widget>();
        let log = Rc::new(RefCell::new(Vec::new()));

        // Registered behind the queue's back, so only the transport knows.
        let mut other = EventQueue::new(transport.clone());
        other.attach(&raw, recording_handlers(&log)).unwrap();

        let err = queue.attach(&raw, recording_handlers(&log)).unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration { .. }));
        assert!(queue.is_empty());

        transport.destroy(raw);
    }

    #[test]
    fn test_absent_proxy_is_an_acquisition_failure() {
        let (mut queue, _transport) = queue();
        let log = Rc::new(RefCell::new(Vec::new()));
        let err = queue
            .attach(&std::ptr::null_mut::<Widget>(), recording_handlers(&log))
            .unwrap_err();

        assert!(matches!(err, Error::ResourceAcquisition { .. }));
        assert_eq!(err.location().unwrap().file(), file!());
    }

    #[test]
    fn test_destroy_frees_storage_of_that_handle_only() {
        let (mut queue, transport) = queue();
        let a = transport.own(transport.create::<Widget>()).unwrap();
        let b = transport.own(transport.create::<Widget>()).unwrap();
        let log_a = Rc::new(RefCell::new(Vec::new()));
        let log_b = Rc::new(RefCell::new(Vec::new()));
        queue.attach(&a, recording_handlers(&log_a)).unwrap();
        queue.attach(&b, recording_handlers(&log_b)).unwrap();
        assert!(queue.is_attached(&a));

        let b_raw = b.get();
        transport.post(b_raw, |table: &WidgetListener, data, proxy| unsafe {
            (table.ping)(data, proxy, 1)
        });
        queue.destroy(b);

        assert_eq!(queue.len(), 1);
        assert_eq!(Rc::strong_count(&log_b), 1);
        // The event queued for the destroyed proxy is dropped.
        assert_eq!(queue.dispatch().unwrap(), 0);
        assert!(log_b.borrow().is_empty());
        assert!(!queue.is_attached(&b_raw));
    }

    #[test]
    fn test_explicit_tuples_attach_like_generated_bundles() {
        let (mut queue, transport) = queue();
        let widget = transport.own(transport.create::<Widget>()).unwrap();
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();

        queue
            .attach(
                &widget,
                (
                    |_: u32| {},
                    |_: i32, _: &std::ffi::CStr| {},
                    move |x: crate::Fixed, y: crate::Fixed| *sink.borrow_mut() = Some((x, y)),
                ),
            )
            .unwrap();
        transport.post(widget.get(), |table: &WidgetListener, data, proxy| unsafe {
            (table.moved)(data, proxy, 256, 512)
        });
        queue.dispatch().unwrap();

        assert_eq!(
            *seen.borrow(),
            Some((crate::Fixed(256), crate::Fixed(512)))
        );
    }

    #[test]
    fn test_dropping_the_queue_frees_all_storage() {
        let (mut queue, transport) = queue();
        let widget = transport.own(transport.create::<Widget>()).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue.attach(&widget, recording_handlers(&log)).unwrap();

        drop(queue);
        assert_eq!(Rc::strong_count(&log), 1);
        drop(widget);
    }

    #[test]
    fn test_reused_address_accepts_a_new_listener_after_plain_drop() {
        let (mut queue, transport) = queue();
        let first = transport.own(transport.create::<Widget>()).unwrap();
        let address = first.get();
        let old = Rc::new(RefCell::new(Vec::new()));
        queue.attach(&first, recording_handlers(&old)).unwrap();
        drop(first);

        let second = transport.own(transport.create::<Widget>()).unwrap();
        assert_eq!(second.get(), address);
        assert!(!queue.is_attached(&second));

        let new = Rc::new(RefCell::new(Vec::new()));
        queue.attach(&second, recording_handlers(&new)).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(Rc::strong_count(&old), 1);

        transport.post(second.get(), |table: &WidgetListener, data, proxy| unsafe {
            (table.ping)(data, proxy, 5)
        });
        queue.dispatch().unwrap();
        assert_eq!(*new.borrow(), vec![Seen::Ping(5)]);
        assert!(old.borrow().is_empty());
    }

    #[test]
    fn test_dispatch_frees_storage_of_dropped_proxies() {
        let (mut queue, transport) = queue();
        let kept = transport.own(transport.create::<Widget>()).unwrap();
        let dropped = transport.own(transport.create::<Widget>()).unwrap();
        let log_kept = Rc::new(RefCell::new(Vec::new()));
        let log_dropped = Rc::new(RefCell::new(Vec::new()));
        queue.attach(&kept, recording_handlers(&log_kept)).unwrap();
        queue.attach(&dropped, recording_handlers(&log_dropped)).unwrap();

        drop(dropped);
        assert_eq!(queue.len(), 2);
        queue.dispatch().unwrap();

        assert_eq!(queue.len(), 1);
        assert!(queue.is_attached(&kept));
        assert_eq!(Rc::strong_count(&log_dropped), 1);
        assert_eq!(Rc::strong_count(&log_kept), 2);
    }

    #[test]
    fn test_destroyed_proxy_is_an_acquisition_failure() {
        let (mut queue, transport) = queue();
        let raw = transport.create::<Widget>();
        transport.destroy(raw);
        let log = Rc::new(RefCell::new(Vec::new()));

        let err = queue.attach(&raw, recording_handlers(&log)).unwrap_err();
        assert!(matches!(
            err,
            Error::ResourceAcquisition { ref what, .. } if what == "test_widget"
        ));
        assert_eq!(err.location().unwrap().file(), file!());
        assert!(queue.is_empty());
        assert_eq!(Rc::strong_count(&log), 1);
    }
}
