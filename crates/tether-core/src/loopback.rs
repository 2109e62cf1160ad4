//! In-process transport with a scriptable peer.
//!
//! Objects are plain heap cells whose addresses serve as proxies. Like
//! protocol object ids, the cell of a destroyed object is handed to the
//! next object created, so every object also carries a serial that is
//! never reused; events are bound to that serial, not to the address.
//!
//! The peer side is whoever holds a clone of the [`LoopbackTransport`]: it
//! queues events with [`LoopbackTransport::post`], and
//! [`Transport::dispatch`] delivers them through the registered tables in
//! posting order.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::ffi::c_void;
use std::io;
use std::mem;
use std::ptr::NonNull;
use std::rc::Rc;

use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::error::Result;
use crate::handle::{OwnedHandle, wrap_named};
use crate::listener::Interface;
use crate::queue::EventQueue;
use crate::transport::{Refusal, Transport};

/// A proxy whose release destroys it on the loopback transport.
pub type Proxy<I> = OwnedHandle<*mut I, Box<dyn FnOnce(*mut I)>>;

type Deliver = Box<dyn FnOnce(NonNull<c_void>, NonNull<c_void>)>;

struct Listener {
    table: NonNull<c_void>,
    data: NonNull<c_void>,
}

struct Object {
    id: u64,
    interface: &'static str,
    cell: *mut u64,
    listener: Option<Listener>,
}

struct Event {
    proxy: usize,
    /// Object serial at posting time, 0 if the proxy was not alive.
    object: u64,
    interface: &'static str,
    deliver: Deliver,
}

struct Inner {
    objects: HashMap<usize, Object>,
    /// Cells of destroyed objects, reused newest first.
    vacant: Vec<*mut u64>,
    events: VecDeque<Event>,
    connected: bool,
    next_object: u64,
    next_serial: u32,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let cells = self.objects.drain().map(|(_, object)| object.cell);
        for cell in cells.chain(self.vacant.drain(..)) {
            // SAFETY: every cell came from `Box::into_raw` in `create` and
            // sits either in `objects` or in `vacant`, never both.
            drop(unsafe { Box::from_raw(cell) });
        }
    }
}

/// Cloneable handle to one in-process connection.
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Rc<RefCell<Inner>>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                objects: HashMap::new(),
                vacant: Vec::new(),
                events: VecDeque::new(),
                connected: true,
                next_object: 1,
                next_serial: 1,
            })),
        }
    }

    /// Creates an object of interface `I` and returns its raw proxy.
    ///
    /// The proxy may equal that of an object destroyed earlier.
    pub fn create<I: Interface>(&self) -> *mut I {
        let mut inner = self.inner.borrow_mut();
        let cell = inner
            .vacant
            .pop()
            .unwrap_or_else(|| Box::into_raw(Box::new(0u64)));
        let id = inner.next_object;
        inner.next_object += 1;
        // SAFETY: `cell` is a live allocation owned by the transport.
        unsafe { *cell = id };
        inner.objects.insert(
            cell as usize,
            Object {
                id,
                interface: I::NAME,
                cell,
                listener: None,
            },
        );
        trace!(interface = I::NAME, id, "object created");
        cell.cast()
    }

    /// Destroys `proxy`. Events still queued for it are dropped at
    /// dispatch, even once its address names a new object. Unknown
    /// proxies are ignored.
    pub fn destroy<I>(&self, proxy: *mut I) {
        let mut inner = self.inner.borrow_mut();
        if let Some(object) = inner.objects.remove(&(proxy as usize)) {
            trace!(interface = object.interface, id = object.id, "object destroyed");
            inner.vacant.push(object.cell);
        }
    }

    /// Whether `proxy` names a live object.
    pub fn is_alive<I>(&self, proxy: *mut I) -> bool {
        self.inner.borrow().objects.contains_key(&(proxy as usize))
    }

    /// Takes ownership of `proxy`; dropping the result destroys it.
    #[track_caller]
    pub fn own<I: Interface>(&self, proxy: *mut I) -> Result<Proxy<I>> {
        let transport = self.clone();
        let release: Box<dyn FnOnce(*mut I)> = Box::new(move |p| transport.destroy(p));
        wrap_named(proxy, release, I::NAME)
    }

    /// Queues an event for `proxy`.
    ///
    /// At dispatch `event` receives the proxy's table, its listener data and
    /// the proxy, and is expected to call one slot of the table.
    pub fn post<I, E>(&self, proxy: *mut I, event: E)
    where
        I: Interface,
        E: FnOnce(&I::Table, *mut c_void, *mut I) + 'static,
    {
        let deliver: Deliver = Box::new(move |table, data| {
            // SAFETY: dispatch only delivers to a listener registered under
            // `I::NAME`, whose table is an `I::Table`.
            let table = unsafe { table.cast::<I::Table>().as_ref() };
            event(table, data.as_ptr(), proxy)
        });
        let mut inner = self.inner.borrow_mut();
        let object = inner
            .objects
            .get(&(proxy as usize))
            .map_or(0, |object| object.id);
        inner.events.push_back(Event {
            proxy: proxy as usize,
            object,
            interface: I::NAME,
            deliver,
        });
    }

    /// Creates a callback and queues its `done` behind every event queued
    /// so far.
    pub fn sync(&self) -> *mut Callback {
        let callback = self.create::<Callback>();
        let serial = {
            let mut inner = self.inner.borrow_mut();
            let serial = inner.next_serial;
            inner.next_serial = serial.wrapping_add(1);
            serial
        };
        self.post(callback, move |table: &CallbackListener, data, proxy| unsafe {
            (table.done)(data, proxy, serial)
        });
        callback
    }

    /// Marks the connection as lost. Every later dispatch fails.
    pub fn disconnect(&self) {
        self.inner.borrow_mut().connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }

    /// Number of queued events.
    pub fn pending(&self) -> usize {
        self.inner.borrow().events.len()
    }
}

impl Transport for LoopbackTransport {
    unsafe fn add_listener(
        &mut self,
        proxy: NonNull<c_void>,
        interface: &'static str,
        table: NonNull<c_void>,
        data: NonNull<c_void>,
    ) -> Result<(), Refusal> {
        let mut inner = self.inner.borrow_mut();
        let Some(object) = inner.objects.get_mut(&(proxy.as_ptr() as usize)) else {
            warn!(interface, "listener for an unknown object");
            return Err(Refusal::InvalidObject);
        };
        if object.interface != interface {
            warn!(
                expected = object.interface,
                interface, "listener for a different interface"
            );
            return Err(Refusal::InvalidObject);
        }
        if object.listener.is_some() {
            return Err(Refusal::Occupied);
        }
        object.listener = Some(Listener { table, data });
        Ok(())
    }

    fn listener_data(&self, proxy: NonNull<c_void>) -> Option<NonNull<c_void>> {
        self.inner
            .borrow()
            .objects
            .get(&(proxy.as_ptr() as usize))
            .and_then(|object| object.listener.as_ref())
            .map(|listener| listener.data)
    }

    fn remove_listener(&mut self, proxy: NonNull<c_void>) {
        if let Some(object) = self
            .inner
            .borrow_mut()
            .objects
            .get_mut(&(proxy.as_ptr() as usize))
        {
            object.listener = None;
        }
    }

    fn dispatch(&mut self) -> io::Result<usize> {
        let batch = {
            let mut inner = self.inner.borrow_mut();
            if !inner.connected {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "loopback connection closed",
                ));
            }
            mem::take(&mut inner.events)
        };

        let mut delivered = 0;
        for event in batch {
            let target = {
                let inner = self.inner.borrow();
                match inner.objects.get(&event.proxy) {
                    None => None,
                    Some(object) if object.id != event.object => None,
                    Some(object) if object.interface != event.interface => {
                        warn!(
                            object = object.interface,
                            event = event.interface,
                            "event for a different interface dropped"
                        );
                        None
                    }
                    Some(object) => object.listener.as_ref().map(|l| (l.table, l.data)),
                }
            };
            match target {
                // The borrow is released: handlers may call back into the
                // transport.
                Some((table, data)) => {
                    (event.deliver)(table, data);
                    delivered += 1;
                }
                None => trace!(interface = event.interface, "event dropped"),
            }
        }
        Ok(delivered)
    }
}

/// Round-trip marker object.
pub struct Callback {
    _private: [u8; 0],
}

crate::dispatch_table! {
    /// Events of a callback object.
    pub struct CallbackListener for Callback = "wl_callback" {
        0 done<D>(callback_data: u32);
    }
}

impl EventQueue<LoopbackTransport> {
    /// Requests a round trip.
    ///
    /// The receiver resolves with the callback serial once every event
    /// queued before the request has been dispatched. The returned proxy
    /// must stay alive until then.
    #[track_caller]
    pub fn sync(&mut self) -> Result<(Proxy<Callback>, oneshot::Receiver<u32>)> {
        let callback = self.transport().own(self.transport().sync())?;
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        self.attach(
            &callback,
            CallbackListener::handlers(move |serial| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(serial);
                }
            }),
        )?;
        Ok((callback, rx))
    }
}
