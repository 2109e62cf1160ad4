//! What the core needs from a display transport.
//!
//! The transport owns the connection, marshals requests and events, and
//! calls dispatch tables. The core never implements any of that; it only
//! hands tables to the transport and asks it to service pending events.

use std::ffi::c_void;
use std::io;
use std::ptr::NonNull;

/// Why a transport declined a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The object already carries a listener.
    Occupied,
    /// The transport does not know a live object of that interface there.
    InvalidObject,
}

/// A connection that dispatches events through registered tables.
pub trait Transport {
    /// Installs `table` and `data` as the listener of `proxy`.
    ///
    /// On refusal the transport keeps no reference to `table` or `data`.
    ///
    /// # Safety
    ///
    /// `proxy` must be a live object of the interface named `interface`,
    /// `table` must point to that interface's dispatch table, and both
    /// `table` and `data` must stay valid until `proxy` is destroyed.
    unsafe fn add_listener(
        &mut self,
        proxy: NonNull<c_void>,
        interface: &'static str,
        table: NonNull<c_void>,
        data: NonNull<c_void>,
    ) -> Result<(), Refusal>;

    /// Data pointer of the listener currently installed on `proxy`.
    ///
    /// `None` when `proxy` is not a live object or has no listener. Once
    /// an object is destroyed its address may name a new object, so this
    /// is how a caller tells its own registration from a stale one.
    fn listener_data(&self, proxy: NonNull<c_void>) -> Option<NonNull<c_void>>;

    /// Forgets the listener of `proxy`, if it has one.
    ///
    /// Called when listener storage is freed while the proxy may still be
    /// known to the transport. After it returns no event of `proxy` may
    /// reach the old table.
    fn remove_listener(&mut self, proxy: NonNull<c_void>);

    /// Services pending events, calling listeners in arrival order.
    ///
    /// Returns how many events reached a listener. An error means the
    /// connection can no longer be used.
    fn dispatch(&mut self) -> io::Result<usize>;
}
