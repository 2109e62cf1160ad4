//! Tether core: ownership, listener binding and continuations for clients of
//! callback-table display protocols.
//!
//! - [`handle`]: non-absent, single-owner handles with a paired release.
//! - [`listener`]: `#[repr(C)]` dispatch tables forwarding into closures.
//! - [`queue`]: the per-connection arena that keeps closure storage alive.
//! - [`continuation`]: single-shot suspended computations for round trips.
//! - [`loopback`]: an in-process transport for tests and simulations.

pub mod continuation;
pub mod error;
pub mod handle;
pub mod listener;
pub mod loopback;
pub mod queue;
pub mod transport;

pub use continuation::{Continuation, State};
pub use error::{Error, Result};
pub use handle::{OwnedHandle, RawHandle, Release, wrap, wrap_named};
pub use listener::{FromAbi, Fixed, Handlers, Interface, RawArray};
pub use loopback::{Callback, CallbackListener, LoopbackTransport, Proxy};
pub use queue::{AsProxy, EventQueue};
pub use transport::{Refusal, Transport};
