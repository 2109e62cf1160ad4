//! Binding of C dispatch tables to Rust closures.
//!
//! A listener-capable protocol object is configured with a `#[repr(C)]`
//! table of function pointers, one slot per event, plus an opaque data
//! pointer that the transport hands back on every event. The
//! [`dispatch_table!`](crate::dispatch_table) macro declares such a table
//! together with one generic, non-capturing trampoline per slot. Each
//! trampoline casts the data pointer back to the tuple of closures it was
//! registered with and calls the closure at its position.
//!
//! Slot `i` always forwards to tuple element `i`. A tuple with the wrong
//! number of closures, or closures with the wrong argument lists, does not
//! implement [`Handlers`] and is rejected at compile time.

use std::ffi::{CStr, c_char, c_void};
use std::fmt;
use std::ptr::NonNull;

/// A protocol interface.
///
/// Implemented on the opaque type a proxy pointer points to, by
/// [`dispatch_table!`](crate::dispatch_table) or, for interfaces without
/// events, by [`interface!`](crate::interface).
///
/// # Safety
///
/// `Table` must have the layout the transport dispatches events of `NAME`
/// through.
pub unsafe trait Interface: 'static {
    /// Interface name as published by the protocol.
    const NAME: &'static str;
    /// Number of event slots in `Table`.
    const SLOTS: usize;
    /// The `#[repr(C)]` dispatch table, `()` without events.
    type Table: Copy + 'static;
}

/// A tuple of closures, one per event slot of `I`.
///
/// Only a tuple with one closure per slot qualifies:
///
/// ```
/// use tether_core::{EventQueue, LoopbackTransport};
///
/// pub struct Gadget {
///     _private: [u8; 0],
/// }
///
/// tether_core::dispatch_table! {
///     pub struct GadgetListener for Gadget = "gadget" {
///         0 reset<R>(serial: u32);
///         1 resized<S>(width: i32, height: i32);
///         2 dropped<D>();
///     }
/// }
///
/// let transport = LoopbackTransport::new();
/// let mut queue = EventQueue::new(transport.clone());
/// let gadget = transport.own(transport.create::<Gadget>()).unwrap();
/// queue
///     .attach(&gadget, (|_: u32| {}, |_: i32, _: i32| {}, || {}))
///     .unwrap();
/// ```
///
/// Leaving a slot out does not compile:
///
/// ```compile_fail
/// use tether_core::{EventQueue, LoopbackTransport};
///
/// pub struct Gadget {
///     _private: [u8; 0],
/// }
///
/// tether_core::dispatch_table! {
///     pub struct GadgetListener for Gadget = "gadget" {
///         0 reset<R>(serial: u32);
///         1 resized<S>(width: i32, height: i32);
///         2 dropped<D>();
///     }
/// }
///
/// let transport = LoopbackTransport::new();
/// let mut queue = EventQueue::new(transport.clone());
/// let gadget = transport.own(transport.create::<Gadget>()).unwrap();
/// queue
///     .attach(&gadget, (|_: u32| {}, |_: i32, _: i32| {}))
///     .unwrap();
/// ```
///
/// # Safety
///
/// Every trampoline in the returned table must treat its data pointer as a
/// `*mut Self`.
pub unsafe trait Handlers<I: Interface>: 'static {
    /// The dispatch table whose trampolines forward into `Self`.
    fn table() -> I::Table;
}

/// Conversion from an argument as the transport passes it to the type the
/// closure receives.
pub trait FromAbi<A>: Sized {
    /// # Safety
    ///
    /// `abi` must be a value the transport produced for this argument and
    /// must stay valid for the duration of the event.
    unsafe fn from_abi(abi: A) -> Self;
}

impl<T> FromAbi<T> for T {
    unsafe fn from_abi(abi: T) -> T {
        abi
    }
}

impl<'a> FromAbi<*const c_char> for &'a CStr {
    unsafe fn from_abi(abi: *const c_char) -> Self {
        unsafe { CStr::from_ptr(abi) }
    }
}

impl<'a> FromAbi<*const c_char> for Option<&'a CStr> {
    unsafe fn from_abi(abi: *const c_char) -> Self {
        if abi.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(abi) })
        }
    }
}

impl<T> FromAbi<*mut T> for Option<NonNull<T>> {
    unsafe fn from_abi(abi: *mut T) -> Self {
        NonNull::new(abi)
    }
}

impl FromAbi<i32> for Fixed {
    unsafe fn from_abi(abi: i32) -> Self {
        Fixed(abi)
    }
}

impl<'a> FromAbi<*mut RawArray> for &'a [u8] {
    unsafe fn from_abi(abi: *mut RawArray) -> Self {
        match unsafe { abi.as_ref() } {
            Some(array) if array.size > 0 && !array.data.is_null() => unsafe {
                std::slice::from_raw_parts(array.data.cast::<u8>(), array.size)
            },
            _ => &[],
        }
    }
}

/// Signed 24.8 fixed-point number, the protocol's coordinate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Fixed(pub i32);

impl Fixed {
    pub fn from_f64(value: f64) -> Self {
        Self((value * 256.0).round() as i32)
    }

    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / 256.0
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

/// Variable-length byte array argument, laid out like the transport's.
#[derive(Debug)]
#[repr(C)]
pub struct RawArray {
    pub size: usize,
    pub alloc: usize,
    pub data: *mut c_void,
}

impl RawArray {
    /// Borrows `bytes` as an array argument.
    pub fn borrowed(bytes: &[u8]) -> Self {
        Self {
            size: bytes.len(),
            alloc: bytes.len(),
            data: bytes.as_ptr() as *mut c_void,
        }
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __lifted {
    ($abi:ty => $lift:ty) => { $lift };
    ($abi:ty) => { $abi };
}

/// Declares the dispatch table of a listener-capable interface.
///
/// ```ignore
/// dispatch_table! {
///     pub struct RegistryListener for WlRegistry = "wl_registry" {
///         0 global<G>(name: u32, interface: *const c_char => &CStr, version: u32);
///         1 global_remove<R>(name: u32);
///     }
/// }
/// ```
///
/// Each slot lists its position, its name, a type parameter for its
/// closure and its arguments after the data and proxy pointers.
/// `abi => lifted` converts an argument through [`FromAbi`] before it
/// reaches the closure.
///
/// The macro emits the `#[repr(C)]` table, the [`Interface`] impl for the
/// proxy type, a `handlers` constructor that bundles closures in slot
/// order, and the [`Handlers`] impl for the matching closure tuple.
#[macro_export]
macro_rules! dispatch_table {
    (
        $(#[$meta:meta])*
        $vis:vis struct $table:ident for $proxy:ty = $name:literal {
            $(
                $(#[$slot_meta:meta])*
                $idx:tt $slot:ident <$F:ident> ( $( $arg:ident : $abi:ty $(=> $lift:ty)? ),* $(,)? );
            )+
        }
    ) => {
        $(#[$meta])*
        #[repr(C)]
        #[derive(Clone, Copy)]
        $vis struct $table {
            $(
                $(#[$slot_meta])*
                pub $slot: unsafe extern "C" fn(*mut ::std::ffi::c_void, *mut $proxy $(, $abi)*),
            )+
        }

        unsafe impl $crate::listener::Interface for $proxy {
            const NAME: &'static str = $name;
            const SLOTS: usize = [$(stringify!($slot)),+].len();
            type Table = $table;
        }

        impl $table {
            /// Bundles one closure per event, in protocol order.
            #[allow(clippy::too_many_arguments)]
            pub fn handlers<$($F),+>($($slot: $F),+) -> ($($F,)+)
            where
                $( $F: FnMut($($crate::__lifted!($abi $(=> $lift)?)),*) + 'static, )+
            {
                ($($slot,)+)
            }
        }

        const _: () = {
            #[allow(dead_code)]
            struct Trampolines<H>(::std::marker::PhantomData<H>);

            impl<$($F),+> Trampolines<($($F,)+)>
            where
                $( $F: FnMut($($crate::__lifted!($abi $(=> $lift)?)),*) + 'static, )+
            {
                unsafe fn closures<'a>(data: *mut ::std::ffi::c_void) -> &'a mut ($($F,)+) {
                    // SAFETY: `data` is the closure tuple registered next to
                    // this table, and events are dispatched one at a time.
                    unsafe { &mut *data.cast::<($($F,)+)>() }
                }

                $(
                    unsafe extern "C" fn $slot(
                        data: *mut ::std::ffi::c_void,
                        _proxy: *mut $proxy
                        $(, $arg: $abi)*
                    ) {
                        let handlers = unsafe { Self::closures(data) };
                        $(
                            let $arg: $crate::__lifted!($abi $(=> $lift)?) =
                                unsafe { $crate::listener::FromAbi::from_abi($arg) };
                        )*
                        (handlers.$idx)($($arg),*);
                    }
                )+
            }

            unsafe impl<$($F),+> $crate::listener::Handlers<$proxy> for ($($F,)+)
            where
                $( $F: FnMut($($crate::__lifted!($abi $(=> $lift)?)),*) + 'static, )+
            {
                fn table() -> $table {
                    $table {
                        $( $slot: Trampolines::<Self>::$slot, )+
                    }
                }
            }
        };
    };
}

/// Declares interfaces that have no events, so their objects never take a
/// listener.
///
/// ```ignore
/// interface!(WlCompositor = "wl_compositor", WlSurface = "wl_surface");
/// ```
#[macro_export]
macro_rules! interface {
    ($($proxy:ty = $name:literal),+ $(,)?) => {
        $(
            unsafe impl $crate::listener::Interface for $proxy {
                const NAME: &'static str = $name;
                const SLOTS: usize = 0;
                type Table = ();
            }
        )+
    };
}
