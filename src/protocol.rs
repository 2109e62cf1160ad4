//! Protocol objects the client talks to and their event tables.
//!
//! Slot order follows the protocol's event order; the closures handed to
//! each `handlers` constructor must come in the same order.

use std::ffi::{CStr, c_char, c_void};
use std::ptr::NonNull;

use bitflags::bitflags;
use tether_core::{Fixed, RawArray, dispatch_table, interface};

macro_rules! opaque {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            pub struct $name {
                _private: [u8; 0],
            }
        )+
    };
}

opaque! {
    /// The connection's root object.
    Display,
    Registry,
    Compositor,
    Surface,
    /// Desktop shell; pings the client to check it is alive.
    Shell,
    ShellSurface,
    Toplevel,
    Seat,
    Keyboard,
    Pointer,
    Touch,
    TabletManager,
    TabletSeat,
    TabletTool,
}

interface!(
    Compositor = "wl_compositor",
    Surface = "wl_surface",
    TabletManager = "zwp_tablet_manager_v2",
);

dispatch_table! {
    pub struct DisplayListener for Display = "wl_display" {
        0 error<E>(object: *mut c_void, code: u32, message: *const c_char => &CStr);
        1 delete_id<D>(id: u32);
    }
}

dispatch_table! {
    pub struct RegistryListener for Registry = "wl_registry" {
        0 global<G>(name: u32, interface: *const c_char => &CStr, version: u32);
        1 global_remove<R>(name: u32);
    }
}

dispatch_table! {
    pub struct ShellListener for Shell = "zxdg_shell_v6" {
        0 ping<P>(serial: u32);
    }
}

dispatch_table! {
    pub struct ShellSurfaceListener for ShellSurface = "zxdg_surface_v6" {
        0 configure<C>(serial: u32);
    }
}

dispatch_table! {
    pub struct ToplevelListener for Toplevel = "zxdg_toplevel_v6" {
        0 configure<C>(width: i32, height: i32, states: *mut RawArray => &[u8]);
        1 close<X>();
    }
}

dispatch_table! {
    pub struct SeatListener for Seat = "wl_seat" {
        0 capabilities<C>(capabilities: u32);
        1 name<N>(name: *const c_char => &CStr);
    }
}

dispatch_table! {
    pub struct KeyboardListener for Keyboard = "wl_keyboard" {
        0 keymap<M>(format: u32, fd: i32, size: u32);
        1 enter<E>(serial: u32, surface: *mut Surface => Option<NonNull<Surface>>, keys: *mut RawArray => &[u8]);
        2 leave<L>(serial: u32, surface: *mut Surface => Option<NonNull<Surface>>);
        3 key<K>(serial: u32, time: u32, key: u32, state: u32);
        4 modifiers<D>(serial: u32, depressed: u32, latched: u32, locked: u32, group: u32);
        5 repeat_info<R>(rate: i32, delay: i32);
    }
}

dispatch_table! {
    pub struct PointerListener for Pointer = "wl_pointer" {
        0 enter<E>(serial: u32, surface: *mut Surface => Option<NonNull<Surface>>, x: i32 => Fixed, y: i32 => Fixed);
        1 leave<L>(serial: u32, surface: *mut Surface => Option<NonNull<Surface>>);
        2 motion<M>(time: u32, x: i32 => Fixed, y: i32 => Fixed);
        3 button<B>(serial: u32, time: u32, button: u32, state: u32);
        4 axis<A>(time: u32, axis: u32, value: i32 => Fixed);
    }
}

dispatch_table! {
    pub struct TouchListener for Touch = "wl_touch" {
        0 down<D>(serial: u32, time: u32, surface: *mut Surface => Option<NonNull<Surface>>, id: i32, x: i32 => Fixed, y: i32 => Fixed);
        1 up<U>(serial: u32, time: u32, id: i32);
        2 motion<M>(time: u32, id: i32, x: i32 => Fixed, y: i32 => Fixed);
        3 frame<F>();
        4 cancel<C>();
    }
}

dispatch_table! {
    pub struct TabletSeatListener for TabletSeat = "zwp_tablet_seat_v2" {
        0 tool_added<T>(tool: *mut TabletTool => Option<NonNull<TabletTool>>);
    }
}

dispatch_table! {
    pub struct TabletToolListener for TabletTool = "zwp_tablet_tool_v2" {
        0 tool_type<T>(tool_type: u32);
        1 proximity_in<I>(serial: u32, tablet: *mut c_void, surface: *mut Surface => Option<NonNull<Surface>>);
        2 proximity_out<O>();
        3 down<D>(serial: u32);
        4 up<U>();
        5 motion<M>(x: i32 => Fixed, y: i32 => Fixed);
        6 pressure<P>(pressure: u32);
        7 frame<F>(time: u32);
        8 removed<R>();
    }
}

bitflags! {
    /// Input devices a seat offers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        const POINTER = 1;
        const KEYBOARD = 2;
        const TOUCH = 4;
    }
}

/// Key and button states as sent on the wire.
pub const STATE_RELEASED: u32 = 0;
pub const STATE_PRESSED: u32 = 1;

/// Keymap format for a plain xkb text keymap.
pub const KEYMAP_FORMAT_XKB_V1: u32 = 1;

pub const BTN_LEFT: u32 = 0x110;
