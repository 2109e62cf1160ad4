//! Simulated compositor on the loopback transport
//!
//! Stands on the server side of the connection: answers the client's
//! requests by creating objects and queueing the events a compositor would
//! send, and plays a short input script on every frame.

use std::cell::RefCell;
use std::ffi::CString;
use std::ptr;
use std::rc::Rc;

use tether_core::{Fixed, Interface, LoopbackTransport, RawArray};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::protocol::{
    BTN_LEFT, Capabilities, Compositor, Display, KEYMAP_FORMAT_XKB_V1, Keyboard, KeyboardListener,
    Pointer, PointerListener, Registry, RegistryListener, STATE_PRESSED, STATE_RELEASED, Seat,
    SeatListener, Shell, ShellListener, ShellSurface, ShellSurfaceListener, Surface,
    TabletManager, TabletSeat, TabletSeatListener, TabletTool, TabletToolListener, Toplevel,
    ToplevelListener, Touch, TouchListener,
};

/// Size the compositor configures new toplevels with.
pub const CONFIGURED_SIZE: (i32, i32) = (800, 600);

const KEY_A: u32 = 30;
const TOOL_PEN: u32 = 0x140;
const SEAT_NAME: &str = "seat0";

#[derive(Debug, Clone)]
struct Global {
    name: u32,
    interface: &'static str,
    version: u32,
}

#[derive(Default)]
struct State {
    globals: Vec<Global>,
    surface: Option<*mut Surface>,
    shell: Option<*mut Shell>,
    toplevel: Option<*mut Toplevel>,
    keyboard: Option<*mut Keyboard>,
    pointer: Option<*mut Pointer>,
    touch: Option<*mut Touch>,
    tool: Option<*mut TabletTool>,
    title: Option<String>,
    acked: Option<u32>,
    serial: u32,
}

impl State {
    fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        self.serial
    }
}

/// The compositor end of one loopback connection.
///
/// Cheap to clone; listeners that need to answer the compositor (pong,
/// ack) keep a clone.
#[derive(Clone)]
pub struct Session {
    transport: LoopbackTransport,
    config: SessionConfig,
    state: Rc<RefCell<State>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let mut globals = vec![
            Global { name: 1, interface: Compositor::NAME, version: 4 },
            Global { name: 2, interface: Shell::NAME, version: 1 },
            Global { name: 3, interface: Seat::NAME, version: 7 },
        ];
        if config.tablet {
            globals.push(Global { name: 4, interface: TabletManager::NAME, version: 1 });
        }
        Self {
            transport: LoopbackTransport::new(),
            config,
            state: Rc::new(RefCell::new(State { globals, ..State::default() })),
        }
    }

    pub fn transport(&self) -> &LoopbackTransport {
        &self.transport
    }

    /// Opens the display, or returns null when the session refuses.
    pub fn connect(&self) -> *mut Display {
        if !self.config.available {
            warn!("simulated display refused the connection");
            return ptr::null_mut();
        }
        self.transport.create::<Display>()
    }

    /// Creates a registry and announces every global on it.
    pub fn get_registry(&self, _display: *mut Display) -> *mut Registry {
        let registry = self.transport.create::<Registry>();
        for global in self.state.borrow().globals.clone() {
            let interface = cstring(global.interface);
            self.transport.post(registry, move |t: &RegistryListener, data, proxy| unsafe {
                (t.global)(data, proxy, global.name, interface.as_ptr(), global.version)
            });
        }
        registry
    }

    /// Binds global `name` as an `I`. Returns null for an unknown name or
    /// an interface mismatch.
    pub fn bind<I: Interface>(&self, _registry: *mut Registry, name: u32, version: u32) -> *mut I {
        let known = self
            .state
            .borrow()
            .globals
            .iter()
            .find(|g| g.name == name)
            .cloned();
        let Some(global) = known else {
            warn!(name, "bind of unknown global");
            return ptr::null_mut();
        };
        if global.interface != I::NAME {
            warn!(name, expected = global.interface, requested = I::NAME, "bind with wrong interface");
            return ptr::null_mut();
        }
        debug!(interface = I::NAME, version = version.min(global.version), "bound");

        let object = self.transport.create::<I>();
        if I::NAME == Seat::NAME {
            self.announce_seat(object.cast());
        } else if I::NAME == Shell::NAME {
            self.state.borrow_mut().shell = Some(object.cast());
        }
        object
    }

    fn announce_seat(&self, seat: *mut Seat) {
        let mut capabilities = Capabilities::POINTER | Capabilities::KEYBOARD;
        if self.config.touch {
            capabilities |= Capabilities::TOUCH;
        }
        let bits = capabilities.bits();
        self.transport.post(seat, move |t: &SeatListener, data, proxy| unsafe {
            (t.capabilities)(data, proxy, bits)
        });
        let name = cstring(SEAT_NAME);
        self.transport.post(seat, move |t: &SeatListener, data, proxy| unsafe {
            (t.name)(data, proxy, name.as_ptr())
        });
    }

    pub fn create_surface(&self, _compositor: *mut Compositor) -> *mut Surface {
        let surface = self.transport.create::<Surface>();
        self.state.borrow_mut().surface = Some(surface);
        surface
    }

    pub fn get_shell_surface(&self, _shell: *mut Shell, _surface: *mut Surface) -> *mut ShellSurface {
        self.transport.create::<ShellSurface>()
    }

    /// Gives the shell surface the toplevel role and sends the initial
    /// configure sequence.
    pub fn get_toplevel(&self, shell_surface: *mut ShellSurface) -> *mut Toplevel {
        let toplevel = self.transport.create::<Toplevel>();
        self.state.borrow_mut().toplevel = Some(toplevel);

        let (width, height) = CONFIGURED_SIZE;
        self.transport.post(toplevel, move |t: &ToplevelListener, data, proxy| unsafe {
            let mut states = RawArray::borrowed(&[]);
            (t.configure)(data, proxy, width, height, &mut states)
        });
        let serial = self.state.borrow_mut().next_serial();
        self.transport.post(shell_surface, move |t: &ShellSurfaceListener, data, proxy| unsafe {
            (t.configure)(data, proxy, serial)
        });
        toplevel
    }

    pub fn set_title(&self, _toplevel: *mut Toplevel, title: &str) {
        debug!(title, "toplevel title set");
        self.state.borrow_mut().title = Some(title.to_owned());
    }

    pub fn ack_configure(&self, _shell_surface: *mut ShellSurface, serial: u32) {
        debug!(serial, "configure acknowledged");
        self.state.borrow_mut().acked = Some(serial);
    }

    pub fn pong(&self, _shell: *mut Shell, serial: u32) {
        debug!(serial, "pong");
    }

    pub fn get_keyboard(&self, _seat: *mut Seat) -> *mut Keyboard {
        let keyboard = self.transport.create::<Keyboard>();
        self.state.borrow_mut().keyboard = Some(keyboard);
        self.transport.post(keyboard, |t: &KeyboardListener, data, proxy| unsafe {
            (t.keymap)(data, proxy, KEYMAP_FORMAT_XKB_V1, -1, 0)
        });
        self.transport.post(keyboard, |t: &KeyboardListener, data, proxy| unsafe {
            (t.repeat_info)(data, proxy, 25, 600)
        });
        keyboard
    }

    pub fn get_pointer(&self, _seat: *mut Seat) -> *mut Pointer {
        let pointer = self.transport.create::<Pointer>();
        self.state.borrow_mut().pointer = Some(pointer);
        pointer
    }

    pub fn get_touch(&self, _seat: *mut Seat) -> *mut Touch {
        let touch = self.transport.create::<Touch>();
        self.state.borrow_mut().touch = Some(touch);
        touch
    }

    /// Creates the tablet seat and announces its single stylus. The stylus
    /// describes itself on the first frame.
    pub fn get_tablet_seat(&self, _manager: *mut TabletManager, _seat: *mut Seat) -> *mut TabletSeat {
        let tablet_seat = self.transport.create::<TabletSeat>();
        let tool = self.transport.create::<TabletTool>();
        self.state.borrow_mut().tool = Some(tool);

        self.transport.post(tablet_seat, move |t: &TabletSeatListener, data, proxy| unsafe {
            (t.tool_added)(data, proxy, tool)
        });
        tablet_seat
    }

    /// Title most recently set on the toplevel.
    pub fn title(&self) -> Option<String> {
        self.state.borrow().title.clone()
    }

    /// Serial of the last acknowledged configure.
    pub fn acked_configure(&self) -> Option<u32> {
        self.state.borrow().acked
    }

    /// Queues the scripted events of frame `frame` (counted from 1).
    pub fn emit_frame(&self, frame: u64) {
        let time = (frame * 16) as u32;

        if frame == 1 {
            self.ping_client();
            self.enter_surface();
        }
        self.pointer_script(frame, time);
        self.keyboard_script(frame, time);
        if self.config.touch {
            self.touch_script(frame, time);
        }
        if self.config.tablet {
            self.tool_script(frame, time);
        }

        if self.config.close_at_frame == Some(frame) {
            if let Some(toplevel) = self.state.borrow().toplevel {
                info!(frame, "compositor requests close");
                self.transport.post(toplevel, |t: &ToplevelListener, data, proxy| unsafe {
                    (t.close)(data, proxy)
                });
            }
        }
        if self.config.disconnect_at_frame == Some(frame) {
            warn!(frame, "simulated connection loss");
            self.transport.disconnect();
        }
    }

    fn ping_client(&self) {
        let (shell, serial) = {
            let mut state = self.state.borrow_mut();
            (state.shell, state.next_serial())
        };
        if let Some(shell) = shell {
            self.transport.post(shell, move |t: &ShellListener, data, proxy| unsafe {
                (t.ping)(data, proxy, serial)
            });
        }
    }

    fn enter_surface(&self) {
        let (surface, pointer, keyboard, serial) = {
            let mut state = self.state.borrow_mut();
            let serial = state.next_serial();
            (state.surface, state.pointer, state.keyboard, serial)
        };
        let surface = surface.unwrap_or(ptr::null_mut());
        if let Some(pointer) = pointer {
            let (x, y) = (Fixed::from_f64(10.0).0, Fixed::from_f64(10.0).0);
            self.transport.post(pointer, move |t: &PointerListener, data, proxy| unsafe {
                (t.enter)(data, proxy, serial, surface, x, y)
            });
        }
        if let Some(keyboard) = keyboard {
            self.transport.post(keyboard, move |t: &KeyboardListener, data, proxy| unsafe {
                let mut keys = RawArray::borrowed(&[]);
                (t.enter)(data, proxy, serial, surface, &mut keys)
            });
        }
    }

    fn pointer_script(&self, frame: u64, time: u32) {
        let Some(pointer) = self.state.borrow().pointer else {
            return;
        };
        // A slow circle around the window center.
        let angle = frame as f64 / 30.0;
        let x = Fixed::from_f64(400.0 + 100.0 * angle.cos()).0;
        let y = Fixed::from_f64(300.0 + 100.0 * angle.sin()).0;
        self.transport.post(pointer, move |t: &PointerListener, data, proxy| unsafe {
            (t.motion)(data, proxy, time, x, y)
        });

        let state = match frame % 30 {
            0 => STATE_PRESSED,
            1 if frame > 1 => STATE_RELEASED,
            _ => return,
        };
        let serial = self.state.borrow_mut().next_serial();
        self.transport.post(pointer, move |t: &PointerListener, data, proxy| unsafe {
            (t.button)(data, proxy, serial, time, BTN_LEFT, state)
        });
        if state == STATE_RELEASED {
            let value = Fixed::from_f64(-10.0).0;
            self.transport.post(pointer, move |t: &PointerListener, data, proxy| unsafe {
                (t.axis)(data, proxy, time, 0, value)
            });
        }
    }

    fn keyboard_script(&self, frame: u64, time: u32) {
        let Some(keyboard) = self.state.borrow().keyboard else {
            return;
        };
        let state = match frame % 45 {
            0 => STATE_PRESSED,
            1 if frame > 1 => STATE_RELEASED,
            _ => return,
        };
        let serial = self.state.borrow_mut().next_serial();
        // Shift is held for the press.
        let depressed = if state == STATE_PRESSED { 1 } else { 0 };
        self.transport.post(keyboard, move |t: &KeyboardListener, data, proxy| unsafe {
            (t.modifiers)(data, proxy, serial, depressed, 0, 0, 0)
        });
        self.transport.post(keyboard, move |t: &KeyboardListener, data, proxy| unsafe {
            (t.key)(data, proxy, serial, time, KEY_A, state)
        });
    }

    fn touch_script(&self, frame: u64, time: u32) {
        let (touch, surface) = {
            let state = self.state.borrow();
            (state.touch, state.surface)
        };
        let Some(touch) = touch else {
            return;
        };
        let (x, y) = (Fixed::from_f64(120.0).0, Fixed::from_f64(80.0).0);
        match frame % 60 {
            10 => {
                let serial = self.state.borrow_mut().next_serial();
                let surface = surface.unwrap_or(ptr::null_mut());
                self.transport.post(touch, move |t: &TouchListener, data, proxy| unsafe {
                    (t.down)(data, proxy, serial, time, surface, 0, x, y)
                });
            }
            11 => {
                let x = Fixed::from_f64(140.0).0;
                self.transport.post(touch, move |t: &TouchListener, data, proxy| unsafe {
                    (t.motion)(data, proxy, time, 0, x, y)
                });
            }
            12 => {
                let serial = self.state.borrow_mut().next_serial();
                self.transport.post(touch, move |t: &TouchListener, data, proxy| unsafe {
                    (t.up)(data, proxy, serial, time, 0)
                });
            }
            _ => return,
        }
        self.transport.post(touch, |t: &TouchListener, data, proxy| unsafe {
            (t.frame)(data, proxy)
        });
    }

    fn tool_script(&self, frame: u64, time: u32) {
        let (tool, surface) = {
            let state = self.state.borrow();
            (state.tool, state.surface)
        };
        let Some(tool) = tool else {
            return;
        };
        match frame {
            1 => {
                self.transport.post(tool, |t: &TabletToolListener, data, proxy| unsafe {
                    (t.tool_type)(data, proxy, TOOL_PEN)
                });
            }
            5 => {
                let serial = self.state.borrow_mut().next_serial();
                let surface = surface.unwrap_or(ptr::null_mut());
                self.transport.post(tool, move |t: &TabletToolListener, data, proxy| unsafe {
                    (t.proximity_in)(data, proxy, serial, ptr::null_mut(), surface)
                });
            }
            6 => {
                let serial = self.state.borrow_mut().next_serial();
                self.transport.post(tool, move |t: &TabletToolListener, data, proxy| unsafe {
                    (t.down)(data, proxy, serial)
                });
            }
            7..=9 => {
                let step = (frame - 6) as f64;
                let (x, y) = (Fixed::from_f64(200.0 + 5.0 * step).0, Fixed::from_f64(150.0).0);
                let pressure = (step * 20000.0) as u32;
                self.transport.post(tool, move |t: &TabletToolListener, data, proxy| unsafe {
                    (t.motion)(data, proxy, x, y)
                });
                self.transport.post(tool, move |t: &TabletToolListener, data, proxy| unsafe {
                    (t.pressure)(data, proxy, pressure)
                });
            }
            10 => {
                self.transport.post(tool, |t: &TabletToolListener, data, proxy| unsafe {
                    (t.up)(data, proxy)
                });
                self.transport.post(tool, |t: &TabletToolListener, data, proxy| unsafe {
                    (t.proximity_out)(data, proxy)
                });
            }
            20 => {
                self.state.borrow_mut().tool = None;
                self.transport.post(tool, |t: &TabletToolListener, data, proxy| unsafe {
                    (t.removed)(data, proxy)
                });
                return;
            }
            _ => return,
        }
        self.transport.post(tool, move |t: &TabletToolListener, data, proxy| unsafe {
            (t.frame)(data, proxy, time)
        });
    }
}

fn cstring(text: &str) -> CString {
    // Interface and seat names are compile-time constants without NULs.
    CString::new(text).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_session_refuses_connection() {
        let session = Session::new(SessionConfig {
            available: false,
            ..SessionConfig::default()
        });
        assert!(session.connect().is_null());
    }

    #[test]
    fn test_bind_checks_name_and_interface() {
        let session = Session::new(SessionConfig::default());
        let registry = session.get_registry(session.connect());

        assert!(!session.bind::<Compositor>(registry, 1, 4).is_null());
        assert!(session.bind::<Seat>(registry, 1, 7).is_null());
        assert!(session.bind::<Seat>(registry, 99, 7).is_null());
    }

    #[test]
    fn test_registry_announces_optional_tablet() {
        let with_tablet = Session::new(SessionConfig::default());
        with_tablet.get_registry(with_tablet.connect());
        assert_eq!(with_tablet.transport().pending(), 4);

        let without = Session::new(SessionConfig {
            tablet: false,
            ..SessionConfig::default()
        });
        without.get_registry(without.connect());
        assert_eq!(without.transport().pending(), 3);
    }
}
