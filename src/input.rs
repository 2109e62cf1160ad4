//! Seat input: device listeners and the events they produce
//!
//! Every device listener translates its protocol events into
//! [`InputEvent`] values pushed to a shared [`InputSink`]. The frame loop
//! drains the sink after each dispatch and logs what arrived.

use std::cell::RefCell;
use std::ffi::CStr;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use tether_core::{Fixed, Handlers};
use tracing::{info, trace};

use crate::protocol::{
    Keyboard, KeyboardListener, Pointer, PointerListener, STATE_PRESSED, TabletTool,
    TabletToolListener, Touch, TouchListener,
};

/// Events collected during one dispatch, in arrival order.
pub type InputSink = Rc<RefCell<Vec<InputEvent>>>;

/// One decoded input event.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Keymap { format: u32, size: u32 },
    KeyboardEnter { serial: u32, pressed: Vec<u32> },
    KeyboardLeave { serial: u32 },
    Key { time: u32, key: u32, pressed: bool },
    Modifiers { depressed: u32, latched: u32, locked: u32, group: u32 },
    RepeatInfo { rate: i32, delay: i32 },

    PointerEnter { serial: u32, x: f64, y: f64 },
    PointerLeave { serial: u32 },
    PointerMotion { time: u32, x: f64, y: f64 },
    PointerButton { time: u32, button: u32, pressed: bool },
    PointerAxis { time: u32, axis: u32, value: f64 },

    TouchDown { time: u32, id: i32, x: f64, y: f64 },
    TouchUp { time: u32, id: i32 },
    TouchMotion { time: u32, id: i32, x: f64, y: f64 },
    TouchFrame,
    TouchCancel,

    ToolType { kind: ToolKind },
    ToolProximityIn { serial: u32 },
    ToolProximityOut,
    ToolDown { serial: u32 },
    ToolUp,
    ToolMotion { x: f64, y: f64 },
    ToolPressure { pressure: f64 },
    ToolFrame { time: u32 },
    ToolRemoved,
}

impl InputEvent {
    /// High-rate events, logged at trace unless motion logging is on.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            Self::PointerMotion { .. }
                | Self::TouchMotion { .. }
                | Self::ToolMotion { .. }
                | Self::ToolPressure { .. }
                | Self::TouchFrame
                | Self::ToolFrame { .. }
        )
    }

    pub fn log(&self, log_motion: bool) {
        if self.is_motion() && !log_motion {
            trace!(event = ?self, "input");
        } else {
            info!(event = ?self, "input");
        }
    }
}

/// Tool type as announced by a tablet tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Pen,
    Eraser,
    Brush,
    Pencil,
    Airbrush,
    Finger,
    Mouse,
    Lens,
    Unknown(u32),
}

impl From<u32> for ToolKind {
    fn from(raw: u32) -> Self {
        match raw {
            0x140 => Self::Pen,
            0x141 => Self::Eraser,
            0x142 => Self::Brush,
            0x143 => Self::Pencil,
            0x144 => Self::Airbrush,
            0x145 => Self::Finger,
            0x146 => Self::Mouse,
            0x147 => Self::Lens,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "unknown({raw:#x})"),
            known => write!(f, "{}", format!("{known:?}").to_lowercase()),
        }
    }
}

/// Tablet pressure is reported in 0..=65535.
pub fn normalize_pressure(raw: u32) -> f64 {
    f64::from(raw.min(65535)) / 65535.0
}

/// Keys held at enter, sent as an array of native-endian `u32` keycodes.
pub fn pressed_keys(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn push(sink: &InputSink) -> impl Fn(InputEvent) + use<> {
    let sink = sink.clone();
    move |event| sink.borrow_mut().push(event)
}

pub fn keyboard_handlers(sink: &InputSink) -> impl Handlers<Keyboard> + use<> {
    let (keymap, enter, leave, key, modifiers, repeat) = (
        push(sink),
        push(sink),
        push(sink),
        push(sink),
        push(sink),
        push(sink),
    );
    KeyboardListener::handlers(
        move |format, _fd, size| keymap(InputEvent::Keymap { format, size }),
        move |serial, _surface, keys| {
            enter(InputEvent::KeyboardEnter {
                serial,
                pressed: pressed_keys(keys),
            })
        },
        move |serial, _surface| leave(InputEvent::KeyboardLeave { serial }),
        move |_serial, time, code, state| {
            key(InputEvent::Key {
                time,
                key: code,
                pressed: state == STATE_PRESSED,
            })
        },
        move |_serial, depressed, latched, locked, group| {
            modifiers(InputEvent::Modifiers {
                depressed,
                latched,
                locked,
                group,
            })
        },
        move |rate, delay| repeat(InputEvent::RepeatInfo { rate, delay }),
    )
}

pub fn pointer_handlers(sink: &InputSink) -> impl Handlers<Pointer> + use<> {
    let (enter, leave, motion, button, axis) =
        (push(sink), push(sink), push(sink), push(sink), push(sink));
    PointerListener::handlers(
        move |serial, _surface, x: Fixed, y: Fixed| {
            enter(InputEvent::PointerEnter {
                serial,
                x: x.to_f64(),
                y: y.to_f64(),
            })
        },
        move |serial, _surface| leave(InputEvent::PointerLeave { serial }),
        move |time, x: Fixed, y: Fixed| {
            motion(InputEvent::PointerMotion {
                time,
                x: x.to_f64(),
                y: y.to_f64(),
            })
        },
        move |_serial, time, code, state| {
            button(InputEvent::PointerButton {
                time,
                button: code,
                pressed: state == STATE_PRESSED,
            })
        },
        move |time, which, value: Fixed| {
            axis(InputEvent::PointerAxis {
                time,
                axis: which,
                value: value.to_f64(),
            })
        },
    )
}

pub fn touch_handlers(sink: &InputSink) -> impl Handlers<Touch> + use<> {
    let (down, up, motion, frame, cancel) =
        (push(sink), push(sink), push(sink), push(sink), push(sink));
    TouchListener::handlers(
        move |_serial, time, _surface, id, x: Fixed, y: Fixed| {
            down(InputEvent::TouchDown {
                time,
                id,
                x: x.to_f64(),
                y: y.to_f64(),
            })
        },
        move |_serial, time, id| up(InputEvent::TouchUp { time, id }),
        move |time, id, x: Fixed, y: Fixed| {
            motion(InputEvent::TouchMotion {
                time,
                id,
                x: x.to_f64(),
                y: y.to_f64(),
            })
        },
        move || frame(InputEvent::TouchFrame),
        move || cancel(InputEvent::TouchCancel),
    )
}

/// Tool listener. `removed` additionally queues the tool for destruction,
/// which has to wait until dispatch returns.
pub fn tool_handlers(
    sink: &InputSink,
    tool: NonNull<TabletTool>,
    retired: &Rc<RefCell<Vec<NonNull<TabletTool>>>>,
) -> impl Handlers<TabletTool> + use<> {
    let (kind, prox_in, prox_out, down, up, motion, pressure, frame, removed) = (
        push(sink),
        push(sink),
        push(sink),
        push(sink),
        push(sink),
        push(sink),
        push(sink),
        push(sink),
        push(sink),
    );
    let retired = retired.clone();
    TabletToolListener::handlers(
        move |raw| kind(InputEvent::ToolType { kind: raw.into() }),
        move |serial, _tablet, _surface| prox_in(InputEvent::ToolProximityIn { serial }),
        move || prox_out(InputEvent::ToolProximityOut),
        move |serial| down(InputEvent::ToolDown { serial }),
        move || up(InputEvent::ToolUp),
        move |x: Fixed, y: Fixed| {
            motion(InputEvent::ToolMotion {
                x: x.to_f64(),
                y: y.to_f64(),
            })
        },
        move |raw| {
            pressure(InputEvent::ToolPressure {
                pressure: normalize_pressure(raw),
            })
        },
        move |time| frame(InputEvent::ToolFrame { time }),
        move || {
            removed(InputEvent::ToolRemoved);
            retired.borrow_mut().push(tool);
        },
    )
}

/// Seat name as announced, lossily decoded.
pub fn seat_name(name: &CStr) -> String {
    name.to_string_lossy().into_owned()
}
