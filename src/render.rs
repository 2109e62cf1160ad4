//! Rendering context for the toplevel surface
//!
//! A software stand-in for an EGL display, window surface and context, so
//! the frame loop owns the same chain of handles a GPU client does: the
//! display, a window sized to the surface, and a context that can only be
//! destroyed through the display it was created on.

use std::cell::Cell;
use std::f64::consts::TAU;
use std::ptr::{self, NonNull};
use std::time::Duration;

use anyhow::{Context, Result};
use tether_core::{OwnedHandle, Release, owned};
use tracing::{debug, trace, warn};

use crate::protocol::{Display, Surface};

/// Rendering side of a display connection.
pub struct EglDisplay {
    next_context: Cell<u32>,
    live_contexts: Cell<u32>,
    current: Cell<Option<u32>>,
}

unsafe impl Release for EglDisplay {
    unsafe fn release(raw: *mut Self) {
        let display = unsafe { Box::from_raw(raw) };
        let live = display.live_contexts.get();
        if live > 0 {
            warn!(live, "terminating EGL display with live contexts");
        }
        debug!("EGL display terminated");
    }
}

/// Drawable backed by a protocol surface.
pub struct EglWindow {
    width: Cell<u32>,
    height: Cell<u32>,
    swaps: Cell<u64>,
}

unsafe impl Release for EglWindow {
    unsafe fn release(raw: *mut Self) {
        let window = unsafe { Box::from_raw(raw) };
        debug!(swaps = window.swaps.get(), "EGL window destroyed");
    }
}

fn get_display(_native: NonNull<Display>) -> *mut EglDisplay {
    Box::into_raw(Box::new(EglDisplay {
        next_context: Cell::new(1),
        live_contexts: Cell::new(0),
        current: Cell::new(None),
    }))
}

fn create_window(_surface: NonNull<Surface>, width: u32, height: u32) -> *mut EglWindow {
    if width == 0 || height == 0 {
        return ptr::null_mut();
    }
    Box::into_raw(Box::new(EglWindow {
        width: Cell::new(width),
        height: Cell::new(height),
        swaps: Cell::new(0),
    }))
}

/// Returns the new context's id. Ids start at 1, so 0 never names a
/// context and an exhausted id space yields it as the failure value.
fn create_context(display: &EglDisplay) -> u32 {
    let id = display.next_context.get();
    if id == 0 {
        return 0;
    }
    display.next_context.set(id.checked_add(1).unwrap_or(0));
    display.live_contexts.set(display.live_contexts.get() + 1);
    id
}

fn destroy_context(display: NonNull<EglDisplay>, context: u32) {
    // SAFETY: the renderer drops its context before its display.
    let display = unsafe { display.as_ref() };
    if display.current.get() == Some(context) {
        display.current.set(None);
    }
    display.live_contexts.set(display.live_contexts.get().saturating_sub(1));
    debug!(context, "EGL context destroyed");
}

type ContextHandle = OwnedHandle<u32, Box<dyn FnOnce(u32)>>;

/// Per-window renderer.
///
/// Fields drop in declaration order, so the context goes before the
/// display it was created on.
pub struct Renderer {
    context: ContextHandle,
    window: OwnedHandle<*mut EglWindow>,
    display: OwnedHandle<*mut EglDisplay>,
    frames: u64,
    clear: [f32; 4],
}

impl Renderer {
    pub fn new(
        native: NonNull<Display>,
        surface: NonNull<Surface>,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let display = owned!(get_display(native)).context("Failed to get EGL display")?;
        let window = owned!(create_window(surface, width, height))
            .context("Failed to create EGL window")?;

        // SAFETY: `display` is live for the whole function.
        let id = create_context(unsafe { display.as_non_null().as_ref() });
        let egl = display.as_non_null();
        let release: Box<dyn FnOnce(u32)> = Box::new(move |ctx| destroy_context(egl, ctx));
        let context = owned!(id, release).context("Failed to create EGL context")?;

        let renderer = Self {
            context,
            window,
            display,
            frames: 0,
            clear: [0.0, 0.0, 0.0, 1.0],
        };
        renderer.make_current();
        debug!(width, height, context = renderer.context.get(), "renderer ready");
        Ok(renderer)
    }

    fn egl_display(&self) -> &EglDisplay {
        // SAFETY: owned by `self.display` for as long as `self` lives.
        unsafe { self.display.as_non_null().as_ref() }
    }

    fn egl_window(&self) -> &EglWindow {
        // SAFETY: owned by `self.window` for as long as `self` lives.
        unsafe { self.window.as_non_null().as_ref() }
    }

    fn make_current(&self) {
        self.egl_display().current.set(Some(self.context.get()));
    }

    /// Follows a new size from the compositor. Zero keeps the current one.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let window = self.egl_window();
        if (window.width.get(), window.height.get()) != (width, height) {
            window.width.set(width);
            window.height.set(height);
            debug!(width, height, "EGL window resized");
        }
    }

    pub fn size(&self) -> (u32, u32) {
        let window = self.egl_window();
        (window.width.get(), window.height.get())
    }

    /// Clears to a color cycling with `elapsed` and presents the frame.
    pub fn draw(&mut self, elapsed: Duration) -> [f32; 4] {
        if self.egl_display().current.get() != Some(self.context.get()) {
            self.make_current();
        }
        self.clear = clear_color(elapsed);
        self.frames += 1;

        let window = self.egl_window();
        window.swaps.set(window.swaps.get() + 1);
        trace!(frame = self.frames, clear = ?self.clear, "frame presented");
        self.clear
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// Three phase-shifted sine waves over a 4 second period.
pub fn clear_color(elapsed: Duration) -> [f32; 4] {
    let phase = elapsed.as_secs_f64() / 4.0 * TAU;
    let channel = |offset: f64| (0.5 + 0.5 * (phase + offset).sin()) as f32;
    [channel(0.0), channel(TAU / 3.0), channel(2.0 * TAU / 3.0), 1.0]
}
