//! Client side of the connection: startup negotiation and object lifetimes
//!
//! Startup runs as two round trips. The first collects the globals the
//! registry announces; the second waits for the seat and the first
//! configure of the new toplevel. Each round trip is a continuation the
//! event queue drives until the awaited `done` arrives.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::rc::Rc;

use anyhow::{Context, Result, anyhow};
use tether_core::{Continuation, EventQueue, Interface, LoopbackTransport, Proxy};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::input::{self, InputEvent, InputSink};
use crate::protocol::{
    Capabilities, Compositor, Display, DisplayListener, Keyboard, Pointer, Registry,
    RegistryListener, Seat, SeatListener, Shell, ShellListener, ShellSurface,
    ShellSurfaceListener, Surface, TabletManager, TabletSeat, TabletSeatListener, TabletTool,
    Toplevel, ToplevelListener, Touch,
};
use crate::render::Renderer;
use crate::session::Session;

/// A global as announced by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub interface: String,
    pub version: u32,
}

/// Globals by registry name.
pub type Globals = BTreeMap<u32, Global>;

fn find<I: Interface>(globals: &Globals) -> Option<(u32, u32)> {
    globals
        .iter()
        .find(|(_, g)| g.interface == I::NAME)
        .map(|(name, g)| (*name, g.version))
}

fn require<I: Interface>(globals: &Globals) -> Result<(u32, u32)> {
    find::<I>(globals).ok_or_else(|| anyhow!("required global {} was not advertised", I::NAME))
}

/// Window state written by the shell listeners.
#[derive(Debug, Default)]
pub struct WindowState {
    pub width: u32,
    pub height: u32,
    pub configured: bool,
    pub closed: bool,
}

/// Devices created from the seat capabilities.
struct Devices {
    touch: Option<Proxy<Touch>>,
    pointer: Option<Proxy<Pointer>>,
    keyboard: Option<Proxy<Keyboard>>,
}

/// Everything the client owns on the connection.
///
/// Fields are declared in reverse acquisition order, so an unceremonious
/// drop still releases dependents first; [`Client::shutdown`] does the
/// same explicitly through the queue.
pub struct Client {
    renderer: Renderer,
    tools: Vec<Proxy<TabletTool>>,
    tablet_seat: Option<Proxy<TabletSeat>>,
    devices: Devices,
    toplevel: Proxy<Toplevel>,
    shell_surface: Proxy<ShellSurface>,
    surface: Proxy<Surface>,
    tablet_manager: Option<Proxy<TabletManager>>,
    seat: Proxy<Seat>,
    shell: Proxy<Shell>,
    compositor: Proxy<Compositor>,
    registry: Proxy<Registry>,
    display: Proxy<Display>,
    queue: EventQueue<LoopbackTransport>,
    session: Session,
    window: Rc<RefCell<WindowState>>,
    input: InputSink,
    new_tools: Rc<RefCell<Vec<NonNull<TabletTool>>>>,
    retired_tools: Rc<RefCell<Vec<NonNull<TabletTool>>>>,
}

impl Client {
    /// Connects and negotiates a configured toplevel with input devices
    pub fn connect(config: &Config, session: Session) -> Result<Self> {
        let transport = session.transport().clone();
        let mut queue = EventQueue::new(transport.clone());

        let display = transport
            .own(session.connect())
            .context("Failed to connect to the display")?;
        queue.attach(
            &display,
            DisplayListener::handlers(
                |object, code, reason| {
                    warn!(?object, code, reason = %reason.to_string_lossy(), "protocol error")
                },
                |id| debug!(id, "object id released"),
            ),
        )?;

        let registry = transport
            .own(session.get_registry(display.get()))
            .context("Failed to get the registry")?;
        let globals = Self::collect_globals(&mut queue, &registry)?;
        info!(count = globals.len(), "globals received");

        let (name, version) = require::<Compositor>(&globals)?;
        let compositor = transport.own(session.bind::<Compositor>(registry.get(), name, version))?;
        let (name, version) = require::<Shell>(&globals)?;
        let shell = transport.own(session.bind::<Shell>(registry.get(), name, version))?;
        let (name, version) = require::<Seat>(&globals)?;
        let seat = transport.own(session.bind::<Seat>(registry.get(), name, version))?;
        let tablet_manager = match find::<TabletManager>(&globals) {
            Some((name, version)) => {
                Some(transport.own(session.bind::<TabletManager>(registry.get(), name, version))?)
            }
            None => {
                debug!("no tablet manager, stylus input disabled");
                None
            }
        };

        let pinger = session.clone();
        let shell_ptr = shell.get();
        queue.attach(
            &shell,
            ShellListener::handlers(move |serial| pinger.pong(shell_ptr, serial)),
        )?;

        let capabilities = Rc::new(Cell::new(Capabilities::empty()));
        let seat_caps = capabilities.clone();
        queue.attach(
            &seat,
            SeatListener::handlers(
                move |bits| seat_caps.set(Capabilities::from_bits_truncate(bits)),
                |name| info!(seat = %input::seat_name(name), "seat announced"),
            ),
        )?;

        let surface = transport
            .own(session.create_surface(compositor.get()))
            .context("Failed to create surface")?;
        let shell_surface = transport
            .own(session.get_shell_surface(shell.get(), surface.get()))
            .context("Failed to create shell surface")?;
        let toplevel = transport
            .own(session.get_toplevel(shell_surface.get()))
            .context("Failed to create toplevel")?;
        session.set_title(toplevel.get(), &config.window.title);

        let window = Rc::new(RefCell::new(WindowState {
            width: config.window.width,
            height: config.window.height,
            ..WindowState::default()
        }));
        let (configured_tx, configured) = tokio::sync::oneshot::channel();
        Self::attach_shell_surface(&mut queue, &session, &shell_surface, &window, configured_tx)?;
        Self::attach_toplevel(&mut queue, &toplevel, &window)?;

        let (callback, synced) = queue.sync()?;
        let mut settle = Continuation::new(async move {
            let serial = configured.await.ok();
            let _ = synced.await;
            serial
        });
        let serial = queue
            .run_until(&mut settle)
            .context("Toplevel was never configured")?;
        queue.destroy(callback);
        let serial = serial.context("Shell surface listener dropped before configure")?;
        if session.acked_configure() != Some(serial) {
            warn!(serial, "first configure was not acknowledged");
        }
        debug!(serial, "first configure received");

        let input = InputSink::default();
        let devices = Self::create_devices(&mut queue, &session, &seat, capabilities.get(), &input)?;

        let new_tools = Rc::new(RefCell::new(Vec::new()));
        let tablet_seat = match &tablet_manager {
            Some(manager) => {
                let tablet_seat = transport
                    .own(session.get_tablet_seat(manager.get(), seat.get()))
                    .context("Failed to get tablet seat")?;
                let announced = new_tools.clone();
                queue.attach(
                    &tablet_seat,
                    TabletSeatListener::handlers(move |tool| {
                        if let Some(tool) = tool {
                            announced.borrow_mut().push(tool);
                        }
                    }),
                )?;
                Some(tablet_seat)
            }
            None => None,
        };

        let (width, height) = {
            let window = window.borrow();
            (window.width, window.height)
        };
        let renderer = Renderer::new(display.as_non_null(), surface.as_non_null(), width, height)?;
        info!(width, height, title = ?session.title(), "window ready");

        let mut client = Self {
            renderer,
            tools: Vec::new(),
            tablet_seat,
            devices,
            toplevel,
            shell_surface,
            surface,
            tablet_manager,
            seat,
            shell,
            compositor,
            registry,
            display,
            queue,
            session,
            window,
            input,
            new_tools,
            retired_tools: Rc::new(RefCell::new(Vec::new())),
        };
        // Picks up tools announced by the tablet seat.
        client.dispatch().context("Initial dispatch failed")?;
        Ok(client)
    }

    /// First round trip: every global announced before `done`.
    fn collect_globals(
        queue: &mut EventQueue<LoopbackTransport>,
        registry: &Proxy<Registry>,
    ) -> Result<Globals> {
        let globals = Rc::new(RefCell::new(Globals::new()));
        let (added, removed) = (globals.clone(), globals.clone());
        queue.attach(
            registry,
            RegistryListener::handlers(
                move |name, interface, version| {
                    let interface = interface.to_string_lossy().into_owned();
                    debug!(name, %interface, version, "global");
                    added.borrow_mut().insert(name, Global { interface, version });
                },
                move |name| {
                    removed.borrow_mut().remove(&name);
                },
            ),
        )?;

        let (callback, done) = queue.sync()?;
        let collected = globals.clone();
        let mut round_trip = Continuation::new(async move {
            done.await
                .map(|_| collected.borrow().clone())
                .map_err(|_| anyhow!("registry round trip was canceled"))
        });
        let result = queue.run_until(&mut round_trip).context("Registry round trip failed")?;
        queue.destroy(callback);
        result
    }

    fn attach_shell_surface(
        queue: &mut EventQueue<LoopbackTransport>,
        session: &Session,
        shell_surface: &Proxy<ShellSurface>,
        window: &Rc<RefCell<WindowState>>,
        configured: tokio::sync::oneshot::Sender<u32>,
    ) -> Result<()> {
        let session = session.clone();
        let window = window.clone();
        let target = shell_surface.get();
        let mut first = Some(configured);
        queue.attach(
            shell_surface,
            ShellSurfaceListener::handlers(move |serial| {
                session.ack_configure(target, serial);
                window.borrow_mut().configured = true;
                if let Some(tx) = first.take() {
                    let _ = tx.send(serial);
                }
            }),
        )?;
        Ok(())
    }

    fn attach_toplevel(
        queue: &mut EventQueue<LoopbackTransport>,
        toplevel: &Proxy<Toplevel>,
        window: &Rc<RefCell<WindowState>>,
    ) -> Result<()> {
        let (sized, closing) = (window.clone(), window.clone());
        queue.attach(
            toplevel,
            ToplevelListener::handlers(
                move |width, height, states| {
                    debug!(width, height, states = states.len() / 4, "toplevel configure");
                    // Zero leaves the size to the client.
                    let mut window = sized.borrow_mut();
                    if width > 0 && height > 0 {
                        window.width = width as u32;
                        window.height = height as u32;
                    }
                },
                move || closing.borrow_mut().closed = true,
            ),
        )?;
        Ok(())
    }

    fn create_devices(
        queue: &mut EventQueue<LoopbackTransport>,
        session: &Session,
        seat: &Proxy<Seat>,
        capabilities: Capabilities,
        input: &InputSink,
    ) -> Result<Devices> {
        info!(?capabilities, "seat capabilities");
        let transport = session.transport();

        let keyboard = if capabilities.contains(Capabilities::KEYBOARD) {
            let keyboard = transport.own(session.get_keyboard(seat.get()))?;
            queue.attach(&keyboard, input::keyboard_handlers(input))?;
            Some(keyboard)
        } else {
            None
        };
        let pointer = if capabilities.contains(Capabilities::POINTER) {
            let pointer = transport.own(session.get_pointer(seat.get()))?;
            queue.attach(&pointer, input::pointer_handlers(input))?;
            Some(pointer)
        } else {
            None
        };
        let touch = if capabilities.contains(Capabilities::TOUCH) {
            let touch = transport.own(session.get_touch(seat.get()))?;
            queue.attach(&touch, input::touch_handlers(input))?;
            Some(touch)
        } else {
            None
        };

        Ok(Devices {
            touch,
            pointer,
            keyboard,
        })
    }

    /// Dispatches pending events, then attaches tools announced and
    /// destroys tools removed during that dispatch
    pub fn dispatch(&mut self) -> Result<usize> {
        let dispatched = self.queue.dispatch()?;

        let announced: Vec<_> = self.new_tools.borrow_mut().drain(..).collect();
        for tool in announced {
            let tool = self.session.transport().own(tool.as_ptr())?;
            self.queue.attach(
                &tool,
                input::tool_handlers(&self.input, tool.as_non_null(), &self.retired_tools),
            )?;
            debug!(tools = self.tools.len() + 1, "tablet tool attached");
            self.tools.push(tool);
        }

        let retired: Vec<_> = self.retired_tools.borrow_mut().drain(..).collect();
        for tool in retired {
            if let Some(index) = self.tools.iter().position(|t| t.as_non_null() == tool) {
                let tool = self.tools.swap_remove(index);
                self.queue.destroy(tool);
                debug!(tools = self.tools.len(), "tablet tool removed");
            }
        }

        let (width, height) = {
            let window = self.window.borrow();
            (window.width, window.height)
        };
        self.renderer.resize(width, height);

        Ok(dispatched)
    }

    /// Input events received since the last call
    pub fn drain_input(&self) -> Vec<InputEvent> {
        std::mem::take(&mut *self.input.borrow_mut())
    }

    /// True once the shell surface received its first configure
    pub fn is_configured(&self) -> bool {
        self.window.borrow().configured
    }

    pub fn is_closed(&self) -> bool {
        self.window.borrow().closed
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Renderer {
        &mut self.renderer
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Releases every object in reverse acquisition order
    pub fn shutdown(self) {
        let Client {
            renderer,
            tools,
            tablet_seat,
            devices,
            toplevel,
            shell_surface,
            surface,
            tablet_manager,
            seat,
            shell,
            compositor,
            registry,
            display,
            mut queue,
            ..
        } = self;

        drop(renderer);
        for tool in tools.into_iter().rev() {
            queue.destroy(tool);
        }
        if let Some(tablet_seat) = tablet_seat {
            queue.destroy(tablet_seat);
        }
        let Devices {
            touch,
            pointer,
            keyboard,
        } = devices;
        if let Some(touch) = touch {
            queue.destroy(touch);
        }
        if let Some(pointer) = pointer {
            queue.destroy(pointer);
        }
        if let Some(keyboard) = keyboard {
            queue.destroy(keyboard);
        }
        queue.destroy(toplevel);
        queue.destroy(shell_surface);
        drop(surface);
        drop(tablet_manager);
        queue.destroy(seat);
        queue.destroy(shell);
        drop(compositor);
        queue.destroy(registry);
        queue.destroy(display);

        if !queue.is_empty() {
            warn!(live = queue.len(), "listeners left after shutdown");
        }
        info!("connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    fn config(session: SessionConfig) -> Config {
        Config {
            session,
            ..Config::default()
        }
    }

    #[test]
    fn test_connect_negotiates_a_configured_window() {
        let config = config(SessionConfig::default());
        let session = Session::new(config.session.clone());
        let client = Client::connect(&config, session.clone()).unwrap();

        assert_eq!(session.title().as_deref(), Some("tether"));
        assert!(session.acked_configure().is_some());
        assert!(client.is_configured());
        assert_eq!(client.renderer.size(), (800, 600));
        assert!(client.devices.touch.is_some());
        assert!(client.tablet_seat.is_some());
        client.shutdown();
    }

    #[test]
    fn test_refused_connection_reports_the_call_site() {
        let config = config(SessionConfig {
            available: false,
            ..SessionConfig::default()
        });
        let session = Session::new(config.session.clone());
        let err = Client::connect(&config, session).err().unwrap();

        let core = err.downcast_ref::<tether_core::Error>().unwrap();
        assert_eq!(core.location().unwrap().file(), file!());
        assert!(format!("{:#}", err).contains("Failed to connect to the display"));
    }

    #[test]
    fn test_missing_global_is_named() {
        let globals = Globals::from([(
            1,
            Global {
                interface: "wl_compositor".into(),
                version: 4,
            },
        )]);
        assert_eq!(require::<Compositor>(&globals).unwrap(), (1, 4));
        let err = require::<Seat>(&globals).unwrap_err();
        assert_eq!(err.to_string(), "required global wl_seat was not advertised");
    }

    #[test]
    fn test_tools_come_and_go_with_the_script() {
        let config = config(SessionConfig {
            touch: false,
            ..SessionConfig::default()
        });
        let session = Session::new(config.session.clone());
        let mut client = Client::connect(&config, session.clone()).unwrap();
        assert!(client.devices.touch.is_none());
        assert_eq!(client.tool_count(), 1);

        let mut seen = Vec::new();
        for frame in 1..=20 {
            session.emit_frame(frame);
            client.dispatch().unwrap();
            seen.extend(client.drain_input());
        }
        assert_eq!(client.tool_count(), 0);
        assert!(seen.contains(&InputEvent::ToolRemoved));
        assert!(seen.contains(&InputEvent::ToolType {
            kind: input::ToolKind::Pen
        }));
        assert!(seen.iter().any(|e| matches!(e, InputEvent::Keymap { .. })));
        assert!(!seen.iter().any(|e| matches!(e, InputEvent::TouchDown { .. })));
        client.shutdown();
    }

    #[test]
    fn test_close_request_marks_the_window_closed() {
        let config = config(SessionConfig {
            close_at_frame: Some(2),
            ..SessionConfig::default()
        });
        let session = Session::new(config.session.clone());
        let mut client = Client::connect(&config, session.clone()).unwrap();

        session.emit_frame(1);
        client.dispatch().unwrap();
        assert!(!client.is_closed());
        session.emit_frame(2);
        client.dispatch().unwrap();
        assert!(client.is_closed());
        client.shutdown();
    }

    #[test]
    fn test_lost_connection_fails_dispatch() {
        let config = config(SessionConfig {
            disconnect_at_frame: Some(1),
            ..SessionConfig::default()
        });
        let session = Session::new(config.session.clone());
        let mut client = Client::connect(&config, session.clone()).unwrap();

        session.emit_frame(1);
        assert!(client.dispatch().is_err());
        client.shutdown();
    }
}
