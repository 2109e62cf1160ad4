//! Tether - demo client
//!
//! Connects to a simulated compositor, negotiates a toplevel window with
//! keyboard, pointer, touch and tablet input, and runs a paced frame loop
//! until the window is closed, the frame budget runs out, ctrl-c arrives
//! or the connection fails.

mod client;
mod config;
mod fps;
mod input;
mod protocol;
mod render;
mod session;

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use client::Client;
use session::Session;

/// Main application state
struct TetherApp {
    /// Connection and everything created on it
    client: Client,

    /// Compositor end of the connection, plays the input script
    session: Session,

    /// Configuration
    config: config::Config,

    /// Frame loop bookkeeping
    frame: u64,
    started: Instant,
    fps: fps::FpsCounter,
}

impl TetherApp {
    /// Initialize the application
    fn new(config: config::Config) -> Result<Self> {
        let session = Session::new(config.session.clone());
        let client = Client::connect(&config, session.clone())
            .context("Failed to set up the window")?;
        let fps = fps::FpsCounter::new(Duration::from_millis(config.frame.report_interval_ms));

        Ok(Self {
            client,
            session,
            config,
            frame: 0,
            started: Instant::now(),
            fps,
        })
    }

    /// Frame loop
    async fn run(mut self) -> Result<()> {
        let period = Duration::from_secs_f64(1.0 / self.config.frame.rate_hz);
        let mut frames = tokio::time::interval(period);
        frames.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        info!(rate_hz = self.config.frame.rate_hz, "Starting frame loop");
        let result = loop {
            tokio::select! {
                _ = frames.tick() => {
                    match self.frame() {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                signal = &mut shutdown => {
                    if let Err(e) = signal {
                        error!("Failed to listen for ctrl-c: {}", e);
                    }
                    info!("Shutdown signal received, cleaning up...");
                    break Ok(());
                }
            }
        };

        info!(
            frames = self.frame,
            presented = self.client.renderer().frames(),
            size = ?self.client.renderer().size(),
            last_fps = self.fps.fps(),
            "Frame loop finished"
        );
        self.client.shutdown();
        result
    }

    /// Runs one frame. Returns false when the loop should stop.
    fn frame(&mut self) -> Result<bool> {
        self.frame += 1;
        self.session.emit_frame(self.frame);

        let dispatched = self
            .client
            .dispatch()
            .with_context(|| format!("Dispatch failed at frame {}", self.frame))?;
        for event in self.client.drain_input() {
            event.log(self.config.input.log_motion);
        }

        if self.client.is_closed() {
            info!("Toplevel closed by the compositor");
            return Ok(false);
        }

        if !self.client.is_configured() {
            return Ok(true);
        }
        let clear = self.client.renderer_mut().draw(self.started.elapsed());
        debug!(frame = self.frame, dispatched, ?clear, "frame");
        if let Some(fps) = self.fps.tick() {
            info!("Performance: fps={:.1}, tools={}", fps, self.client.tool_count());
        }

        Ok(self
            .config
            .frame
            .max_frames
            .is_none_or(|max| self.frame < max))
    }
}

/// Logs the error chain and, for a missing handle, where it was produced
fn report(err: &anyhow::Error) {
    error!("Application error: {:#}", err);
    let location = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<tether_core::Error>())
        .find_map(tether_core::Error::location);
    if let Some(location) = location {
        error!(
            file = location.file(),
            line = location.line(),
            column = location.column(),
            "Handle acquisition failed here"
        );
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tether=debug,tether_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tether");

    // Load configuration
    let config = config::Config::load().context("Failed to load configuration")?;

    let app = match TetherApp::new(config) {
        Ok(app) => app,
        Err(e) => {
            report(&e);
            return Err(e);
        }
    };

    if let Err(e) = app.run().await {
        report(&e);
        return Err(e);
    }

    Ok(())
}
