// FPS counter for the frame loop
use std::time::{Duration, Instant};

/// Simple rolling-average FPS counter
pub struct FpsCounter {
    /// When we started counting
    last_report: Instant,
    /// Frames since last report
    frame_count: u32,
    /// Last calculated FPS
    current_fps: f64,
    /// Report interval
    report_interval: Duration,
}

impl FpsCounter {
    pub fn new(report_interval: Duration) -> Self {
        Self::starting_at(Instant::now(), report_interval)
    }

    fn starting_at(start: Instant, report_interval: Duration) -> Self {
        Self {
            last_report: start,
            frame_count: 0,
            current_fps: 0.0,
            report_interval,
        }
    }

    /// Call this after each frame is presented
    /// Returns Some(fps) if a new measurement is available
    pub fn tick(&mut self) -> Option<f64> {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> Option<f64> {
        self.frame_count += 1;

        let elapsed = now.saturating_duration_since(self.last_report);
        if elapsed >= self.report_interval && !elapsed.is_zero() {
            self.current_fps = self.frame_count as f64 / elapsed.as_secs_f64();
            self.frame_count = 0;
            self.last_report = now;
            Some(self.current_fps)
        } else {
            None
        }
    }

    /// Get the last calculated FPS
    pub fn fps(&self) -> f64 {
        self.current_fps
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
