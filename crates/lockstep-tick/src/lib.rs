//! Fixed-rate frame clock for Lockstep.
//!
//! A lockstep server advances the simulation one frame per clock tick.
//! The clock keeps that cadence steady, notices when the node falls
//! behind, and tells it how many frames to run to make up for it.
//!
//! # Integration
//!
//! The clock sits inside the node task's `tokio::select!` loop:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         Some(event) = events.recv() => { /* handle packets */ }
//!         tick = clock.wait_for_frame() => {
//!             for _ in 0..tick.frames {
//!                 server.tick(Instant::now());
//!             }
//!             clock.record_frame_end();
//!         }
//!     }
//! }
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant as TokioInstant};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What to do when the node wakes up late for one or more frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Run one frame and resume the cadence from now. Missed frames are
    /// gone; the game simply runs slower for a moment.
    #[default]
    Skip,
    /// Run the missed frames right away, up to `max_catchup` of them.
    CatchUp {
        /// Most extra frames run in one burst.
        max_catchup: u32,
    },
}

/// Frame clock settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameClockConfig {
    /// Milliseconds per frame.
    pub frame_interval_ms: u64,
    pub policy: OverrunPolicy,
    /// Fraction of the frame budget (0.0–1.0) above which a slow frame
    /// is logged.
    pub budget_warn_threshold: f64,
    /// Fraction of the frame budget treated as critical.
    pub budget_critical_threshold: f64,
    /// Keep average and maximum frame times.
    pub metrics_enabled: bool,
}

impl Default for FrameClockConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 30,
            policy: OverrunPolicy::default(),
            budget_warn_threshold: 0.80,
            budget_critical_threshold: 1.0,
            metrics_enabled: true,
        }
    }
}

impl FrameClockConfig {
    /// Slowest allowed frame interval.
    pub const MAX_INTERVAL_MS: u64 = 1_000;

    pub fn with_interval_ms(frame_interval_ms: u64) -> Self {
        Self {
            frame_interval_ms,
            ..Default::default()
        }
    }

    /// Clamps out-of-range values.
    ///
    /// - `frame_interval_ms` kept within `1..=MAX_INTERVAL_MS`
    /// - thresholds clamped to `0.0..=1.0`, warn never above critical
    pub fn validated(mut self) -> Self {
        if self.frame_interval_ms == 0 || self.frame_interval_ms > Self::MAX_INTERVAL_MS {
            warn!(
                interval_ms = self.frame_interval_ms,
                max = Self::MAX_INTERVAL_MS,
                "frame_interval_ms out of range, clamping"
            );
            self.frame_interval_ms = self.frame_interval_ms.clamp(1, Self::MAX_INTERVAL_MS);
        }
        self.budget_warn_threshold = self.budget_warn_threshold.clamp(0.0, 1.0);
        self.budget_critical_threshold = self.budget_critical_threshold.clamp(0.0, 1.0);
        if self.budget_warn_threshold > self.budget_critical_threshold {
            self.budget_warn_threshold = self.budget_critical_threshold;
        }
        self
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// FrameTick
// ---------------------------------------------------------------------------

/// One wake-up of the clock, returned by [`FrameClock::wait_for_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTick {
    /// Wake-up counter, starting at 1.
    pub tick: u64,
    /// Frames to run now. 1 unless catching up.
    pub frames: u32,
    /// `true` if the wake-up came noticeably late.
    pub overrun: bool,
    /// Frames dropped for good by this wake-up.
    pub skipped: u64,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Counters for the clock, updated as frames run.
#[derive(Debug, Clone, Default)]
pub struct FrameMetrics {
    pub total_ticks: u64,
    /// Frames run, catch-up frames included.
    pub total_frames: u64,
    pub total_overruns: u64,
    pub total_skipped: u64,
    /// Moving average of frame processing time (α = 0.1).
    pub avg_frame_time: Duration,
    pub max_frame_time: Duration,
    /// Last processing time over the budget. Above 1.0 means overrun.
    pub budget_utilization: f64,
}

// ---------------------------------------------------------------------------
// FrameClock
// ---------------------------------------------------------------------------

/// Fixed-interval clock for one node.
#[derive(Debug)]
pub struct FrameClock {
    config: FrameClockConfig,
    interval: Duration,
    tick_count: u64,
    next_frame: TokioInstant,
    /// When processing of the current wake-up started.
    frame_start: Option<Instant>,
    /// Frames to charge the current processing time against.
    frames_in_flight: u32,
    paused: bool,
    metrics: FrameMetrics,
}

impl FrameClock {
    pub fn new(config: FrameClockConfig) -> Self {
        let config = config.validated();
        let interval = config.frame_interval();
        debug!(
            interval_ms = config.frame_interval_ms,
            policy = ?config.policy,
            "frame clock created"
        );
        Self {
            config,
            interval,
            tick_count: 0,
            next_frame: TokioInstant::now() + interval,
            frame_start: None,
            frames_in_flight: 0,
            paused: false,
            metrics: FrameMetrics::default(),
        }
    }

    pub fn with_interval_ms(frame_interval_ms: u64) -> Self {
        Self::new(FrameClockConfig::with_interval_ms(frame_interval_ms))
    }

    /// Waits until the next frame is due.
    ///
    /// While paused the future never resolves, so the other branches of a
    /// `select!` keep running.
    pub async fn wait_for_frame(&mut self) -> FrameTick {
        if self.paused {
            std::future::pending::<()>().await;
        }
        let due = self.next_frame;
        time::sleep_until(due).await;

        let now = TokioInstant::now();
        self.tick_count += 1;
        self.frame_start = Some(Instant::now());

        let late_by = now.saturating_duration_since(due);
        let overrun = late_by > self.interval / 10;
        let behind = (late_by.as_nanos() / self.interval.as_nanos()) as u64;

        let (frames, skipped) = match self.config.policy {
            OverrunPolicy::Skip => {
                if behind > 0 {
                    warn!(
                        tick = self.tick_count,
                        skipped = behind,
                        late_ms = late_by.as_secs_f64() * 1000.0,
                        "frame clock behind, skipping ahead"
                    );
                }
                self.next_frame = now + self.interval;
                (1, behind)
            }
            OverrunPolicy::CatchUp { max_catchup } => {
                let extra = behind.min(u64::from(max_catchup));
                let skipped = behind - extra;
                if behind > 0 {
                    warn!(
                        tick = self.tick_count,
                        behind,
                        catching_up = extra,
                        skipped,
                        "frame clock behind, catching up"
                    );
                }
                self.next_frame = if skipped == 0 {
                    due + self.interval * (extra as u32 + 1)
                } else {
                    now + self.interval
                };
                (extra as u32 + 1, skipped)
            }
        };

        self.frames_in_flight = frames;
        if overrun {
            self.metrics.total_overruns += 1;
        }
        self.metrics.total_ticks += 1;
        self.metrics.total_frames += u64::from(frames);
        self.metrics.total_skipped += skipped;
        trace!(tick = self.tick_count, frames, overrun, "frame clock fired");

        FrameTick {
            tick: self.tick_count,
            frames,
            overrun,
            skipped,
        }
    }

    /// Records that the frames of the last wake-up finished processing.
    ///
    /// Feeds the budget warnings and metrics. A no-op without a prior
    /// [`wait_for_frame`](Self::wait_for_frame).
    pub fn record_frame_end(&mut self) {
        let Some(start) = self.frame_start.take() else {
            return;
        };
        let frames = self.frames_in_flight.max(1);
        let elapsed = start.elapsed() / frames;

        let utilization = elapsed.as_secs_f64() / self.interval.as_secs_f64();
        self.metrics.budget_utilization = utilization;
        if utilization >= self.config.budget_critical_threshold {
            warn!(
                tick = self.tick_count,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                budget_ms = self.interval.as_secs_f64() * 1000.0,
                "frame exceeded budget"
            );
        } else if utilization >= self.config.budget_warn_threshold {
            debug!(
                tick = self.tick_count,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                "frame approaching budget"
            );
        }

        if self.config.metrics_enabled {
            if elapsed > self.metrics.max_frame_time {
                self.metrics.max_frame_time = elapsed;
            }
            let alpha = 0.1;
            let prev = self.metrics.avg_frame_time.as_secs_f64();
            self.metrics.avg_frame_time =
                Duration::from_secs_f64(prev * (1.0 - alpha) + elapsed.as_secs_f64() * alpha);
        }
    }

    /// Stops the clock. Idempotent.
    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            debug!(tick = self.tick_count, "frame clock paused");
        }
    }

    /// Restarts the clock one interval from now, so the pause does not
    /// turn into a burst of catch-up frames.
    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.next_frame = TokioInstant::now() + self.interval;
            debug!(tick = self.tick_count, "frame clock resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn metrics(&self) -> &FrameMetrics {
        &self.metrics
    }

    pub fn frame_interval(&self) -> Duration {
        self.interval
    }
}
