//! The two periodic tasks and the tracking session that owns them.
//!
//! The video task drains the frame buffer through the detection pipeline at
//! a fast rate; the control task runs the PID controller at a slow rate. They
//! share only the frame buffer and the result slot.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::TrackerConfig;
use crate::control::TrackingController;
use crate::detect::DetectionResult;
use crate::frame::FrameBuffer;
use crate::pipeline::{DetectionPipeline, OperatorControls, PipelineStats, ResultSlot};
use crate::vehicle::{SessionFlags, VehicleInterface};

// ----------------------------------------------------------------------------
// PeriodicTask
// ----------------------------------------------------------------------------

/// A dedicated thread calling `tick` at a fixed rate.
///
/// Deadlines are `start + n * period`, so a tick that overruns its period is
/// followed immediately by the next one; ticks never overlap.
pub struct PeriodicTask {
    name: String,
    stop: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &str, period: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(anyhow!("{} period must be greater than zero", name));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicU64::new(0));
        let thread_stop = Arc::clone(&stop);
        let thread_ticks = Arc::clone(&ticks);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let start = Instant::now();
                let mut due = start;
                while !thread_stop.load(Ordering::SeqCst) {
                    tick();
                    thread_ticks.fetch_add(1, Ordering::Relaxed);
                    due += period;
                    loop {
                        if thread_stop.load(Ordering::SeqCst) {
                            return;
                        }
                        let now = Instant::now();
                        if now >= due {
                            break;
                        }
                        thread::park_timeout(due - now);
                    }
                }
            })
            .with_context(|| format!("failed to spawn {} thread", name))?;

        Ok(Self {
            name: name.to_string(),
            stop,
            ticks,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Completed ticks.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Stop and join. A tick in progress finishes first; none start after.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("{} task panicked", self.name);
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Tracker
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickPeriods {
    pub video: Duration,
    pub control: Duration,
}

impl Default for TickPeriods {
    fn default() -> Self {
        Self {
            video: Duration::from_millis(66),
            control: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub frames_published: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub detections: u64,
    pub commands_issued: u64,
    pub video_ticks: u64,
    pub control_ticks: u64,
}

/// A running tracking session.
pub struct Tracker {
    frames: Arc<FrameBuffer>,
    controls: Arc<OperatorControls>,
    results: Arc<ResultSlot>,
    flags: Arc<SessionFlags>,
    vehicle: Arc<dyn VehicleInterface>,
    pipeline_stats: Arc<PipelineStats>,
    commands: Arc<AtomicU64>,
    video: Option<PeriodicTask>,
    control: Option<PeriodicTask>,
}

impl Tracker {
    /// Connect the vehicle and start both ticks.
    ///
    /// Nothing runs if the vehicle cannot be reached.
    pub fn start(
        mut pipeline: DetectionPipeline,
        mut controller: TrackingController,
        vehicle: Arc<dyn VehicleInterface>,
        periods: TickPeriods,
    ) -> Result<Self> {
        if periods.video >= periods.control {
            log::warn!(
                "video tick ({:?}) is not faster than control tick ({:?})",
                periods.video,
                periods.control
            );
        }
        vehicle
            .connect()
            .with_context(|| format!("vehicle {} unreachable", vehicle.name()))?;

        let frames = Arc::new(FrameBuffer::new());
        let controls = pipeline.controls();
        let results = pipeline.results();
        let pipeline_stats = pipeline.stats();
        let flags = Arc::new(SessionFlags::new());
        let commands = Arc::new(AtomicU64::new(0));

        let video_frames = Arc::clone(&frames);
        let video = PeriodicTask::spawn("video-tick", periods.video, move || {
            pipeline.tick(&video_frames);
        })?;

        let control_results = Arc::clone(&results);
        let control_flags = Arc::clone(&flags);
        let control_vehicle = Arc::clone(&vehicle);
        let control_commands = Arc::clone(&commands);
        let control = PeriodicTask::spawn("control-tick", periods.control, move || {
            match controller.tick(&control_results, &control_flags, control_vehicle.as_ref()) {
                Ok(Some(_)) => {
                    control_commands.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {}
                Err(err) => log::error!("control tick: {:#}", err),
            }
        })?;

        log::info!(
            "tracker started: video every {:?}, control every {:?}, vehicle {}",
            periods.video,
            periods.control,
            vehicle.name()
        );

        Ok(Self {
            frames,
            controls,
            results,
            flags,
            vehicle,
            pipeline_stats,
            commands,
            video: Some(video),
            control: Some(control),
        })
    }

    /// Build the pipeline and controller from `config` and start.
    pub fn from_config(config: &TrackerConfig, vehicle: Arc<dyn VehicleInterface>) -> Result<Self> {
        let pipeline = DetectionPipeline::from_config(config)?;
        let controller = TrackingController::new(config.control.settings);
        Self::start(pipeline, controller, vehicle, config.tick_periods())
    }

    /// Where the video link delivers frames.
    pub fn frame_buffer(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.frames)
    }

    pub fn controls(&self) -> Arc<OperatorControls> {
        Arc::clone(&self.controls)
    }

    pub fn flags(&self) -> Arc<SessionFlags> {
        Arc::clone(&self.flags)
    }

    pub fn latest_result(&self) -> Result<Option<Arc<DetectionResult>>> {
        self.results.latest()
    }

    pub fn is_running(&self) -> bool {
        self.video.is_some() || self.control.is_some()
    }

    pub fn set_tracking(&self, tracking: bool) {
        if self.flags.is_tracking() != tracking {
            log::info!("tracking {}", if tracking { "enabled" } else { "disabled" });
        }
        self.flags.set_tracking(tracking);
    }

    /// Take off and hover in place.
    pub fn take_off(&self) -> Result<()> {
        self.ensure_running()?;
        self.vehicle.take_off()?;
        self.vehicle.hover()?;
        self.flags.set_active(true);
        log::info!("airborne");
        Ok(())
    }

    pub fn land(&self) -> Result<()> {
        self.flags.set_active(false);
        self.vehicle.land()?;
        log::info!("landed");
        Ok(())
    }

    /// Cut the motors wherever the vehicle is. Unlike `land` this does not
    /// descend first.
    pub fn stop_vehicle(&self) -> Result<()> {
        self.flags.set_active(false);
        self.vehicle.stop()?;
        log::warn!("vehicle stopped");
        Ok(())
    }

    /// Start/stop button: take off when grounded, land when airborne.
    pub fn toggle_flight(&self) -> Result<()> {
        if self.flags.is_active() {
            self.land()
        } else {
            self.take_off()
        }
    }

    pub fn hover(&self) -> Result<()> {
        self.ensure_running()?;
        self.vehicle.hover()
    }

    pub fn reset_vehicle(&self) -> Result<()> {
        self.ensure_running()?;
        self.vehicle.reset()
    }

    /// Clear both PID states on the next control tick.
    pub fn reset_controller(&self) {
        self.flags.request_controller_reset();
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            frames_published: self.frames.published(),
            frames_processed: self.pipeline_stats.processed(),
            frames_dropped: self.pipeline_stats.dropped(),
            detections: self.pipeline_stats.detected(),
            commands_issued: self.commands.load(Ordering::Relaxed),
            video_ticks: self.video.as_ref().map_or(0, PeriodicTask::ticks),
            control_ticks: self.control.as_ref().map_or(0, PeriodicTask::ticks),
        }
    }

    /// Stop both ticks. The control task is joined first, so once this
    /// returns no further commands reach the vehicle from the tracker.
    pub fn stop(&mut self) {
        let was_running = self.is_running();
        if let Some(mut control) = self.control.take() {
            control.stop();
        }
        if let Some(mut video) = self.video.take() {
            video.stop();
        }
        if was_running {
            log::info!("tracker stopped");
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(anyhow!("tracker is stopped"))
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_task_ticks_until_stopped() {
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let mut task = PeriodicTask::spawn("test-tick", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        thread::sleep(Duration::from_millis(60));
        task.stop();
        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "only {} ticks", after_stop);
        assert_eq!(task.ticks(), after_stop);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn zero_period_is_rejected() {
        assert!(PeriodicTask::spawn("bad", Duration::ZERO, || {}).is_err());
    }
}
