//! trackerd - visual tracking daemon
//!
//! This daemon:
//! 1. Loads configuration (file + environment)
//! 2. Builds the detection pipeline and PID controller
//! 3. Connects the vehicle (dry-run: commands are logged only)
//! 4. Feeds synthetic frames into the frame buffer
//! 5. Runs the video and control ticks until Ctrl-C or `--seconds` elapse
//! 6. Stops both ticks, then lands (or cuts the motors if landing fails)

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use visual_tracker::detect::DetectionMode;
use visual_tracker::ui::{Ui, UiMode};
use visual_tracker::{
    DetectionPipeline, DryRunVehicle, SyntheticConfig, SyntheticSource, TrackedObjectPreset,
    Tracker, TrackerConfig, TrackingController, VehicleInterface,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (.toml or .json).
    #[arg(long, env = "TRACKER_CONFIG")]
    config: Option<PathBuf>,
    /// Detection mode, overriding the config.
    #[arg(long)]
    mode: Option<DetectionMode>,
    /// Colour preset for preconfigured_hsv mode.
    #[arg(long)]
    preset: Option<TrackedObjectPreset>,
    /// Run for this many seconds; 0 runs until Ctrl-C.
    #[arg(long, default_value_t = 0)]
    seconds: u64,
    /// Take off and enable tracking immediately.
    #[arg(long)]
    track: bool,
    /// Startup output style.
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = Ui::for_stderr(args.ui);

    let cfg = {
        let _stage = ui.stage("load config");
        let mut cfg = TrackerConfig::load_from(args.config.as_deref())?;
        if let Some(mode) = args.mode {
            if mode == DetectionMode::FaceDetection && cfg.detection.face_cascade.is_none() {
                return Err(anyhow!("--mode face_detection needs detection.face_cascade"));
            }
            cfg.detection.mode = mode;
        }
        if let Some(preset) = args.preset {
            cfg.detection.preset = preset;
        }
        cfg
    };

    let pipeline = {
        let mut stage = ui.stage("build detection pipeline");
        let pipeline = DetectionPipeline::from_config(&cfg)?;
        stage.set_detail(format!(
            "mode={} face={}",
            cfg.detection.mode,
            pipeline.has_face_backend()
        ));
        pipeline
    };
    let controller = TrackingController::new(cfg.control.settings);

    let vehicle = Arc::new(DryRunVehicle::new());
    let mut tracker = {
        let mut stage = ui.stage("start tracker");
        let tracker = Tracker::start(
            pipeline,
            controller,
            Arc::clone(&vehicle) as Arc<dyn VehicleInterface>,
            cfg.tick_periods(),
        )?;
        stage.set_detail(vehicle.name().to_string());
        tracker
    };

    let mut source = SyntheticSource::new(SyntheticConfig {
        width: cfg.video.width,
        height: cfg.video.height,
        fps: cfg.source.fps,
        ..SyntheticConfig::default()
    })?
    .spawn(tracker.frame_buffer())?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst))
        .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;

    if args.track {
        tracker.take_off()?;
        tracker.set_tracking(true);
    }

    log::info!(
        "trackerd running: mode={} preset={} frame={}x{}",
        cfg.detection.mode,
        cfg.detection.preset,
        cfg.video.width,
        cfg.video.height
    );

    let started = Instant::now();
    let deadline = (args.seconds > 0).then(|| Duration::from_secs(args.seconds));
    let mut last_health_log = Instant::now();

    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }

        if last_health_log.elapsed() >= Duration::from_secs(5) {
            let stats = tracker.stats();
            let latest = tracker.latest_result()?;
            log::info!(
                "health frames={} processed={} dropped={} detections={} commands={} target={}",
                stats.frames_published,
                stats.frames_processed,
                stats.frames_dropped,
                stats.detections,
                stats.commands_issued,
                latest
                    .as_ref()
                    .and_then(|r| r.position())
                    .map(|(x, y)| format!("({:.0}, {:.0})", x, y))
                    .unwrap_or_else(|| "none".to_string())
            );
            last_health_log = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("shutting down");
    let stats = tracker.stats();
    tracker.stop();
    source.stop();
    if tracker.flags().is_active() {
        if let Err(err) = tracker.land() {
            log::error!("landing failed: {:#}", err);
            tracker.stop_vehicle()?;
        }
    }
    log::info!(
        "session: {} frames processed, {} commands issued, {} vehicle calls",
        stats.frames_processed,
        stats.commands_issued,
        vehicle.commands()
    );
    Ok(())
}
