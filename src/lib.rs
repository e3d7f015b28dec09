//! Visual tracker
//!
//! Closed-loop visual tracking for a remotely piloted aircraft: frames from
//! the video link are run through one of five detectors, and the target's
//! position is turned into rotation and climb commands by a PID controller.
//!
//! # Architecture
//!
//! Data flows one way:
//!
//! ```text
//! video link -> FrameBuffer -> DetectionPipeline (video tick)
//!            -> ResultSlot -> TrackingController (control tick) -> VehicleInterface
//! ```
//!
//! The two ticks run on their own threads at independent rates and share
//! only the frame buffer and the result slot, both newest-wins single-slot
//! mailboxes.
//!
//! # Module Structure
//!
//! - `frame`: `Frame` and the single-slot `FrameBuffer`
//! - `color`: colour spaces, ranges and presets
//! - `detect`: detection results, the backend trait and the five backends
//! - `pipeline`: operator controls, mode dispatch, listeners
//! - `control`: PID state and the tracking controller
//! - `vehicle`: the vehicle command surface and session flags
//! - `scheduler`: periodic tasks and the `Tracker` session
//! - `ingest`: synthetic frame source
//! - `config`: `TrackerConfig` loading

pub mod color;
pub mod config;
pub mod control;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod mailbox;
pub mod pipeline;
pub mod scheduler;
pub mod ui;
pub mod vehicle;

pub use color::{ColorRange, ColorSpace, TrackedObjectPreset};
pub use config::TrackerConfig;
pub use control::{
    ActuationCommand, Axis, Climb, ControllerSettings, PidGains, PidState, PidTrace, Rotation,
    TrackingController,
};
pub use detect::{DetectionMode, DetectionResult, DetectorBackend, DiagnosticImage, DiagnosticKind};
pub use frame::{Frame, FrameBuffer};
pub use ingest::{SyntheticConfig, SyntheticSource};
pub use pipeline::{DetectionPipeline, OperatorControls, ResultSlot};
pub use scheduler::{PeriodicTask, TickPeriods, Tracker, TrackerStats};
pub use vehicle::{DryRunVehicle, SessionFlags, VehicleInterface};
