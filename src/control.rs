//! PID tracking controller.
//!
//! One PID state per axis: horizontal (rotation) and vertical (thrust). The
//! target is the frame centre, so the error on each axis is the normalized
//! target position itself.
//!
//! The derivative term accumulates the negated previous error across ticks
//! instead of taking `error - last_error`, and there is no windup or output
//! clamp beyond integer truncation of the scaled command.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::detect::DetectionResult;
use crate::pipeline::ResultSlot;
use crate::vehicle::{SessionFlags, VehicleInterface};

pub const DEFAULT_COMMAND_SCALE: f64 = 0.1;
pub const DEFAULT_COMMAND_DURATION: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub const fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

impl Default for PidGains {
    fn default() -> Self {
        Self::new(5.0, 10.0, 12.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PidState {
    pub last_error: f64,
    pub integral: f64,
    pub derivative: f64,
}

impl PidState {
    /// Advance the state with a new error and return the command magnitude.
    pub fn update(&mut self, error: f64, gains: &PidGains) -> f64 {
        self.integral += error;
        self.derivative -= self.last_error;
        self.last_error = error;
        gains.kp * error + gains.ki * self.integral + gains.kd * self.derivative
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    Horizontal,
    Vertical,
}

/// Per-axis PID values after one update, for charts and logs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PidTrace {
    pub axis: Axis,
    pub error: f64,
    pub integral: f64,
    pub derivative: f64,
    pub magnitude: f64,
}

pub type TraceObserver = Box<dyn Fn(&PidTrace) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rotation {
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Climb {
    Ascend,
    Descend,
}

/// One control tick's output: a rotation and a climb command.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActuationCommand {
    /// Raw signed magnitudes before scaling.
    pub horizontal: f64,
    pub vertical: f64,

    pub rotation: Rotation,
    pub rotation_speed: u32,
    pub climb: Climb,
    pub climb_speed: u32,
    pub duration_ticks: u32,
}

impl ActuationCommand {
    /// Positive horizontal spins right. Negative vertical (target above
    /// centre) ascends.
    pub fn from_magnitudes(horizontal: f64, vertical: f64, scale: f64, duration_ticks: u32) -> Self {
        Self {
            horizontal,
            vertical,
            rotation: if horizontal > 0.0 {
                Rotation::Right
            } else {
                Rotation::Left
            },
            rotation_speed: command_speed(horizontal, scale),
            climb: if vertical < 0.0 {
                Climb::Ascend
            } else {
                Climb::Descend
            },
            climb_speed: command_speed(vertical, scale),
            duration_ticks,
        }
    }

    /// Send both commands. Both are attempted even if the first fails.
    pub fn issue(&self, vehicle: &dyn VehicleInterface) -> Result<()> {
        let rotation = match self.rotation {
            Rotation::Left => vehicle.spin_left(self.rotation_speed, self.duration_ticks),
            Rotation::Right => vehicle.spin_right(self.rotation_speed, self.duration_ticks),
        }
        .with_context(|| format!("{} rejected {:?} command", vehicle.name(), self.rotation));
        let climb = match self.climb {
            Climb::Ascend => vehicle.ascend(self.climb_speed, self.duration_ticks),
            Climb::Descend => vehicle.descend(self.climb_speed, self.duration_ticks),
        }
        .with_context(|| format!("{} rejected {:?} command", vehicle.name(), self.climb));
        rotation.and(climb)
    }
}

fn command_speed(magnitude: f64, scale: f64) -> u32 {
    // saturating float-to-int cast; truncates toward zero
    (magnitude * scale).abs() as u32
}

/// Map a pixel coordinate to `[-1, 1]` across `dimension`.
pub fn normalize(pixel: f64, dimension: u32) -> f64 {
    2.0 * pixel / f64::from(dimension) - 1.0
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControllerSettings {
    pub gains_x: PidGains,
    pub gains_y: PidGains,
    /// Factor applied to a magnitude before it becomes an integer command.
    pub command_scale: f64,
    /// Vehicle ticks each command lasts.
    pub command_duration: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            gains_x: PidGains::default(),
            gains_y: PidGains::default(),
            command_scale: DEFAULT_COMMAND_SCALE,
            command_duration: DEFAULT_COMMAND_DURATION,
        }
    }
}

/// Owned by the control task; nothing else reads or writes its PID state.
pub struct TrackingController {
    settings: ControllerSettings,
    horizontal: PidState,
    vertical: PidState,
    observers: Vec<TraceObserver>,
}

impl TrackingController {
    pub fn new(settings: ControllerSettings) -> Self {
        Self {
            settings,
            horizontal: PidState::default(),
            vertical: PidState::default(),
            observers: Vec::new(),
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Observers are called in registration order, horizontal axis first.
    pub fn add_observer(&mut self, observer: TraceObserver) {
        self.observers.push(observer);
    }

    pub fn state(&self, axis: Axis) -> PidState {
        match axis {
            Axis::Horizontal => self.horizontal,
            Axis::Vertical => self.vertical,
        }
    }

    pub fn reset(&mut self) {
        self.horizontal = PidState::default();
        self.vertical = PidState::default();
    }

    /// Compute a command from `result`.
    ///
    /// Returns `None` without touching PID state when the controller is not
    /// engaged, when there is no result, or when the target was missed.
    pub fn step(
        &mut self,
        result: Option<&DetectionResult>,
        engaged: bool,
    ) -> Option<ActuationCommand> {
        if !engaged {
            return None;
        }
        let result = result?;
        let (x, y) = result.position()?;
        if result.frame_width == 0 || result.frame_height == 0 {
            return None;
        }

        let error_x = normalize(x, result.frame_width);
        let error_y = normalize(y, result.frame_height);
        let horizontal = self.horizontal.update(error_x, &self.settings.gains_x);
        let vertical = self.vertical.update(error_y, &self.settings.gains_y);

        self.notify(Axis::Horizontal, error_x, horizontal);
        self.notify(Axis::Vertical, error_y, vertical);

        let command = ActuationCommand::from_magnitudes(
            horizontal,
            vertical,
            self.settings.command_scale,
            self.settings.command_duration,
        );
        log::debug!(
            "pid: err=({:.3}, {:.3}) mag=({:.3}, {:.3}) -> {:?} {} / {:?} {}",
            error_x,
            error_y,
            horizontal,
            vertical,
            command.rotation,
            command.rotation_speed,
            command.climb,
            command.climb_speed
        );
        Some(command)
    }

    /// One control tick: honour a pending reset, read the latest result and
    /// send at most one rotation and one climb command.
    pub fn tick(
        &mut self,
        results: &ResultSlot,
        flags: &SessionFlags,
        vehicle: &dyn VehicleInterface,
    ) -> Result<Option<ActuationCommand>> {
        if flags.take_controller_reset() {
            log::info!("pid state reset");
            self.reset();
        }
        let latest = results.latest()?;
        let Some(command) = self.step(latest.as_deref(), flags.engaged()) else {
            return Ok(None);
        };
        command.issue(vehicle)?;
        Ok(Some(command))
    }

    fn notify(&self, axis: Axis, error: f64, magnitude: f64) {
        if self.observers.is_empty() {
            return;
        }
        let state = self.state(axis);
        let trace = PidTrace {
            axis,
            error,
            integral: state.integral,
            derivative: state.derivative,
            magnitude,
        };
        for observer in &self.observers {
            observer(&trace);
        }
    }
}
