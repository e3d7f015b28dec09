//! Vehicle command channel and session flags.
//!
//! The link to the aircraft (transport, telemetry, video delivery) lives
//! outside this crate; the tracker only needs the command surface below.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Commands the tracker sends to the aircraft.
///
/// Motion commands take an integer magnitude and a duration in vehicle
/// ticks. Implementations are shared between the control task and operator
/// actions, so every method takes `&self`.
pub trait VehicleInterface: Send + Sync {
    fn name(&self) -> &str;

    /// Called once by `Tracker::start`. An error here is fatal.
    fn connect(&self) -> Result<()> {
        Ok(())
    }

    fn take_off(&self) -> Result<()>;
    fn land(&self) -> Result<()>;
    fn hover(&self) -> Result<()>;
    fn reset(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;

    fn spin_left(&self, magnitude: u32, duration_ticks: u32) -> Result<()>;
    fn spin_right(&self, magnitude: u32, duration_ticks: u32) -> Result<()>;
    fn ascend(&self, magnitude: u32, duration_ticks: u32) -> Result<()>;
    fn descend(&self, magnitude: u32, duration_ticks: u32) -> Result<()>;
}

/// Session state shared by the operator and the control task.
///
/// `active` follows take-off and landing; `tracking` is the operator's
/// toggle. Commands are issued only while both are set.
#[derive(Debug, Default)]
pub struct SessionFlags {
    active: AtomicBool,
    tracking: AtomicBool,
    reset_requested: AtomicBool,
}

impl SessionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_tracking(&self, tracking: bool) {
        self.tracking.store(tracking, Ordering::SeqCst);
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }

    pub fn engaged(&self) -> bool {
        self.is_active() && self.is_tracking()
    }

    /// Ask the control task to clear its PID state on its next tick.
    pub fn request_controller_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    /// Consume a pending reset request.
    pub fn take_controller_reset(&self) -> bool {
        self.reset_requested.swap(false, Ordering::SeqCst)
    }
}

/// Vehicle that only logs. Used by the daemon when no link is configured.
#[derive(Debug, Default)]
pub struct DryRunVehicle {
    connected: AtomicBool,
    commands: AtomicU64,
}

impl DryRunVehicle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Motion and flight commands received so far.
    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    fn record(&self, what: &str) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(anyhow!("dry-run vehicle: '{}' sent before connect", what));
        }
        self.commands.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn motion(&self, what: &str, magnitude: u32, duration_ticks: u32) -> Result<()> {
        self.record(what)?;
        log::debug!("dry-run: {} {} for {} ticks", what, magnitude, duration_ticks);
        Ok(())
    }
}

impl VehicleInterface for DryRunVehicle {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        log::info!("dry-run vehicle connected");
        Ok(())
    }

    fn take_off(&self) -> Result<()> {
        self.record("take_off")?;
        log::info!("dry-run: take off");
        Ok(())
    }

    fn land(&self) -> Result<()> {
        self.record("land")?;
        log::info!("dry-run: land");
        Ok(())
    }

    fn hover(&self) -> Result<()> {
        self.record("hover")?;
        log::debug!("dry-run: hover");
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.record("reset")?;
        log::info!("dry-run: reset");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.record("stop")?;
        log::info!("dry-run: stop");
        Ok(())
    }

    fn spin_left(&self, magnitude: u32, duration_ticks: u32) -> Result<()> {
        self.motion("spin_left", magnitude, duration_ticks)
    }

    fn spin_right(&self, magnitude: u32, duration_ticks: u32) -> Result<()> {
        self.motion("spin_right", magnitude, duration_ticks)
    }

    fn ascend(&self, magnitude: u32, duration_ticks: u32) -> Result<()> {
        self.motion("ascend", magnitude, duration_ticks)
    }

    fn descend(&self, magnitude: u32, duration_ticks: u32) -> Result<()> {
        self.motion("descend", magnitude, duration_ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engaged_needs_both_flags() {
        let flags = SessionFlags::new();
        assert!(!flags.engaged());
        flags.set_tracking(true);
        assert!(!flags.engaged());
        flags.set_active(true);
        assert!(flags.engaged());
    }

    #[test]
    fn reset_request_is_consumed_once() {
        let flags = SessionFlags::new();
        assert!(!flags.take_controller_reset());
        flags.request_controller_reset();
        assert!(flags.take_controller_reset());
        assert!(!flags.take_controller_reset());
    }

    #[test]
    fn dry_run_requires_connect() {
        let vehicle = DryRunVehicle::new();
        assert!(vehicle.take_off().is_err());
        vehicle.connect().unwrap();
        vehicle.take_off().unwrap();
        vehicle.spin_left(3, 10).unwrap();
        assert_eq!(vehicle.commands(), 2);
    }
}
