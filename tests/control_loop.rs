use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};

use visual_tracker::control::{
    normalize, Axis, Climb, ControllerSettings, PidGains, PidState, Rotation, TrackingController,
};
use visual_tracker::detect::{DetectionMode, DetectionResult};
use visual_tracker::frame::Frame;
use visual_tracker::pipeline::{DetectionPipeline, ResultSlot};
use visual_tracker::scheduler::{TickPeriods, Tracker};
use visual_tracker::vehicle::{SessionFlags, VehicleInterface};

#[derive(Clone, Debug, PartialEq)]
enum Call {
    TakeOff,
    Land,
    Hover,
    Reset,
    Stop,
    SpinLeft(u32, u32),
    SpinRight(u32, u32),
    Ascend(u32, u32),
    Descend(u32, u32),
}

#[derive(Default)]
struct RecordingVehicle {
    calls: Mutex<Vec<Call>>,
    unreachable: AtomicBool,
}

impl RecordingVehicle {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn motion_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::SpinLeft(..) | Call::SpinRight(..) | Call::Ascend(..) | Call::Descend(..)
                )
            })
            .count()
    }

    fn push(&self, call: Call) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl VehicleInterface for RecordingVehicle {
    fn name(&self) -> &str {
        "recording"
    }

    fn connect(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(anyhow!("no link"))
        } else {
            Ok(())
        }
    }

    fn take_off(&self) -> Result<()> {
        self.push(Call::TakeOff)
    }

    fn land(&self) -> Result<()> {
        self.push(Call::Land)
    }

    fn hover(&self) -> Result<()> {
        self.push(Call::Hover)
    }

    fn reset(&self) -> Result<()> {
        self.push(Call::Reset)
    }

    fn stop(&self) -> Result<()> {
        self.push(Call::Stop)
    }

    fn spin_left(&self, magnitude: u32, duration_ticks: u32) -> Result<()> {
        self.push(Call::SpinLeft(magnitude, duration_ticks))
    }

    fn spin_right(&self, magnitude: u32, duration_ticks: u32) -> Result<()> {
        self.push(Call::SpinRight(magnitude, duration_ticks))
    }

    fn ascend(&self, magnitude: u32, duration_ticks: u32) -> Result<()> {
        self.push(Call::Ascend(magnitude, duration_ticks))
    }

    fn descend(&self, magnitude: u32, duration_ticks: u32) -> Result<()> {
        self.push(Call::Descend(magnitude, duration_ticks))
    }
}

fn engaged_flags() -> SessionFlags {
    let flags = SessionFlags::new();
    flags.set_active(true);
    flags.set_tracking(true);
    flags
}

fn red_target_frame(cx: u32, cy: u32) -> Frame {
    Frame::from_image(RgbImage::from_fn(640, 360, |x, y| {
        if x + 30 >= cx && x < cx + 30 && y + 30 >= cy && y < cy + 30 {
            Rgb([220, 20, 20])
        } else {
            Rgb([15, 15, 25])
        }
    }))
}

#[test]
fn pid_magnitudes_follow_closed_form() {
    let gains_x = PidGains::new(5.0, 10.0, 12.0);
    let gains_y = PidGains::new(1.0, 2.0, 3.0);
    let mut controller = TrackingController::new(ControllerSettings {
        gains_x,
        gains_y,
        ..ControllerSettings::default()
    });

    let positions = [(480.0, 90.0), (400.0, 270.0), (160.0, 180.0)];
    let ex: Vec<f64> = positions.iter().map(|p| normalize(p.0, 640)).collect();
    let ey: Vec<f64> = positions.iter().map(|p| normalize(p.1, 360)).collect();

    let closed_form = |g: PidGains, e: &[f64], k: usize| {
        let integral: f64 = e[..=k].iter().sum();
        let derivative: f64 = -e[..k].iter().sum::<f64>();
        g.kp * e[k] + g.ki * integral + g.kd * derivative
    };

    for (k, &(x, y)) in positions.iter().enumerate() {
        let result = DetectionResult::hit(x, y, 640, 360);
        let cmd = controller.step(Some(&result), true).expect("command");
        let expect_h = closed_form(gains_x, &ex, k);
        let expect_v = closed_form(gains_y, &ey, k);
        assert!((cmd.horizontal - expect_h).abs() < 1e-9, "tick {} h", k);
        assert!((cmd.vertical - expect_v).abs() < 1e-9, "tick {} v", k);
    }

    let h = controller.state(Axis::Horizontal);
    assert!((h.integral - ex.iter().sum::<f64>()).abs() < 1e-12);
    assert!((h.derivative + ex[0] + ex[1]).abs() < 1e-12);
    assert_eq!(h.last_error, ex[2]);
}

#[test]
fn miss_issues_nothing_and_keeps_state() {
    let vehicle = RecordingVehicle::default();
    let flags = engaged_flags();
    let results = ResultSlot::new();
    let mut controller = TrackingController::new(ControllerSettings::default());

    results.publish(Arc::new(DetectionResult::hit(100.0, 100.0, 640, 360))).unwrap();
    controller.tick(&results, &flags, &vehicle).unwrap();
    let before = (
        controller.state(Axis::Horizontal),
        controller.state(Axis::Vertical),
    );
    let calls_before = vehicle.calls().len();

    results.publish(Arc::new(DetectionResult::miss(640, 360))).unwrap();
    assert!(controller.tick(&results, &flags, &vehicle).unwrap().is_none());
    assert_eq!(vehicle.calls().len(), calls_before);
    assert_eq!(controller.state(Axis::Horizontal), before.0);
    assert_eq!(controller.state(Axis::Vertical), before.1);
}

#[test]
fn not_tracking_issues_nothing() {
    let vehicle = RecordingVehicle::default();
    let flags = SessionFlags::new();
    flags.set_active(true);
    let results = ResultSlot::new();
    results.publish(Arc::new(DetectionResult::hit(100.0, 100.0, 640, 360))).unwrap();

    let mut controller = TrackingController::new(ControllerSettings::default());
    assert!(controller.tick(&results, &flags, &vehicle).unwrap().is_none());
    assert!(vehicle.calls().is_empty());
    assert_eq!(controller.state(Axis::Horizontal), PidState::default());
}

#[test]
fn mode_switch_keeps_pid_state_until_explicit_reset() {
    let vehicle = RecordingVehicle::default();
    let flags = engaged_flags();
    let mut pipeline = DetectionPipeline::default();
    let results = pipeline.results();
    let mut controller = TrackingController::new(ControllerSettings::default());

    pipeline.process_frame(Some(&red_target_frame(480, 90)));
    controller.tick(&results, &flags, &vehicle).unwrap().expect("command");
    let after_first = controller.state(Axis::Horizontal);
    assert_ne!(after_first, PidState::default());

    pipeline
        .controls()
        .set_mode(DetectionMode::QrDetection)
        .unwrap();
    pipeline.process_frame(Some(&red_target_frame(480, 90)));
    // the QR detector misses, so the controller holds
    assert!(controller.tick(&results, &flags, &vehicle).unwrap().is_none());
    assert_eq!(controller.state(Axis::Horizontal), after_first);

    flags.request_controller_reset();
    controller.tick(&results, &flags, &vehicle).unwrap();
    assert_eq!(controller.state(Axis::Horizontal), PidState::default());
    assert_eq!(controller.state(Axis::Vertical), PidState::default());
}

#[test]
fn one_rotation_and_one_climb_per_tick_with_matching_signs() {
    let vehicle = RecordingVehicle::default();
    let flags = engaged_flags();
    let mut pipeline = DetectionPipeline::default();
    let results = pipeline.results();
    let mut controller = TrackingController::new(ControllerSettings::default());

    // right of centre and above it
    pipeline
        .process_frame(Some(&red_target_frame(560, 60)))
        .expect("video tick");
    let cmd = controller
        .tick(&results, &flags, &vehicle)
        .unwrap()
        .expect("control tick");

    assert!(cmd.horizontal > 0.0);
    assert!(cmd.vertical < 0.0);
    assert_eq!(cmd.rotation, Rotation::Right);
    assert_eq!(cmd.climb, Climb::Ascend);
    assert_eq!(
        vehicle.calls(),
        vec![
            Call::SpinRight(cmd.rotation_speed, 10),
            Call::Ascend(cmd.climb_speed, 10),
        ]
    );

    // left of centre and below it
    pipeline
        .process_frame(Some(&red_target_frame(80, 300)))
        .expect("video tick");
    let cmd = controller
        .tick(&results, &flags, &vehicle)
        .unwrap()
        .expect("control tick");
    let calls = vehicle.calls();
    assert_eq!(calls.len(), 4);
    let expected_rotation = if cmd.horizontal > 0.0 {
        Call::SpinRight(cmd.rotation_speed, 10)
    } else {
        Call::SpinLeft(cmd.rotation_speed, 10)
    };
    let expected_climb = if cmd.vertical < 0.0 {
        Call::Ascend(cmd.climb_speed, 10)
    } else {
        Call::Descend(cmd.climb_speed, 10)
    };
    assert_eq!(calls[2], expected_rotation);
    assert_eq!(calls[3], expected_climb);
}

#[test]
fn unreachable_vehicle_prevents_start() {
    let vehicle = Arc::new(RecordingVehicle::default());
    vehicle.unreachable.store(true, Ordering::SeqCst);
    let started = Tracker::start(
        DetectionPipeline::default(),
        TrackingController::new(ControllerSettings::default()),
        vehicle.clone() as Arc<dyn VehicleInterface>,
        TickPeriods::default(),
    );
    assert!(started.is_err());
    assert!(vehicle.calls().is_empty());
}

#[test]
fn running_tracker_commands_vehicle_and_goes_quiet_after_stop() {
    let vehicle = Arc::new(RecordingVehicle::default());
    let mut tracker = Tracker::start(
        DetectionPipeline::default(),
        TrackingController::new(ControllerSettings::default()),
        vehicle.clone() as Arc<dyn VehicleInterface>,
        TickPeriods {
            video: Duration::from_millis(5),
            control: Duration::from_millis(20),
        },
    )
    .expect("tracker starts");

    tracker
        .frame_buffer()
        .publish(red_target_frame(500, 100))
        .unwrap();
    tracker.take_off().unwrap();
    tracker.set_tracking(true);
    assert_eq!(vehicle.calls()[..2], [Call::TakeOff, Call::Hover]);

    let deadline = Instant::now() + Duration::from_secs(5);
    while vehicle.motion_calls() < 4 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(vehicle.motion_calls() >= 4, "control loop never commanded");
    assert!(tracker.latest_result().unwrap().is_some_and(|r| r.detected));

    tracker.stop();
    let settled = vehicle.calls().len();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(vehicle.calls().len(), settled);
    assert!(!tracker.is_running());
    assert!(tracker.take_off().is_err());

    tracker.land().unwrap();
    assert_eq!(vehicle.calls().last(), Some(&Call::Land));
}

#[test]
fn operator_actions_reach_the_vehicle() {
    let vehicle = Arc::new(RecordingVehicle::default());
    let mut tracker = Tracker::start(
        DetectionPipeline::default(),
        TrackingController::new(ControllerSettings::default()),
        vehicle.clone() as Arc<dyn VehicleInterface>,
        TickPeriods::default(),
    )
    .expect("tracker starts");
    let flags = tracker.flags();

    tracker.toggle_flight().unwrap();
    assert!(flags.is_active());
    tracker.reset_vehicle().unwrap();
    tracker.toggle_flight().unwrap();
    assert!(!flags.is_active());
    assert_eq!(
        vehicle.calls(),
        vec![Call::TakeOff, Call::Hover, Call::Reset, Call::Land]
    );

    tracker.take_off().unwrap();
    tracker.stop_vehicle().unwrap();
    assert!(!flags.is_active());
    assert_eq!(vehicle.calls().last(), Some(&Call::Stop));

    // stopping the vehicle still works once the ticks are down
    tracker.stop();
    assert!(tracker.reset_vehicle().is_err());
    tracker.stop_vehicle().unwrap();
    assert_eq!(
        vehicle.calls().iter().filter(|c| **c == Call::Stop).count(),
        2
    );
}
