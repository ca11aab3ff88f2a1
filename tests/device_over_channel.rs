//! Device firmware driven by the host sync client over the in-process broker.

mod common;

use common::Rig;
use train_control::{
    device::{
        hal::ScriptedHal,
        params::{Direction, ExperimentMode, ParamKey, ParameterSet},
    },
    host::param_sync::SyncEvent,
    telemetry::TelemetrySample,
};

#[test]
fn request_params_reproduces_the_applied_set() {
    let mut rig = Rig::new(ScriptedHal::constant(20.0), ParameterSet::default());
    rig.client.set_param(ParamKey::Kp, 42.0).unwrap();
    rig.client.set_param(ParamKey::Ki, 3.0).unwrap();
    rig.client.set_param(ParamKey::Reference, 15.0).unwrap();
    rig.pump_until(|r| r.confirmed(ParamKey::Reference) == Some(15.0));
    assert!(rig.state.lock().unconfirmed().is_empty());

    // forget everything, then rebuild the cache from the device alone
    rig.state.lock().confirmed.clear();
    rig.client.request_params(ExperimentMode::Pid).unwrap();
    rig.pump_until(|r| r.state.lock().confirmed_set(ExperimentMode::Pid).len() == 6);

    let device_view = rig.device.machine().params().snapshot(ExperimentMode::Pid);
    assert_eq!(rig.state.lock().confirmed_set(ExperimentMode::Pid), device_view);
    assert_eq!(rig.confirmed(ParamKey::Kp), Some(42.0));
}

#[test]
fn out_of_range_command_is_confirmed_clamped() {
    let mut rig = Rig::new(ScriptedHal::constant(20.0), ParameterSet::default());
    // host clamps gains to its namespace limits first
    assert_eq!(rig.client.set_param(ParamKey::Kp, 999.0).unwrap(), 250.0);
    // the connect-time resync already confirmed the old value
    rig.pump_until(|r| r.confirmed(ParamKey::Kp) == Some(250.0));
    assert!(rig.state.lock().unconfirmed().is_empty());
    assert_eq!(rig.device.machine().params().pid.kp, 250.0);
}

#[test]
fn step_run_skips_warmup_then_baseline_then_step() {
    let mut rig = Rig::new(ScriptedHal::constant(25.0), ParameterSet::default());
    rig.client.set_param(ParamKey::StepAmplitude, 4.2).unwrap();
    rig.client.set_param(ParamKey::StepDuration, 0.1).unwrap();
    rig.client.set_param(ParamKey::SupplyVoltage, 8.4).unwrap();
    rig.pump_until(|r| {
        r.confirmed(ParamKey::StepAmplitude) == Some(4.2) && r.confirmed(ParamKey::SupplyVoltage) == Some(8.4)
    });
    let _ = rig.samples(ExperimentMode::Step);
    // drop the resync's activation report
    let _ = rig.events();

    rig.client.start_mode(ExperimentMode::Step).unwrap();
    // the run stops itself after the step deadline
    let mut started = false;
    rig.pump_until(|r| {
        r.client.events().try_iter().any(|e| match e {
            SyncEvent::Activation { mode: ExperimentMode::Step, active } => {
                let finished = started && !active;
                started |= active;
                finished
            }
            _ => false,
        })
    });

    let samples = rig.samples(ExperimentMode::Step);
    let steps: Vec<_> = samples
        .iter()
        .filter_map(|s| match s {
            TelemetrySample::Step(s) => Some(*s),
            _ => None,
        })
        .collect();

    let params = rig.device.machine().params().step.clone();
    let baseline = params.baseline_samples as usize;
    // 0.1 s at 20 ms per tick
    assert_eq!(steps.len(), baseline + 5);
    assert!(steps[..baseline].iter().all(|s| s.applied == 0.0 && s.drive == 0));
    assert!(steps[baseline..].iter().all(|s| s.applied == 4.2 && s.drive == 128));
    assert_eq!(params.duration_s, 0.1);
    // motor off once the run is over
    assert_eq!(rig.device.hal().motor_log.last().map(|m| m.0), Some(0));
}

#[test]
fn deadband_calibration_flags_exactly_one_sample() {
    // a small twitch at low drive, real motion from 100 up
    let hal = ScriptedHal::new(|drive, direction| match (drive, direction) {
        (100..=u16::MAX, Direction::Forward) => 19.96,
        (30..=40, _) => 20.0,
        _ => 20.68,
    });
    let mut rig = Rig::new(hal, ParameterSet::default());
    rig.client.start_mode(ExperimentMode::Deadband).unwrap();
    rig.pump_until(|r| r.state.lock().calibration.is_some());

    let samples = rig.samples(ExperimentMode::Deadband);
    let flagged: Vec<_> = samples
        .iter()
        .filter_map(|s| match s {
            TelemetrySample::Deadband(d) if d.motion_detected => Some(*d),
            _ => None,
        })
        .collect();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].drive, 100);
    assert!((flagged[0].initial_position - flagged[0].position - 0.72).abs() < 1e-9);
    // the flagged sample is the last one of the run
    assert!(matches!(samples.last(), Some(TelemetrySample::Deadband(d)) if d.motion_detected));

    let log = &rig.device.hal().motor_log;
    let last_drive = log.iter().rposition(|m| m.0 == 100).unwrap();
    assert_eq!(log[last_drive + 1].0, 0);

    let result = rig.state.lock().calibration.unwrap();
    assert_eq!(result.drive, 100);

    rig.client.apply_deadband().unwrap();
    rig.pump_until(|r| r.confirmed(ParamKey::DeadbandCompensation) == Some(100.0));
    assert_eq!(rig.device.machine().params().pid.deadband, 100.0);
}

#[test]
fn stop_on_idle_device_changes_nothing() {
    let mut rig = Rig::new(ScriptedHal::constant(20.0), ParameterSet::default());
    rig.pump(5);
    let before = rig.device.machine().params().clone();
    let _ = rig.events();

    rig.client.stop_mode(ExperimentMode::Pid).unwrap();
    rig.client.stop_mode(ExperimentMode::Step).unwrap();
    rig.pump(50);

    assert_eq!(rig.device.mode(), ExperimentMode::Idle);
    assert_eq!(rig.device.machine().params(), &before);
    assert!(rig
        .events()
        .iter()
        .all(|e| !matches!(e, SyncEvent::Activation { .. })));
}

#[test]
fn invalid_start_is_rejected_without_state_change() {
    let mut rig = Rig::new(ScriptedHal::constant(20.0), ParameterSet::default());
    // all gains zero
    rig.client.start_mode(ExperimentMode::Pid).unwrap();
    rig.pump_until(|r| {
        r.client
            .events()
            .try_iter()
            .any(|e| e == SyncEvent::Activation { mode: ExperimentMode::Pid, active: false })
    });
    assert_eq!(rig.device.mode(), ExperimentMode::Idle);
    assert_eq!(rig.state.lock().active_mode, None);
}

#[test]
fn both_sides_recover_after_broker_outage() {
    let mut rig = Rig::new(ScriptedHal::constant(20.0), ParameterSet::default());
    rig.client.set_param(ParamKey::Kp, 10.0).unwrap();
    rig.pump_until(|r| r.confirmed(ParamKey::Kp) == Some(10.0));

    rig.broker.set_online(false);
    rig.pump_until(|r| !r.device.is_connected() && !r.client.is_connected());
    rig.pump(20);
    rig.broker.set_online(true);
    rig.pump_until(|r| r.device.is_connected() && r.client.is_connected());

    // resync is the only recovery path
    rig.state.lock().confirmed.clear();
    rig.client.request_params(ExperimentMode::Pid).unwrap();
    rig.pump_until(|r| r.confirmed(ParamKey::Kp) == Some(10.0));

    rig.client.set_param(ParamKey::Kp, 20.0).unwrap();
    rig.pump_until(|r| r.confirmed(ParamKey::Kp) == Some(20.0));
    assert!(rig.device.stats().reconnects >= 2);
}
