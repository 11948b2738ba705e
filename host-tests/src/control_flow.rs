use std::time::{Duration, Instant};

use c6_co2_node::mqtt::Command;
use c6_co2_node::scheduler::ZERO_FEEDBACK;
use c6_co2_node::state::{SharedState, COMMAND_QUEUE_CAPACITY};
use proptest::prelude::*;
use serde_json::Value;

use crate::rig::{Rig, RigOptions, PREFIX};

const TELEMETRY_PERIOD: Duration = Duration::from_secs(10);
const STEP: Duration = Duration::from_millis(100);

fn availability(rig: &Rig) -> Option<Vec<u8>> {
    rig.broker.retained(&format!("{}/availability", PREFIX))
}

#[test]
fn brightness_command_is_applied_and_reflected_in_telemetry() {
    let mut rig = Rig::new(RigOptions::default());
    let t0 = Instant::now();
    rig.tick(t0);
    assert_eq!(availability(&rig).as_deref(), Some(&b"online"[..]));
    assert_eq!(rig.last_status()["brightness"], 10);

    rig.cmd("brightness:150");
    rig.tick(t0 + STEP);
    assert_eq!(rig.display.brightness(), Some(100));

    rig.tick(t0 + TELEMETRY_PERIOD);
    let status = rig.last_status();
    assert_eq!(status["brightness"], 100);
    assert_eq!(status["co2_ppm"], 640);
    assert_eq!(status["humidity_pct"], 38);
}

#[test]
fn invalid_commands_change_nothing() {
    let mut rig = Rig::new(RigOptions::default());
    let t0 = Instant::now();
    rig.tick(t0);

    for junk in ["brightness:-5", "brightness:bright", "abc:maybe", "dance", ""] {
        rig.cmd(junk);
    }
    rig.tick(t0 + STEP);

    assert_eq!(rig.display.brightness(), Some(10));
    assert_eq!(rig.co2.calibrations(), 0);
    assert_eq!(rig.system.restarts(), 0);
    assert!(rig.state.drain_commands().is_empty());
}

#[test]
fn repeated_abc_off_equals_one() {
    let mut rig = Rig::new(RigOptions {
        abc: true,
        ..Default::default()
    });
    let t0 = Instant::now();
    rig.tick(t0);
    assert_eq!(rig.co2.abc(), Some(true));

    rig.cmd("abc:off");
    rig.tick(t0 + STEP);
    let after_one = (rig.co2.abc(), rig.state.snapshot().abc);

    rig.cmd("ABC=0");
    rig.tick(t0 + 2 * STEP);
    let after_two = (rig.co2.abc(), rig.state.snapshot().abc);

    assert_eq!(after_one, (Some(false), false));
    assert_eq!(after_two, after_one);

    rig.tick(t0 + TELEMETRY_PERIOD);
    assert_eq!(rig.last_status()["abc"], false);
}

#[test]
fn zero_calibration_shows_feedback_for_a_while() {
    let mut rig = Rig::new(RigOptions::default());
    let t0 = Instant::now();
    rig.tick(t0);

    rig.cmd("zero_calibrate");
    rig.tick(t0 + STEP);
    assert_eq!(rig.co2.calibrations(), 1);
    assert!(rig.display.renders().last().unwrap().zero_calibrating);

    rig.tick(t0 + STEP + ZERO_FEEDBACK);
    assert!(!rig.display.renders().last().unwrap().zero_calibrating);
}

#[test]
fn reboot_command_restarts_the_device() {
    let mut rig = Rig::new(RigOptions::default());
    let t0 = Instant::now();
    rig.tick(t0);
    rig.cmd("reboot");
    rig.tick(t0 + STEP);
    assert_eq!(rig.system.restarts(), 1);
}

#[test]
fn failed_sensor_read_is_published_as_null() {
    let mut rig = Rig::new(RigOptions {
        co2: vec![None],
        ..Default::default()
    });
    let t0 = Instant::now();
    rig.tick(t0);
    rig.tick(t0 + TELEMETRY_PERIOD);

    let status = rig.last_status();
    assert_eq!(status["co2_ppm"], Value::Null);
    assert_eq!(status["temp_c"], 22.5);
}

#[test]
fn broker_loss_marks_the_node_offline_until_it_reconnects() {
    let mut rig = Rig::new(RigOptions::default());
    let t0 = Instant::now();
    rig.tick(t0);
    let sent = rig.state.telemetry_sent();

    rig.broker.drop_client(PREFIX);
    assert_eq!(availability(&rig).as_deref(), Some(&b"offline"[..]));

    rig.tick(t0 + TELEMETRY_PERIOD);
    assert!(!rig.worker.channel().unwrap().is_connected());
    assert_eq!(rig.state.telemetry_sent(), sent);

    rig.broker.restore_client(PREFIX);
    rig.tick(t0 + TELEMETRY_PERIOD + STEP);
    assert_eq!(availability(&rig).as_deref(), Some(&b"online"[..]));
    assert!(rig.broker.is_subscribed(&format!("{}/cmd", PREFIX)));

    // Commands flow again after the re-announce
    rig.cmd("brightness:55");
    rig.tick(t0 + TELEMETRY_PERIOD + 2 * STEP);
    assert_eq!(rig.display.brightness(), Some(55));
}

#[test]
fn sensing_keeps_running_while_offline() {
    let mut rig = Rig::new(RigOptions {
        co2: vec![Some(700), Some(720)],
        ..Default::default()
    });
    rig.link.set_up(false);
    let t0 = Instant::now();
    rig.tick(t0);
    assert_eq!(rig.state.snapshot().co2_ppm, Some(700));
    rig.tick(t0 + Duration::from_secs(5));
    assert_eq!(rig.state.snapshot().co2_ppm, Some(720));
    assert!(rig.broker.published(&format!("{}/status", PREFIX)).is_empty());
}

proptest! {
    #[test]
    fn command_queue_keeps_the_newest(levels in proptest::collection::vec(0u8..=100, 0..48)) {
        let state = SharedState::new(10, false);
        for level in &levels {
            state.push_command(Command::SetBrightness(*level));
        }
        let queued = state.drain_commands();
        let kept = levels.len().min(COMMAND_QUEUE_CAPACITY);
        prop_assert_eq!(queued.len(), kept);
        let expected: Vec<Command> = levels[levels.len() - kept..]
            .iter()
            .map(|l| Command::SetBrightness(*l))
            .collect();
        prop_assert_eq!(queued, expected);
        prop_assert_eq!(state.commands_dropped() as usize, levels.len() - kept);
    }
}
