//! Property tests for the task queue and the liveness tracker

use std::collections::HashMap;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use pingwatch::config::LivenessConfig;
use pingwatch::liveness::Observation;
use pingwatch::monitoring::{FailureReason, TaskQueue};
use pingwatch::{DeviceId, LivenessTracker, MonitoredTarget, ProbeOutcome};
use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;
use tokio::time::Instant;

const DEVICES: [&str; 4] = ["ap-1", "ap-2", "sw-1", "sw-2"];

#[derive(Debug, Clone)]
enum QueueOp {
    Schedule { device: usize, interval_secs: u64 },
    Cancel { device: usize },
    Advance { secs: u64 },
    Complete { device: usize },
}

impl Arbitrary for QueueOp {
    fn arbitrary(g: &mut Gen) -> Self {
        let device = usize::arbitrary(g) % DEVICES.len();
        match u8::arbitrary(g) % 4 {
            0 => QueueOp::Schedule { device, interval_secs: u64::arbitrary(g) % 10 + 1 },
            1 => QueueOp::Cancel { device },
            2 => QueueOp::Advance { secs: u64::arbitrary(g) % 5 },
            _ => QueueOp::Complete { device },
        }
    }
}

// At most one task per device and never two runs at once, whatever the order of calls
#[quickcheck]
fn prop_one_slot_per_device(ops: Vec<QueueOp>) -> bool {
    let mut queue = TaskQueue::new();
    let start = Instant::now();
    let mut now = start;
    let mut running: HashMap<DeviceId, u64> = HashMap::new();

    for op in ops {
        match op {
            QueueOp::Schedule { device, interval_secs } => {
                queue.schedule(DeviceId::from(DEVICES[device]), Duration::from_secs(interval_secs), now);
            }
            QueueOp::Cancel { device } => {
                queue.cancel(&DeviceId::from(DEVICES[device]));
            }
            QueueOp::Advance { secs } => {
                now += Duration::from_secs(secs);
                let Ok(due) = queue.pop_due(now, usize::MAX) else {
                    return false;
                };
                let mut ids: Vec<&DeviceId> = due.iter().map(|task| &task.device_id).collect();
                let popped = ids.len();
                ids.sort();
                ids.dedup();
                if ids.len() != popped || due.iter().any(|task| task.next_due_at > now) {
                    return false;
                }
                for task in due {
                    // Handed out again before its previous run completed
                    if running.insert(task.device_id.clone(), task.generation()).is_some() {
                        return false;
                    }
                }
            }
            QueueOp::Complete { device } => {
                let id = DeviceId::from(DEVICES[device]);
                if let Some(generation) = running.remove(&id) {
                    queue.complete(&id, generation, now);
                }
            }
        }

        if queue.check_invariants().is_err() {
            return false;
        }
        let slots = queue.pending_len() + queue.in_flight_len();
        let both = DEVICES
            .iter()
            .any(|id| queue.is_pending(&DeviceId::from(*id)) && queue.is_in_flight(&DeviceId::from(*id)));
        if slots > DEVICES.len() || both {
            return false;
        }
    }
    true
}

// pop_due hands tasks out earliest first, ties by device id
#[quickcheck]
fn prop_pop_due_is_ordered(intervals: Vec<(u8, u8)>) -> bool {
    let mut queue = TaskQueue::new();
    let now = Instant::now();
    for (device, secs) in intervals {
        let id = DeviceId::from(DEVICES[device as usize % DEVICES.len()]);
        queue.schedule(id, Duration::from_secs(u64::from(secs % 8) + 1), now);
    }

    let Ok(due) = queue.pop_due(now + Duration::from_secs(60), usize::MAX) else {
        return false;
    };
    due.windows(2)
        .all(|pair| (pair[0].next_due_at, &pair[0].device_id) <= (pair[1].next_due_at, &pair[1].device_id))
}

fn outcome(device: &str, success: bool, index: usize) -> ProbeOutcome {
    let at = Utc.timestamp_opt(1_700_000_000 + index as i64, 0).unwrap();
    let id = DeviceId::from(device);
    if success {
        ProbeOutcome::success(id, 2).at(at)
    } else {
        ProbeOutcome::failure(id, FailureReason::Unreachable, "no route").at(at)
    }
}

fn tracker() -> LivenessTracker {
    let tracker = LivenessTracker::new(&LivenessConfig::default());
    for id in ["left", "right"] {
        tracker.register(&MonitoredTarget::new(id, "10.1.1.1", 1000));
    }
    tracker
}

// A device's state only depends on its own outcomes
#[quickcheck]
fn prop_devices_are_independent(stream: Vec<(bool, bool)>) -> bool {
    let mixed = tracker();
    let alone = tracker();
    let mut mixed_transitions = 0;
    let mut alone_transitions = 0;

    for (index, (is_left, success)) in stream.into_iter().enumerate() {
        let device = if is_left { "left" } else { "right" };
        let outcome = outcome(device, success, index);

        if matches!(mixed.observe(&outcome), Observation::Transitioned(_)) && is_left {
            mixed_transitions += 1;
        }
        if is_left && matches!(alone.observe(&outcome), Observation::Transitioned(_)) {
            alone_transitions += 1;
        }
    }

    let left = DeviceId::from("left");
    let (Some(mixed_state), Some(alone_state)) = (mixed.state(&left), alone.state(&left)) else {
        return false;
    };
    mixed_transitions == alone_transitions
        && mixed_state.status == alone_state.status
        && mixed_state.consecutive_failures == alone_state.consecutive_failures
        && mixed_state.consecutive_successes == alone_state.consecutive_successes
        && mixed_state.down_since == alone_state.down_since
        && mixed_state.holds_invariants()
}
