//! Sharded map of per-device liveness states.
//!
//! Each device hashes to one shard; a shard lock is held only while one
//! outcome is folded into one state, so devices on different shards never
//! contend. Readers get cloned snapshots.

use std::collections::HashMap;
use std::collections::hash_map::{DefaultHasher, Entry as MapEntry};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::state::{HealthStatus, LivenessState, Thresholds};
use crate::config::LivenessConfig;
use crate::events::types::TransitionEvent;
use crate::monitoring::types::ProbeOutcome;
use crate::target::{DeviceId, MonitoredTarget};

/// What the tracker did with an outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// No state for this device
    Unregistered,
    /// The device is known but no longer monitored
    Detached,
    /// Replayed, or dispatched before the device's latest registration
    Stale,
    Updated,
    Transitioned(TransitionEvent),
}

impl Observation {
    pub fn into_event(self) -> Option<TransitionEvent> {
        match self {
            Observation::Transitioned(event) => Some(event),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Tracked {
    state: LivenessState,
    device_name: String,
    ip_address: String,
    attached: bool,
    /// Ticket taken when the device was last (re)attached
    registered_at: u64,
    last_sequence: u64,
    last_applied_at: Option<DateTime<Utc>>,
}

impl Tracked {
    /// Sequenced outcomes must be newer than both the registration and the
    /// last applied outcome. Unsequenced ones fall back to their timestamp.
    fn accepts(&self, outcome: &ProbeOutcome) -> bool {
        if outcome.sequence == 0 {
            return self.last_applied_at.is_none_or(|last| outcome.timestamp > last);
        }
        outcome.sequence > self.registered_at && outcome.sequence > self.last_sequence
    }
}

type Shard = HashMap<DeviceId, Tracked>;

pub struct LivenessTracker {
    shards: Vec<Mutex<Shard>>,
    thresholds: Thresholds,
    tickets: AtomicU64,
}

impl LivenessTracker {
    pub fn new(config: &LivenessConfig) -> Self {
        let shards = (0..config.shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            thresholds: Thresholds { failure: config.failure_threshold, recovery: config.recovery_threshold },
            tickets: AtomicU64::new(0),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Take the next dispatch ticket. Tickets start at one and never repeat.
    pub fn next_sequence(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn shard(&self, device_id: &DeviceId) -> MutexGuard<'_, Shard> {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        self.shards[index].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn each_shard(&self) -> impl Iterator<Item = MutexGuard<'_, Shard>> {
        self.shards.iter().map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Start tracking a device, or refresh its metadata.
    ///
    /// A detached state is re-attached with its status and `down_since`
    /// intact but both counters restarted.
    pub fn register(&self, target: &MonitoredTarget) {
        let ticket = self.next_sequence();
        let mut shard = self.shard(&target.device_id);

        match shard.entry(target.device_id.clone()) {
            MapEntry::Occupied(occupied) => {
                let tracked = occupied.into_mut();
                tracked.device_name.clone_from(&target.device_name);
                tracked.ip_address.clone_from(&target.ip_address);
                if !tracked.attached {
                    tracked.attached = true;
                    tracked.registered_at = ticket;
                    tracked.state.reset_counters();
                    debug!(
                        device_id = %target.device_id,
                        status = %tracked.state.status,
                        "Re-attached liveness state"
                    );
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Tracked {
                    state: LivenessState::new(target.device_id.clone(), Utc::now()),
                    device_name: target.device_name.clone(),
                    ip_address: target.ip_address.clone(),
                    attached: true,
                    registered_at: ticket,
                    last_sequence: 0,
                    last_applied_at: None,
                });
            }
        }
    }

    /// Stop applying outcomes for the device but keep its state
    pub fn detach(&self, device_id: &DeviceId) -> bool {
        match self.shard(device_id).get_mut(device_id) {
            Some(tracked) => {
                tracked.attached = false;
                true
            }
            None => false,
        }
    }

    /// Drop the device's state entirely
    pub fn forget(&self, device_id: &DeviceId) -> Option<LivenessState> {
        self.shard(device_id).remove(device_id).map(|tracked| tracked.state)
    }

    /// Fold one probe outcome into the device's state
    pub fn observe(&self, outcome: &ProbeOutcome) -> Observation {
        let mut shard = self.shard(&outcome.device_id);
        let Some(tracked) = shard.get_mut(&outcome.device_id) else {
            return Observation::Unregistered;
        };
        if !tracked.attached {
            return Observation::Detached;
        }
        if !tracked.accepts(outcome) {
            debug!(
                device_id = %outcome.device_id,
                sequence = outcome.sequence,
                "Ignoring stale probe outcome"
            );
            return Observation::Stale;
        }

        tracked.last_sequence = tracked.last_sequence.max(outcome.sequence);
        tracked.last_applied_at = Some(outcome.timestamp);

        let Some(transition) = tracked.state.apply(outcome, self.thresholds) else {
            return Observation::Updated;
        };

        let event = TransitionEvent::from_transition(
            transition,
            outcome.device_id.clone(),
            tracked.device_name.clone(),
            tracked.ip_address.clone(),
        );
        match tracked.state.status {
            HealthStatus::Unhealthy => warn!(
                device_id = %event.device_id,
                device_name = %event.device_name,
                failures = tracked.state.consecutive_failures,
                "Device is down"
            ),
            HealthStatus::Healthy => info!(
                device_id = %event.device_id,
                device_name = %event.device_name,
                downtime_ms = event.downtime().map(|d| d.num_milliseconds()).unwrap_or_default(),
                "Device recovered"
            ),
        }
        Observation::Transitioned(event)
    }

    /// Snapshot of one device's state
    pub fn state(&self, device_id: &DeviceId) -> Option<LivenessState> {
        self.shard(device_id).get(device_id).map(|tracked| tracked.state.clone())
    }

    pub fn is_attached(&self, device_id: &DeviceId) -> bool {
        self.shard(device_id).get(device_id).is_some_and(|tracked| tracked.attached)
    }

    /// Snapshot of every known state, detached ones included, ordered by device id
    pub fn states(&self) -> Vec<LivenessState> {
        let mut states: Vec<LivenessState> = self
            .each_shard()
            .flat_map(|shard| shard.values().map(|tracked| tracked.state.clone()).collect::<Vec<_>>())
            .collect();
        states.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        states
    }

    pub fn len(&self) -> usize {
        self.each_shard().map(|shard| shard.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load previously persisted states. They stay detached until the device
    /// is registered again; devices already tracked are left alone.
    pub fn restore(&self, states: impl IntoIterator<Item = LivenessState>) -> usize {
        let mut restored = 0;
        for state in states {
            let state = state.normalize();
            let mut shard = self.shard(&state.device_id);
            if let MapEntry::Vacant(vacant) = shard.entry(state.device_id.clone()) {
                vacant.insert(Tracked {
                    device_name: state.device_id.to_string(),
                    ip_address: String::new(),
                    attached: false,
                    registered_at: 0,
                    last_sequence: 0,
                    last_applied_at: None,
                    state,
                });
                restored += 1;
            }
        }
        restored
    }

    /// Monitored UNHEALTHY devices whose state has not moved for longer than `threshold`
    pub fn stale_unhealthy(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> Vec<LivenessState> {
        let mut stale: Vec<LivenessState> = self
            .each_shard()
            .flat_map(|shard| {
                shard
                    .values()
                    .filter(|tracked| {
                        tracked.attached
                            && tracked.state.status == HealthStatus::Unhealthy
                            && now - tracked.state.updated_at > threshold
                    })
                    .map(|tracked| tracked.state.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        stale.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        stale
    }
}
