//! Time-ordered task queue with one slot per device.
//!
//! A device is in exactly one of three places: pending (waiting for its due
//! time), in flight (popped and being probed) or absent. `schedule` on a
//! pending device replaces its slot; on an in-flight device it only updates
//! the settings used when the probe completes. Cancelling an in-flight device
//! leaves a marker until that run completes, so a device is never handed out
//! twice. The heap is lazily cleaned: replaced slots leave stale entries
//! behind that are skipped by generation.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::SchedulerError;
use crate::target::DeviceId;

/// One pending or running probe task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub device_id: DeviceId,
    pub next_due_at: Instant,
    pub interval: Duration,
    /// Re-enqueued on completion when set
    pub recurring: bool,
    generation: u64,
    cancelled: bool,
    /// Due time requested while the task was cancelled in flight
    resume_at: Option<Instant>,
}

impl ScheduledTask {
    /// Dispatch token; `complete` only accepts the generation it handed out
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

type HeapEntry = Reverse<(Instant, DeviceId, u64)>;

#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<HeapEntry>,
    pending: HashMap<DeviceId, ScheduledTask>,
    in_flight: HashMap<DeviceId, ScheduledTask>,
    next_generation: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the recurring task for `device_id`, due at `now + interval`
    pub fn schedule(&mut self, device_id: DeviceId, interval: Duration, now: Instant) {
        self.schedule_at(device_id, interval, now + interval, true);
    }

    /// Insert or replace a task with an explicit due time
    pub fn schedule_at(&mut self, device_id: DeviceId, interval: Duration, due_at: Instant, recurring: bool) {
        if let Some(running) = self.in_flight.get_mut(&device_id) {
            // The probe in flight re-enqueues with the new settings when it completes
            running.interval = interval;
            running.recurring = recurring;
            if running.cancelled {
                running.cancelled = false;
                running.resume_at = Some(due_at);
            }
            return;
        }

        self.next_generation += 1;
        let task = ScheduledTask {
            device_id: device_id.clone(),
            next_due_at: due_at,
            interval,
            recurring,
            generation: self.next_generation,
            cancelled: false,
            resume_at: None,
        };
        self.heap.push(Reverse((due_at, device_id.clone(), task.generation)));
        self.pending.insert(device_id, task);
        self.compact_if_needed();
    }

    /// Remove the device from the queue. A running task stays marked as in
    /// flight but is not re-enqueued unless the device is scheduled again.
    pub fn cancel(&mut self, device_id: &DeviceId) -> bool {
        let pending = self.pending.remove(device_id).is_some();
        let running = match self.in_flight.get_mut(device_id) {
            Some(task) if !task.cancelled => {
                task.cancelled = true;
                task.resume_at = None;
                true
            }
            _ => false,
        };
        pending || running
    }

    /// Remove and return up to `limit` tasks due at or before `now`, earliest first,
    /// ties broken by device id. Popped tasks move to in flight.
    pub fn pop_due(&mut self, now: Instant, limit: usize) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let mut due = Vec::new();

        while due.len() < limit {
            let Some(Reverse((due_at, device_id, generation))) = self.heap.peek().cloned() else {
                break;
            };
            if !self.is_live(&device_id, generation) {
                self.heap.pop();
                continue;
            }
            if due_at > now {
                break;
            }
            self.heap.pop();

            let Some(task) = self.pending.remove(&device_id) else {
                continue;
            };
            if self.in_flight.contains_key(&device_id) {
                return Err(SchedulerError::DuplicateTask(device_id));
            }
            self.in_flight.insert(device_id, task.clone());
            due.push(task);
        }

        Ok(due)
    }

    /// Mark the dispatch `generation` of the device as finished. Recurring
    /// tasks come back due at `now + interval`; returns that due time, or
    /// `None` if the device was cancelled meanwhile, the task was one-shot or
    /// `generation` is not the one in flight.
    pub fn complete(&mut self, device_id: &DeviceId, generation: u64, now: Instant) -> Option<Instant> {
        if self.in_flight.get(device_id)?.generation != generation {
            return None;
        }
        let task = self.in_flight.remove(device_id)?;
        if task.cancelled || !task.recurring {
            return None;
        }
        let due_at = match task.resume_at {
            Some(resume_at) => resume_at.max(now),
            None => now + task.interval,
        };
        self.schedule_at(task.device_id, task.interval, due_at, true);
        Some(due_at)
    }

    /// Earliest due time among pending tasks
    pub fn peek_next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse((due_at, device_id, generation))) = self.heap.peek() {
            if self.is_live(device_id, *generation) {
                return Some(*due_at);
            }
            self.heap.pop();
        }
        None
    }

    pub fn is_pending(&self, device_id: &DeviceId) -> bool {
        self.pending.contains_key(device_id)
    }

    /// True from dispatch until `complete`, even when cancelled meanwhile
    pub fn is_in_flight(&self, device_id: &DeviceId) -> bool {
        self.in_flight.contains_key(device_id)
    }

    /// Pending, or in flight and due to come back on completion
    pub fn is_scheduled(&self, device_id: &DeviceId) -> bool {
        self.is_pending(device_id) || self.in_flight.get(device_id).is_some_and(|task| !task.cancelled)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// Verify that no device occupies more than one slot
    pub fn check_invariants(&self) -> Result<(), SchedulerError> {
        if let Some(device_id) = self.pending.keys().find(|id| self.in_flight.contains_key(*id)) {
            return Err(SchedulerError::DuplicateTask(device_id.clone()));
        }
        Ok(())
    }

    fn is_live(&self, device_id: &DeviceId, generation: u64) -> bool {
        self.pending.get(device_id).is_some_and(|task| task.generation == generation)
    }

    fn compact_if_needed(&mut self) {
        if self.heap.len() > 2 * self.pending.len() + 64 {
            let pending = &self.pending;
            self.heap.retain(|Reverse((_, id, generation))| {
                pending.get(id).is_some_and(|task| task.generation == *generation)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DeviceId {
        DeviceId::from(s)
    }

    #[test]
    fn schedule_replaces_existing_slot() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        queue.schedule(id("a"), Duration::from_secs(10), now);
        queue.schedule(id("a"), Duration::from_secs(1), now);

        assert_eq!(queue.pending_len(), 1);
        let due = queue.pop_due(now + Duration::from_secs(1), usize::MAX).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].interval, Duration::from_secs(1));
        assert!(queue.pop_due(now + Duration::from_secs(20), usize::MAX).unwrap().is_empty());
    }

    #[test]
    fn pops_in_due_order_with_id_tie_break() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        queue.schedule(id("c"), Duration::from_millis(200), now);
        queue.schedule(id("b"), Duration::from_millis(100), now);
        queue.schedule(id("a"), Duration::from_millis(100), now);

        let due = queue.pop_due(now + Duration::from_secs(1), usize::MAX).unwrap();
        let order: Vec<&str> = due.iter().map(|t| t.device_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn not_yet_due_tasks_stay() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        queue.schedule(id("a"), Duration::from_secs(5), now);

        assert!(queue.pop_due(now + Duration::from_secs(4), usize::MAX).unwrap().is_empty());
        assert_eq!(queue.peek_next_due(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn limit_leaves_remaining_tasks_pending() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        for name in ["a", "b", "c"] {
            queue.schedule_at(id(name), Duration::from_secs(1), now, true);
        }

        let first = queue.pop_due(now, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.in_flight_len(), 2);
    }

    #[test]
    fn completion_reschedules_from_completion_time() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        queue.schedule_at(id("a"), Duration::from_secs(1), now, true);
        let task = queue.pop_due(now, usize::MAX).unwrap().remove(0);

        let finished = now + Duration::from_millis(700);
        assert_eq!(
            queue.complete(&id("a"), task.generation(), finished),
            Some(finished + Duration::from_secs(1))
        );
        assert!(queue.is_pending(&id("a")));
        assert!(!queue.is_in_flight(&id("a")));
    }

    #[test]
    fn schedule_during_flight_does_not_duplicate() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        queue.schedule_at(id("a"), Duration::from_secs(1), now, true);
        let task = queue.pop_due(now, usize::MAX).unwrap().remove(0);

        queue.schedule(id("a"), Duration::from_secs(30), now);
        assert!(!queue.is_pending(&id("a")));
        assert!(queue.check_invariants().is_ok());

        let next = queue.complete(&id("a"), task.generation(), now).unwrap();
        assert_eq!(next, now + Duration::from_secs(30));
    }

    #[test]
    fn cancel_during_flight_drops_reschedule() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        queue.schedule_at(id("a"), Duration::from_secs(1), now, true);
        let task = queue.pop_due(now, usize::MAX).unwrap().remove(0);

        assert!(queue.cancel(&id("a")));
        assert!(queue.is_in_flight(&id("a")));
        assert!(!queue.is_scheduled(&id("a")));
        assert!(!queue.cancel(&id("a")));
        assert_eq!(queue.complete(&id("a"), task.generation(), now), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn rescheduling_a_cancelled_running_task_waits_for_it() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        queue.schedule_at(id("a"), Duration::from_secs(1), now, true);
        let task = queue.pop_due(now, usize::MAX).unwrap().remove(0);

        queue.cancel(&id("a"));
        queue.schedule_at(id("a"), Duration::from_secs(1), now, true);
        assert!(queue.is_scheduled(&id("a")));
        assert!(!queue.is_pending(&id("a")));
        assert!(queue.pop_due(now + Duration::from_secs(5), usize::MAX).unwrap().is_empty());

        // The requested due time has passed, so it is due right at completion
        let finished = now + Duration::from_secs(3);
        assert_eq!(queue.complete(&id("a"), task.generation(), finished), Some(finished));
        let next = queue.pop_due(finished, usize::MAX).unwrap();
        assert_eq!(next.len(), 1);
        assert_ne!(next[0].generation(), task.generation());
    }

    #[test]
    fn completion_with_an_old_generation_is_ignored() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        queue.schedule_at(id("a"), Duration::from_secs(1), now, true);
        let first = queue.pop_due(now, usize::MAX).unwrap().remove(0);
        queue.complete(&id("a"), first.generation(), now);

        let later = now + Duration::from_secs(1);
        let second = queue.pop_due(later, usize::MAX).unwrap().remove(0);
        assert_eq!(queue.complete(&id("a"), first.generation(), later), None);
        assert!(queue.is_in_flight(&id("a")));

        assert!(queue.complete(&id("a"), second.generation(), later).is_some());
        assert!(!queue.is_in_flight(&id("a")));
    }

    #[test]
    fn one_shot_tasks_are_not_requeued() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        queue.schedule_at(id("a"), Duration::from_secs(1), now, false);
        let task = queue.pop_due(now, usize::MAX).unwrap().remove(0);
        assert_eq!(queue.complete(&id("a"), task.generation(), now), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn heap_is_compacted_after_many_replacements() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        for _ in 0..1000 {
            queue.schedule(id("a"), Duration::from_secs(1), now);
        }
        assert!(queue.heap.len() <= 2 * queue.pending_len() + 65);
    }
}
