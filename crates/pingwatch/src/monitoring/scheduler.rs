use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::breaker::CircuitBreaker;
use super::executor::Prober;
use super::queue::{ScheduledTask, TaskQueue};
use crate::config::{EngineConfig, SchedulerConfig};
use crate::error::SchedulerError;
use crate::events::emitter::EmitterHandle;
use crate::liveness::{LivenessState, LivenessTracker, Observation};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::target::{DeviceId, MonitoredTarget};

/// Monitoring scheduler - dispatches due probes onto a bounded worker pool.
///
/// Every worker runs probe, state update, emit and reschedule in that order,
/// so a device's next probe is only queued once its previous outcome has
/// been fully processed.
pub struct MonitoringScheduler {
    prober: Arc<dyn Prober>,
    queue: Mutex<TaskQueue>,
    targets: RwLock<HashMap<DeviceId, MonitoredTarget>>,
    tracker: Arc<LivenessTracker>,
    emitter: EmitterHandle,
    breaker: Option<CircuitBreaker>,
    metrics: Arc<EngineMetrics>,
    permits: Arc<Semaphore>,
    config: SchedulerConfig,
    fatal: OnceLock<SchedulerError>,
}

impl MonitoringScheduler {
    pub fn new(
        config: &EngineConfig,
        prober: Arc<dyn Prober>,
        tracker: Arc<LivenessTracker>,
        emitter: EmitterHandle,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let breaker = config.breaker.enabled.then(|| CircuitBreaker::new(config.breaker.clone()));
        Self {
            prober,
            queue: Mutex::new(TaskQueue::new()),
            targets: RwLock::new(HashMap::new()),
            tracker,
            emitter,
            breaker,
            metrics,
            permits: Arc::new(Semaphore::new(config.scheduler.max_concurrent_probes.max(1))),
            config: config.scheduler.clone(),
            fatal: OnceLock::new(),
        }
    }

    fn queue(&self) -> Result<MutexGuard<'_, TaskQueue>, SchedulerError> {
        self.queue.lock().map_err(|_| SchedulerError::QueuePoisoned)
    }

    fn targets(&self) -> RwLockReadGuard<'_, HashMap<DeviceId, MonitoredTarget>> {
        self.targets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn targets_mut(&self) -> RwLockWriteGuard<'_, HashMap<DeviceId, MonitoredTarget>> {
        self.targets.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or update a device.
    ///
    /// New and re-enabled devices are probed on the next tick. A disabled
    /// device loses its task and its state stops accepting outcomes. Invalid
    /// records are logged and ignored.
    pub fn upsert_target(&self, target: MonitoredTarget) -> Result<(), SchedulerError> {
        if let Err(e) = target.validate() {
            warn!(device_id = %target.device_id, error = %e, "Ignoring invalid target");
            return Ok(());
        }

        let device_id = target.device_id.clone();
        let interval = target.interval();

        if !target.monitored {
            self.targets_mut().insert(device_id.clone(), target);
            self.queue()?.cancel(&device_id);
            self.tracker.detach(&device_id);
            if let Some(breaker) = &self.breaker {
                breaker.reset(&device_id);
            }
            info!(device_id = %device_id, "Monitoring disabled");
            return Ok(());
        }

        self.tracker.register(&target);
        let previous = self.targets_mut().insert(device_id.clone(), target);

        let mut queue = self.queue()?;
        let now = Instant::now();
        let scheduled = queue.is_scheduled(&device_id);
        match previous {
            Some(previous) if previous.monitored && scheduled => {
                if previous.probe_interval_ms != interval.as_millis() as u64 {
                    queue.schedule(device_id.clone(), interval, now);
                    debug!(device_id = %device_id, interval_ms = interval.as_millis() as u64, "Probe interval changed");
                }
            }
            _ => {
                queue.schedule_at(device_id.clone(), interval, now, true);
                info!(device_id = %device_id, interval_ms = interval.as_millis() as u64, "Monitoring enabled");
            }
        }
        Ok(())
    }

    /// Forget a device: task, liveness state and circuit
    pub fn remove_target(&self, device_id: &DeviceId) -> Result<bool, SchedulerError> {
        let known = self.targets_mut().remove(device_id).is_some();
        self.queue()?.cancel(device_id);
        self.tracker.forget(device_id);
        if let Some(breaker) = &self.breaker {
            breaker.reset(device_id);
        }
        if known {
            info!(device_id = %device_id, "Device removed from monitoring");
        }
        Ok(known)
    }

    /// Insert or replace the device's task, due `interval` from now.
    /// Unknown and disabled devices are ignored with a warning.
    pub fn schedule(&self, device_id: &DeviceId, interval: Duration) -> Result<(), SchedulerError> {
        if interval.is_zero() {
            warn!(device_id = %device_id, "Ignoring schedule with zero interval");
            return Ok(());
        }
        {
            let mut targets = self.targets_mut();
            match targets.get_mut(device_id) {
                Some(target) if target.monitored => {
                    target.probe_interval_ms = interval.as_millis() as u64;
                }
                Some(_) => {
                    warn!(device_id = %device_id, "Ignoring schedule for disabled device");
                    return Ok(());
                }
                None => {
                    warn!(device_id = %device_id, "Ignoring schedule for unknown device");
                    return Ok(());
                }
            }
        }
        self.queue()?.schedule(device_id.clone(), interval, Instant::now());
        Ok(())
    }

    /// Remove the device's task, leaving its state untouched
    pub fn cancel(&self, device_id: &DeviceId) -> Result<bool, SchedulerError> {
        Ok(self.queue()?.cancel(device_id))
    }

    /// Read-only snapshot of the device's liveness
    pub fn state(&self, device_id: &DeviceId) -> Option<LivenessState> {
        self.tracker.state(device_id)
    }

    pub fn target(&self, device_id: &DeviceId) -> Option<MonitoredTarget> {
        self.targets().get(device_id).cloned()
    }

    pub fn target_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.targets().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn tracker(&self) -> &Arc<LivenessTracker> {
        &self.tracker
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Earliest pending due time
    pub fn next_due(&self) -> Result<Option<Instant>, SchedulerError> {
        Ok(self.queue()?.peek_next_due())
    }

    pub fn pending_tasks(&self) -> Result<usize, SchedulerError> {
        Ok(self.queue()?.pending_len())
    }

    fn fail(&self, error: SchedulerError) {
        error!(error = %error, "Fatal scheduler fault");
        let _ = self.fatal.set(error);
    }

    /// Drive the control loop until `cancel` fires or a fatal fault occurs.
    ///
    /// On exit no new probes are dispatched; probes already running are
    /// awaited so their outcomes and events are not lost.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), SchedulerError> {
        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut workers = JoinSet::new();

        info!(
            tick_ms = self.config.tick_ms,
            max_concurrent_probes = self.config.max_concurrent_probes,
            devices = self.targets().len(),
            "Scheduler started"
        );

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    self.reap(joined);
                    continue;
                }
                _ = ticker.tick() => {}
            }

            if let Some(fault) = self.fatal.get() {
                break Err(fault.clone());
            }
            if let Err(fault) = self.dispatch_due(&mut workers) {
                self.fail(fault.clone());
                break Err(fault);
            }
        };

        if !workers.is_empty() {
            info!(in_flight = workers.len(), "Scheduler stopping, waiting for running probes");
        }
        while let Some(joined) = workers.join_next().await {
            self.reap(joined);
        }

        match (result, self.fatal.get()) {
            (Ok(()), Some(fault)) => Err(fault.clone()),
            (result, _) => {
                info!("Scheduler stopped");
                result
            }
        }
    }

    fn reap(&self, joined: Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                self.fail(SchedulerError::WorkerPanicked(e.to_string()));
            }
        }
    }

    /// Pop every due task the worker pool can take right now and spawn it
    fn dispatch_due(self: &Arc<Self>, workers: &mut JoinSet<()>) -> Result<(), SchedulerError> {
        let available = self.permits.available_permits();
        if available == 0 {
            debug!("Probe pool saturated, leaving due tasks queued");
            return Ok(());
        }

        let now = Instant::now();
        let due = self.queue()?.pop_due(now, available)?;
        for task in due {
            self.dispatch(task, now, workers)?;
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, task: ScheduledTask, now: Instant, workers: &mut JoinSet<()>) -> Result<(), SchedulerError> {
        let generation = task.generation();
        let device_id = task.device_id;

        let lateness = now.saturating_duration_since(task.next_due_at);
        if lateness > task.interval {
            self.metrics.overrun();
            debug!(device_id = %device_id, late_ms = lateness.as_millis() as u64, "Probe dispatched late");
        }

        let target = self.targets().get(&device_id).filter(|t| t.monitored).cloned();
        let Some(target) = target else {
            let mut queue = self.queue()?;
            queue.cancel(&device_id);
            queue.complete(&device_id, generation, now);
            return Ok(());
        };

        if let Some(breaker) = &self.breaker {
            if !breaker.allow(&device_id, now) {
                self.metrics.probe_skipped();
                debug!(device_id = %device_id, "Circuit open, skipping probe");
                self.queue()?.complete(&device_id, generation, now);
                return Ok(());
            }
        }

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            // Only the loop acquires permits, so this means the pool was closed
            self.queue()?.complete(&device_id, generation, now);
            return Ok(());
        };

        let sequence = self.tracker.next_sequence();
        self.metrics.probe_started();
        let scheduler = Arc::clone(self);
        workers.spawn(async move {
            let _permit = permit;
            scheduler.probe_and_record(target, sequence, generation).await;
        });
        Ok(())
    }

    async fn probe_and_record(&self, target: MonitoredTarget, sequence: u64, generation: u64) {
        let outcome = self.prober.probe(&target).await.with_sequence(sequence);
        let device_id = &target.device_id;
        self.metrics.probe_finished(outcome.is_success());

        if let Some(breaker) = &self.breaker {
            if outcome.is_success() {
                breaker.record_success(device_id);
            } else {
                breaker.record_failure(device_id, Instant::now());
            }
        }

        match self.tracker.observe(&outcome) {
            Observation::Transitioned(event) => {
                self.metrics.transition();
                self.emitter.emit(event);
            }
            Observation::Updated => {}
            Observation::Stale | Observation::Detached | Observation::Unregistered => {
                self.metrics.outcome_discarded();
            }
        }

        match self.queue() {
            Ok(mut queue) => {
                queue.complete(device_id, generation, Instant::now());
            }
            Err(fault) => self.fail(fault),
        }
    }
}
