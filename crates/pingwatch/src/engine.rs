use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{ConfigError, SchedulerError};
use crate::events::bus::EventBus;
use crate::events::emitter::TransitionEmitter;
use crate::liveness::LivenessTracker;
use crate::metrics::EngineMetrics;
use crate::monitoring::executor::Prober;
use crate::monitoring::scheduler::MonitoringScheduler;

/// Scheduler, tracker and emitter wired together.
///
/// Must be created inside a tokio runtime: the emitter task starts right away.
pub struct Engine {
    scheduler: Arc<MonitoringScheduler>,
    metrics: Arc<EngineMetrics>,
    emitter_task: JoinHandle<()>,
    emitter_stop: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig, prober: Arc<dyn Prober>, bus: Arc<dyn EventBus>) -> Result<Self, ConfigError> {
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::new());
        let tracker = Arc::new(LivenessTracker::new(&config.liveness));
        let emitter_stop = CancellationToken::new();
        let (emitter, emitter_task) =
            TransitionEmitter::new(bus, config.emitter.clone(), metrics.clone()).spawn(emitter_stop.clone());
        let scheduler = Arc::new(MonitoringScheduler::new(&config, prober, tracker, emitter, metrics.clone()));

        Ok(Self { scheduler, metrics, emitter_task, emitter_stop })
    }

    pub fn scheduler(&self) -> &Arc<MonitoringScheduler> {
        &self.scheduler
    }

    pub fn tracker(&self) -> &Arc<LivenessTracker> {
        self.scheduler.tracker()
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Run until `cancel` fires, then flush the emitter queue
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        let result = self.scheduler.clone().run(cancel).await;

        // The emitter outlives the scheduler so events from the last probes still go out
        self.emitter_stop.cancel();
        if let Err(e) = self.emitter_task.await {
            warn!(error = %e, "Emitter task ended abnormally");
        }
        result
    }
}
