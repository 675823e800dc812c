/// Orchestrator - coordinates the service components
///
/// Owns the engine task and the periodic housekeeping around it:
/// inventory reloads, metrics logging, stale state reports and state
/// persistence.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use pingwatch::{Engine, LivenessTracker, MonitoringScheduler, ProbeExecutor};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus;
use crate::config::Config;
use crate::database::{LibsqlStateStore, StatePersister, StateStore, initialize_database};
use crate::inventory::Inventory;
use crate::pool::open_pool;

fn ticker(secs: u64) -> tokio::time::Interval {
    let mut ticker = interval(Duration::from_secs(secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Open the state store and seed the tracker from it
async fn open_store(config: &Config, tracker: &LivenessTracker) -> Result<StatePersister> {
    info!(path = %config.database.path.display(), "Opening state database");
    let pool = open_pool(&config.database.path, config.database.max_connections).await?;
    {
        let conn = pool.get().await?;
        initialize_database(&conn).await?;
    }

    let store: Arc<dyn StateStore> = Arc::new(LibsqlStateStore::new_from_pool(pool));
    let states = store.load_states().await.context("failed to load liveness states")?;
    let saved: Vec<_> = states.iter().map(|s| s.device_id.clone()).collect();
    let restored = tracker.restore(states);
    info!(restored, "Restored liveness states");

    Ok(StatePersister::new(store, saved))
}

async fn reload_inventory(inventory: &mut Inventory, scheduler: &MonitoringScheduler) -> Result<()> {
    match inventory.reload().await {
        Ok(diff) => diff.apply(scheduler).map_err(|e| anyhow!(e)),
        Err(e) => {
            // Keep probing the last good inventory
            warn!(error = %e, "Inventory reload failed");
            Ok(())
        }
    }
}

async fn persist(persister: &mut Option<StatePersister>, tracker: &LivenessTracker) {
    if let Some(persister) = persister.as_mut() {
        if let Err(e) = persister.persist(tracker).await {
            error!(error = %e, "Failed to persist liveness states");
        }
    }
}

/// Run the service until `cancel` fires or the engine fails
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let bus = bus::build(&config.bus)?;
    let prober = Arc::new(ProbeExecutor::new(config.engine.probe.clone())?);
    let engine = Engine::new(config.engine.clone(), prober, bus)?;

    let scheduler = engine.scheduler().clone();
    let tracker = engine.tracker().clone();
    let metrics = engine.metrics().clone();

    let mut persister =
        if config.database.enabled { Some(open_store(&config, &tracker).await?) } else { None };

    let mut inventory = Inventory::new(&config.inventory.path);
    reload_inventory(&mut inventory, &scheduler).await?;
    info!(devices = inventory.len(), path = %inventory.path().display(), "Inventory loaded");

    let engine_stop = cancel.child_token();
    let mut engine_task = tokio::spawn(engine.run(engine_stop.clone()));

    let mut reload_tick = ticker(config.inventory.reload_secs);
    let mut metrics_tick = ticker(config.service.metrics_interval_secs);
    let mut stale_tick = ticker(config.service.stale_check_secs);
    let mut persist_tick = ticker(config.database.persist_secs);
    let stale_after = chrono::Duration::seconds(config.engine.liveness.stale_after_secs as i64);

    // The first tick of an interval completes immediately
    reload_tick.tick().await;
    persist_tick.tick().await;

    info!("Service running");

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutdown requested");
                break Ok(());
            }
            joined = &mut engine_task => {
                // Scheduler stopped without being asked to
                let result = match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(anyhow!(e).context("engine stopped")),
                    Err(e) => Err(anyhow!(e).context("engine task failed")),
                };
                persist(&mut persister, &tracker).await;
                return result;
            }
            _ = reload_tick.tick() => {
                if let Err(e) = reload_inventory(&mut inventory, &scheduler).await {
                    break Err(e);
                }
            }
            _ = metrics_tick.tick() => {
                let snapshot = metrics.snapshot();
                let circuits = scheduler.breaker().map(|breaker| breaker.counts()).unwrap_or_default();
                info!(
                    devices = tracker.len(),
                    pending = scheduler.pending_tasks().unwrap_or_default(),
                    dispatched = snapshot.probes_dispatched,
                    active = snapshot.probes_active,
                    failed = snapshot.probes_failed,
                    skipped = snapshot.probes_skipped,
                    overruns = snapshot.overruns,
                    circuits_open = circuits.open,
                    circuits_half_open = circuits.half_open,
                    transitions = snapshot.transitions,
                    published = snapshot.events_published,
                    dropped = snapshot.events_dropped,
                    "Engine metrics"
                );
            }
            _ = stale_tick.tick() => {
                for state in tracker.stale_unhealthy(Utc::now(), stale_after) {
                    warn!(
                        device_id = %state.device_id,
                        down_since = ?state.down_since,
                        updated_at = %state.updated_at,
                        "Device has been unhealthy without new probe results"
                    );
                }
            }
            _ = persist_tick.tick(), if persister.is_some() => {
                persist(&mut persister, &tracker).await;
            }
        }
    };

    engine_stop.cancel();
    match engine_task.await {
        Ok(Err(e)) => error!(error = %e, "Engine stopped with an error"),
        Err(e) => error!(error = %e, "Engine task failed"),
        Ok(Ok(())) => {}
    }
    persist(&mut persister, &tracker).await;
    info!("Service stopped");
    outcome
}
