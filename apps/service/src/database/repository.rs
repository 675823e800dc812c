use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, Value, params};
use pingwatch::{DeviceId, HealthStatus, LivenessState};

use crate::pool::{LibsqlManager, LibsqlPool};

/// Storage for liveness states
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load every stored state
    async fn load_states(&self) -> Result<Vec<LivenessState>>;

    /// Insert or replace the given states
    async fn save_states(&self, states: &[LivenessState]) -> Result<()>;

    /// Delete the states of the given devices
    async fn delete_states(&self, device_ids: &[DeviceId]) -> Result<()>;
}

/// LibSQL-backed state store
pub struct LibsqlStateStore {
    pool: LibsqlPool,
}

impl LibsqlStateStore {
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }
}

fn to_millis(at: Option<DateTime<Utc>>) -> Value {
    match at {
        Some(at) => Value::Integer(at.timestamp_millis()),
        None => Value::Null,
    }
}

fn from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(DateTime::<Utc>::from_timestamp_millis)
}

fn state_from_row(row: &Row) -> Result<LivenessState> {
    let device_id: String = row.get(0)?;
    let status: String = row.get(1)?;
    let status = status
        .parse::<HealthStatus>()
        .map_err(|e| anyhow::anyhow!("bad status for device {device_id}: {e}"))?;
    let updated_at: i64 = row.get(7)?;

    Ok(LivenessState {
        device_id: DeviceId::new(device_id),
        status,
        consecutive_successes: row.get::<i64>(2)?.try_into().unwrap_or(0),
        consecutive_failures: row.get::<i64>(3)?.try_into().unwrap_or(0),
        last_success_at: from_millis(row.get(4)?),
        last_failure_at: from_millis(row.get(5)?),
        down_since: from_millis(row.get(6)?),
        updated_at: from_millis(Some(updated_at)).unwrap_or_default(),
    })
}

#[async_trait]
impl StateStore for LibsqlStateStore {
    async fn load_states(&self) -> Result<Vec<LivenessState>> {
        let conn = self.get_conn().await?;
        let mut stmt = conn
            .prepare(
                "SELECT device_id, status, consecutive_successes, consecutive_failures, last_success_at, last_failure_at, down_since, updated_at FROM liveness_states ORDER BY device_id",
            )
            .await?;

        let mut rows = stmt.query(()).await?;
        let mut states = Vec::new();

        while let Some(row) = rows.next().await? {
            match state_from_row(&row) {
                Ok(state) => states.push(state),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable liveness state"),
            }
        }

        Ok(states)
    }

    async fn save_states(&self, states: &[LivenessState]) -> Result<()> {
        if states.is_empty() {
            return Ok(());
        }
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;

        for state in states {
            tx.execute(
                "INSERT INTO liveness_states (device_id, status, consecutive_successes, consecutive_failures, last_success_at, last_failure_at, down_since, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(device_id) DO UPDATE SET
                    status = excluded.status,
                    consecutive_successes = excluded.consecutive_successes,
                    consecutive_failures = excluded.consecutive_failures,
                    last_success_at = excluded.last_success_at,
                    last_failure_at = excluded.last_failure_at,
                    down_since = excluded.down_since,
                    updated_at = excluded.updated_at",
                params![
                    state.device_id.as_str(),
                    state.status.to_string(),
                    i64::from(state.consecutive_successes),
                    i64::from(state.consecutive_failures),
                    to_millis(state.last_success_at),
                    to_millis(state.last_failure_at),
                    to_millis(state.down_since),
                    state.updated_at.timestamp_millis(),
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_states(&self, device_ids: &[DeviceId]) -> Result<()> {
        let conn = self.get_conn().await?;
        for device_id in device_ids {
            conn.execute("DELETE FROM liveness_states WHERE device_id = ?", params![device_id.as_str()])
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::initialize_database;
    use crate::pool::open_pool;
    use chrono::TimeZone;
    use tempfile::tempdir;

    async fn store(dir: &tempfile::TempDir) -> LibsqlStateStore {
        let pool = open_pool(dir.path().join("state.db"), 2).await.unwrap();
        {
            let conn = pool.get().await.unwrap();
            initialize_database(&conn).await.unwrap();
        }
        LibsqlStateStore::new_from_pool(pool)
    }

    fn down_state(id: &str) -> LivenessState {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        LivenessState {
            device_id: DeviceId::from(id),
            status: HealthStatus::Unhealthy,
            consecutive_successes: 0,
            consecutive_failures: 4,
            last_success_at: Some(at - chrono::Duration::seconds(30)),
            last_failure_at: Some(at),
            down_since: Some(at - chrono::Duration::seconds(10)),
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn saved_states_load_back() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let down = down_state("nas");
        let up = LivenessState::new(DeviceId::from("ap-1"), down.updated_at);

        store.save_states(&[down.clone(), up.clone()]).await.unwrap();

        let loaded = store.load_states().await.unwrap();
        assert_eq!(loaded, vec![up, down]);
    }

    #[tokio::test]
    async fn save_overwrites_and_delete_removes() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let mut state = down_state("nas");
        store.save_states(std::slice::from_ref(&state)).await.unwrap();

        state.consecutive_failures = 9;
        store.save_states(std::slice::from_ref(&state)).await.unwrap();
        assert_eq!(store.load_states().await.unwrap(), vec![state.clone()]);

        store.delete_states(&[state.device_id.clone()]).await.unwrap();
        assert!(store.load_states().await.unwrap().is_empty());
    }
}
