//! SQLite-backed task store.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{ConnectOptions, Row, SqlitePool};
use tokio::sync::Mutex;

use crate::task::{Task, TaskId, TaskPatch, TaskStatus};

use super::lease::{InstanceLease, LeaseClaim, LeaseHolder, LeaseState};
use super::schema;
use super::store::{StoreError, TaskFilter, TaskStore};

/// Key of the orchestrator lease row.
const LEASE_NAME: &str = "orchestrator";

/// Task store persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
    /// Holds a shared in-memory database open while the pool replaces
    /// connections.
    _anchor: Option<Arc<Mutex<SqliteConnection>>>,
}

impl SqliteTaskStore {
    /// Opens (or creates) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self::from_pool(pool).await?;
        tracing::info!(path = %path.display(), "Task store opened");
        Ok(store)
    }

    /// Connects using a `sqlite://` URL.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Self::from_pool(pool).await
    }

    /// Opens a private in-memory database.
    ///
    /// The database is named and shared-cache, and an extra connection keeps
    /// it alive, so a connection dropped mid-query is replaced by one that
    /// still sees the schema and rows.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let url = format!(
            "sqlite:file:recon-forge-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4()
        );
        let opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let anchor = opts
            .connect()
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self::from_pool(pool).await?;
        Ok(Self {
            _anchor: Some(Arc::new(Mutex::new(anchor))),
            ..store
        })
    }

    /// Wraps an existing pool and applies the schema.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in schema::all_schema_statements() {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, _anchor: None })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: &Task) -> Result<TaskId, StoreError> {
        if !task.is_consistent() {
            return Err(StoreError::InvariantViolation(format!(
                "task {} has status {} but result_ref {:?}",
                task.id, task.status, task.result_ref
            )));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO recon_tasks (
                id, artifact_ref, input_path, working_dir, variant,
                status, result_ref, failure, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.artifact_ref)
        .bind(task.input_path.to_string_lossy().to_string())
        .bind(task.working_dir.to_string_lossy().to_string())
        .bind(&task.variant)
        .bind(task.status.as_str())
        .bind(&task.result_ref)
        .bind(&task.failure)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(task.id),
            Err(sqlx::Error::Database(db)) if db.message().contains("recon_tasks.working_dir") => {
                Err(StoreError::WorkdirTaken(
                    task.working_dir.display().to_string(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let query = format!(
            "SELECT {} FROM recon_tasks WHERE id = ?1",
            schema::TASK_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<bool, StoreError> {
        if !patch.is_valid() {
            return Err(StoreError::InvariantViolation(format!(
                "illegal patch {} -> {} for task {}",
                patch.expected(),
                patch.status(),
                id
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE recon_tasks
            SET status = ?1, result_ref = ?2, failure = ?3, updated_at = ?4
            WHERE id = ?5 AND status = ?6
            "#,
        )
        .bind(patch.status().as_str())
        .bind(patch.result_ref())
        .bind(patch.failure())
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(patch.expected().as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut query = format!("SELECT {} FROM recon_tasks", schema::TASK_COLUMNS);
        let mut conditions = Vec::new();

        if filter.artifact_ref.is_some() {
            conditions.push("artifact_ref = ?".to_string());
        }
        if filter.variant.is_some() {
            conditions.push("variant = ?".to_string());
        }
        if filter.working_dir.is_some() {
            conditions.push("working_dir = ?".to_string());
        }
        if !filter.statuses.is_empty() {
            let placeholders = vec!["?"; filter.statuses.len()].join(", ");
            conditions.push(format!("status IN ({})", placeholders));
        }

        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }

        query.push_str(" ORDER BY seq ASC");

        if filter.limit.is_some() {
            query.push_str(" LIMIT ?");
        }

        // Bind in the same order the conditions were pushed
        let mut sqlx_query = sqlx::query(&query);

        if let Some(ref artifact_ref) = filter.artifact_ref {
            sqlx_query = sqlx_query.bind(artifact_ref);
        }
        if let Some(ref variant) = filter.variant {
            sqlx_query = sqlx_query.bind(variant);
        }
        if let Some(ref dir) = filter.working_dir {
            sqlx_query = sqlx_query.bind(dir.to_string_lossy().to_string());
        }
        for status in &filter.statuses {
            sqlx_query = sqlx_query.bind(status.as_str());
        }
        if let Some(limit) = filter.limit {
            sqlx_query = sqlx_query.bind(limit);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn count(&self, filter: &TaskFilter) -> Result<usize, StoreError> {
        if filter.artifact_ref.is_some() || filter.variant.is_some() || filter.working_dir.is_some()
        {
            return Ok(self.list(filter).await?.len());
        }

        let mut query = String::from("SELECT COUNT(*) AS n FROM recon_tasks");
        if !filter.statuses.is_empty() {
            let placeholders = vec!["?"; filter.statuses.len()].join(", ");
            query.push_str(&format!(" WHERE status IN ({})", placeholders));
        }

        let mut sqlx_query = sqlx::query(&query);
        for status in &filter.statuses {
            sqlx_query = sqlx_query.bind(status.as_str());
        }

        let row = sqlx_query.fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as usize)
    }

    async fn claim_lease(&self, claim: &LeaseClaim<'_>) -> Result<LeaseState, StoreError> {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(claim.ttl.as_millis()).unwrap_or(i64::MAX);
        let stale_before = now.saturating_sub(ttl_ms);

        // One statement: insert, renew our own row, or take over an expired
        // or evicted one
        let result = sqlx::query(
            r#"
            INSERT INTO recon_lease (name, owner, pid, heartbeat_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name) DO UPDATE
            SET owner = excluded.owner, pid = excluded.pid, heartbeat_ms = excluded.heartbeat_ms
            WHERE recon_lease.owner = excluded.owner
               OR recon_lease.heartbeat_ms < ?5
               OR recon_lease.owner = ?6
            "#,
        )
        .bind(LEASE_NAME)
        .bind(&claim.lease.owner)
        .bind(i64::from(claim.lease.pid))
        .bind(now)
        .bind(stale_before)
        .bind(claim.evict)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(LeaseState::Granted);
        }

        let row = sqlx::query("SELECT owner, pid, heartbeat_ms FROM recon_lease WHERE name = ?1")
            .bind(LEASE_NAME)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(StoreError::Corrupt(
                "lease claim rejected but no lease row exists".to_string(),
            ));
        };

        let pid: i64 = row.try_get("pid")?;
        let heartbeat_ms: i64 = row.try_get("heartbeat_ms")?;
        Ok(LeaseState::Held(LeaseHolder {
            owner: row.try_get("owner")?,
            pid: u32::try_from(pid)
                .map_err(|_| StoreError::Corrupt(format!("lease pid {}", pid)))?,
            heartbeat_at: DateTime::from_timestamp_millis(heartbeat_ms).ok_or_else(|| {
                StoreError::Corrupt(format!("lease heartbeat {}", heartbeat_ms))
            })?,
        }))
    }

    async fn release_lease(&self, lease: &InstanceLease) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM recon_lease WHERE name = ?1 AND owner = ?2")
            .bind(LEASE_NAME)
            .bind(&lease.owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_task(row: &SqliteRow) -> Result<Task, StoreError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let input_path: String = row.try_get("input_path")?;
    let working_dir: String = row.try_get("working_dir")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(Task {
        id: id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("task id '{}': {}", id, e)))?,
        artifact_ref: row.try_get("artifact_ref")?,
        input_path: PathBuf::from(input_path),
        working_dir: PathBuf::from(working_dir),
        variant: row.try_get("variant")?,
        status: status.parse::<TaskStatus>().map_err(StoreError::Corrupt)?,
        result_ref: row.try_get("result_ref")?,
        failure: row.try_get("failure")?,
        seq: row.try_get("seq")?,
        created_at,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn new_task(artifact: &str, variant: &str, dir: &str, status: TaskStatus) -> Task {
        Task::new(artifact, "/in/clip.mp4", dir, variant, status)
    }

    #[tokio::test]
    async fn test_create_get_roundtrip_assigns_seq() {
        let store = SqliteTaskStore::open_in_memory().await.expect("open");
        let first = new_task("1", "3dgs", "/w/a", TaskStatus::Pending);
        let second = new_task("2", "3dgs", "/w/b", TaskStatus::Queued);

        store.create(&first).await.expect("create first");
        store.create(&second).await.expect("create second");

        let loaded_first = store.get(first.id).await.expect("get").expect("exists");
        let loaded_second = store.get(second.id).await.expect("get").expect("exists");

        assert_eq!(loaded_first.artifact_ref, "1");
        assert_eq!(loaded_first.status, TaskStatus::Pending);
        assert_eq!(loaded_first.working_dir, PathBuf::from("/w/a"));
        assert!(loaded_first.seq < loaded_second.seq);
        assert!(store.get(TaskId::new()).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store_survives_dropped_connection() {
        use sqlx::Connection;

        let store = SqliteTaskStore::open_in_memory().await.expect("open");
        let task = new_task("1", "3dgs", "/w/a", TaskStatus::Pending);
        store.create(&task).await.expect("create");

        let conn = store.pool.acquire().await.expect("acquire").detach();
        conn.close().await.expect("close");

        let loaded = store.get(task.id).await.expect("get after reconnect");
        assert_eq!(loaded.map(|t| t.id), Some(task.id));
    }

    #[tokio::test]
    async fn test_in_memory_stores_are_isolated() {
        let first = SqliteTaskStore::open_in_memory().await.expect("open");
        let second = SqliteTaskStore::open_in_memory().await.expect("open");
        let task = new_task("1", "3dgs", "/w/a", TaskStatus::Pending);
        first.create(&task).await.expect("create");

        assert!(second.get(task.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_lease_excludes_second_owner_until_released() {
        let store = SqliteTaskStore::open_in_memory().await.expect("open");
        let first = InstanceLease::for_current_process();
        let second = InstanceLease::for_current_process();
        let ttl = Duration::from_secs(60);

        let claimed = store.claim_lease(&LeaseClaim::new(&first, ttl)).await.expect("claim");
        assert_eq!(claimed, LeaseState::Granted);

        // Renewal by the holder keeps working
        let renewed = store.claim_lease(&LeaseClaim::new(&first, ttl)).await.expect("renew");
        assert_eq!(renewed, LeaseState::Granted);

        match store.claim_lease(&LeaseClaim::new(&second, ttl)).await.expect("claim") {
            LeaseState::Held(holder) => {
                assert_eq!(holder.owner, first.owner);
                assert_eq!(holder.pid, first.pid);
            }
            other => panic!("expected held lease, got {:?}", other),
        }

        store.release_lease(&first).await.expect("release");
        let claimed = store.claim_lease(&LeaseClaim::new(&second, ttl)).await.expect("claim");
        assert_eq!(claimed, LeaseState::Granted);
    }

    #[tokio::test]
    async fn test_lease_taken_over_when_expired_or_evicted() {
        let store = SqliteTaskStore::open_in_memory().await.expect("open");
        let first = InstanceLease::for_current_process();
        let second = InstanceLease::for_current_process();
        let third = InstanceLease::for_current_process();

        store
            .claim_lease(&LeaseClaim::new(&first, Duration::from_secs(60)))
            .await
            .expect("claim");
        tokio::time::sleep(Duration::from_millis(30)).await;

        let expired = store
            .claim_lease(&LeaseClaim::new(&second, Duration::from_millis(10)))
            .await
            .expect("claim");
        assert_eq!(expired, LeaseState::Granted);

        let evicted = store
            .claim_lease(&LeaseClaim::new(&third, Duration::from_secs(60)).evicting(&second.owner))
            .await
            .expect("claim");
        assert_eq!(evicted, LeaseState::Granted);

        // The previous holder cannot renew any more
        let stale = store
            .claim_lease(&LeaseClaim::new(&second, Duration::from_secs(60)))
            .await
            .expect("claim");
        assert!(matches!(stale, LeaseState::Held(h) if h.owner == third.owner));
    }

    #[tokio::test]
    async fn test_update_is_compare_and_set() {
        let store = SqliteTaskStore::open_in_memory().await.expect("open");
        let task = new_task("1", "3dgs", "/w/a", TaskStatus::Pending);
        store.create(&task).await.expect("create");

        let applied = store
            .update(task.id, &TaskPatch::advance(TaskStatus::Pending, TaskStatus::Imaged))
            .await
            .expect("update");
        assert!(applied);

        // Stale expectation is rejected without touching the row
        let stale = store
            .update(task.id, &TaskPatch::failed(TaskStatus::Pending, "late"))
            .await
            .expect("update");
        assert!(!stale);

        let loaded = store.get(task.id).await.expect("get").expect("exists");
        assert_eq!(loaded.status, TaskStatus::Imaged);
        assert!(loaded.failure.is_none());
    }

    #[tokio::test]
    async fn test_trained_patch_sets_result_atomically() {
        let store = SqliteTaskStore::open_in_memory().await.expect("open");
        let task = new_task("1", "3dgs", "/w/a", TaskStatus::Converted);
        store.create(&task).await.expect("create");

        store
            .update(task.id, &TaskPatch::trained("a/results/point_cloud.ply"))
            .await
            .expect("update");

        let loaded = store.get(task.id).await.expect("get").expect("exists");
        assert_eq!(loaded.status, TaskStatus::Trained);
        assert_eq!(loaded.result_ref.as_deref(), Some("a/results/point_cloud.ply"));
        assert!(loaded.is_consistent());
    }

    #[tokio::test]
    async fn test_illegal_patch_rejected() {
        let store = SqliteTaskStore::open_in_memory().await.expect("open");
        let task = new_task("1", "3dgs", "/w/a", TaskStatus::Trained).trained("a/p.ply");
        store.create(&task).await.expect("create");

        let err = store
            .update(task.id, &TaskPatch::advance(TaskStatus::Trained, TaskStatus::Imaged))
            .await
            .expect_err("illegal transition");
        assert!(matches!(err, StoreError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_inconsistent_task_rejected_on_create() {
        let store = SqliteTaskStore::open_in_memory().await.expect("open");
        let task = new_task("1", "3dgs", "/w/a", TaskStatus::Trained);

        let err = store.create(&task).await.expect_err("missing result");
        assert!(matches!(err, StoreError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_working_dir_is_exclusive() {
        let store = SqliteTaskStore::open_in_memory().await.expect("open");
        store
            .create(&new_task("1", "3dgs", "/w/shared", TaskStatus::Pending))
            .await
            .expect("create");

        let err = store
            .create(&new_task("2", "3dgs", "/w/shared", TaskStatus::Queued))
            .await
            .expect_err("duplicate dir");
        assert!(matches!(err, StoreError::WorkdirTaken(_)));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_by_seq() {
        let store = SqliteTaskStore::open_in_memory().await.expect("open");
        let queued_a = new_task("a", "3dgs", "/w/1", TaskStatus::Queued);
        let active = new_task("b", "3dgs", "/w/2", TaskStatus::Pending);
        let queued_b = new_task("c", "2dgs", "/w/3", TaskStatus::Queued);
        for task in [&queued_a, &active, &queued_b] {
            store.create(task).await.expect("create");
        }

        let queued = store.list(&TaskFilter::queued()).await.expect("list");
        assert_eq!(
            queued.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![queued_a.id, queued_b.id]
        );

        let oldest = store
            .list(&TaskFilter::queued().with_limit(1))
            .await
            .expect("list");
        assert_eq!(oldest.len(), 1);
        assert_eq!(oldest[0].id, queued_a.id);

        let by_variant = store
            .list(&TaskFilter::new().with_variant("2dgs"))
            .await
            .expect("list");
        assert_eq!(by_variant.len(), 1);

        assert_eq!(store.count(&TaskFilter::active()).await.expect("count"), 1);
        assert_eq!(store.count(&TaskFilter::new()).await.expect("count"), 3);
        assert_eq!(
            store
                .count(&TaskFilter::new().with_artifact_ref("a"))
                .await
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn test_open_file_database_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("tasks.db");
        let task = new_task("1", "3dgs", "/w/a", TaskStatus::Queued);

        {
            let store = SqliteTaskStore::open(&db_path).await.expect("open");
            store.create(&task).await.expect("create");
        }

        let reopened = SqliteTaskStore::open(&db_path).await.expect("reopen");
        let loaded = reopened.get(task.id).await.expect("get").expect("exists");
        assert_eq!(loaded.status, TaskStatus::Queued);
    }
}
