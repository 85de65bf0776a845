use crate::core::counters;
use crate::core::error::{StoreError, StoreResult};
use crate::core::model::{
    EnqueueOutcome, Mode, RequeueOutcome, Source, Task, TaskId, TaskPatch, TaskStatus,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

const TASK_COLUMNS: &str = "id, url, source, local_id, source_prefix, mode, status, progress, \
     retry_count, filename, filepath, error_msg, added_at, completed_at";

/// Persisted download queue plus the per-source counters.
///
/// Reads go straight to the pool. Every mutation takes `write_lock` first, so two
/// writers never interleave inside one logical operation even though WAL lets
/// readers run alongside.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl TaskStore {
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::CreateDir {
                        path: parent.display().to_string(),
                        source,
                    })?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        let store = Self { pool, write_lock: Arc::new(Mutex::new(())) };
        store.migrate().await?;
        info!(db = %db_path.display(), "task store ready");
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              url TEXT NOT NULL,
              source TEXT NOT NULL DEFAULT 'UNKNOWN',
              local_id INTEGER NOT NULL DEFAULT 0,
              source_prefix TEXT NOT NULL DEFAULT '',
              mode TEXT NOT NULL DEFAULT 'VIDEO',
              filename TEXT,
              filepath TEXT,
              status TEXT NOT NULL DEFAULT 'PENDING',
              progress REAL NOT NULL DEFAULT 0.0,
              retry_count INTEGER NOT NULL DEFAULT 0,
              added_at TEXT NOT NULL DEFAULT (datetime('now')),
              completed_at TEXT,
              error_msg TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_added_at ON tasks(added_at);")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS counters (
              source TEXT PRIMARY KEY,
              last_local_id INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn write_lock(&self) -> &Mutex<()> {
        &self.write_lock
    }

    /// Inserts a PENDING task unless the URL is already PENDING or DOWNLOADING.
    pub async fn enqueue(&self, url: &str, source: Source, mode: Mode) -> StoreResult<EnqueueOutcome> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT id FROM tasks WHERE url = ? AND status IN (?, ?) LIMIT 1")
            .bind(url)
            .bind(TaskStatus::Pending.as_str())
            .bind(TaskStatus::Downloading.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = existing {
            let id: i64 = row.get("id");
            info!(url, existing = id, "duplicate task ignored");
            return Ok(EnqueueOutcome::Duplicate);
        }

        let local_id = counters::bump(&mut *tx, source).await?;
        let res = sqlx::query(
            r#"
            INSERT INTO tasks (url, source, local_id, source_prefix, mode, status)
            VALUES (?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(url)
        .bind(source.as_str())
        .bind(local_id)
        .bind(source.prefix())
        .bind(mode.as_str())
        .bind(TaskStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let id = res.last_insert_rowid();
        info!(task_id = id, url, source = source.as_str(), local_id, "task queued");
        Ok(EnqueueOutcome::Queued(id))
    }

    pub async fn get(&self, id: TaskId) -> StoreResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Newest first.
    pub async fn list_tasks(&self, limit: i64, offset: i64) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY id DESC LIMIT ? OFFSET ?"
        ))
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Lowest-id PENDING task, i.e. strict FIFO.
    pub async fn next_pending(&self) -> StoreResult<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY id ASC LIMIT 1"
        ))
        .bind(TaskStatus::Pending.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// PENDING -> DOWNLOADING. Returns false when the row is gone or no longer PENDING.
    pub async fn claim(&self, id: TaskId) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let res = sqlx::query(
            "UPDATE tasks SET status = ?, progress = 0, error_msg = NULL WHERE id = ? AND status = ?",
        )
        .bind(TaskStatus::Downloading.as_str())
        .bind(id)
        .bind(TaskStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn update(&self, id: TaskId, patch: &TaskPatch) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        apply_patch(&mut *conn, id, patch, None).await
    }

    /// Applies `patch` only while the row is still in `expected`.
    pub async fn update_if(&self, id: TaskId, expected: TaskStatus, patch: &TaskPatch) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        apply_patch(&mut *conn, id, patch, Some(expected)).await
    }

    pub async fn bump_retry(&self, id: TaskId) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE tasks SET retry_count = retry_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Back to PENDING with progress, error and completion cleared.
    pub async fn reset(&self, id: TaskId) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, progress = 0, error_msg = NULL, completed_at = NULL
            WHERE id = ?;
            "#,
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Terminal task -> PENDING with `retry_count + 1`, unless the same URL is
    /// already queued again under another id.
    pub async fn requeue(&self, id: TaskId) -> StoreResult<RequeueOutcome> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query("SELECT url, status FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(RequeueOutcome::NotFound);
        };
        let url: String = row.try_get("url")?;
        let status = parse_status(&row.try_get::<String, _>("status")?)?;
        if status.is_active() {
            return Ok(RequeueOutcome::Busy(status));
        }

        let twin = sqlx::query("SELECT id FROM tasks WHERE url = ? AND id != ? AND status IN (?, ?) LIMIT 1")
            .bind(&url)
            .bind(id)
            .bind(TaskStatus::Pending.as_str())
            .bind(TaskStatus::Downloading.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        if twin.is_some() {
            return Ok(RequeueOutcome::Duplicate);
        }

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, progress = 0, error_msg = NULL, completed_at = NULL,
                retry_count = retry_count + 1
            WHERE id = ?;
            "#,
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(task_id = id, url = %url, "task requeued");
        Ok(RequeueOutcome::Requeued)
    }

    pub async fn delete(&self, id: TaskId) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let res = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Drops every task but keeps the id sequence.
    pub async fn clear_all(&self) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().await;
        let res = sqlx::query("DELETE FROM tasks").execute(&self.pool).await?;
        warn!(removed = res.rows_affected(), "all tasks deleted");
        Ok(res.rows_affected())
    }

    /// Drops every task and restarts the id sequence at 1.
    pub async fn reset_all_and_ids(&self) -> StoreResult<()> {
        self.wipe(false).await
    }

    /// Tasks, id sequence and source counters in one transaction, so nothing
    /// enqueued concurrently can land between the task wipe and the counter reset.
    pub async fn reset_everything(&self) -> StoreResult<()> {
        self.wipe(true).await
    }

    async fn wipe(&self, counters_too: bool) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tasks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM sqlite_sequence WHERE name = 'tasks'")
            .execute(&mut *tx)
            .await?;
        if counters_too {
            sqlx::query("DELETE FROM counters").execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!(counters_too, "tasks wiped and id sequence reset");

        // VACUUM refuses to run inside a transaction; the wipe stands even if it fails.
        if let Err(e) = sqlx::query("VACUUM").execute(&self.pool).await {
            warn!(error = %e, "vacuum after wipe failed");
        }
        Ok(())
    }

    /// DOWNLOADING -> PENDING for rows orphaned by a crash. Returns how many were healed.
    pub async fn recover_stuck(&self) -> StoreResult<u64> {
        self.recover_stuck_except(None).await
    }

    /// Like [`recover_stuck`](Self::recover_stuck) but leaves `in_flight` alone.
    pub async fn recover_stuck_except(&self, in_flight: Option<TaskId>) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().await;
        let res = sqlx::query("UPDATE tasks SET status = ? WHERE status = ? AND id IS NOT ?")
            .bind(TaskStatus::Pending.as_str())
            .bind(TaskStatus::Downloading.as_str())
            .bind(in_flight)
            .execute(&self.pool)
            .await?;
        let healed = res.rows_affected();
        if healed > 0 {
            info!(healed, "recovered tasks stuck in DOWNLOADING");
        } else {
            info!("no stuck tasks");
        }
        Ok(healed)
    }
}

async fn apply_patch(
    conn: &mut SqliteConnection,
    id: TaskId,
    patch: &TaskPatch,
    expected: Option<TaskStatus>,
) -> StoreResult<bool> {
    if patch.is_empty() {
        return Ok(false);
    }

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE tasks SET ");
    {
        let mut set = qb.separated(", ");
        if let Some(status) = patch.status {
            set.push("status = ").push_bind_unseparated(status.as_str());
        }
        if let Some(progress) = patch.progress {
            set.push("progress = ").push_bind_unseparated(progress.clamp(0.0, 100.0));
        }
        if let Some(msg) = &patch.error_msg {
            set.push("error_msg = ").push_bind_unseparated(msg.clone());
        }
        if let Some(name) = &patch.filename {
            set.push("filename = ").push_bind_unseparated(name.clone());
        }
        if let Some(path) = &patch.filepath {
            set.push("filepath = ").push_bind_unseparated(path.clone());
        }
        if let Some(at) = &patch.completed_at {
            set.push("completed_at = ").push_bind_unseparated(at.clone());
        }
    }
    qb.push(" WHERE id = ").push_bind(id);
    if let Some(expected) = expected {
        qb.push(" AND status = ").push_bind(expected.as_str());
    }

    let res = qb.build().execute(&mut *conn).await?;
    Ok(res.rows_affected() > 0)
}

fn parse_status(value: &str) -> StoreResult<TaskStatus> {
    TaskStatus::parse(value).ok_or_else(|| StoreError::CorruptRow {
        table: "tasks",
        column: "status",
        value: value.to_string(),
    })
}

fn task_from_row(row: &SqliteRow) -> StoreResult<Task> {
    let status = parse_status(&row.try_get::<String, _>("status")?)?;
    let mode_s: String = row.try_get("mode")?;
    let mode = Mode::parse(&mode_s).ok_or(StoreError::CorruptRow {
        table: "tasks",
        column: "mode",
        value: mode_s.clone(),
    })?;
    let source_s: String = row.try_get("source")?;

    Ok(Task {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        source: Source::parse(&source_s),
        local_id: row.try_get("local_id")?,
        source_prefix: row.try_get("source_prefix")?,
        mode,
        status,
        progress: row.try_get("progress")?,
        retry_count: row.try_get("retry_count")?,
        filename: row.try_get("filename")?,
        filepath: row.try_get("filepath")?,
        error_msg: row.try_get("error_msg")?,
        added_at: row.try_get("added_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

/// UTC, same shape as sqlite's `datetime('now')`.
pub fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn temp_store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(&dir.path().join("queue.sqlite")).await.unwrap();
        (dir, store)
    }

    fn queued(outcome: EnqueueOutcome) -> TaskId {
        match outcome {
            EnqueueOutcome::Queued(id) => id,
            EnqueueOutcome::Duplicate => panic!("expected a new task"),
        }
    }

    #[tokio::test]
    async fn enqueue_assigns_prefix_and_local_id() {
        let (_dir, store) = temp_store().await;
        let a = queued(store.enqueue("https://a.test/1", Source::Gui, Mode::Video).await.unwrap());
        let b = queued(store.enqueue("https://a.test/2", Source::Gui, Mode::Playlist).await.unwrap());
        let c = queued(store.enqueue("https://a.test/3", Source::Ext, Mode::Video).await.unwrap());

        let b_task = store.get(b).await.unwrap().unwrap();
        assert_eq!(b_task.display_id(), "G2");
        assert_eq!(b_task.mode, Mode::Playlist);
        assert_eq!(b_task.status, TaskStatus::Pending);
        assert_eq!(store.get(c).await.unwrap().unwrap().display_id(), "E1");
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn duplicate_only_while_active() {
        let (_dir, store) = temp_store().await;
        let url = "https://dup.test/v";
        let id = queued(store.enqueue(url, Source::Api, Mode::Video).await.unwrap());
        assert_eq!(store.enqueue(url, Source::Gui, Mode::Video).await.unwrap(), EnqueueOutcome::Duplicate);

        assert!(store.claim(id).await.unwrap());
        assert_eq!(store.enqueue(url, Source::Gui, Mode::Video).await.unwrap(), EnqueueOutcome::Duplicate);

        store
            .update(id, &TaskPatch::status(TaskStatus::Error).with_error("boom"))
            .await
            .unwrap();
        assert!(matches!(
            store.enqueue(url, Source::Gui, Mode::Video).await.unwrap(),
            EnqueueOutcome::Queued(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_enqueue_of_same_url_yields_one_row() {
        let (_dir, store) = temp_store().await;
        let mut handles = Vec::new();
        for _ in 0..16 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                s.enqueue("https://race.test/x", Source::Api, Mode::Video).await.unwrap()
            }));
        }
        let mut queued_count = 0;
        for h in handles {
            if matches!(h.await.unwrap(), EnqueueOutcome::Queued(_)) {
                queued_count += 1;
            }
        }
        assert_eq!(queued_count, 1);
        assert_eq!(store.list_tasks(100, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn next_pending_is_lowest_pending_id() {
        let (_dir, store) = temp_store().await;
        let first = queued(store.enqueue("https://q.test/1", Source::Gui, Mode::Video).await.unwrap());
        let second = queued(store.enqueue("https://q.test/2", Source::Gui, Mode::Video).await.unwrap());
        let third = queued(store.enqueue("https://q.test/3", Source::Gui, Mode::Video).await.unwrap());

        assert_eq!(store.next_pending().await.unwrap().unwrap().id, first);
        store.claim(first).await.unwrap();
        assert_eq!(store.next_pending().await.unwrap().unwrap().id, second);
        store.update(second, &TaskPatch::status(TaskStatus::Completed)).await.unwrap();
        assert_eq!(store.next_pending().await.unwrap().unwrap().id, third);
        store.update(third, &TaskPatch::status(TaskStatus::Cancelled)).await.unwrap();
        assert!(store.next_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_newest_first_and_paged() {
        let (_dir, store) = temp_store().await;
        for i in 0..5 {
            store.enqueue(&format!("https://l.test/{i}"), Source::File, Mode::Video).await.unwrap();
        }
        let page = store.list_tasks(2, 1).await.unwrap();
        let ids: Vec<_> = page.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![4, 3]);
    }

    #[tokio::test]
    async fn guarded_update_skips_rows_in_other_states() {
        let (_dir, store) = temp_store().await;
        let id = queued(store.enqueue("https://g.test/1", Source::Gui, Mode::Video).await.unwrap());
        let patch = TaskPatch::status(TaskStatus::Completed).with_progress(100.0);
        assert!(!store.update_if(id, TaskStatus::Downloading, &patch).await.unwrap());
        store.claim(id).await.unwrap();
        assert!(store.update_if(id, TaskStatus::Downloading, &patch).await.unwrap());
        let t = store.get(id).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.progress, 100.0);
    }

    #[tokio::test]
    async fn reset_clears_progress_and_error() {
        let (_dir, store) = temp_store().await;
        let id = queued(store.enqueue("https://r.test/1", Source::Gui, Mode::Video).await.unwrap());
        store.claim(id).await.unwrap();
        store
            .update(id, &TaskPatch::status(TaskStatus::Error).with_progress(42.0).with_error("nope"))
            .await
            .unwrap();
        store.bump_retry(id).await.unwrap();
        assert!(store.reset(id).await.unwrap());

        let t = store.get(id).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.progress, 0.0);
        assert_eq!(t.error_msg, None);
        assert_eq!(t.retry_count, 1);
    }

    #[tokio::test]
    async fn requeue_only_finished_tasks_without_active_twin() {
        let (_dir, store) = temp_store().await;
        assert_eq!(store.requeue(99).await.unwrap(), RequeueOutcome::NotFound);

        let id = queued(store.enqueue("https://q.test/1", Source::Gui, Mode::Video).await.unwrap());
        assert_eq!(store.requeue(id).await.unwrap(), RequeueOutcome::Busy(TaskStatus::Pending));

        store.claim(id).await.unwrap();
        store.update(id, &TaskPatch::status(TaskStatus::Error).with_error("boom")).await.unwrap();
        assert_eq!(store.requeue(id).await.unwrap(), RequeueOutcome::Requeued);
        let t = store.get(id).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retry_count, 1);
        assert_eq!(t.error_msg, None);

        store.claim(id).await.unwrap();
        store.update(id, &TaskPatch::status(TaskStatus::Cancelled)).await.unwrap();
        queued(store.enqueue("https://q.test/1", Source::Api, Mode::Video).await.unwrap());
        assert_eq!(store.requeue(id).await.unwrap(), RequeueOutcome::Duplicate);
    }

    #[tokio::test]
    async fn recover_stuck_heals_only_downloading_rows() {
        let (_dir, store) = temp_store().await;
        let a = queued(store.enqueue("https://s.test/a", Source::Gui, Mode::Video).await.unwrap());
        let b = queued(store.enqueue("https://s.test/b", Source::Gui, Mode::Video).await.unwrap());
        store.claim(a).await.unwrap();
        store.claim(b).await.unwrap();
        store.update(b, &TaskPatch::status(TaskStatus::Completed)).await.unwrap();

        assert_eq!(store.recover_stuck().await.unwrap(), 1);
        assert_eq!(store.get(a).await.unwrap().unwrap().status, TaskStatus::Pending);
        assert_eq!(store.get(b).await.unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn recover_stuck_can_spare_the_in_flight_row() {
        let (_dir, store) = temp_store().await;
        let a = queued(store.enqueue("https://s.test/a", Source::Gui, Mode::Video).await.unwrap());
        let b = queued(store.enqueue("https://s.test/b", Source::Gui, Mode::Video).await.unwrap());
        store.claim(a).await.unwrap();
        store.claim(b).await.unwrap();

        assert_eq!(store.recover_stuck_except(Some(b)).await.unwrap(), 1);
        assert_eq!(store.get(a).await.unwrap().unwrap().status, TaskStatus::Pending);
        assert_eq!(store.get(b).await.unwrap().unwrap().status, TaskStatus::Downloading);
    }

    #[tokio::test]
    async fn reset_all_restarts_ids_and_clear_all_does_not() {
        let (_dir, store) = temp_store().await;
        store.enqueue("https://w.test/1", Source::Gui, Mode::Video).await.unwrap();
        store.enqueue("https://w.test/2", Source::Gui, Mode::Video).await.unwrap();

        store.clear_all().await.unwrap();
        let id = queued(store.enqueue("https://w.test/3", Source::Gui, Mode::Video).await.unwrap());
        assert_eq!(id, 3);

        store.reset_all_and_ids().await.unwrap();
        assert!(store.list_tasks(10, 0).await.unwrap().is_empty());
        let id = queued(store.enqueue("https://w.test/4", Source::Gui, Mode::Video).await.unwrap());
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let (_dir, store) = temp_store().await;
        let id = queued(store.enqueue("https://d.test/1", Source::Gui, Mode::Video).await.unwrap());
        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_reset_is_atomic_against_concurrent_enqueue() {
        let (_dir, store) = temp_store().await;
        for i in 0..500 {
            store.enqueue(&format!("https://big.test/{i}"), Source::Gui, Mode::Video).await.unwrap();
        }

        let wipe = {
            let s = store.clone();
            tokio::spawn(async move { s.reset_everything().await.unwrap() })
        };
        let late = {
            let s = store.clone();
            tokio::spawn(async move { s.enqueue("https://late.test/1", Source::Gui, Mode::Video).await.unwrap() })
        };
        wipe.await.unwrap();
        late.await.unwrap();

        let rows = store.list_tasks(1000, 0).await.unwrap();
        let counters = store.counters().await.unwrap();
        match rows.as_slice() {
            [] => assert!(counters.is_empty()),
            [t] => {
                assert_eq!(t.id, 1);
                assert_eq!(t.display_id(), "G1");
                assert_eq!(counters.len(), 1);
                assert_eq!(counters[0].last_local_id, 1);
            }
            other => panic!("rows survived the reset: {}", other.len()),
        }
    }
}
