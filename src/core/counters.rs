//! Per-source sequence numbers behind the short ids (`G7`, `E3`, ...).
//!
//! Counters share the task store's pool and write lock; a row is created the
//! first time a source allocates and removed again by a full reset.

use crate::core::error::StoreResult;
use crate::core::model::{Source, SourceCounter};
use crate::core::store::TaskStore;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::info;

/// Read-increment-write in one statement. Callers must hold the store's write lock.
pub(crate) async fn bump(conn: &mut SqliteConnection, source: Source) -> StoreResult<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO counters (source, last_local_id) VALUES (?, 1)
        ON CONFLICT(source) DO UPDATE SET last_local_id = last_local_id + 1
        RETURNING last_local_id;
        "#,
    )
    .bind(source.as_str())
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.try_get::<i64, _>("last_local_id")?)
}

impl TaskStore {
    /// Allocates the next local id for `source`, starting at 1.
    pub async fn next_local_id(&self, source: Source) -> StoreResult<i64> {
        let _guard = self.write_lock().lock().await;
        let mut conn = self.pool().acquire().await?;
        bump(&mut *conn, source).await
    }

    pub async fn reset_counters(&self) -> StoreResult<()> {
        let _guard = self.write_lock().lock().await;
        sqlx::query("DELETE FROM counters").execute(self.pool()).await?;
        info!("source counters reset");
        Ok(())
    }

    pub async fn counters(&self) -> StoreResult<Vec<SourceCounter>> {
        let rows = sqlx::query("SELECT source, last_local_id FROM counters ORDER BY source ASC")
            .fetch_all(self.pool())
            .await?;
        rows.into_iter()
            .map(|r| -> StoreResult<SourceCounter> {
                Ok(SourceCounter {
                    source: r.try_get("source")?,
                    last_local_id: r.try_get("last_local_id")?,
                })
            })
            .collect()
    }
}
