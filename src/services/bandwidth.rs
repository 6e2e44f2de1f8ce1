//! Bandwidth accounting hook: per-UTC-day running totals of bytes served.

use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct BandwidthLedger {
    db: Arc<SqlitePool>,
}

impl BandwidthLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Add `bytes` to today's total. Accounting never fails a request:
    /// errors are logged and dropped.
    pub async fn record(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let day = Utc::now().date_naive();
        if let Err(err) = self.add(day, bytes).await {
            warn!(error = %err, bytes, "failed to record bandwidth");
        }
    }

    pub async fn total_for(&self, day: NaiveDate) -> sqlx::Result<u64> {
        let total: Option<i64> =
            sqlx::query_scalar("SELECT total_bytes FROM bandwidth_daily WHERE day = ?")
                .bind(day.to_string())
                .fetch_optional(&*self.db)
                .await?;
        Ok(total.unwrap_or(0).max(0) as u64)
    }

    async fn add(&self, day: NaiveDate, bytes: u64) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bandwidth_daily (day, total_bytes) VALUES (?, ?)
            ON CONFLICT(day) DO UPDATE SET total_bytes = total_bytes + excluded.total_bytes
            "#,
        )
        .bind(day.to_string())
        .bind(i64::try_from(bytes).unwrap_or(i64::MAX))
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn accumulates_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = BandwidthLedger::new(test_pool(dir.path()).await);
        ledger.record(100).await;
        ledger.record(23).await;
        ledger.record(0).await;
        let today = Utc::now().date_naive();
        assert_eq!(ledger.total_for(today).await.unwrap(), 123);
        assert_eq!(ledger.total_for(today.pred_opt().unwrap()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_pool(dir.path()).await;
        sqlx::query("DROP TABLE bandwidth_daily")
            .execute(&*db)
            .await
            .unwrap();
        BandwidthLedger::new(db).record(42).await;
    }
}
