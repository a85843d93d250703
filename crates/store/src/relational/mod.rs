//! 压缩行存储：每根 K 线一行，`data` 列保存压缩信封。
//!
//! 行 id 为 `exchange:symbol:timeframe:openTime`，相同 id 的写入按"后写者胜出"覆盖。

pub mod query;
pub mod readonly;
pub mod shard;

pub use readonly::ReadOnlyRelationalStore;

use crate::codec::envelope;
use async_trait::async_trait;
use chrono::Utc;
use footprint_core::common::TimeFrame;
use footprint_core::config::StoreConfig;
use footprint_core::market::entity::FootprintCandle;
use footprint_core::store::error::StoreError;
use footprint_core::store::port::{
    AggregateQuery, AggregateRow, BatchOutcome, CandleAnalytics, CandleFilter, CandleReader, CandleStore,
    FindOptions, HealthStatus, SaveOutcome, StorageSummary,
};
use shard::ShardSet;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// 关系型后端在数据根目录下的子目录名
pub const RELATIONAL_DIR: &str = "relational";

pub(crate) const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS candles (
        id TEXT PRIMARY KEY,
        exchange TEXT NOT NULL,
        symbol TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        open_time INTEGER NOT NULL,
        data BLOB NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_candles_series
        ON candles (symbol, exchange, timeframe, open_time);
"#;

// 内容完全相同的覆盖不计为写入，用于区分 Written 与 Duplicate
const UPSERT_SQL: &str = r#"
    INSERT INTO candles (id, exchange, symbol, timeframe, open_time, data, created_at)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        data = excluded.data,
        created_at = excluded.created_at
    WHERE candles.data <> excluded.data
"#;

/// K 线行 id。
pub fn candle_id(candle: &FootprintCandle) -> String {
    format!(
        "{}:{}:{}:{}",
        candle.exchange, candle.symbol, candle.timeframe, candle.open_time
    )
}

pub(crate) fn relational_path(config: &StoreConfig) -> PathBuf {
    PathBuf::from(&config.data_dir).join(RELATIONAL_DIR)
}

async fn health_of(shards: &ShardSet, backend: &str) -> HealthStatus {
    let pools = match shards.pools_for(None).await {
        Ok(pools) => pools,
        Err(e) => {
            return HealthStatus {
                healthy: false,
                backend: backend.to_string(),
                detail: e.to_string(),
            };
        }
    };
    for pool in &pools {
        if let Err(e) = sqlx::query("SELECT 1").execute(pool).await {
            warn!(error = %e, "Relational health check failed");
            return HealthStatus {
                healthy: false,
                backend: backend.to_string(),
                detail: e.to_string(),
            };
        }
    }
    HealthStatus {
        healthy: true,
        backend: backend.to_string(),
        detail: format!("{} database(s) at {}", pools.len(), shards.base_path().display()),
    }
}

/// # Summary
/// 压缩行存储的读写实例。
///
/// # Invariants
/// - 同一 id 只有一行；重复写入相同内容为 `Duplicate`，不同内容覆盖旧行。
/// - 批量写入按分库分组，每 `batch_size` 行一个事务。
pub struct RelationalStore {
    shards: ShardSet,
}

impl RelationalStore {
    /// # Summary
    /// 创建读写实例。
    ///
    /// # Logic
    /// 只准备目录，分库在首次访问时创建。
    pub async fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let base_path = relational_path(config);
        tokio::fs::create_dir_all(&base_path)
            .await
            .map_err(|e| StoreError::InitError(format!("{}: {}", base_path.display(), e)))?;
        info!(path = ?base_path, shard_mode = ?config.relational.shard_mode, "Relational store opened");
        Ok(Self {
            shards: ShardSet::new(base_path, config.relational.clone(), false),
        })
    }

    async fn upsert(
        executor: &mut Transaction<'_, Sqlite>,
        candle: &FootprintCandle,
        data: &[u8],
        now: i64,
    ) -> Result<SaveOutcome, sqlx::Error> {
        let result = sqlx::query(UPSERT_SQL)
            .bind(candle_id(candle))
            .bind(&candle.exchange)
            .bind(&candle.symbol)
            .bind(candle.timeframe.as_str())
            .bind(candle.open_time)
            .bind(data)
            .bind(now)
            .execute(&mut **executor)
            .await?;
        Ok(if result.rows_affected() > 0 {
            SaveOutcome::Written
        } else {
            SaveOutcome::Duplicate
        })
    }

    /// # Summary
    /// 在单个事务中写入一组已编码的 K 线。
    ///
    /// # Returns
    /// 事务失败时整组回滚，由调用方计入 `failed`。
    async fn write_chunk(
        pool: &SqlitePool,
        chunk: &[(&FootprintCandle, Vec<u8>)],
    ) -> Result<BatchOutcome, sqlx::Error> {
        let now = Utc::now().timestamp_millis();
        let mut tx = pool.begin().await?;
        let mut outcome = BatchOutcome::default();
        for (candle, data) in chunk {
            outcome.record(Self::upsert(&mut tx, candle, data, now).await?);
        }
        tx.commit().await?;
        Ok(outcome)
    }
}

#[async_trait]
impl CandleReader for RelationalStore {
    async fn find_by_symbol(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: TimeFrame,
        options: &FindOptions,
    ) -> Result<Vec<FootprintCandle>, StoreError> {
        self.shards.query_series(symbol, exchange, timeframe, options).await
    }

    async fn find_latest(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: TimeFrame,
    ) -> Result<Option<FootprintCandle>, StoreError> {
        self.shards.query_latest(symbol, exchange, timeframe).await
    }

    async fn health_check(&self) -> Result<HealthStatus, StoreError> {
        Ok(health_of(&self.shards, "relational").await)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.shards.close().await;
        Ok(())
    }
}

#[async_trait]
impl CandleStore for RelationalStore {
    async fn save(&self, candle: &FootprintCandle) -> Result<SaveOutcome, StoreError> {
        candle.validate()?;
        let data = envelope::encode_candle(candle)?;
        let pool = self.shards.writable_pool(&candle.exchange).await?;

        let mut tx = pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;
        let outcome = Self::upsert(&mut tx, candle, &data, Utc::now().timestamp_millis())
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;

        if outcome == SaveOutcome::Duplicate {
            debug!(id = %candle_id(candle), "Identical candle already stored");
        }
        Ok(outcome)
    }

    /// # Summary
    /// 批量写入。
    ///
    /// # Logic
    /// 1. 逐条校验并编码，失败的计入 `failed`。
    /// 2. 按分库分组。
    /// 3. 每组切成 `batch_size` 大小的块，每块一个事务；失败的块整体计入 `failed`，
    ///    已提交的块不受影响。
    async fn save_many(&self, candles: &[FootprintCandle]) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        let mut groups: BTreeMap<String, Vec<(&FootprintCandle, Vec<u8>)>> = BTreeMap::new();

        for candle in candles {
            let encoded = candle
                .validate()
                .and_then(|_| envelope::encode_candle(candle).map_err(StoreError::from));
            match encoded {
                Ok(data) => groups
                    .entry(self.shards.shard_for(&candle.exchange))
                    .or_default()
                    .push((candle, data)),
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        exchange = %candle.exchange,
                        symbol = %candle.symbol,
                        open_time = candle.open_time,
                        error = %e,
                        "Rejected candle in batch"
                    );
                }
            }
        }

        let batch_size = self.shards.config().batch_size.max(1);
        for (shard, rows) in groups {
            let pool = match self.shards.pool(&shard, true).await {
                Ok(Some(pool)) => pool,
                Ok(None) => {
                    outcome.failed += rows.len();
                    continue;
                }
                Err(e) => {
                    warn!(shard = %shard, error = %e, "Failed to open shard for batch");
                    outcome.failed += rows.len();
                    continue;
                }
            };
            for chunk in rows.chunks(batch_size) {
                match Self::write_chunk(&pool, chunk).await {
                    Ok(written) => outcome.merge(written),
                    Err(e) => {
                        warn!(shard = %shard, rows = chunk.len(), error = %e, "Batch transaction failed");
                        outcome.failed += chunk.len();
                    }
                }
            }
        }

        debug!(
            written = outcome.written,
            duplicates = outcome.duplicates,
            failed = outcome.failed,
            "Batch saved"
        );
        Ok(outcome)
    }

    /// 触发一次被动 WAL checkpoint；数据在提交时已经持久化。
    async fn flush(&self) -> Result<(), StoreError> {
        for pool in self.shards.pools_for(None).await? {
            sqlx::query("PRAGMA wal_checkpoint(PASSIVE)")
                .execute(&pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl CandleAnalytics for RelationalStore {
    async fn find_with_filter(&self, filter: &CandleFilter) -> Result<Vec<FootprintCandle>, StoreError> {
        self.shards.query_filter(filter).await
    }

    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<AggregateRow>, StoreError> {
        self.shards.query_aggregate(query).await
    }

    async fn find_cross_symbol(
        &self,
        symbols: &[String],
        exchange: &str,
        timeframe: TimeFrame,
        start_time: i64,
        end_time: i64,
    ) -> Result<BTreeMap<String, Vec<FootprintCandle>>, StoreError> {
        self.shards
            .query_cross_symbol(symbols, exchange, timeframe, start_time, end_time)
            .await
    }

    async fn list_symbols(&self, exchange: Option<&str>) -> Result<Vec<String>, StoreError> {
        self.shards.query_symbols(exchange).await
    }

    async fn get_storage_summary(&self) -> Result<StorageSummary, StoreError> {
        self.shards.query_summary().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::binary::tests::sample_candle;

    #[test]
    fn test_candle_id_format() {
        let candle = sample_candle();
        assert_eq!(candle_id(&candle), "binance:BTCUSDT:1m:1700000040000");
    }
}
