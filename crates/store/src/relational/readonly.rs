use super::shard::ShardSet;
use super::{health_of, relational_path};
use async_trait::async_trait;
use footprint_core::common::TimeFrame;
use footprint_core::config::StoreConfig;
use footprint_core::market::entity::FootprintCandle;
use footprint_core::store::error::StoreError;
use footprint_core::store::port::{
    AggregateQuery, AggregateRow, BatchOutcome, CandleAnalytics, CandleFilter, CandleReader, CandleStore,
    FindOptions, HealthStatus, SaveOutcome, StorageSummary,
};
use std::collections::BTreeMap;
use tracing::info;

/// # Summary
/// 关系型存储的只读实例，供分析查询在写者活跃时并发访问同一批库文件。
///
/// # Invariants
/// - 以只读方式打开连接，不创建库文件，不执行建表。
/// - 任何写操作返回 `StoreError::ReadOnly`。
pub struct ReadOnlyRelationalStore {
    shards: ShardSet,
}

impl ReadOnlyRelationalStore {
    pub fn new(config: &StoreConfig) -> Self {
        let base_path = relational_path(config);
        info!(path = ?base_path, "Read-only relational store opened");
        Self {
            shards: ShardSet::new(base_path, config.relational.clone(), true),
        }
    }
}

#[async_trait]
impl CandleReader for ReadOnlyRelationalStore {
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
        Ok(health_of(&self.shards, "relational_read_only").await)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.shards.close().await;
        Ok(())
    }
}

#[async_trait]
impl CandleStore for ReadOnlyRelationalStore {
    async fn save(&self, _candle: &FootprintCandle) -> Result<SaveOutcome, StoreError> {
        Err(StoreError::ReadOnly)
    }

    async fn save_many(&self, _candles: &[FootprintCandle]) -> Result<BatchOutcome, StoreError> {
        Err(StoreError::ReadOnly)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl CandleAnalytics for ReadOnlyRelationalStore {
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
