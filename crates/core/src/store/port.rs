use super::error::StoreError;
use crate::common::TimeFrame;
use crate::market::entity::FootprintCandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// # Summary
/// 按交易对查询时的可选条件。
///
/// # Invariants
/// - `start_time` / `end_time` 均为闭区间边界 (Unix 毫秒)。
/// - 有 `start_time` 时 `limit` 保留起点之后的前 N 根，否则保留最近的 N 根。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindOptions {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: Option<usize>,
}

impl FindOptions {
    /// 不带任何条件，返回完整序列。
    pub fn all() -> Self {
        Self::default()
    }

    /// 指定时间区间。
    pub fn range(start_time: i64, end_time: i64) -> Self {
        Self {
            start_time: Some(start_time),
            end_time: Some(end_time),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// 时间戳是否落在查询区间内。
    pub fn contains(&self, open_time: i64) -> bool {
        self.start_time.is_none_or(|s| open_time >= s) && self.end_time.is_none_or(|e| open_time <= e)
    }

    /// # Summary
    /// 对已按开盘时间升序排列的结果应用 `limit`。
    ///
    /// # Logic
    /// 1. 无 `limit` 时原样返回。
    /// 2. 有 `start_time` 时截取前 N 根。
    /// 3. 否则丢弃最旧的部分，只保留最近 N 根。
    pub fn apply_limit<T>(&self, mut items: Vec<T>) -> Vec<T> {
        let Some(limit) = self.limit else {
            return items;
        };
        if items.len() <= limit {
            return items;
        }
        if self.start_time.is_some() {
            items.truncate(limit);
            items
        } else {
            items.split_off(items.len() - limit)
        }
    }
}

/// 单次写入的结果。重复写入是一个确定的空操作，不是错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    Duplicate,
}

/// # Summary
/// 批量写入的统计结果。
///
/// # Invariants
/// - `written + duplicates + failed` 等于输入条数。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub written: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn record(&mut self, outcome: SaveOutcome) {
        match outcome {
            SaveOutcome::Written => self.written += 1,
            SaveOutcome::Duplicate => self.duplicates += 1,
        }
    }

    pub fn merge(&mut self, other: BatchOutcome) {
        self.written += other.written;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.written + self.duplicates + self.failed
    }
}

/// 存活检查结果。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub backend: String,
    pub detail: String,
}

/// # Summary
/// K 线存储的只读契约，所有后端（包括只读实例）都实现。
///
/// # Invariants
/// - 读路径上文件或分区不存在时返回空结果，不返回错误。
/// - 单条损坏记录被跳过并记录日志，不影响其余记录的读取。
#[async_trait]
pub trait CandleReader: Send + Sync {
    /// # Summary
    /// 读取一条序列的 K 线。
    ///
    /// # Arguments
    /// * `symbol`: 交易对。
    /// * `exchange`: 交易所。
    /// * `timeframe`: K 线周期。
    /// * `options`: 时间区间与数量限制。
    ///
    /// # Returns
    /// 按开盘时间升序排列的 K 线列表。
    async fn find_by_symbol(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: TimeFrame,
        options: &FindOptions,
    ) -> Result<Vec<FootprintCandle>, StoreError>;

    /// # Summary
    /// 读取序列中最新的一根 K 线。
    ///
    /// # Returns
    /// 序列为空时返回 `None`。
    async fn find_latest(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: TimeFrame,
    ) -> Result<Option<FootprintCandle>, StoreError>;

    /// 存活检查。
    async fn health_check(&self) -> Result<HealthStatus, StoreError>;

    /// # Summary
    /// 释放底层资源。
    ///
    /// # Logic
    /// 对于有缓冲的后端，关闭前先落盘。
    async fn close(&self) -> Result<(), StoreError>;
}

/// # Summary
/// K 线存储契约，三种后端以相同语义实现。
///
/// # Invariants
/// - 同一 `(exchange, symbol, timeframe, open_time)` 最多持久化一次。
/// - 未收盘的 K 线永远不会被写入。
#[async_trait]
pub trait CandleStore: CandleReader {
    /// # Summary
    /// 保存单根 K 线。
    ///
    /// # Logic
    /// 1. 调用 `FootprintCandle::validate`，失败时不做任何 I/O。
    /// 2. 由后端完成去重与持久化。
    ///
    /// # Returns
    /// `Written` 或 `Duplicate`；磁盘或数据库故障原样返回。
    async fn save(&self, candle: &FootprintCandle) -> Result<SaveOutcome, StoreError>;

    /// # Summary
    /// 批量保存 K 线。
    ///
    /// # Logic
    /// 单根失败只计入 `failed` 并记录日志，不回滚已成功的写入，也不中断后续写入。
    ///
    /// # Returns
    /// 批量统计结果。
    async fn save_many(&self, candles: &[FootprintCandle]) -> Result<BatchOutcome, StoreError>;

    /// 将缓冲中的写入落盘；立即持久化的后端为空操作。
    async fn flush(&self) -> Result<(), StoreError>;
}

/// 排序方向。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// # Summary
/// 高级过滤条件，仅关系型后端支持。
///
/// # Invariants
/// - `symbols` 为空表示不限交易对。
/// - `offset` / `limit` 在排序之后生效。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleFilter {
    pub symbols: Vec<String>,
    pub exchange: Option<String>,
    pub timeframe: Option<TimeFrame>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order: SortOrder,
}

/// 分组聚合的过滤条件。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub symbols: Vec<String>,
    pub exchange: Option<String>,
    pub timeframe: Option<TimeFrame>,
    // 只返回记录数不少于该值的分组
    pub min_count: Option<u64>,
}

/// 按 (symbol, exchange, timeframe) 分组的聚合结果。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub symbol: String,
    pub exchange: String,
    pub timeframe: TimeFrame,
    pub count: u64,
    pub earliest: i64,
    pub latest: i64,
}

/// 存储整体概况。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSummary {
    pub total_candles: u64,
    pub series: u64,
    pub databases: u64,
    pub size_bytes: u64,
    pub earliest: Option<i64>,
    pub latest: Option<i64>,
}

/// # Summary
/// 关系型后端的分析扩展，读写实例与只读实例均实现。
#[async_trait]
pub trait CandleAnalytics: Send + Sync {
    /// 按高级条件过滤。
    async fn find_with_filter(&self, filter: &CandleFilter) -> Result<Vec<FootprintCandle>, StoreError>;

    /// 分组统计数量与最早/最晚开盘时间。
    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<AggregateRow>, StoreError>;

    /// # Summary
    /// 跨交易对查询同一时间窗口。
    ///
    /// # Returns
    /// 交易对到其 K 线列表的映射；没有数据的交易对映射到空列表。
    async fn find_cross_symbol(
        &self,
        symbols: &[String],
        exchange: &str,
        timeframe: TimeFrame,
        start_time: i64,
        end_time: i64,
    ) -> Result<BTreeMap<String, Vec<FootprintCandle>>, StoreError>;

    /// 列出去重后的交易对，可按交易所过滤。
    async fn list_symbols(&self, exchange: Option<&str>) -> Result<Vec<String>, StoreError>;

    /// 存储概况。
    async fn get_storage_summary(&self) -> Result<StorageSummary, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_limit_keeps_latest_without_start() {
        let opts = FindOptions::all().with_limit(2);
        assert_eq!(opts.apply_limit(vec![1, 2, 3, 4]), vec![3, 4]);
    }

    #[test]
    fn test_apply_limit_keeps_first_with_start() {
        let opts = FindOptions {
            start_time: Some(1),
            end_time: None,
            limit: Some(2),
        };
        assert_eq!(opts.apply_limit(vec![1, 2, 3, 4]), vec![1, 2]);
        assert_eq!(opts.apply_limit(vec![1]), vec![1]);
    }

    #[test]
    fn test_contains_is_inclusive() {
        let opts = FindOptions::range(10, 20);
        assert!(opts.contains(10));
        assert!(opts.contains(20));
        assert!(!opts.contains(9));
        assert!(!opts.contains(21));
        assert!(FindOptions::all().contains(i64::MIN));
    }

    #[test]
    fn test_batch_outcome_accounting() {
        let mut outcome = BatchOutcome::default();
        outcome.record(SaveOutcome::Written);
        outcome.record(SaveOutcome::Duplicate);
        outcome.failed += 1;
        let mut total = BatchOutcome::default();
        total.merge(outcome);
        assert_eq!(total.total(), 3);
        assert_eq!(total.written, 1);
    }
}
