//! 分层追加写存储。
//!
//! 磁盘布局：
//! ```text
//! {data_dir}/append_only/
//!   {exchange}/{symbol}/metadata.json
//!   {exchange}/{symbol}/candles/{timeframe}/{period}.bin   K 线主体
//!   {exchange}/{symbol}/candles/{timeframe}/{period}.idx   去重索引
//!   {exchange}/{symbol}/candles/{timeframe}/_index.json    分区摘要
//!   {exchange}/{symbol}/footprints/{timeframe}/...          逐价位聚合，结构相同
//! ```
//!
//! 单次写入的状态顺序：缓存检查 → 索引检查 → 缓存插入 → 追加 K 线 → 追加足迹（可选）
//! → 更新索引 → 更新元数据（可选）。

use crate::codec::FootprintRecord;
use crate::codec::envelope;
use crate::fs;
use crate::index::{DuplicateIndex, WriteCache};
use crate::partition::{self, Partition, partition_dir, partition_for, partition_key, period_from_file_name};
use crate::partition_file::{self, PartitionScan};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use footprint_core::common::{DataKind, TimeFrame};
use footprint_core::config::StoreConfig;
use footprint_core::market::entity::{AggregationBin, FootprintCandle};
use footprint_core::store::error::StoreError;
use footprint_core::store::port::{
    BatchOutcome, CandleReader, CandleStore, FindOptions, HealthStatus, SaveOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 追加写后端在数据根目录下的子目录名
pub const APPEND_ONLY_DIR: &str = "append_only";
const METADATA_FILE: &str = "metadata.json";
const HEALTH_PROBE_FILE: &str = ".health_probe";

/// 单个周期已知的开盘时间范围。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeframeRange {
    pub first_open_time: i64,
    pub last_open_time: i64,
}

/// # Summary
/// 每个交易对一份的元数据文件，记录各周期的首尾开盘时间。
///
/// # Invariants
/// - 只在写入扩展了已知范围时才更新，不随每次写入重写。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesMetadata {
    pub exchange: String,
    pub symbol: String,
    pub timeframes: BTreeMap<String, TimeframeRange>,
    pub updated_at: i64,
}

impl SeriesMetadata {
    fn new(exchange: &str, symbol: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            timeframes: BTreeMap::new(),
            updated_at: 0,
        }
    }

    /// 合并一次写入，返回范围是否被扩展。
    fn extend(&mut self, timeframe: TimeFrame, open_time: i64) -> bool {
        match self.timeframes.get_mut(timeframe.as_str()) {
            Some(range) => {
                let mut changed = false;
                if open_time < range.first_open_time {
                    range.first_open_time = open_time;
                    changed = true;
                }
                if open_time > range.last_open_time {
                    range.last_open_time = open_time;
                    changed = true;
                }
                changed
            }
            None => {
                self.timeframes.insert(
                    timeframe.to_string(),
                    TimeframeRange {
                        first_open_time: open_time,
                        last_open_time: open_time,
                    },
                );
                true
            }
        }
    }
}

// 元数据的内存副本，首次访问时从磁盘加载
type MetadataSlot = Arc<Mutex<Option<SeriesMetadata>>>;

/// # Summary
/// 分层追加写存储，写入代价与分区大小无关。
///
/// # Invariants
/// - 同一分区键的写入由一把异步锁串行化，索引只在数据追加成功后更新。
/// - 先写者胜出：相同开盘时间的后续写入被丢弃。
/// - 仅保证单进程内的并发安全。
pub struct AppendOnlyStore {
    root: PathBuf,
    index: DuplicateIndex,
    cache: WriteCache,
    locks: DashMap<String, Arc<Mutex<()>>>,
    metadata: DashMap<String, MetadataSlot>,
    fsync: bool,
}

impl AppendOnlyStore {
    /// # Summary
    /// 创建追加写存储实例。
    ///
    /// # Logic
    /// 1. 在 `data_dir` 下准备 `append_only` 子目录。
    /// 2. 内存中的索引与缓存均为惰性加载。
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let root = PathBuf::from(&config.data_dir).join(APPEND_ONLY_DIR);
        std::fs::create_dir_all(&root).map_err(|e| StoreError::InitError(format!("{}: {}", root.display(), e)))?;
        info!(root = ?root, "Append-only store opened");
        Ok(Self {
            root,
            index: DuplicateIndex::new(config.append.fsync),
            cache: WriteCache::new(config.append.write_cache_per_key),
            locks: DashMap::new(),
            metadata: DashMap::new(),
            fsync: config.append.fsync,
        })
    }

    /// 存储根目录。
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }

    fn dir(&self, exchange: &str, symbol: &str, kind: DataKind, timeframe: TimeFrame) -> PathBuf {
        partition_dir(&self.root, exchange, symbol, kind, timeframe)
    }

    /// # Summary
    /// 追加一条 K 线的足迹记录。
    ///
    /// # Returns
    /// 追加成功返回足迹目录，需要随后更新其索引；足迹分区中已有该开盘时间
    /// （上次写入在 K 线索引之后中断）时跳过追加并返回 `None`。
    async fn append_footprint(
        &self,
        candle: &FootprintCandle,
        partition: &Partition,
        fp_dir: &Path,
    ) -> Result<Option<PathBuf>, StoreError> {
        if self.index.is_duplicate(fp_dir, &partition.period_id, candle.open_time).await? {
            debug!(dir = ?fp_dir, open_time = candle.open_time, "Footprint already stored");
            return Ok(None);
        }
        let fp_payload = envelope::encode_footprint(candle.open_time, &candle.aggs)?;
        partition_file::append_record(
            &fp_dir.join(&partition.file_name),
            &candle.symbol,
            candle.timeframe.as_str(),
            candle.open_time,
            &fp_payload,
            self.fsync,
        )
        .await?;
        Ok(Some(fp_dir.to_path_buf()))
    }

    /// # Summary
    /// 在持有分区锁的情况下写入一根新 K 线。
    ///
    /// # Logic
    /// 1. 再次检查磁盘索引，覆盖锁等待期间其他写者已完成的情况。
    /// 2. 追加 K 线主体（不含价位聚合）。
    /// 3. 有非空价位时追加足迹记录到平行目录；失败时仍为已落盘的 K 线建立索引再返回错误。
    /// 4. 依次更新 K 线与足迹目录的索引。
    /// 5. 范围被扩展时更新元数据。
    async fn write_new(
        &self,
        candle: &FootprintCandle,
        partition: &Partition,
        key: &str,
        dir: &Path,
    ) -> Result<SaveOutcome, StoreError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        if self.index.is_duplicate(dir, &partition.period_id, candle.open_time).await? {
            debug!(key, open_time = candle.open_time, "Duplicate detected after lock");
            return Ok(SaveOutcome::Duplicate);
        }

        let interval = candle.timeframe.as_str();
        let payload = envelope::encode_candle(&candle.without_aggs())?;
        partition_file::append_record(
            &dir.join(&partition.file_name),
            &candle.symbol,
            interval,
            candle.open_time,
            &payload,
            self.fsync,
        )
        .await?;

        let footprint_dir = if candle.has_footprint() {
            let fp_dir = self.dir(&candle.exchange, &candle.symbol, DataKind::Footprint, candle.timeframe);
            match self.append_footprint(candle, partition, &fp_dir).await {
                Ok(appended) => appended,
                Err(e) => {
                    // K 线已落盘，先补上它的索引，重试时才会被判为重复而不是再追加一次
                    if let Err(index_err) = self
                        .index
                        .update_after_append(
                            dir,
                            &partition.period_id,
                            partition.pattern,
                            candle.open_time,
                            &candle.symbol,
                            candle.timeframe,
                        )
                        .await
                    {
                        warn!(key, open_time = candle.open_time, error = %index_err, "Failed to index candle after footprint error");
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.index
            .update_after_append(
                dir,
                &partition.period_id,
                partition.pattern,
                candle.open_time,
                &candle.symbol,
                candle.timeframe,
            )
            .await?;
        if let Some(fp_dir) = footprint_dir {
            self.index
                .update_after_append(
                    &fp_dir,
                    &partition.period_id,
                    partition.pattern,
                    candle.open_time,
                    &candle.symbol,
                    candle.timeframe,
                )
                .await?;
        }

        // 数据与索引已落盘，元数据只是摘要，失败不影响本次写入结果
        if let Err(e) = self.update_metadata(candle).await {
            warn!(
                exchange = %candle.exchange,
                symbol = %candle.symbol,
                error = %e,
                "Failed to update series metadata"
            );
        }
        Ok(SaveOutcome::Written)
    }

    async fn metadata_slot(&self, exchange: &str, symbol: &str) -> Result<MetadataSlot, StoreError> {
        let slot_key = format!("{}:{}", exchange, symbol);
        let slot = self.metadata.entry(slot_key).or_default().clone();
        {
            let mut guard = slot.lock().await;
            if guard.is_none() {
                *guard = Some(self.load_metadata(exchange, symbol).await?);
            }
        }
        Ok(slot)
    }

    fn metadata_path(&self, exchange: &str, symbol: &str) -> PathBuf {
        self.root.join(exchange).join(symbol).join(METADATA_FILE)
    }

    async fn load_metadata(&self, exchange: &str, symbol: &str) -> Result<SeriesMetadata, StoreError> {
        let path = self.metadata_path(exchange, symbol);
        match fs::read_if_exists(&path).await? {
            Some(bytes) => match serde_json::from_slice::<SeriesMetadata>(&bytes) {
                Ok(meta) => Ok(meta),
                Err(e) => {
                    warn!(path = ?path, error = %e, "Corrupt series metadata, starting empty");
                    Ok(SeriesMetadata::new(exchange, symbol))
                }
            },
            None => Ok(SeriesMetadata::new(exchange, symbol)),
        }
    }

    async fn update_metadata(&self, candle: &FootprintCandle) -> Result<(), StoreError> {
        let slot = self.metadata_slot(&candle.exchange, &candle.symbol).await?;
        let mut guard = slot.lock().await;
        let meta = guard.get_or_insert_with(|| SeriesMetadata::new(&candle.exchange, &candle.symbol));

        if !meta.extend(candle.timeframe, candle.open_time) {
            return Ok(());
        }
        meta.updated_at = Utc::now().timestamp_millis();
        let bytes = serde_json::to_vec_pretty(&*meta).map_err(|e| StoreError::Unknown(e.to_string()))?;
        fs::write_atomic(&self.metadata_path(&candle.exchange, &candle.symbol), &bytes).await?;
        debug!(exchange = %candle.exchange, symbol = %candle.symbol, "Series metadata extended");
        Ok(())
    }

    /// # Summary
    /// 读取交易对的元数据。
    ///
    /// # Returns
    /// 从未写入过的交易对返回 `None`。
    pub async fn series_metadata(&self, exchange: &str, symbol: &str) -> Result<Option<SeriesMetadata>, StoreError> {
        let slot = self.metadata_slot(exchange, symbol).await?;
        let guard = slot.lock().await;
        Ok(guard.clone().filter(|m| !m.timeframes.is_empty()))
    }

    /// # Summary
    /// 扫描一个目录下与查询区间相交的分区。
    ///
    /// # Logic
    /// 1. 列出数据文件并按分区标识排序，字典序即时间顺序。
    /// 2. 用索引摘要筛掉与区间不相交的分区。
    /// 3. 只有 `limit` 而没有起点时从最新分区向前读，凑够数量即停止。
    /// 4. 每个分区线性扫描，跳过无法解析的记录。
    ///
    /// # Returns
    /// 以开盘时间为键的记录，重复的开盘时间保留先写入的一条。
    async fn scan_dir<T, F, G>(
        &self,
        dir: &Path,
        timeframe: TimeFrame,
        options: &FindOptions,
        decode: F,
        open_time_of: G,
    ) -> Result<BTreeMap<i64, T>, StoreError>
    where
        F: Fn(&[u8]) -> Result<T, crate::codec::CodecError>,
        G: Fn(&T) -> i64,
    {
        let mut periods: Vec<String> = fs::list_file_names(dir)
            .await?
            .iter()
            .filter_map(|name| period_from_file_name(name).map(str::to_string))
            .collect();
        periods.sort();

        let periods = self
            .index
            .filter_periods_by_time_range(dir, timeframe, &periods, options.start_time, options.end_time)
            .await?;

        let newest_first = options.limit.is_some() && options.start_time.is_none();
        let ordered: Vec<&String> = if newest_first {
            periods.iter().rev().collect()
        } else {
            periods.iter().collect()
        };

        let mut out = BTreeMap::new();
        for period in ordered {
            let path = dir.join(format!("{}.{}", period, partition::PARTITION_EXT));
            let Some(scan) = partition_file::read_partition(&path, &decode).await? else {
                continue;
            };
            let PartitionScan {
                records, skipped, ..
            } = scan;
            if skipped > 0 {
                warn!(path = ?path, skipped, "Partition contained unreadable records");
            }
            for record in records {
                let ts = open_time_of(&record);
                if options.contains(ts) {
                    out.entry(ts).or_insert(record);
                }
            }
            if let Some(limit) = options.limit
                && newest_first
                && out.len() >= limit
            {
                break;
            }
        }
        Ok(out)
    }

    /// # Summary
    /// 读取 K 线主体，不合并逐价位聚合。
    ///
    /// # Returns
    /// 按开盘时间升序排列；目录不存在时为空列表。
    pub async fn find_candles_only(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: TimeFrame,
        options: &FindOptions,
    ) -> Result<Vec<FootprintCandle>, StoreError> {
        let dir = self.dir(exchange, symbol, DataKind::Candle, timeframe);
        let records = self
            .scan_dir(&dir, timeframe, options, envelope::decode_candle, |c: &FootprintCandle| c.open_time)
            .await?;
        Ok(options.apply_limit(records.into_values().collect()))
    }

    /// # Summary
    /// 读取 K 线并左连接足迹数据。
    ///
    /// # Logic
    /// 1. 读取 K 线主体并应用 `limit`。
    /// 2. 只在结果覆盖的时间范围内读取足迹分区。
    /// 3. 按开盘时间合并；没有足迹记录的 K 线原样返回。
    pub async fn find_with_footprint(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: TimeFrame,
        options: &FindOptions,
    ) -> Result<Vec<FootprintCandle>, StoreError> {
        let mut candles = self.find_candles_only(symbol, exchange, timeframe, options).await?;
        let (Some(first), Some(last)) = (candles.first(), candles.last()) else {
            return Ok(candles);
        };

        let window = FindOptions::range(first.open_time, last.open_time);
        let fp_dir = self.dir(exchange, symbol, DataKind::Footprint, timeframe);
        let footprints: HashMap<i64, Vec<AggregationBin>> = self
            .scan_dir(&fp_dir, timeframe, &window, envelope::decode_footprint, |r: &FootprintRecord| {
                r.open_time
            })
            .await?
            .into_iter()
            .map(|(ts, record)| (ts, record.aggs))
            .collect();

        for candle in candles.iter_mut() {
            if let Some(aggs) = footprints.get(&candle.open_time) {
                candle.aggs = aggs.clone();
            }
        }
        Ok(candles)
    }
}

#[async_trait]
impl CandleReader for AppendOnlyStore {
    async fn find_by_symbol(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: TimeFrame,
        options: &FindOptions,
    ) -> Result<Vec<FootprintCandle>, StoreError> {
        self.find_with_footprint(symbol, exchange, timeframe, options).await
    }

    async fn find_latest(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: TimeFrame,
    ) -> Result<Option<FootprintCandle>, StoreError> {
        let mut latest = self
            .find_with_footprint(symbol, exchange, timeframe, &FindOptions::all().with_limit(1))
            .await?;
        Ok(latest.pop())
    }

    /// 在根目录写入并删除探针文件。
    async fn health_check(&self) -> Result<HealthStatus, StoreError> {
        let probe = self.root.join(HEALTH_PROBE_FILE);
        let result = async {
            fs::write_atomic(&probe, b"ok").await?;
            tokio::fs::remove_file(&probe).await
        }
        .await;
        Ok(match result {
            Ok(()) => HealthStatus {
                healthy: true,
                backend: "append_only".to_string(),
                detail: self.root.display().to_string(),
            },
            Err(e) => {
                warn!(root = ?self.root, error = %e, "Append-only health check failed");
                HealthStatus {
                    healthy: false,
                    backend: "append_only".to_string(),
                    detail: e.to_string(),
                }
            }
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.cache.clear();
        self.index.clear();
        self.locks.clear();
        self.metadata.clear();
        info!(root = ?self.root, "Append-only store closed");
        Ok(())
    }
}

#[async_trait]
impl CandleStore for AppendOnlyStore {
    /// # Summary
    /// 保存单根 K 线。
    ///
    /// # Logic
    /// 1. 校验，失败时不做任何 I/O。
    /// 2. 内存缓存命中即视为重复。
    /// 3. 磁盘索引命中即视为重复，并回填缓存。
    /// 4. 先插入缓存再写盘，封住两个并发写者同时通过索引检查的窗口。
    /// 5. 写盘失败时撤销缓存插入，使重试可以继续。
    async fn save(&self, candle: &FootprintCandle) -> Result<SaveOutcome, StoreError> {
        candle.validate()?;

        let partition = partition_for(candle.timeframe, candle.open_time)?;
        let key = partition_key(&candle.exchange, &candle.symbol, DataKind::Candle, candle.timeframe);
        let dir = self.dir(&candle.exchange, &candle.symbol, DataKind::Candle, candle.timeframe);

        if self.cache.contains(&key, candle.open_time) {
            debug!(key = %key, open_time = candle.open_time, "Duplicate candle (cache)");
            return Ok(SaveOutcome::Duplicate);
        }
        if self.index.is_duplicate(&dir, &partition.period_id, candle.open_time).await? {
            self.cache.insert(&key, candle.open_time);
            debug!(key = %key, open_time = candle.open_time, "Duplicate candle (index)");
            return Ok(SaveOutcome::Duplicate);
        }
        if !self.cache.insert(&key, candle.open_time) {
            debug!(key = %key, open_time = candle.open_time, "Duplicate candle (concurrent)");
            return Ok(SaveOutcome::Duplicate);
        }

        let result = self.write_new(candle, &partition, &key, &dir).await;
        if result.is_err() {
            self.cache.remove(&key, candle.open_time);
        }
        result
    }

    /// # Summary
    /// 批量保存。
    ///
    /// # Logic
    /// 按分区键分组后逐条写入，同一分区的写入相邻执行；
    /// 单条失败记录日志并计入 `failed`，不影响其余记录。
    async fn save_many(&self, candles: &[FootprintCandle]) -> Result<BatchOutcome, StoreError> {
        let mut groups: BTreeMap<String, Vec<&FootprintCandle>> = BTreeMap::new();
        for candle in candles {
            let group = partition_for(candle.timeframe, candle.open_time)
                .map(|p| format!("{}:{}", candle.series(), p.period_id))
                .unwrap_or_default();
            groups.entry(group).or_default().push(candle);
        }

        let mut outcome = BatchOutcome::default();
        for candle in groups.into_values().flatten() {
            match self.save(candle).await {
                Ok(result) => outcome.record(result),
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        exchange = %candle.exchange,
                        symbol = %candle.symbol,
                        timeframe = %candle.timeframe,
                        open_time = candle.open_time,
                        error = %e,
                        "Failed to save candle in batch"
                    );
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

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_extends_only_on_new_range() {
        let mut meta = SeriesMetadata::new("binance", "BTCUSDT");
        assert!(meta.extend(TimeFrame::Minute1, 1_000));
        assert!(!meta.extend(TimeFrame::Minute1, 1_000));
        assert!(meta.extend(TimeFrame::Minute1, 2_000));
        assert!(meta.extend(TimeFrame::Minute1, 500));
        assert!(!meta.extend(TimeFrame::Minute1, 1_500));
        assert!(meta.extend(TimeFrame::Hour1, 1_500));

        let range = meta.timeframes["1m"];
        assert_eq!(range.first_open_time, 500);
        assert_eq!(range.last_open_time, 2_000);
        assert_eq!(meta.timeframes.len(), 2);
    }
}
