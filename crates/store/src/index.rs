//! 去重索引与内存写缓存。
//!
//! 每个分区目录下有两类索引文件：
//! - `_index.json`：目录清单，记录每个分区的首尾时间戳与记录数，用于按时间区间筛选分区。
//! - `{period}.idx`：该分区已写入的时间戳，每条 8 字节小端 i64，只追加。
//!
//! 磁盘索引是去重的权威来源；`WriteCache` 只用于挡住"索引检查与索引更新之间"的并发重复写，
//! 随时可以清空而不影响正确性。

use crate::fs;
use crate::partition::{partition_for, period_bounds};
use crate::partition_file;
use chrono::Utc;
use dashmap::DashMap;
use footprint_core::common::{DataKind, TimeFrame};
use footprint_core::store::error::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 目录清单文件名
pub const MANIFEST_FILE: &str = "_index.json";
/// 时间戳索引扩展名
pub const TIMESTAMPS_EXT: &str = "idx";

const MANIFEST_VERSION: u32 = 1;

/// # Summary
/// 单个分区的摘要，冗余存储以便不打开数据文件即可判断时间区间。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub pattern: String,
    pub symbol: String,
    pub timeframe: String,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
    pub count: u64,
    pub updated_at: i64,
}

impl PeriodSummary {
    /// 摘要区间与查询区间是否相交。
    pub fn intersects(&self, start: Option<i64>, end: Option<i64>) -> bool {
        start.is_none_or(|s| self.last_timestamp >= s) && end.is_none_or(|e| self.first_timestamp <= e)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexManifest {
    version: u32,
    periods: BTreeMap<String, PeriodSummary>,
}

impl Default for IndexManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            periods: BTreeMap::new(),
        }
    }
}

/// 一个分区目录在内存中的索引状态。
#[derive(Default)]
struct DirIndex {
    manifest: IndexManifest,
    // 已按需加载的分区时间戳集合
    loaded: HashMap<String, HashSet<i64>>,
}

/// # Summary
/// 按分区目录组织的去重索引。
///
/// # Invariants
/// - `update_after_append` 是唯一的修改入口，只能在对应数据写入成功之后调用。
/// - 同一目录的内存状态由一把异步锁保护。
pub struct DuplicateIndex {
    dirs: DashMap<PathBuf, Arc<Mutex<DirIndex>>>,
    fsync: bool,
}

fn timestamps_path(dir: &Path, period_id: &str) -> PathBuf {
    dir.join(format!("{}.{}", period_id, TIMESTAMPS_EXT))
}

fn data_path(dir: &Path, period_id: &str) -> PathBuf {
    dir.join(format!("{}.{}", period_id, crate::partition::PARTITION_EXT))
}

fn parse_timestamps(bytes: &[u8]) -> HashSet<i64> {
    bytes
        .chunks_exact(8)
        .filter_map(|chunk| <[u8; 8]>::try_from(chunk).ok())
        .map(i64::from_le_bytes)
        .collect()
}

fn kind_of_dir(dir: &Path) -> DataKind {
    // 目录结构: .../{candles|footprints}/{timeframe}
    let is_footprint = dir
        .parent()
        .and_then(|p| p.file_name())
        .is_some_and(|n| n == DataKind::Footprint.dir_name());
    if is_footprint {
        DataKind::Footprint
    } else {
        DataKind::Candle
    }
}

/// # Summary
/// 按数据文件的实际内容修正清单中的分区摘要。
///
/// # Returns
/// 摘要有变化时返回 `true`，调用方负责落盘。
fn refresh_summary(
    state: &mut DirIndex,
    period_id: &str,
    recovery: &partition_file::Recovery,
    distinct: usize,
) -> bool {
    let (Some(first), Some(last)) = (
        recovery.timestamps.iter().min().copied(),
        recovery.timestamps.iter().max().copied(),
    ) else {
        return false;
    };
    let count = u64::try_from(distinct).unwrap_or(u64::MAX);

    if let Some(summary) = state.manifest.periods.get(period_id)
        && summary.first_timestamp == first
        && summary.last_timestamp == last
        && summary.count == count
    {
        return false;
    }

    // 清单中没有该分区时，从数据文件头补齐交易对与周期
    let (symbol, timeframe) = match &recovery.header {
        Some(h) => (h.symbol.clone(), h.interval.clone()),
        None => (String::new(), String::new()),
    };
    let pattern = timeframe
        .parse::<TimeFrame>()
        .ok()
        .and_then(|tf| partition_for(tf, first).ok())
        .map(|p| p.pattern.to_string())
        .unwrap_or_default();

    let now = Utc::now().timestamp_millis();
    let summary = state
        .manifest
        .periods
        .entry(period_id.to_string())
        .or_insert_with(|| PeriodSummary {
            pattern,
            symbol,
            timeframe,
            first_timestamp: first,
            last_timestamp: last,
            count,
            updated_at: now,
        });
    summary.first_timestamp = first;
    summary.last_timestamp = last;
    summary.count = count;
    summary.updated_at = now;
    warn!(period = period_id, first, last, count, "Refreshed stale partition summary");
    true
}

impl DuplicateIndex {
    pub fn new(fsync: bool) -> Self {
        Self {
            dirs: DashMap::new(),
            fsync,
        }
    }

    /// # Summary
    /// 获取目录的索引状态，首次访问时从 `_index.json` 加载。
    ///
    /// # Logic
    /// 清单损坏时记录日志并从空清单开始；时间戳集合仍会在加载分区时与数据文件核对。
    async fn dir_state(&self, dir: &Path) -> Result<Arc<Mutex<DirIndex>>, StoreError> {
        if let Some(state) = self.dirs.get(dir) {
            return Ok(state.clone());
        }

        let manifest = match fs::read_if_exists(&dir.join(MANIFEST_FILE)).await? {
            Some(bytes) => match serde_json::from_slice::<IndexManifest>(&bytes) {
                Ok(m) => m,
                Err(e) => {
                    warn!(dir = ?dir, error = %e, "Corrupt index manifest, starting empty");
                    IndexManifest::default()
                }
            },
            None => IndexManifest::default(),
        };

        let state = Arc::new(Mutex::new(DirIndex {
            manifest,
            loaded: HashMap::new(),
        }));
        // 并发首次加载时以先插入者为准
        let entry = self.dirs.entry(dir.to_path_buf()).or_insert(state);
        Ok(entry.clone())
    }

    /// # Summary
    /// 确保分区的时间戳集合已加载。
    ///
    /// # Logic
    /// 1. 读取 `{period}.idx`。
    /// 2. 对数据文件做一次自检（见 `partition_file::recover`），截掉崩溃留下的半截记录并修正文件头。
    /// 3. 以数据文件中实际可读的时间戳为准；与索引文件不一致（例如进程在写数据后、更新索引前崩溃）时
    ///    原子地重写索引文件，并刷新清单中该分区的摘要。
    ///
    /// 每个分区在进程内只做一次，之后只查内存集合。
    async fn ensure_loaded<'a>(
        &self,
        state: &'a mut DirIndex,
        dir: &Path,
        period_id: &str,
    ) -> Result<&'a mut HashSet<i64>, StoreError> {
        if !state.loaded.contains_key(period_id) {
            let idx_path = timestamps_path(dir, period_id);
            let indexed = fs::read_if_exists(&idx_path)
                .await?
                .map(|b| parse_timestamps(&b))
                .unwrap_or_default();

            let data = data_path(dir, period_id);
            let set = match partition_file::recover(&data, kind_of_dir(dir), self.fsync).await? {
                Some(recovery) => {
                    let on_disk: HashSet<i64> = recovery.timestamps.iter().copied().collect();
                    if on_disk != indexed {
                        info!(
                            path = ?data,
                            indexed = indexed.len(),
                            rebuilt = on_disk.len(),
                            "Rebuilt duplicate index from partition data"
                        );
                        let mut sorted: Vec<i64> = on_disk.iter().copied().collect();
                        sorted.sort_unstable();
                        let bytes: Vec<u8> = sorted.iter().flat_map(|ts| ts.to_le_bytes()).collect();
                        fs::write_atomic_with(&idx_path, &bytes, self.fsync).await?;
                    }
                    if refresh_summary(state, period_id, &recovery, on_disk.len()) {
                        self.write_manifest(state, dir).await?;
                    }
                    on_disk
                }
                None => indexed,
            };
            state.loaded.insert(period_id.to_string(), set);
        }
        state
            .loaded
            .get_mut(period_id)
            .ok_or_else(|| StoreError::Unknown(format!("index for {} not loaded", period_id)))
    }

    async fn write_manifest(&self, state: &DirIndex, dir: &Path) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&state.manifest).map_err(|e| StoreError::Unknown(e.to_string()))?;
        fs::write_atomic_with(&dir.join(MANIFEST_FILE), &bytes, self.fsync).await?;
        Ok(())
    }

    /// # Summary
    /// 判断时间戳是否已写入分区。
    ///
    /// # Arguments
    /// * `dir`: 分区目录（分区键在磁盘上的位置）。
    /// * `period_id`: 分区标识。
    /// * `timestamp`: 开盘时间。
    pub async fn is_duplicate(&self, dir: &Path, period_id: &str, timestamp: i64) -> Result<bool, StoreError> {
        let state = self.dir_state(dir).await?;
        let mut guard = state.lock().await;
        let set = self.ensure_loaded(&mut guard, dir, period_id).await?;
        Ok(set.contains(&timestamp))
    }

    /// # Summary
    /// 数据写入成功后更新索引。
    ///
    /// # Logic
    /// 1. 时间戳追加到 `{period}.idx`。
    /// 2. 更新内存中的集合与分区摘要（首尾时间戳取最小/最大）。
    /// 3. 原子地重写 `_index.json`；只有开启 fsync 时才在替换前落盘。
    pub async fn update_after_append(
        &self,
        dir: &Path,
        period_id: &str,
        pattern: &str,
        timestamp: i64,
        symbol: &str,
        timeframe: TimeFrame,
    ) -> Result<(), StoreError> {
        let state = self.dir_state(dir).await?;
        let mut guard = state.lock().await;

        let set = self.ensure_loaded(&mut guard, dir, period_id).await?;
        if !set.insert(timestamp) {
            // 加载时已从数据文件重建，说明该时间戳已被计入
            debug!(dir = ?dir, period = period_id, timestamp, "Timestamp already indexed");
        } else {
            fs::append(&timestamps_path(dir, period_id), &timestamp.to_le_bytes(), self.fsync).await?;
        }
        let count = u64::try_from(set.len()).unwrap_or(u64::MAX);

        let now = Utc::now().timestamp_millis();
        let summary = guard
            .manifest
            .periods
            .entry(period_id.to_string())
            .or_insert_with(|| PeriodSummary {
                pattern: pattern.to_string(),
                symbol: symbol.to_string(),
                timeframe: timeframe.to_string(),
                first_timestamp: timestamp,
                last_timestamp: timestamp,
                count: 0,
                updated_at: now,
            });
        summary.first_timestamp = summary.first_timestamp.min(timestamp);
        summary.last_timestamp = summary.last_timestamp.max(timestamp);
        summary.count = count;
        summary.updated_at = now;

        self.write_manifest(&guard, dir).await
    }

    /// # Summary
    /// 按时间区间筛选分区，避免逐个打开数据文件。
    ///
    /// # Logic
    /// 1. 清单中有摘要的分区用摘要的首尾时间戳判断是否相交。
    /// 2. 没有摘要的分区（例如索引丢失）退回到分区标识所代表的日历区间；
    ///    标识无法解析时保守地保留。
    ///
    /// # Returns
    /// 保持输入顺序的分区标识列表。
    pub async fn filter_periods_by_time_range(
        &self,
        dir: &Path,
        timeframe: TimeFrame,
        periods: &[String],
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<String>, StoreError> {
        if start.is_none() && end.is_none() {
            return Ok(periods.to_vec());
        }
        let state = self.dir_state(dir).await?;
        let guard = state.lock().await;

        Ok(periods
            .iter()
            .filter(|period| match guard.manifest.periods.get(period.as_str()) {
                Some(summary) => summary.intersects(start, end),
                None => match period_bounds(timeframe, period) {
                    Some((p_start, p_end)) => {
                        start.is_none_or(|s| p_end >= s) && end.is_none_or(|e| p_start <= e)
                    }
                    None => true,
                },
            })
            .cloned()
            .collect())
    }

    /// 目录清单中的全部分区摘要。
    pub async fn summaries(&self, dir: &Path) -> Result<BTreeMap<String, PeriodSummary>, StoreError> {
        let state = self.dir_state(dir).await?;
        let guard = state.lock().await;
        Ok(guard.manifest.periods.clone())
    }

    /// 丢弃全部内存状态，下次访问时从磁盘重新加载。
    pub fn clear(&self) {
        self.dirs.clear();
    }
}

#[derive(Default)]
struct CacheBucket {
    seen: HashSet<i64>,
    order: VecDeque<i64>,
}

/// # Summary
/// 最近写入的 `(分区键, 时间戳)` 内存集合。
///
/// # Invariants
/// - 每个分区键最多保留 `capacity` 个时间戳，超出时淘汰最旧的一半。
/// - 不是事实来源，清空后仅退化为依赖磁盘索引。
pub struct WriteCache {
    buckets: DashMap<String, CacheBucket>,
    capacity: usize,
}

impl WriteCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: capacity.max(2),
        }
    }

    pub fn contains(&self, key: &str, timestamp: i64) -> bool {
        self.buckets
            .get(key)
            .is_some_and(|b| b.seen.contains(&timestamp))
    }

    /// # Summary
    /// 原子地检查并插入。
    ///
    /// # Returns
    /// 新插入返回 `true`；已存在返回 `false`，调用方应视为重复写。
    pub fn insert(&self, key: &str, timestamp: i64) -> bool {
        let mut bucket = self.buckets.entry(key.to_string()).or_default();
        if !bucket.seen.insert(timestamp) {
            return false;
        }
        bucket.order.push_back(timestamp);

        if bucket.order.len() > self.capacity {
            let evict = bucket.order.len() / 2;
            for _ in 0..evict {
                if let Some(old) = bucket.order.pop_front() {
                    bucket.seen.remove(&old);
                }
            }
            debug!(key, evicted = evict, "Write cache bucket trimmed");
        }
        true
    }

    /// 写入失败时撤销插入，使重试不会被误判为重复。
    pub fn remove(&self, key: &str, timestamp: i64) {
        if let Some(mut bucket) = self.buckets.get_mut(key)
            && bucket.seen.remove(&timestamp)
        {
            bucket.order.retain(|t| *t != timestamp);
        }
    }

    pub fn len(&self, key: &str) -> usize {
        self.buckets.get(key).map(|b| b.seen.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.seen.is_empty())
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_cache_insert_is_check_and_set() {
        let cache = WriteCache::new(10);
        assert!(!cache.contains("k", 1));
        assert!(cache.insert("k", 1));
        assert!(!cache.insert("k", 1));
        assert!(cache.contains("k", 1));
        assert!(!cache.contains("other", 1));
        cache.remove("k", 1);
        assert!(!cache.contains("k", 1));
        assert!(cache.insert("k", 1));
    }

    #[test]
    fn test_write_cache_evicts_oldest_half() {
        let cache = WriteCache::new(1000);
        for ts in 0..1001 {
            assert!(cache.insert("k", ts));
        }
        assert_eq!(cache.len("k"), 501);
        assert!(!cache.contains("k", 0));
        assert!(!cache.contains("k", 499));
        assert!(cache.contains("k", 500));
        assert!(cache.contains("k", 1000));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_index_update_and_lookup_persist() {
        let dir = tempdir().unwrap();
        let part_dir = dir.path().join("binance/BTCUSDT/candles/1m");

        let index = DuplicateIndex::new(false);
        assert!(!index.is_duplicate(&part_dir, "2024-W07", 100).await.unwrap());
        index
            .update_after_append(&part_dir, "2024-W07", "YYYY-Www", 100, "BTCUSDT", TimeFrame::Minute1)
            .await
            .unwrap();
        index
            .update_after_append(&part_dir, "2024-W07", "YYYY-Www", 50, "BTCUSDT", TimeFrame::Minute1)
            .await
            .unwrap();
        assert!(index.is_duplicate(&part_dir, "2024-W07", 100).await.unwrap());

        // 新实例从磁盘加载
        let reloaded = DuplicateIndex::new(false);
        assert!(reloaded.is_duplicate(&part_dir, "2024-W07", 50).await.unwrap());
        assert!(!reloaded.is_duplicate(&part_dir, "2024-W07", 51).await.unwrap());
        let summaries = reloaded.summaries(&part_dir).await.unwrap();
        let summary = &summaries["2024-W07"];
        assert_eq!(summary.count, 2);
        assert_eq!(summary.first_timestamp, 50);
        assert_eq!(summary.last_timestamp, 100);
    }

    #[tokio::test]
    async fn test_filter_periods_by_time_range() {
        let dir = tempdir().unwrap();
        let part_dir = dir.path().join("binance/BTCUSDT/candles/1h");
        let index = DuplicateIndex::new(false);
        for (period, ts) in [("2024-01", 1_000), ("2024-02", 2_000), ("2024-03", 3_000)] {
            index
                .update_after_append(&part_dir, period, "YYYY-MM", ts, "BTCUSDT", TimeFrame::Hour1)
                .await
                .unwrap();
        }
        let periods: Vec<String> = ["2024-01", "2024-02", "2024-03"].iter().map(|s| s.to_string()).collect();

        let hit = index
            .filter_periods_by_time_range(&part_dir, TimeFrame::Hour1, &periods, Some(1_500), Some(2_500))
            .await
            .unwrap();
        assert_eq!(hit, vec!["2024-02".to_string()]);

        let hit = index
            .filter_periods_by_time_range(&part_dir, TimeFrame::Hour1, &periods, Some(2_000), None)
            .await
            .unwrap();
        assert_eq!(hit, vec!["2024-02".to_string(), "2024-03".to_string()]);

        let all = index
            .filter_periods_by_time_range(&part_dir, TimeFrame::Hour1, &periods, None, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_filter_falls_back_to_calendar_bounds() {
        let dir = tempdir().unwrap();
        let index = DuplicateIndex::new(false);
        let periods = vec!["2024".to_string(), "2025".to_string(), "junk".to_string()];
        let start_2025 = chrono::NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        let hit = index
            .filter_periods_by_time_range(dir.path(), TimeFrame::Day1, &periods, Some(start_2025), None)
            .await
            .unwrap();
        assert_eq!(hit, vec!["2025".to_string(), "junk".to_string()]);
    }

    #[tokio::test]
    async fn test_reload_refreshes_index_and_summary_from_data() {
        let dir = tempdir().unwrap();
        let part_dir = dir.path().join("binance/BTCUSDT/candles/1m");
        let data = data_path(&part_dir, "2024-W07");
        let mut candle = crate::codec::binary::tests::sample_candle();

        let index = DuplicateIndex::new(false);
        for (i, ts) in [1_000i64, 61_000].into_iter().enumerate() {
            candle.open_time = ts;
            let payload = crate::codec::envelope::encode_candle(&candle).unwrap();
            partition_file::append_record(&data, "BTCUSDT", "1m", ts, &payload, false)
                .await
                .unwrap();
            // 第二条写入数据后、更新索引前中断
            if i == 0 {
                index
                    .update_after_append(&part_dir, "2024-W07", "YYYY-Www", ts, "BTCUSDT", TimeFrame::Minute1)
                    .await
                    .unwrap();
            }
        }
        let stale = index.summaries(&part_dir).await.unwrap();
        assert_eq!(stale["2024-W07"].count, 1);

        let reloaded = DuplicateIndex::new(false);
        assert!(reloaded.is_duplicate(&part_dir, "2024-W07", 61_000).await.unwrap());
        let summaries = reloaded.summaries(&part_dir).await.unwrap();
        let summary = &summaries["2024-W07"];
        assert_eq!(summary.count, 2);
        assert_eq!(summary.first_timestamp, 1_000);
        assert_eq!(summary.last_timestamp, 61_000);

        // 清单已落盘，新实例不必再加载分区也能按区间筛选
        let fresh = DuplicateIndex::new(false);
        let periods = vec!["2024-W07".to_string()];
        let hit = fresh
            .filter_periods_by_time_range(&part_dir, TimeFrame::Minute1, &periods, Some(30_000), None)
            .await
            .unwrap();
        assert_eq!(hit, periods);
        let idx_bytes = tokio::fs::read(timestamps_path(&part_dir, "2024-W07")).await.unwrap();
        assert_eq!(idx_bytes.len(), 16);
    }
}
