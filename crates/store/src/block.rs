//! 整块二进制存储：每条序列一个文件，内存中攒批后整文件替换。
//!
//! ```text
//! 文件: [magic "FPBK"][u16 version][u16 reserved][u32 block_size][u32 block_count][块帧]...
//! 块帧: 魔数 "FPBF" 的 codec::frame 帧，负载为 [u32 count][条目帧] x count
//! 条目帧: 魔数 "FPRM" 的 codec::frame 帧，负载为 binary 编码的 K 线
//! ```
//!
//! 条目各自带 CRC，块帧校验失败时仍能从中找回完好的 K 线。
//!
//! 适合写入频率较低的交易对：每次落盘都重写整个文件，换取读取时无需任何索引。

use crate::codec::CodecError;
use crate::codec::binary;
use crate::codec::frame::{FRAME_HEADER_SIZE, FrameIter, RECORD_MAGIC, encode_frame};
use crate::fs;
use async_trait::async_trait;
use bytes::{Buf, BufMut};
use dashmap::DashMap;
use footprint_core::common::{SeriesKey, TimeFrame};
use footprint_core::config::StoreConfig;
use footprint_core::market::entity::FootprintCandle;
use footprint_core::store::error::StoreError;
use footprint_core::store::port::{
    BatchOutcome, CandleReader, CandleStore, FindOptions, HealthStatus, SaveOutcome,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 整块后端在数据根目录下的子目录名
pub const BLOCK_DIR: &str = "block";
pub const BLOCK_EXT: &str = "fpb";
const BLOCK_MAGIC: [u8; 4] = *b"FPBK";
const BLOCK_FRAME_MAGIC: [u8; 4] = *b"FPBF";
const BLOCK_VERSION: u16 = 2;
const FILE_HEADER_SIZE: usize = 16;
const HEALTH_PROBE_FILE: &str = ".health_probe";

#[derive(Default)]
struct SeriesState {
    candles: BTreeMap<i64, FootprintCandle>,
    // 内存中有尚未落盘的修改
    dirty: bool,
    // 上次落盘之后新增的 K 线数
    pending: usize,
    // 已被逐出缓存；持有旧引用的写者需要重新获取
    evicted: bool,
}

struct CachedSeries {
    last_access: AtomicU64,
    state: Mutex<SeriesState>,
}

/// # Summary
/// 编码整个序列文件。
///
/// # Logic
/// K 线按开盘时间升序切成 `block_size` 大小的块，每块一个带 CRC 的帧。
fn encode_series(candles: &BTreeMap<i64, FootprintCandle>, block_size: usize) -> Result<Vec<u8>, CodecError> {
    let values: Vec<&FootprintCandle> = candles.values().collect();
    let blocks: Vec<&[&FootprintCandle]> = values.chunks(block_size.max(1)).collect();

    let mut out = Vec::with_capacity(FILE_HEADER_SIZE);
    out.put_slice(&BLOCK_MAGIC);
    out.put_u16_le(BLOCK_VERSION);
    out.put_u16_le(0);
    out.put_u32_le(u32::try_from(block_size).map_err(|e| CodecError::Invalid(e.to_string()))?);
    out.put_u32_le(u32::try_from(blocks.len()).map_err(|e| CodecError::Invalid(e.to_string()))?);

    for block in blocks {
        let mut payload = Vec::new();
        payload.put_u32_le(u32::try_from(block.len()).map_err(|e| CodecError::Invalid(e.to_string()))?);
        for candle in block {
            payload.extend(encode_frame(RECORD_MAGIC, &binary::encode_candle(candle)?)?);
        }
        out.extend(encode_frame(BLOCK_FRAME_MAGIC, &payload)?);
    }
    Ok(out)
}

/// 逐个校验并解码条目帧，返回成功解码的 K 线与被跳过的条数。
fn decode_entries(path: &Path, entries: &[u8]) -> (Vec<FootprintCandle>, usize) {
    let mut candles = Vec::new();
    let mut skipped = 0;
    for entry in FrameIter::new(entries, RECORD_MAGIC) {
        match entry.and_then(binary::decode_candle) {
            Ok(candle) => candles.push(candle),
            Err(e) => {
                skipped += 1;
                warn!(path = ?path, error = %e, "Skipping unreadable candle in block");
            }
        }
    }
    (candles, skipped)
}

/// 解码一个已通过校验的块。
fn decode_block(path: &Path, mut payload: &[u8]) -> Result<Vec<FootprintCandle>, CodecError> {
    if payload.remaining() < 4 {
        return Err(CodecError::Truncated {
            needed: 4,
            remaining: payload.remaining(),
        });
    }
    let count = payload.get_u32_le();
    let (candles, skipped) = decode_entries(path, payload);
    if usize::try_from(count).is_ok_and(|count| count != candles.len() + skipped) {
        warn!(path = ?path, count, decoded = candles.len(), skipped, "Block entry count mismatch");
    }
    Ok(candles)
}

/// 从校验失败的块帧原始字节中找回仍能通过条目校验的 K 线。
fn salvage_block(path: &Path, damaged: &[u8]) -> Vec<FootprintCandle> {
    let entries = damaged.get(FRAME_HEADER_SIZE + 4..).unwrap_or_default();
    decode_entries(path, entries).0
}

/// # Summary
/// 解码整个序列文件。
///
/// # Logic
/// 1. 文件头损坏时记录日志后仍尝试读取其后的块。
/// 2. 块帧校验失败时逐条校验其中的条目帧，只丢弃损坏的 K 线。
/// 3. 块内单条损坏的 K 线单独跳过；开盘时间重复时保留先出现的一条。
fn decode_series(path: &Path, data: &[u8]) -> BTreeMap<i64, FootprintCandle> {
    let header_ok = data.get(..4).is_some_and(|m| m == BLOCK_MAGIC.as_slice()) && data.len() >= FILE_HEADER_SIZE;
    if !header_ok {
        warn!(path = ?path, "Unreadable block file header, scanning blocks anyway");
    }

    let mut out = BTreeMap::new();
    let mut frames = FrameIter::new(data.get(FILE_HEADER_SIZE..).unwrap_or_default(), BLOCK_FRAME_MAGIC);
    let mut position = 0usize;
    while let Some(frame) = frames.next() {
        let candles = match frame {
            Ok(payload) => decode_block(path, payload).unwrap_or_else(|e| {
                warn!(path = ?path, block = position, error = %e, "Skipping unreadable block");
                Vec::new()
            }),
            Err(e) => {
                let salvaged = salvage_block(path, frames.damaged());
                warn!(
                    path = ?path,
                    block = position,
                    error = %e,
                    salvaged = salvaged.len(),
                    "Block failed verification, keeping entries that still verify"
                );
                salvaged
            }
        };
        for candle in candles {
            out.entry(candle.open_time).or_insert(candle);
        }
        position += 1;
    }
    if frames.truncated_tail() {
        let salvaged = salvage_block(path, frames.damaged());
        warn!(path = ?path, salvaged = salvaged.len(), "Partial trailing block, keeping complete entries");
        for candle in salvaged {
            out.entry(candle.open_time).or_insert(candle);
        }
    }
    out
}

/// # Summary
/// 整块二进制存储。
///
/// # Invariants
/// - 先写者胜出：同一开盘时间只保留第一次写入。
/// - 缓存最多保留 `max_cached_series` 条序列，逐出前先落盘脏数据。
/// - 某条序列未落盘的 K 线数达到 `block_size` 时自动落盘。
pub struct BlockStore {
    root: PathBuf,
    block_size: usize,
    max_cached_series: usize,
    cache: DashMap<SeriesKey, Arc<CachedSeries>>,
    clock: AtomicU64,
}

impl BlockStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let root = PathBuf::from(&config.data_dir).join(BLOCK_DIR);
        std::fs::create_dir_all(&root).map_err(|e| StoreError::InitError(format!("{}: {}", root.display(), e)))?;
        info!(root = ?root, block_size = config.block.block_size, "Block store opened");
        Ok(Self {
            root,
            block_size: config.block.block_size.max(1),
            max_cached_series: config.block.max_cached_series.max(1),
            cache: DashMap::new(),
            clock: AtomicU64::new(0),
        })
    }

    /// 序列文件路径：`{root}/{exchange}/{symbol}/{timeframe}.fpb`。
    pub fn series_path(&self, series: &SeriesKey) -> PathBuf {
        self.root
            .join(&series.exchange)
            .join(&series.symbol)
            .join(format!("{}.{}", series.timeframe, BLOCK_EXT))
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// # Summary
    /// 获取序列的缓存项，不在缓存中时从磁盘加载。
    ///
    /// # Logic
    /// 1. 命中缓存则刷新访问时间。
    /// 2. 否则读取并解码文件（不存在视为空序列），并发加载时以先插入者为准。
    /// 3. 插入后若超出容量则逐出最久未访问的序列。
    async fn series(&self, key: &SeriesKey) -> Result<Arc<CachedSeries>, StoreError> {
        if let Some(entry) = self.cache.get(key).map(|e| e.value().clone()) {
            entry.last_access.store(self.tick(), Ordering::Relaxed);
            return Ok(entry);
        }

        let path = self.series_path(key);
        let candles = match fs::read_if_exists(&path).await? {
            Some(data) => decode_series(&path, &data),
            None => BTreeMap::new(),
        };
        debug!(series = %key, candles = candles.len(), "Loaded series into cache");

        let loaded = Arc::new(CachedSeries {
            last_access: AtomicU64::new(self.tick()),
            state: Mutex::new(SeriesState {
                candles,
                ..SeriesState::default()
            }),
        });
        let entry = self.cache.entry(key.clone()).or_insert(loaded).value().clone();
        self.evict_if_needed(key).await?;
        Ok(entry)
    }

    /// # Summary
    /// 超出容量时逐出最久未访问的序列，刚访问的 `keep` 不参与逐出。
    ///
    /// # Logic
    /// 持有序列锁完成落盘与移除，并标记 `evicted`，使持有旧引用的写者重新加载。
    async fn evict_if_needed(&self, keep: &SeriesKey) -> Result<(), StoreError> {
        while self.cache.len() > self.max_cached_series {
            let victim = self
                .cache
                .iter()
                .filter(|e| e.key() != keep)
                .min_by_key(|e| e.value().last_access.load(Ordering::Relaxed))
                .map(|e| (e.key().clone(), e.value().clone()));
            let Some((victim_key, victim)) = victim else {
                return Ok(());
            };

            let mut state = victim.state.lock().await;
            if state.evicted {
                continue;
            }
            if state.dirty {
                self.persist(&victim_key, &mut state).await?;
            }
            state.evicted = true;
            self.cache.remove(&victim_key);
            debug!(series = %victim_key, "Evicted series from cache");
        }
        Ok(())
    }

    async fn persist(&self, key: &SeriesKey, state: &mut SeriesState) -> Result<(), StoreError> {
        let bytes = encode_series(&state.candles, self.block_size)?;
        fs::write_atomic(&self.series_path(key), &bytes).await?;
        debug!(series = %key, candles = state.candles.len(), "Series written");
        state.dirty = false;
        state.pending = 0;
        Ok(())
    }

    /// # Summary
    /// 在序列锁内插入一组 K 线。
    ///
    /// # Logic
    /// 1. 缓存项已被逐出时重新获取。
    /// 2. 已存在的开盘时间计为重复。
    /// 3. 未落盘条数达到 `block_size` 时整文件落盘；落盘失败时数据保留在内存中，
    ///    等待下一次 `flush`。
    async fn insert_all(&self, key: &SeriesKey, candles: &[&FootprintCandle]) -> Result<BatchOutcome, StoreError> {
        loop {
            let entry = self.series(key).await?;
            let mut state = entry.state.lock().await;
            if state.evicted {
                continue;
            }

            let mut outcome = BatchOutcome::default();
            for candle in candles {
                if state.candles.contains_key(&candle.open_time) {
                    debug!(series = %key, open_time = candle.open_time, "Duplicate candle");
                    outcome.record(SaveOutcome::Duplicate);
                } else {
                    state.candles.insert(candle.open_time, (*candle).clone());
                    state.dirty = true;
                    state.pending += 1;
                    outcome.record(SaveOutcome::Written);
                }
            }

            if state.pending >= self.block_size {
                self.persist(key, &mut state).await?;
            }
            return Ok(outcome);
        }
    }

    /// 读取缓存中的一条序列。
    async fn with_series<T>(
        &self,
        key: &SeriesKey,
        f: impl Fn(&BTreeMap<i64, FootprintCandle>) -> T,
    ) -> Result<T, StoreError> {
        loop {
            let entry = self.series(key).await?;
            let state = entry.state.lock().await;
            if state.evicted {
                continue;
            }
            return Ok(f(&state.candles));
        }
    }

    /// 缓存中尚有未落盘修改的序列数。
    pub async fn dirty_series(&self) -> usize {
        let entries: Vec<Arc<CachedSeries>> = self.cache.iter().map(|e| e.value().clone()).collect();
        let mut dirty = 0;
        for entry in entries {
            if entry.state.lock().await.dirty {
                dirty += 1;
            }
        }
        dirty
    }

    /// 当前缓存的序列数。
    pub fn cached_series(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl CandleReader for BlockStore {
    async fn find_by_symbol(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: TimeFrame,
        options: &FindOptions,
    ) -> Result<Vec<FootprintCandle>, StoreError> {
        let key = SeriesKey::new(exchange, symbol, timeframe);
        let candles = self
            .with_series(&key, |candles| {
                let lower = options.start_time.unwrap_or(i64::MIN);
                let upper = options.end_time.unwrap_or(i64::MAX);
                if lower > upper {
                    return Vec::new();
                }
                candles.range(lower..=upper).map(|(_, c)| c.clone()).collect::<Vec<_>>()
            })
            .await?;
        Ok(options.apply_limit(candles))
    }

    async fn find_latest(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: TimeFrame,
    ) -> Result<Option<FootprintCandle>, StoreError> {
        let key = SeriesKey::new(exchange, symbol, timeframe);
        self.with_series(&key, |candles| candles.last_key_value().map(|(_, c)| c.clone()))
            .await
    }

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
                backend: "block".to_string(),
                detail: format!("{} cached series at {}", self.cache.len(), self.root.display()),
            },
            Err(e) => {
                warn!(root = ?self.root, error = %e, "Block health check failed");
                HealthStatus {
                    healthy: false,
                    backend: "block".to_string(),
                    detail: e.to_string(),
                }
            }
        })
    }

    /// 先落盘再清空缓存。
    async fn close(&self) -> Result<(), StoreError> {
        self.flush().await?;
        self.cache.clear();
        info!(root = ?self.root, "Block store closed");
        Ok(())
    }
}

#[async_trait]
impl CandleStore for BlockStore {
    async fn save(&self, candle: &FootprintCandle) -> Result<SaveOutcome, StoreError> {
        candle.validate()?;
        let outcome = self.insert_all(&candle.series(), &[candle]).await?;
        Ok(if outcome.written > 0 {
            SaveOutcome::Written
        } else {
            SaveOutcome::Duplicate
        })
    }

    /// # Summary
    /// 按序列分组后批量插入，每条序列只加一次锁。
    async fn save_many(&self, candles: &[FootprintCandle]) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        let mut groups: BTreeMap<SeriesKey, Vec<&FootprintCandle>> = BTreeMap::new();
        for candle in candles {
            match candle.validate() {
                Ok(()) => groups.entry(candle.series()).or_default().push(candle),
                Err(e) => {
                    outcome.failed += 1;
                    warn!(symbol = %candle.symbol, open_time = candle.open_time, error = %e, "Rejected candle in batch");
                }
            }
        }

        for (key, group) in groups {
            match self.insert_all(&key, &group).await {
                Ok(result) => outcome.merge(result),
                Err(e) => {
                    // 已进入内存的 K 线会在下次 flush 时落盘
                    warn!(series = %key, error = %e, "Failed to persist series during batch");
                    outcome.failed += group.len();
                }
            }
        }
        Ok(outcome)
    }

    /// # Summary
    /// 只落盘标记为脏的序列。
    async fn flush(&self) -> Result<(), StoreError> {
        let entries: Vec<(SeriesKey, Arc<CachedSeries>)> = self
            .cache
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut written = 0;
        for (key, entry) in entries {
            let mut state = entry.state.lock().await;
            if state.dirty && !state.evicted {
                self.persist(&key, &mut state).await?;
                written += 1;
            }
        }
        info!(series = written, "Block store flushed");
        Ok(())
    }
}
