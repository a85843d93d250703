//! 分区文件的读取与追加。
//!
//! 文件结构：`[64 字节文件头][帧][帧]...`，帧格式见 `codec::frame`。

use crate::codec::envelope;
use crate::codec::frame::{FrameIter, RECORD_MAGIC, encode_frame};
use crate::codec::CodecError;
use crate::fs;
use crate::header::{HEADER_SIZE, PartitionHeader};
use footprint_core::common::DataKind;
use footprint_core::store::error::StoreError;
use std::path::Path;
use tracing::{debug, warn};

/// # Summary
/// 一个分区文件的扫描结果。
///
/// # Invariants
/// - `skipped` 统计了 CRC 或解码失败而被丢弃的记录数。
/// - `truncated_tail` 为真表示文件末尾有一个不完整的帧被当作 EOF 处理。
#[derive(Debug, Clone)]
pub struct PartitionScan<T> {
    pub header: Option<PartitionHeader>,
    pub records: Vec<T>,
    pub skipped: usize,
    pub truncated_tail: bool,
}

/// # Summary
/// 扫描内存中的分区文件字节。
///
/// # Logic
/// 1. 解析文件头；文件头损坏时记录日志，但仍继续扫描其后的记录。
/// 2. 逐帧校验 CRC 并调用 `decode`，失败的记录计数后跳过。
/// 3. 尾部不完整的帧视为 EOF。
/// 4. 文件头计数多于实际读到的帧数时记录告警，这些记录已经无法恢复。
pub fn scan_bytes<T, F>(path: &Path, data: &[u8], decode: F) -> PartitionScan<T>
where
    F: Fn(&[u8]) -> Result<T, CodecError>,
{
    let header = match PartitionHeader::decode(data) {
        Ok(h) => Some(h),
        Err(e) => {
            warn!(path = ?path, error = %e, "Unreadable partition header, scanning records anyway");
            None
        }
    };

    let body = data.get(HEADER_SIZE..).unwrap_or_default();
    let mut frames = FrameIter::new(body, RECORD_MAGIC);
    let mut records = Vec::new();
    let mut skipped = 0;
    let mut seen = 0usize;

    for (position, frame) in frames.by_ref().enumerate() {
        seen = position + 1;
        let result = frame.and_then(&decode);
        match result {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                warn!(path = ?path, position, error = %e, "Skipping unreadable record");
            }
        }
    }

    let truncated_tail = frames.truncated_tail();
    if truncated_tail {
        debug!(path = ?path, "Partial trailing record treated as end of file");
    }
    if let Some(h) = &header
        && usize::try_from(h.count).is_ok_and(|count| count > seen)
    {
        warn!(path = ?path, header_count = h.count, frames = seen, "Partition holds fewer records than its header counts");
    }

    PartitionScan {
        header,
        records,
        skipped,
        truncated_tail,
    }
}

/// # Summary
/// 读取并扫描分区文件。
///
/// # Returns
/// 文件不存在时返回 `None`；磁盘错误原样返回。
pub async fn read_partition<T, F>(path: &Path, decode: F) -> Result<Option<PartitionScan<T>>, StoreError>
where
    F: Fn(&[u8]) -> Result<T, CodecError>,
{
    let Some(data) = fs::read_if_exists(path).await? else {
        return Ok(None);
    };
    Ok(Some(scan_bytes(path, &data, decode)))
}

/// 只读取分区文件头。文件不存在或文件头损坏时返回 `None`。
pub async fn read_header(path: &Path) -> Result<Option<PartitionHeader>, StoreError> {
    let Some(bytes) = fs::read_range(path, 0, HEADER_SIZE).await? else {
        return Ok(None);
    };
    match PartitionHeader::decode(&bytes) {
        Ok(h) => Ok(Some(h)),
        Err(e) => {
            warn!(path = ?path, error = %e, "Unreadable partition header");
            Ok(None)
        }
    }
}

/// # Summary
/// 向分区文件追加一条记录，整个过程不读取已有记录。
///
/// # Logic
/// 1. 文件不存在时先原子地创建只含文件头 (count = 0) 的文件。
/// 2. 读取 64 字节文件头。
/// 3. 以 append 模式写入记录帧；写入失败时把文件截回原长度，不留下半截帧。
/// 4. 只改写文件头中的计数与首尾时间戳。
///
/// # Returns
/// 更新后的文件头。文件头损坏时返回 `StoreError::Codec`，不做任何写入。
pub async fn append_record(
    path: &Path,
    symbol: &str,
    interval: &str,
    timestamp: i64,
    payload: &[u8],
    sync: bool,
) -> Result<PartitionHeader, StoreError> {
    let frame = encode_frame(RECORD_MAGIC, payload)?;

    if fs::create_atomic(path, &PartitionHeader::new(symbol, interval).encode()).await? {
        debug!(path = ?path, "Created partition file");
    }

    let header_bytes = fs::read_range(path, 0, HEADER_SIZE)
        .await?
        .ok_or(StoreError::NotFound)?;
    let mut header = PartitionHeader::decode(&header_bytes)?;

    let before = tokio::fs::metadata(path).await?.len();
    if let Err(e) = fs::append(path, &frame, sync).await {
        if let Err(rollback) = fs::truncate(path, before, sync).await {
            warn!(path = ?path, error = %rollback, "Failed to drop partial record after append error");
        }
        return Err(e.into());
    }

    header.record_append(timestamp);
    fs::write_range(path, 0, &header.encode(), sync).await?;
    Ok(header)
}

/// # Summary
/// 分区文件自检的结果。
///
/// # Invariants
/// - `timestamps` 按文件中的顺序排列，只含可解码的记录。
#[derive(Debug, Clone)]
pub struct Recovery {
    pub header: Option<PartitionHeader>,
    pub timestamps: Vec<i64>,
}

/// # Summary
/// 打开分区文件后的一次性自检，修复崩溃或写入失败留下的状态。
///
/// # Logic
/// 1. 扫描全部帧，收集可解码记录的开盘时间。
/// 2. 尾部有不完整的帧时截断到最后一个完整帧之后，之后的追加不会接在残留字节后面。
/// 3. 文件头计数与实际帧数不一致，或首尾时间没有覆盖实际记录时（追加后、改写文件头前崩溃），按实际内容改写文件头。
///
/// # Returns
/// 文件不存在时返回 `None`。文件头损坏时不做修复，只返回读到的时间戳。
pub async fn recover(path: &Path, kind: DataKind, sync: bool) -> Result<Option<Recovery>, StoreError> {
    let Some(data) = fs::read_if_exists(path).await? else {
        return Ok(None);
    };
    let decode = |bytes: &[u8]| match kind {
        DataKind::Candle => envelope::decode_candle(bytes).map(|c| c.open_time),
        DataKind::Footprint => envelope::decode_footprint(bytes).map(|r| r.open_time),
    };

    let body = data.get(HEADER_SIZE..).unwrap_or_default();
    let mut frames = FrameIter::new(body, RECORD_MAGIC);
    let mut timestamps = Vec::new();
    let mut appended = 0u32;
    for frame in frames.by_ref() {
        appended = appended.saturating_add(1);
        match frame.and_then(&decode) {
            Ok(ts) => timestamps.push(ts),
            Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable record during recovery"),
        }
    }

    if frames.truncated_tail() {
        let valid = HEADER_SIZE + frames.consumed();
        warn!(
            path = ?path,
            dropped = data.len().saturating_sub(valid),
            "Partial record at end of partition, truncating"
        );
        let len = u64::try_from(valid).map_err(|_| StoreError::Unknown("partition length exceeds u64".to_string()))?;
        fs::truncate(path, len, sync).await?;
    }

    let header = match PartitionHeader::decode(&data) {
        Ok(mut h) => {
            let first = timestamps.iter().min().copied();
            let last = timestamps.iter().max().copied();
            let range_stale = match (first, last) {
                (Some(first), Some(last)) => first < h.first_timestamp || last > h.last_timestamp,
                _ => false,
            };
            if h.count != appended || range_stale {
                warn!(
                    path = ?path,
                    header_count = h.count,
                    frames = appended,
                    "Partition header out of date, rewriting"
                );
                h.count = appended;
                if let (Some(first), Some(last)) = (first, last) {
                    h.first_timestamp = first;
                    h.last_timestamp = last;
                }
                fs::write_range(path, 0, &h.encode(), sync).await?;
            }
            Some(h)
        }
        Err(e) => {
            warn!(path = ?path, error = %e, "Unreadable partition header, leaving it as is");
            None
        }
    };

    Ok(Some(Recovery { header, timestamps }))
}
