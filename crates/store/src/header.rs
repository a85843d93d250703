//! 分区文件头，固定 64 字节，小端序。
//!
//! ```text
//! offset size field
//! 0      4    magic "FPRT"
//! 4      2    version
//! 6      2    record_size (0 = 变长)
//! 8      4    count
//! 12     8    first_timestamp
//! 20     8    last_timestamp
//! 28     16   symbol (右侧补零)
//! 44     8    interval (右侧补零)
//! 52     12   reserved (全零)
//! ```
//!
//! 文件头是分区文件中唯一可变的区域，其余部分只追加。

use crate::codec::CodecError;
use bytes::{Buf, BufMut};

pub const HEADER_SIZE: usize = 64;
pub const PARTITION_MAGIC: [u8; 4] = *b"FPRT";
pub const PARTITION_VERSION: u16 = 1;

const SYMBOL_FIELD: usize = 16;
const INTERVAL_FIELD: usize = 8;
const RESERVED_FIELD: usize = 12;

/// # Summary
/// 分区文件头。
///
/// # Invariants
/// - `count` 等于已追加的记录数。
/// - `count > 0` 时，所有记录的时间戳落在 `[first_timestamp, last_timestamp]` 内。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHeader {
    pub version: u16,
    pub record_size: u16,
    pub count: u32,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
    pub symbol: String,
    pub interval: String,
}

impl PartitionHeader {
    /// 空分区的文件头。超长的 symbol / interval 会被截断到字段宽度。
    pub fn new(symbol: &str, interval: &str) -> Self {
        Self {
            version: PARTITION_VERSION,
            record_size: 0,
            count: 0,
            first_timestamp: 0,
            last_timestamp: 0,
            symbol: truncate_utf8(symbol, SYMBOL_FIELD).to_string(),
            interval: truncate_utf8(interval, INTERVAL_FIELD).to_string(),
        }
    }

    /// # Summary
    /// 记录一次追加。
    ///
    /// # Logic
    /// 第一条记录同时设定首尾时间戳；此后始终取最小/最大值，乱序追加也能保持区间正确。
    pub fn record_append(&mut self, timestamp: i64) {
        if self.count == 0 {
            self.first_timestamp = timestamp;
            self.last_timestamp = timestamp;
        } else {
            self.first_timestamp = self.first_timestamp.min(timestamp);
            self.last_timestamp = self.last_timestamp.max(timestamp);
        }
        self.count = self.count.saturating_add(1);
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_slice(&PARTITION_MAGIC);
        buf.put_u16_le(self.version);
        buf.put_u16_le(self.record_size);
        buf.put_u32_le(self.count);
        buf.put_i64_le(self.first_timestamp);
        buf.put_i64_le(self.last_timestamp);
        put_padded(&mut buf, &self.symbol, SYMBOL_FIELD);
        put_padded(&mut buf, &self.interval, INTERVAL_FIELD);
        buf.put_bytes(0, RESERVED_FIELD);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                remaining: bytes.len(),
            });
        }
        let mut cursor = &bytes[..HEADER_SIZE];

        let mut magic = [0u8; 4];
        cursor.copy_to_slice(&mut magic);
        if magic != PARTITION_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let version = cursor.get_u16_le();
        if version != PARTITION_VERSION {
            return Err(CodecError::UnsupportedVersion(u8::try_from(version).unwrap_or(u8::MAX)));
        }
        let record_size = cursor.get_u16_le();
        let count = cursor.get_u32_le();
        let first_timestamp = cursor.get_i64_le();
        let last_timestamp = cursor.get_i64_le();
        let symbol = get_padded(&mut cursor, SYMBOL_FIELD)?;
        let interval = get_padded(&mut cursor, INTERVAL_FIELD)?;

        Ok(Self {
            version,
            record_size,
            count,
            first_timestamp,
            last_timestamp,
            symbol,
            interval,
        })
    }

    /// 记录时间戳是否落在头部声明的区间内。
    pub fn covers(&self, timestamp: i64) -> bool {
        self.count > 0 && self.first_timestamp <= timestamp && timestamp <= self.last_timestamp
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn put_padded(buf: &mut &mut [u8], s: &str, width: usize) {
    let s = truncate_utf8(s, width);
    buf.put_slice(s.as_bytes());
    buf.put_bytes(0, width - s.len());
}

fn get_padded(cursor: &mut &[u8], width: usize) -> Result<String, CodecError> {
    let (field, rest) = cursor.split_at(width);
    *cursor = rest;
    let end = field.iter().position(|b| *b == 0).unwrap_or(width);
    String::from_utf8(field[..end].to_vec()).map_err(|e| CodecError::Invalid(e.to_string()))
}
