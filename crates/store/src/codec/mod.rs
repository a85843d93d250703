//! K 线记录编解码。
//!
//! 两种编码并存：
//! - `binary`：无压缩的结构化二进制布局，供整块后端使用，也是压缩信封的内层格式。
//! - `envelope`：`[4 字节魔数][LZ4 压缩负载]`，供关系型后端与追加写后端使用。
//!
//! `frame` 负责在文件中以 `[魔数][长度][CRC32][负载]` 的形式串联记录。

pub mod binary;
pub mod envelope;
pub mod frame;

use footprint_core::store::error::StoreError;
use thiserror::Error;

pub use binary::FootprintRecord;

/// # Summary
/// 编解码错误。调用方应跳过出错的单条记录并记录日志，而不是中断整个读取。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    // 字节不足
    #[error("truncated: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    // 魔数不匹配
    #[error("bad magic: {0:02x?}")]
    BadMagic([u8; 4]),
    // 不支持的布局版本
    #[error("unsupported layout version {0}")]
    UnsupportedVersion(u8),
    // 解压失败
    #[error("decompression failed: {0}")]
    Decompress(String),
    // CRC 校验失败
    #[error("checksum mismatch: stored {stored:08x}, computed {computed:08x}")]
    Checksum { stored: u32, computed: u32 },
    // 字段值不合法，或编码时超出布局上限
    #[error("invalid data: {0}")]
    Invalid(String),
}

impl From<CodecError> for StoreError {
    fn from(e: CodecError) -> Self {
        StoreError::Codec(e.to_string())
    }
}
