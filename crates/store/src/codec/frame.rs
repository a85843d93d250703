//! 记录帧：`[4 字节帧魔数][u32 负载长度][u32 CRC32][负载]`，帧与帧之间没有填充。
//!
//! CRC 同时覆盖长度字段与负载，长度字段被改写也能被发现。
//!
//! 读取时：
//! - 魔数、长度或 CRC 不合法的帧作为单条错误返回，随后向前搜索下一个能通过校验的帧继续扫描。
//! - 之后再也找不到完整帧的不完整尾部视为 EOF（进程崩溃留下的半截写入），不视为损坏。

use super::CodecError;
use bytes::{Buf, BufMut};

pub const FRAME_HEADER_SIZE: usize = 12;

/// 分区文件记录与块内条目使用的帧魔数
pub const RECORD_MAGIC: [u8; 4] = *b"FPRM";

/// 单帧负载上限，超出即视为长度字段损坏
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

fn checksum(len: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// 将负载封装为一个帧。
pub fn encode_frame(magic: [u8; 4], payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::Invalid(format!(
            "frame of {} bytes exceeds {} byte limit",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| CodecError::Invalid(format!("frame of {} bytes exceeds u32", payload.len())))?;
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.put_slice(&magic);
    out.put_u32_le(len);
    out.put_u32_le(checksum(len, payload));
    out.put_slice(payload);
    Ok(out)
}

enum Parsed<'a> {
    Frame(&'a [u8]),
    // 剩余字节不足一个完整帧
    Incomplete,
    Corrupt(CodecError),
}

fn parse(data: &[u8], magic: [u8; 4]) -> Parsed<'_> {
    let Some(mut header) = data.get(..FRAME_HEADER_SIZE) else {
        return Parsed::Incomplete;
    };
    let mut found = [0u8; 4];
    header.copy_to_slice(&mut found);
    if found != magic {
        return Parsed::Corrupt(CodecError::BadMagic(found));
    }
    let raw_len = header.get_u32_le();
    let stored = header.get_u32_le();

    let len = usize::try_from(raw_len).unwrap_or(usize::MAX);
    if len > MAX_FRAME_LEN {
        return Parsed::Corrupt(CodecError::Invalid(format!("frame length {} exceeds limit", len)));
    }
    let Some(payload) = data.get(FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len) else {
        return Parsed::Incomplete;
    };
    let computed = checksum(raw_len, payload);
    if computed != stored {
        return Parsed::Corrupt(CodecError::Checksum { stored, computed });
    }
    Parsed::Frame(payload)
}

/// # Summary
/// 帧迭代器，逐个产出帧负载或该帧的校验错误。
///
/// # Invariants
/// - 每个损坏区间只产出一个错误，之后从下一个完整有效的帧继续。
/// - 迭代结束后 `truncated_tail()` 表示是否遇到了不完整的尾部帧。
/// - `consumed()` 是已处理字节数，不含被当作 EOF 的尾部。
pub struct FrameIter<'a> {
    data: &'a [u8],
    magic: [u8; 4],
    consumed: usize,
    truncated_tail: bool,
    damaged: &'a [u8],
}

impl<'a> FrameIter<'a> {
    pub fn new(data: &'a [u8], magic: [u8; 4]) -> Self {
        Self {
            data,
            magic,
            consumed: 0,
            truncated_tail: false,
            damaged: &[],
        }
    }

    /// 是否在末尾遇到了不完整的帧。
    pub fn truncated_tail(&self) -> bool {
        self.truncated_tail
    }

    /// 已处理的字节数。尾部被当作 EOF 时，这就是有效数据的结束位置。
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// 最近一次被跳过的原始字节（损坏区间或不完整的尾部），从该帧的起始位置算起。
    pub fn damaged(&self) -> &'a [u8] {
        self.damaged
    }

    fn advance(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data = self.data.get(n..).unwrap_or_default();
        self.consumed += n;
    }

    // 当前位置之后下一个完整有效帧的偏移
    fn resync(&self) -> Option<usize> {
        (1..self.data.len()).find(|&offset| {
            self.data
                .get(offset..)
                .is_some_and(|rest| rest.starts_with(&self.magic) && matches!(parse(rest, self.magic), Parsed::Frame(_)))
        })
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<&'a [u8], CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }

        let error = match parse(self.data, self.magic) {
            Parsed::Frame(payload) => {
                self.advance(FRAME_HEADER_SIZE + payload.len());
                return Some(Ok(payload));
            }
            Parsed::Incomplete => None,
            Parsed::Corrupt(e) => Some(e),
        };

        match (self.resync(), error) {
            (Some(offset), error) => {
                self.damaged = self.data.get(..offset).unwrap_or_default();
                self.advance(offset);
                Some(Err(error.unwrap_or_else(|| {
                    CodecError::Invalid("frame length overruns the next record".to_string())
                })))
            }
            (None, None) => {
                self.damaged = self.data;
                self.truncated_tail = true;
                self.data = &[];
                None
            }
            (None, Some(e)) => {
                self.damaged = self.data;
                self.advance(self.data.len());
                Some(Err(e))
            }
        }
    }
}
