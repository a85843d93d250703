//! 压缩信封：`[4 字节魔数][u32 原始长度][LZ4 块]`。
//!
//! 原始长度由 `lz4_flex::compress_prepend_size` 写入，解压前先校验上限，
//! 损坏的长度字段不会触发超大内存分配。

use super::CodecError;
use super::binary::{self, FootprintRecord};
use footprint_core::market::entity::{AggregationBin, FootprintCandle};

/// K 线信封魔数
pub const CANDLE_MAGIC: [u8; 4] = *b"FPC1";
/// 足迹记录信封魔数
pub const FOOTPRINT_MAGIC: [u8; 4] = *b"FPF1";

const MAGIC_SIZE: usize = 4;
// 单条记录解压后的上限，远大于任何合理的足迹 K 线
const MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

/// 编码并压缩一根 K 线。
pub fn encode_candle(candle: &FootprintCandle) -> Result<Vec<u8>, CodecError> {
    let raw = binary::encode_candle(candle)?;
    Ok(seal(CANDLE_MAGIC, &raw))
}

/// 解压并解码一根 K 线。
pub fn decode_candle(bytes: &[u8]) -> Result<FootprintCandle, CodecError> {
    let raw = open(CANDLE_MAGIC, bytes)?;
    binary::decode_candle(&raw)
}

/// 编码并压缩一条足迹记录。
pub fn encode_footprint(open_time: i64, aggs: &[AggregationBin]) -> Result<Vec<u8>, CodecError> {
    let raw = binary::encode_footprint(open_time, aggs)?;
    Ok(seal(FOOTPRINT_MAGIC, &raw))
}

/// 解压并解码一条足迹记录。
pub fn decode_footprint(bytes: &[u8]) -> Result<FootprintRecord, CodecError> {
    let raw = open(FOOTPRINT_MAGIC, bytes)?;
    binary::decode_footprint(&raw)
}

fn seal(magic: [u8; 4], raw: &[u8]) -> Vec<u8> {
    let compressed = lz4_flex::compress_prepend_size(raw);
    let mut out = Vec::with_capacity(MAGIC_SIZE + compressed.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&compressed);
    out
}

fn open(expected: [u8; 4], bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    if bytes.len() < MAGIC_SIZE + 4 {
        return Err(CodecError::Truncated {
            needed: MAGIC_SIZE + 4,
            remaining: bytes.len(),
        });
    }
    let (magic, body) = bytes.split_at(MAGIC_SIZE);
    let mut found = [0u8; 4];
    found.copy_from_slice(magic);
    if found != expected {
        return Err(CodecError::BadMagic(found));
    }

    let mut size_prefix = [0u8; 4];
    size_prefix.copy_from_slice(&body[..4]);
    let declared = usize::try_from(u32::from_le_bytes(size_prefix))
        .map_err(|e| CodecError::Invalid(e.to_string()))?;
    if declared > MAX_DECOMPRESSED_SIZE {
        return Err(CodecError::Decompress(format!(
            "declared size {} exceeds limit {}",
            declared, MAX_DECOMPRESSED_SIZE
        )));
    }

    lz4_flex::decompress_size_prepended(body).map_err(|e| CodecError::Decompress(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::binary::tests::sample_candle;

    #[test]
    fn test_envelope_round_trip() {
        let candle = sample_candle();
        let bytes = encode_candle(&candle).unwrap();
        assert_eq!(&bytes[..4], b"FPC1");
        assert_eq!(decode_candle(&bytes).unwrap(), candle);
    }

    #[test]
    fn test_magic_mismatch_is_decode_error() {
        let mut bytes = encode_candle(&sample_candle()).unwrap();
        bytes[0] ^= 0xff;
        assert!(matches!(decode_candle(&bytes), Err(CodecError::BadMagic(_))));
    }

    #[test]
    fn test_footprint_envelope_is_not_a_candle() {
        let candle = sample_candle();
        let bytes = encode_footprint(candle.open_time, &candle.aggs).unwrap();
        assert!(matches!(decode_candle(&bytes), Err(CodecError::BadMagic(_))));
        let record = decode_footprint(&bytes).unwrap();
        assert_eq!(record.aggs, candle.aggs);
    }

    #[test]
    fn test_truncated_and_garbage_payloads() {
        let bytes = encode_candle(&sample_candle()).unwrap();
        assert!(decode_candle(&bytes[..3]).is_err());
        assert!(decode_candle(&bytes[..bytes.len() / 2]).is_err());

        let mut garbage = CANDLE_MAGIC.to_vec();
        garbage.extend_from_slice(&[0xff, 0xff, 0xff, 0x7f, 1, 2, 3]);
        assert!(matches!(decode_candle(&garbage), Err(CodecError::Decompress(_))));
    }
}
