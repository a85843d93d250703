//! 结构化二进制布局 (小端序)。
//!
//! ```text
//! K 线:
//! [u8 version][u8 flags][str exchange][str symbol][str timeframe]
//! [i64 open_time][i64 close_time]
//! [f64 x10: open high low close volume quote_volume buy_volume sell_volume buy_quote sell_quote]
//! [u64 trade_count][f64 delta][f64 delta_max][f64 delta_min]
//! [i64 first_trade_id][i64 last_trade_id]
//! [u32 bin_count][bin x N]
//!
//! 足迹记录:
//! [u8 version][i64 open_time][u32 bin_count][bin x N]
//!
//! str: [u16 len][utf8]
//! bin: [f64 price][f64 buy_volume][f64 sell_volume][f64 buy_quote][f64 sell_quote]
//! ```

use super::CodecError;
use bytes::{Buf, BufMut, BytesMut};
use footprint_core::common::TimeFrame;
use footprint_core::market::entity::{AggregationBin, FootprintCandle};

pub const CANDLE_LAYOUT_VERSION: u8 = 1;
pub const FOOTPRINT_LAYOUT_VERSION: u8 = 1;

const FLAG_COMPLETE: u8 = 0b0000_0001;
const BIN_SIZE: usize = 5 * 8;
// 头部固定字段长度，不含三个字符串的内容与价位数组
const CANDLE_FIXED_SIZE: usize = 2 + 3 * 2 + 2 * 8 + 10 * 8 + 8 + 3 * 8 + 2 * 8 + 4;

/// 足迹文件中的一条记录：开盘时间 + 逐价位聚合。
#[derive(Debug, Clone, PartialEq)]
pub struct FootprintRecord {
    pub open_time: i64,
    pub aggs: Vec<AggregationBin>,
}

/// # Summary
/// 将 K 线编码为结构化二进制。
///
/// # Returns
/// 字符串超过 `u16::MAX` 字节或价位数超过 `u32::MAX` 时返回 `CodecError::Invalid`。
pub fn encode_candle(candle: &FootprintCandle) -> Result<Vec<u8>, CodecError> {
    let timeframe = candle.timeframe.as_str();
    let mut buf = BytesMut::with_capacity(
        CANDLE_FIXED_SIZE
            + candle.exchange.len()
            + candle.symbol.len()
            + timeframe.len()
            + candle.aggs.len() * BIN_SIZE,
    );

    buf.put_u8(CANDLE_LAYOUT_VERSION);
    buf.put_u8(if candle.is_complete { FLAG_COMPLETE } else { 0 });
    put_str(&mut buf, &candle.exchange)?;
    put_str(&mut buf, &candle.symbol)?;
    put_str(&mut buf, timeframe)?;

    buf.put_i64_le(candle.open_time);
    buf.put_i64_le(candle.close_time);
    for v in [
        candle.open,
        candle.high,
        candle.low,
        candle.close,
        candle.volume,
        candle.quote_volume,
        candle.buy_volume,
        candle.sell_volume,
        candle.buy_quote,
        candle.sell_quote,
    ] {
        buf.put_f64_le(v);
    }
    buf.put_u64_le(candle.trade_count);
    buf.put_f64_le(candle.delta);
    buf.put_f64_le(candle.delta_max);
    buf.put_f64_le(candle.delta_min);
    buf.put_i64_le(candle.first_trade_id);
    buf.put_i64_le(candle.last_trade_id);
    put_bins(&mut buf, &candle.aggs)?;

    Ok(buf.to_vec())
}

/// # Summary
/// 从结构化二进制解码 K 线。
///
/// # Logic
/// 1. 每次读取前检查剩余长度，不足时返回 `Truncated`。
/// 2. 校验版本号与周期字符串。
/// 3. 读取完毕后不得有多余字节。
pub fn decode_candle(bytes: &[u8]) -> Result<FootprintCandle, CodecError> {
    let mut r = Reader::new(bytes);

    let version = r.u8()?;
    if version != CANDLE_LAYOUT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let flags = r.u8()?;
    let exchange = r.string()?;
    let symbol = r.string()?;
    let timeframe_str = r.string()?;
    let timeframe: TimeFrame = timeframe_str
        .parse()
        .map_err(CodecError::Invalid)?;

    let open_time = r.i64()?;
    let close_time = r.i64()?;
    let open = r.f64()?;
    let high = r.f64()?;
    let low = r.f64()?;
    let close = r.f64()?;
    let volume = r.f64()?;
    let quote_volume = r.f64()?;
    let buy_volume = r.f64()?;
    let sell_volume = r.f64()?;
    let buy_quote = r.f64()?;
    let sell_quote = r.f64()?;
    let trade_count = r.u64()?;
    let delta = r.f64()?;
    let delta_max = r.f64()?;
    let delta_min = r.f64()?;
    let first_trade_id = r.i64()?;
    let last_trade_id = r.i64()?;
    let aggs = r.bins()?;
    r.finish()?;

    Ok(FootprintCandle {
        exchange,
        symbol,
        timeframe,
        open_time,
        close_time,
        open,
        high,
        low,
        close,
        volume,
        quote_volume,
        buy_volume,
        sell_volume,
        buy_quote,
        sell_quote,
        trade_count,
        delta,
        delta_max,
        delta_min,
        first_trade_id,
        last_trade_id,
        is_complete: flags & FLAG_COMPLETE != 0,
        aggs,
    })
}

/// 编码一条足迹记录。
pub fn encode_footprint(open_time: i64, aggs: &[AggregationBin]) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::with_capacity(1 + 8 + 4 + aggs.len() * BIN_SIZE);
    buf.put_u8(FOOTPRINT_LAYOUT_VERSION);
    buf.put_i64_le(open_time);
    put_bins(&mut buf, aggs)?;
    Ok(buf.to_vec())
}

/// 解码一条足迹记录。
pub fn decode_footprint(bytes: &[u8]) -> Result<FootprintRecord, CodecError> {
    let mut r = Reader::new(bytes);
    let version = r.u8()?;
    if version != FOOTPRINT_LAYOUT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let open_time = r.i64()?;
    let aggs = r.bins()?;
    r.finish()?;
    Ok(FootprintRecord { open_time, aggs })
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len())
        .map_err(|_| CodecError::Invalid(format!("string of {} bytes exceeds u16", s.len())))?;
    buf.put_u16_le(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_bins(buf: &mut BytesMut, bins: &[AggregationBin]) -> Result<(), CodecError> {
    let count = u32::try_from(bins.len())
        .map_err(|_| CodecError::Invalid(format!("{} bins exceed u32", bins.len())))?;
    buf.put_u32_le(count);
    for bin in bins {
        buf.put_f64_le(bin.price);
        buf.put_f64_le(bin.buy_volume);
        buf.put_f64_le(bin.sell_volume);
        buf.put_f64_le(bin.buy_quote);
        buf.put_f64_le(bin.sell_quote);
    }
    Ok(())
}

/// 带长度检查的小端读取器，避免 `Buf::get_*` 在字节不足时 panic。
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < needed {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn f64(&mut self) -> Result<f64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_f64_le())
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = usize::from(self.u16()?);
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        String::from_utf8(head.to_vec()).map_err(|e| CodecError::Invalid(e.to_string()))
    }

    fn bins(&mut self) -> Result<Vec<AggregationBin>, CodecError> {
        let count = usize::try_from(self.u32()?)
            .map_err(|e| CodecError::Invalid(e.to_string()))?;
        // 先按声明的数量检查长度，防止损坏的计数触发巨量分配
        let needed = count
            .checked_mul(BIN_SIZE)
            .ok_or_else(|| CodecError::Invalid(format!("bin count {} overflows", count)))?;
        self.need(needed)?;

        let mut bins = Vec::with_capacity(count);
        for _ in 0..count {
            bins.push(AggregationBin {
                price: self.buf.get_f64_le(),
                buy_volume: self.buf.get_f64_le(),
                sell_volume: self.buf.get_f64_le(),
                buy_quote: self.buf.get_f64_le(),
                sell_quote: self.buf.get_f64_le(),
            });
        }
        Ok(bins)
    }

    fn finish(&self) -> Result<(), CodecError> {
        if self.buf.has_remaining() {
            return Err(CodecError::Invalid(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_candle() -> FootprintCandle {
        FootprintCandle {
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            timeframe: TimeFrame::Minute1,
            open_time: 1_700_000_040_000,
            close_time: 1_700_000_099_999,
            open: 37_000.5,
            high: 37_010.0,
            low: 36_990.25,
            close: 37_005.0,
            volume: 12.5,
            quote_volume: 462_500.0,
            buy_volume: 7.5,
            sell_volume: 5.0,
            buy_quote: 277_500.0,
            sell_quote: 185_000.0,
            trade_count: 321,
            delta: 2.5,
            delta_max: 3.0,
            delta_min: -0.75,
            first_trade_id: 9_000_001,
            last_trade_id: 9_000_321,
            is_complete: true,
            aggs: vec![
                AggregationBin {
                    price: 37_000.0,
                    buy_volume: 4.0,
                    sell_volume: 1.0,
                    buy_quote: 148_000.0,
                    sell_quote: 37_000.0,
                },
                AggregationBin {
                    price: 36_990.0,
                    buy_volume: 0.0,
                    sell_volume: 4.0,
                    buy_quote: 0.0,
                    sell_quote: 147_960.0,
                },
                AggregationBin {
                    price: 37_010.0,
                    buy_volume: 3.5,
                    sell_volume: 0.0,
                    buy_quote: 129_535.0,
                    sell_quote: 0.0,
                },
            ],
        }
    }

    #[test]
    fn test_candle_round_trip_keeps_bin_order() {
        let candle = sample_candle();
        let bytes = encode_candle(&candle).unwrap();
        let decoded = decode_candle(&bytes).unwrap();
        assert_eq!(decoded, candle);
        assert_eq!(decoded.aggs[1].price, 36_990.0);
    }

    #[test]
    fn test_candle_round_trip_defaults() {
        let candle = FootprintCandle {
            aggs: Vec::new(),
            trade_count: 0,
            quote_volume: 0.0,
            ..sample_candle()
        };
        let decoded = decode_candle(&encode_candle(&candle).unwrap()).unwrap();
        assert_eq!(decoded, candle);
        assert!(decoded.aggs.is_empty());
    }

    #[test]
    fn test_every_truncation_is_detected() {
        let bytes = encode_candle(&sample_candle()).unwrap();
        for cut in 0..bytes.len() {
            assert!(decode_candle(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_candle(&sample_candle()).unwrap();
        bytes.push(0);
        assert!(matches!(decode_candle(&bytes), Err(CodecError::Invalid(_))));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = encode_candle(&sample_candle()).unwrap();
        bytes[0] = 99;
        assert_eq!(decode_candle(&bytes), Err(CodecError::UnsupportedVersion(99)));
    }

    #[test]
    fn test_huge_bin_count_does_not_allocate() {
        let mut bytes = encode_footprint(1, &[]).unwrap();
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decode_footprint(&bytes), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_footprint_round_trip() {
        let candle = sample_candle();
        let bytes = encode_footprint(candle.open_time, &candle.aggs).unwrap();
        let record = decode_footprint(&bytes).unwrap();
        assert_eq!(record.open_time, candle.open_time);
        assert_eq!(record.aggs, candle.aggs);
    }
}
