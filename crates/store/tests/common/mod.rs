#![allow(dead_code)]

use footprint_core::common::TimeFrame;
use footprint_core::config::StoreConfig;
use footprint_core::market::entity::{AggregationBin, FootprintCandle};
use std::path::Path;

/// 2023-11-14 22:14:00 UTC，分钟对齐
pub const T0: i64 = 1_700_000_040_000;
pub const MINUTE: i64 = 60_000;

pub fn config(dir: &Path) -> StoreConfig {
    StoreConfig::with_data_dir(dir.to_string_lossy().into_owned())
}

/// 带一个价位聚合的已收盘 K 线。
pub fn candle(exchange: &str, symbol: &str, timeframe: TimeFrame, open_time: i64) -> FootprintCandle {
    let price = 100.0 + f64::from(u8::try_from((open_time / MINUTE).rem_euclid(100)).unwrap_or(0));
    FootprintCandle {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        timeframe,
        open_time,
        close_time: open_time + timeframe.duration_ms() - 1,
        open: price,
        high: price + 1.0,
        low: price - 1.0,
        close: price + 0.5,
        volume: 10.0,
        quote_volume: price * 10.0,
        buy_volume: 6.0,
        sell_volume: 4.0,
        buy_quote: price * 6.0,
        sell_quote: price * 4.0,
        trade_count: 42,
        delta: 2.0,
        delta_max: 3.0,
        delta_min: -1.0,
        first_trade_id: open_time,
        last_trade_id: open_time + 41,
        is_complete: true,
        aggs: vec![AggregationBin {
            price,
            buy_volume: 6.0,
            sell_volume: 4.0,
            buy_quote: price * 6.0,
            sell_quote: price * 4.0,
        }],
    }
}

pub fn btc(open_time: i64) -> FootprintCandle {
    candle("binance", "BTCUSDT", TimeFrame::Minute1, open_time)
}

pub fn open_times(candles: &[FootprintCandle]) -> Vec<i64> {
    candles.iter().map(|c| c.open_time).collect()
}
