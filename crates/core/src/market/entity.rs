use crate::common::{SeriesKey, TimeFrame};
use crate::store::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// # Summary
/// 单个价位上的订单流聚合，记录该价位在 K 线区间内的主动买卖量。
///
/// # Invariants
/// - 所有数值非负。
/// - 旧版本数据没有成交额字段，反序列化时缺省为 0。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationBin {
    // 价位
    pub price: f64,
    // 主动买入量
    #[serde(alias = "buyVol")]
    pub buy_volume: f64,
    // 主动卖出量
    #[serde(alias = "sellVol")]
    pub sell_volume: f64,
    // 主动买入成交额
    #[serde(default)]
    pub buy_quote: f64,
    // 主动卖出成交额
    #[serde(default)]
    pub sell_quote: f64,
}

impl AggregationBin {
    /// 该价位没有任何成交时为空。
    pub fn is_empty(&self) -> bool {
        self.buy_volume == 0.0
            && self.sell_volume == 0.0
            && self.buy_quote == 0.0
            && self.sell_quote == 0.0
    }
}

/// # Summary
/// 足迹 K 线实体：在 OHLCV 基础上附带逐价位的买卖量分布。
///
/// # Invariants
/// - 身份键为 `(exchange, symbol, timeframe, open_time)`。
/// - 只有 `is_complete == true` 的 K 线允许落盘。
/// - `aggs` 的顺序即写入顺序，编解码必须保持。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FootprintCandle {
    // 交易所代码
    pub exchange: String,
    // 交易对
    pub symbol: String,
    // K 线周期
    #[serde(alias = "interval")]
    pub timeframe: TimeFrame,
    // 开盘时间 (Unix 毫秒)
    #[serde(alias = "t")]
    pub open_time: i64,
    // 收盘时间 (Unix 毫秒)
    #[serde(default, alias = "T")]
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    // 成交量
    pub volume: f64,
    // 成交额
    #[serde(default)]
    pub quote_volume: f64,
    // 主动买入量
    #[serde(default)]
    pub buy_volume: f64,
    // 主动卖出量
    #[serde(default)]
    pub sell_volume: f64,
    // 主动买入成交额
    #[serde(default)]
    pub buy_quote: f64,
    // 主动卖出成交额
    #[serde(default)]
    pub sell_quote: f64,
    // 成交笔数
    #[serde(default, alias = "n")]
    pub trade_count: u64,
    // 买卖差 (buy_volume - sell_volume)
    #[serde(default)]
    pub delta: f64,
    // K 线内 delta 的最大值
    #[serde(default)]
    pub delta_max: f64,
    // K 线内 delta 的最小值
    #[serde(default)]
    pub delta_min: f64,
    #[serde(default)]
    pub first_trade_id: i64,
    #[serde(default)]
    pub last_trade_id: i64,
    // 是否已收盘
    #[serde(default, alias = "complete", alias = "isClosed")]
    pub is_complete: bool,
    // 逐价位聚合
    #[serde(default, alias = "bins")]
    pub aggs: Vec<AggregationBin>,
}

/// # Summary
/// K 线的唯一身份键。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandleKey {
    pub series: SeriesKey,
    pub open_time: i64,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.series, self.open_time)
    }
}

/// 标识符中允许出现的字符，保证可以安全地作为路径片段使用。
fn is_safe_identifier(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

impl FootprintCandle {
    /// # Summary
    /// 落盘前的前置校验。
    ///
    /// # Logic
    /// 1. 交易所、交易对必须非空且只包含 `[A-Za-z0-9._-]`。
    /// 2. 开盘时间必须为正。
    /// 3. K 线必须已收盘。
    ///
    /// # Returns
    /// 校验失败返回 `StoreError::Validation`，此时调用方不得进行任何 I/O。
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.symbol.is_empty() {
            return Err(StoreError::Validation("candle has no symbol".to_string()));
        }
        if !is_safe_identifier(&self.symbol) {
            return Err(StoreError::Validation(format!(
                "symbol contains unsupported characters: {:?}",
                self.symbol
            )));
        }
        if self.exchange.is_empty() {
            return Err(StoreError::Validation(format!(
                "candle {} has no exchange",
                self.symbol
            )));
        }
        if !is_safe_identifier(&self.exchange) {
            return Err(StoreError::Validation(format!(
                "exchange contains unsupported characters: {:?}",
                self.exchange
            )));
        }
        if self.open_time <= 0 {
            return Err(StoreError::Validation(format!(
                "candle {} has non-positive open time {}",
                self.symbol, self.open_time
            )));
        }
        if !self.is_complete {
            return Err(StoreError::Validation(format!(
                "candle {}@{} is not complete",
                self.symbol, self.open_time
            )));
        }
        Ok(())
    }

    /// 所属序列的身份。
    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(self.exchange.clone(), self.symbol.clone(), self.timeframe)
    }

    /// 唯一身份键。
    pub fn key(&self) -> CandleKey {
        CandleKey {
            series: self.series(),
            open_time: self.open_time,
        }
    }

    /// 至少有一个非空价位时才视为带有足迹数据。
    pub fn has_footprint(&self) -> bool {
        self.aggs.iter().any(|bin| !bin.is_empty())
    }

    /// 开盘时间的 `DateTime` 形式，越界时返回 None。
    pub fn open_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.open_time)
    }

    /// 去掉逐价位聚合后的副本，用于只写 K 线主体的场景。
    pub fn without_aggs(&self) -> Self {
        Self {
            aggs: Vec::new(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FootprintCandle {
        FootprintCandle {
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            timeframe: TimeFrame::Minute1,
            open_time: 1_700_000_040_000,
            close_time: 1_700_000_099_999,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            quote_volume: 15.0,
            buy_volume: 6.0,
            sell_volume: 4.0,
            buy_quote: 9.0,
            sell_quote: 6.0,
            trade_count: 12,
            delta: 2.0,
            delta_max: 3.0,
            delta_min: -1.0,
            first_trade_id: 100,
            last_trade_id: 111,
            is_complete: true,
            aggs: vec![AggregationBin {
                price: 1.0,
                buy_volume: 6.0,
                sell_volume: 4.0,
                buy_quote: 9.0,
                sell_quote: 6.0,
            }],
        }
    }

    #[test]
    fn test_validate_accepts_complete_candle() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let mut c = sample();
        c.is_complete = false;
        assert!(matches!(c.validate(), Err(StoreError::Validation(_))));

        let mut c = sample();
        c.symbol.clear();
        assert!(matches!(c.validate(), Err(StoreError::Validation(_))));

        let mut c = sample();
        c.open_time = 0;
        assert!(matches!(c.validate(), Err(StoreError::Validation(_))));

        let mut c = sample();
        c.symbol = "../etc".to_string();
        assert!(matches!(c.validate(), Err(StoreError::Validation(_))));

        let mut c = sample();
        c.exchange = String::new();
        assert!(matches!(c.validate(), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_open_datetime_and_key() {
        let c = sample();
        let dt = c.open_datetime().unwrap();
        assert_eq!(dt.timestamp_millis(), c.open_time);
        assert_eq!(c.key().series, c.series());
        assert_eq!(c.key().open_time, c.open_time);
    }

    #[test]
    fn test_has_footprint_ignores_empty_bins() {
        let mut c = sample();
        assert!(c.has_footprint());
        c.aggs = vec![AggregationBin {
            price: 1.0,
            ..Default::default()
        }];
        assert!(!c.has_footprint());
        c.aggs.clear();
        assert!(!c.has_footprint());
    }

    #[test]
    fn test_legacy_json_field_names() {
        let json = r#"{
            "exchange": "binance",
            "symbol": "ETHUSDT",
            "interval": "5m",
            "t": 1700000100000,
            "open": 1.0, "high": 1.0, "low": 1.0, "close": 1.0, "volume": 2.0,
            "n": 7,
            "isClosed": true,
            "bins": [{"price": 1.0, "buyVol": 1.5, "sellVol": 0.5}]
        }"#;
        let c: FootprintCandle = serde_json::from_str(json).unwrap();
        assert_eq!(c.timeframe, TimeFrame::Minute5);
        assert_eq!(c.open_time, 1_700_000_100_000);
        assert_eq!(c.trade_count, 7);
        assert!(c.is_complete);
        assert_eq!(c.aggs.len(), 1);
        assert_eq!(c.aggs[0].buy_volume, 1.5);
        assert_eq!(c.aggs[0].buy_quote, 0.0);
    }
}
