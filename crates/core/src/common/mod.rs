use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// # Summary
/// K 线时间周期枚举，定义单根 K 线覆盖的时间跨度。
///
/// # Invariants
/// - 每个周期都有固定的毫秒时长，不支持自然月这类变长周期。
/// - 字符串形式 (`1m`、`4h`、`1d` ...) 同时用作目录名与数据库字段值。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeFrame {
    // 1分钟
    #[serde(rename = "1m")]
    Minute1,
    // 3分钟
    #[serde(rename = "3m")]
    Minute3,
    // 5分钟
    #[serde(rename = "5m")]
    Minute5,
    // 15分钟
    #[serde(rename = "15m")]
    Minute15,
    // 30分钟
    #[serde(rename = "30m")]
    Minute30,
    // 1小时
    #[serde(rename = "1h")]
    Hour1,
    // 2小时
    #[serde(rename = "2h")]
    Hour2,
    // 4小时
    #[serde(rename = "4h")]
    Hour4,
    // 6小时
    #[serde(rename = "6h")]
    Hour6,
    // 8小时
    #[serde(rename = "8h")]
    Hour8,
    // 12小时
    #[serde(rename = "12h")]
    Hour12,
    // 1日
    #[serde(rename = "1d")]
    Day1,
    // 3日
    #[serde(rename = "3d")]
    Day3,
    // 1周
    #[serde(rename = "1w")]
    Week1,
}

const MINUTE_MS: i64 = 60_000;

impl TimeFrame {
    /// 全部支持的周期，按时长升序排列。
    pub const ALL: [TimeFrame; 14] = [
        TimeFrame::Minute1,
        TimeFrame::Minute3,
        TimeFrame::Minute5,
        TimeFrame::Minute15,
        TimeFrame::Minute30,
        TimeFrame::Hour1,
        TimeFrame::Hour2,
        TimeFrame::Hour4,
        TimeFrame::Hour6,
        TimeFrame::Hour8,
        TimeFrame::Hour12,
        TimeFrame::Day1,
        TimeFrame::Day3,
        TimeFrame::Week1,
    ];

    /// # Summary
    /// 返回该周期的毫秒时长。
    pub fn duration_ms(&self) -> i64 {
        match self {
            TimeFrame::Minute1 => MINUTE_MS,
            TimeFrame::Minute3 => 3 * MINUTE_MS,
            TimeFrame::Minute5 => 5 * MINUTE_MS,
            TimeFrame::Minute15 => 15 * MINUTE_MS,
            TimeFrame::Minute30 => 30 * MINUTE_MS,
            TimeFrame::Hour1 => 60 * MINUTE_MS,
            TimeFrame::Hour2 => 2 * 60 * MINUTE_MS,
            TimeFrame::Hour4 => 4 * 60 * MINUTE_MS,
            TimeFrame::Hour6 => 6 * 60 * MINUTE_MS,
            TimeFrame::Hour8 => 8 * 60 * MINUTE_MS,
            TimeFrame::Hour12 => 12 * 60 * MINUTE_MS,
            TimeFrame::Day1 => 24 * 60 * MINUTE_MS,
            TimeFrame::Day3 => 3 * 24 * 60 * MINUTE_MS,
            TimeFrame::Week1 => 7 * 24 * 60 * MINUTE_MS,
        }
    }

    /// 是否为小时以下的分钟级周期。
    pub fn is_intraday_minutes(&self) -> bool {
        self.duration_ms() < 60 * MINUTE_MS
    }

    /// 周期的短字符串形式。
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFrame::Minute1 => "1m",
            TimeFrame::Minute3 => "3m",
            TimeFrame::Minute5 => "5m",
            TimeFrame::Minute15 => "15m",
            TimeFrame::Minute30 => "30m",
            TimeFrame::Hour1 => "1h",
            TimeFrame::Hour2 => "2h",
            TimeFrame::Hour4 => "4h",
            TimeFrame::Hour6 => "6h",
            TimeFrame::Hour8 => "8h",
            TimeFrame::Hour12 => "12h",
            TimeFrame::Day1 => "1d",
            TimeFrame::Day3 => "3d",
            TimeFrame::Week1 => "1w",
        }
    }
}

impl FromStr for TimeFrame {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "1M" 在部分交易所表示自然月，这里不做大小写折叠以免与 1m 混淆
        match s {
            "1m" | "minute1" => Ok(TimeFrame::Minute1),
            "3m" | "minute3" => Ok(TimeFrame::Minute3),
            "5m" | "minute5" => Ok(TimeFrame::Minute5),
            "15m" | "minute15" => Ok(TimeFrame::Minute15),
            "30m" | "minute30" => Ok(TimeFrame::Minute30),
            "1h" | "hour1" => Ok(TimeFrame::Hour1),
            "2h" | "hour2" => Ok(TimeFrame::Hour2),
            "4h" | "hour4" => Ok(TimeFrame::Hour4),
            "6h" | "hour6" => Ok(TimeFrame::Hour6),
            "8h" | "hour8" => Ok(TimeFrame::Hour8),
            "12h" | "hour12" => Ok(TimeFrame::Hour12),
            "1d" | "day1" => Ok(TimeFrame::Day1),
            "3d" | "day3" => Ok(TimeFrame::Day3),
            "1w" | "week1" => Ok(TimeFrame::Week1),
            _ => Err(format!("Unknown TimeFrame: {}", s)),
        }
    }
}

impl std::fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// # Summary
/// 持久化数据种类：普通 K 线或订单流足迹。
///
/// # Invariants
/// - 目录名固定为 `candles` / `footprints`，一旦落盘不得更改。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Candle,
    Footprint,
}

impl DataKind {
    /// 数据种类对应的目录名。
    pub fn dir_name(&self) -> &'static str {
        match self {
            DataKind::Candle => "candles",
            DataKind::Footprint => "footprints",
        }
    }
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// # Summary
/// 一条 K 线序列的身份：交易所 + 交易对 + 周期。
///
/// # Invariants
/// - 三者组合在存储中唯一标识一条时间序列。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    // 交易所代码 (例如: binance)
    pub exchange: String,
    // 交易对 (例如: BTCUSDT)
    pub symbol: String,
    // K 线周期
    pub timeframe: TimeFrame,
}

impl SeriesKey {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>, timeframe: TimeFrame) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.symbol, self.timeframe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_round_trip_strings() {
        for tf in TimeFrame::ALL {
            let parsed: TimeFrame = tf.to_string().parse().unwrap();
            assert_eq!(parsed, tf);
        }
        assert!("1M".parse::<TimeFrame>().is_err());
        assert!("7m".parse::<TimeFrame>().is_err());
    }

    #[test]
    fn test_timeframe_durations_ascending() {
        let durations: Vec<i64> = TimeFrame::ALL.iter().map(|t| t.duration_ms()).collect();
        let mut sorted = durations.clone();
        sorted.sort();
        assert_eq!(durations, sorted);
        assert!(TimeFrame::Minute30.is_intraday_minutes());
        assert!(!TimeFrame::Hour1.is_intraday_minutes());
    }

    #[test]
    fn test_timeframe_serde_uses_short_form() {
        let json = serde_json::to_string(&TimeFrame::Hour4).unwrap();
        assert_eq!(json, "\"4h\"");
        let tf: TimeFrame = serde_json::from_str("\"1w\"").unwrap();
        assert_eq!(tf, TimeFrame::Week1);
    }

    #[test]
    fn test_series_key_display() {
        let key = SeriesKey::new("binance", "BTCUSDT", TimeFrame::Minute1);
        assert_eq!(key.to_string(), "binance:BTCUSDT:1m");
    }
}
