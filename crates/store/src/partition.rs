use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use footprint_core::common::{DataKind, TimeFrame};
use footprint_core::store::error::StoreError;
use std::path::{Path, PathBuf};

/// 分区数据文件扩展名
pub const PARTITION_EXT: &str = "bin";

/// # Summary
/// 分区粒度。周期越短，分区越窄，使每个分区只容纳有限条记录。
///
/// # Invariants
/// - 同一周期下，分区标识的字典序与时间顺序一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    // ISO 周，`YYYY-Www`
    Week,
    // 自然月，`YYYY-MM`
    Month,
    // 自然年，`YYYY`
    Year,
}

impl Granularity {
    /// 根据 K 线周期选择分区粒度。
    pub fn for_timeframe(timeframe: TimeFrame) -> Self {
        if timeframe.is_intraday_minutes() {
            Granularity::Week
        } else if timeframe < TimeFrame::Day1 {
            Granularity::Month
        } else {
            Granularity::Year
        }
    }

    /// 分区标识的格式描述。
    pub fn pattern(&self) -> &'static str {
        match self {
            Granularity::Week => "YYYY-Www",
            Granularity::Month => "YYYY-MM",
            Granularity::Year => "YYYY",
        }
    }

    fn period_id(&self, dt: DateTime<Utc>) -> String {
        match self {
            Granularity::Week => {
                let week = dt.iso_week();
                format!("{:04}-W{:02}", week.year(), week.week())
            }
            Granularity::Month => format!("{:04}-{:02}", dt.year(), dt.month()),
            Granularity::Year => format!("{:04}", dt.year()),
        }
    }
}

/// # Summary
/// 一个时间戳所属的分区。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    // 分区标识，例如 2024-W07
    pub period_id: String,
    // 标识格式，例如 YYYY-Www
    pub pattern: &'static str,
    // 数据文件名，例如 2024-W07.bin
    pub file_name: String,
}

/// # Summary
/// 计算时间戳所属的分区。
///
/// # Logic
/// 1. 根据周期选择粒度。
/// 2. 按 UTC 时间格式化出分区标识与文件名。
///
/// # Arguments
/// * `timeframe`: K 线周期。
/// * `timestamp`: Unix 毫秒。
///
/// # Returns
/// 时间戳超出可表示范围时返回 `StoreError::Validation`。
pub fn partition_for(timeframe: TimeFrame, timestamp: i64) -> Result<Partition, StoreError> {
    let dt = DateTime::<Utc>::from_timestamp_millis(timestamp).ok_or_else(|| {
        StoreError::Validation(format!("timestamp {} out of range", timestamp))
    })?;
    let granularity = Granularity::for_timeframe(timeframe);
    let period_id = granularity.period_id(dt);
    let file_name = format!("{}.{}", period_id, PARTITION_EXT);
    Ok(Partition {
        period_id,
        pattern: granularity.pattern(),
        file_name,
    })
}

/// # Summary
/// 解析分区标识，得到其覆盖的闭区间 `[start, end]` (Unix 毫秒)。
///
/// # Returns
/// 标识与周期的粒度不符时返回 `None`。
pub fn period_bounds(timeframe: TimeFrame, period_id: &str) -> Option<(i64, i64)> {
    let (start, next) = match Granularity::for_timeframe(timeframe) {
        Granularity::Week => {
            let (year, week) = period_id.split_once("-W")?;
            let start = NaiveDate::from_isoywd_opt(year.parse().ok()?, week.parse().ok()?, Weekday::Mon)?;
            (start, start.checked_add_signed(Duration::days(7))?)
        }
        Granularity::Month => {
            let (year, month) = period_id.split_once('-')?;
            let year: i32 = year.parse().ok()?;
            let month: u32 = month.parse().ok()?;
            let start = NaiveDate::from_ymd_opt(year, month, 1)?;
            let next = if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(year, month + 1, 1)?
            };
            (start, next)
        }
        Granularity::Year => {
            let year: i32 = period_id.parse().ok()?;
            (NaiveDate::from_ymd_opt(year, 1, 1)?, NaiveDate::from_ymd_opt(year + 1, 1, 1)?)
        }
    };
    let start_ms = Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0)?).timestamp_millis();
    let next_ms = Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0)?).timestamp_millis();
    Some((start_ms, next_ms - 1))
}

/// 分区键：`exchange:symbol:kind:timeframe`，用于写缓存与锁表。
pub fn partition_key(exchange: &str, symbol: &str, kind: DataKind, timeframe: TimeFrame) -> String {
    format!("{}:{}:{}:{}", exchange, symbol, kind.dir_name(), timeframe)
}

/// 分区目录：`{root}/{exchange}/{symbol}/{candles|footprints}/{timeframe}`。
pub fn partition_dir(
    root: &Path,
    exchange: &str,
    symbol: &str,
    kind: DataKind,
    timeframe: TimeFrame,
) -> PathBuf {
    root.join(exchange)
        .join(symbol)
        .join(kind.dir_name())
        .join(timeframe.as_str())
}

/// 从数据文件名中取出分区标识，非数据文件返回 `None`。
pub fn period_from_file_name(name: &str) -> Option<&str> {
    let period = name.strip_suffix(PARTITION_EXT)?.strip_suffix('.')?;
    if period.is_empty() || period.starts_with('.') {
        return None;
    }
    Some(period)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(y: i32, m: u32, d: u32, h: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap().timestamp_millis()
    }

    #[test]
    fn test_granularity_scales_with_timeframe() {
        assert_eq!(Granularity::for_timeframe(TimeFrame::Minute1), Granularity::Week);
        assert_eq!(Granularity::for_timeframe(TimeFrame::Minute30), Granularity::Week);
        assert_eq!(Granularity::for_timeframe(TimeFrame::Hour1), Granularity::Month);
        assert_eq!(Granularity::for_timeframe(TimeFrame::Hour12), Granularity::Month);
        assert_eq!(Granularity::for_timeframe(TimeFrame::Day1), Granularity::Year);
        assert_eq!(Granularity::for_timeframe(TimeFrame::Week1), Granularity::Year);
    }

    #[test]
    fn test_partition_identifiers() {
        let p = partition_for(TimeFrame::Minute1, ms(2024, 2, 14, 10)).unwrap();
        assert_eq!(p.period_id, "2024-W07");
        assert_eq!(p.file_name, "2024-W07.bin");
        assert_eq!(p.pattern, "YYYY-Www");

        let p = partition_for(TimeFrame::Hour4, ms(2024, 2, 14, 10)).unwrap();
        assert_eq!(p.period_id, "2024-02");

        let p = partition_for(TimeFrame::Day1, ms(2024, 2, 14, 10)).unwrap();
        assert_eq!(p.period_id, "2024");
    }

    #[test]
    fn test_iso_week_year_boundary() {
        // 2025-12-29 属于 ISO 2026 年第 1 周
        let p = partition_for(TimeFrame::Minute5, ms(2025, 12, 29, 0)).unwrap();
        assert_eq!(p.period_id, "2026-W01");
        let p = partition_for(TimeFrame::Minute5, ms(2025, 12, 28, 23)).unwrap();
        assert_eq!(p.period_id, "2025-W52");
    }

    #[test]
    fn test_lexical_order_matches_time_order() {
        for tf in TimeFrame::ALL {
            let step = tf.duration_ms() * 37;
            let mut t = ms(2019, 12, 1, 0);
            let mut prev = partition_for(tf, t).unwrap().period_id;
            for _ in 0..500 {
                t += step;
                let cur = partition_for(tf, t).unwrap().period_id;
                assert!(prev <= cur, "{}: {} > {}", tf, prev, cur);
                prev = cur;
            }
        }
    }

    #[test]
    fn test_period_bounds_contain_their_timestamps() {
        for (tf, t) in [
            (TimeFrame::Minute1, ms(2024, 2, 14, 10)),
            (TimeFrame::Minute15, ms(2026, 1, 1, 0)),
            (TimeFrame::Hour1, ms(2024, 12, 31, 23)),
            (TimeFrame::Day1, ms(2023, 6, 1, 0)),
        ] {
            let p = partition_for(tf, t).unwrap();
            let (start, end) = period_bounds(tf, &p.period_id).unwrap();
            assert!(start <= t && t <= end, "{} {}", tf, p.period_id);
            assert_eq!(partition_for(tf, start).unwrap().period_id, p.period_id);
            assert_eq!(partition_for(tf, end).unwrap().period_id, p.period_id);
            assert_ne!(partition_for(tf, end + 1).unwrap().period_id, p.period_id);
        }
        assert!(period_bounds(TimeFrame::Minute1, "2024-02").is_none());
    }

    #[test]
    fn test_period_from_file_name() {
        assert_eq!(period_from_file_name("2024-W07.bin"), Some("2024-W07"));
        assert_eq!(period_from_file_name("2024-W07.idx"), None);
        assert_eq!(period_from_file_name(".2024.bin.tmp"), None);
        assert_eq!(period_from_file_name("_index.json"), None);
    }

    #[test]
    fn test_partition_layout() {
        let dir = partition_dir(Path::new("/data"), "binance", "BTCUSDT", DataKind::Footprint, TimeFrame::Minute1);
        assert_eq!(dir, PathBuf::from("/data/binance/BTCUSDT/footprints/1m"));
        assert_eq!(
            partition_key("binance", "BTCUSDT", DataKind::Candle, TimeFrame::Hour1),
            "binance:BTCUSDT:candles:1h"
        );
    }
}
