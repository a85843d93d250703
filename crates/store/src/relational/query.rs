//! 关系型后端的读路径，读写实例与只读实例共用。

use super::shard::ShardSet;
use crate::codec::envelope;
use footprint_core::common::TimeFrame;
use footprint_core::market::entity::FootprintCandle;
use footprint_core::store::error::StoreError;
use footprint_core::store::port::{
    AggregateQuery, AggregateRow, CandleFilter, FindOptions, SortOrder, StorageSummary,
};
use futures::future::try_join_all;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// 解码 `data` 列；损坏的行记录日志后跳过。
fn decode_rows(rows: Vec<(String, Vec<u8>)>) -> Vec<FootprintCandle> {
    rows.into_iter()
        .filter_map(|(id, data)| match envelope::decode_candle(&data) {
            Ok(candle) => Some(candle),
            Err(e) => {
                warn!(id = %id, error = %e, "Skipping unreadable candle row");
                None
            }
        })
        .collect()
}

async fn fetch_candles(
    pool: &SqlitePool,
    mut qb: QueryBuilder<'_, Sqlite>,
) -> Result<Vec<FootprintCandle>, StoreError> {
    let rows: Vec<(String, Vec<u8>)> = qb
        .build_query_as()
        .fetch_all(pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(decode_rows(rows))
}

/// 追加 `symbol IN (...)` 条件，集合为空时不追加。
fn push_symbols<'a>(qb: &mut QueryBuilder<'a, Sqlite>, symbols: &'a [String]) {
    if symbols.is_empty() {
        return;
    }
    qb.push(" AND symbol IN (");
    let mut separated = qb.separated(", ");
    for symbol in symbols {
        separated.push_bind(symbol.as_str());
    }
    separated.push_unseparated(")");
}

fn compare_candles(a: &FootprintCandle, b: &FootprintCandle, order: SortOrder) -> std::cmp::Ordering {
    let by_time = match order {
        SortOrder::Asc => a.open_time.cmp(&b.open_time),
        SortOrder::Desc => b.open_time.cmp(&a.open_time),
    };
    by_time
        .then_with(|| a.symbol.cmp(&b.symbol))
        .then_with(|| a.exchange.cmp(&b.exchange))
        .then_with(|| a.timeframe.cmp(&b.timeframe))
}

impl ShardSet {
    /// # Summary
    /// 读取一条序列。
    ///
    /// # Logic
    /// 只有 `limit` 没有起点时按降序取最近 N 行再翻转，结果始终升序。
    pub async fn query_series(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: TimeFrame,
        options: &FindOptions,
    ) -> Result<Vec<FootprintCandle>, StoreError> {
        let Some(pool) = self.pool(&self.shard_for(exchange), false).await? else {
            return Ok(Vec::new());
        };

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, data FROM candles WHERE symbol = ");
        qb.push_bind(symbol)
            .push(" AND exchange = ")
            .push_bind(exchange)
            .push(" AND timeframe = ")
            .push_bind(timeframe.as_str());
        if let Some(start) = options.start_time {
            qb.push(" AND open_time >= ").push_bind(start);
        }
        if let Some(end) = options.end_time {
            qb.push(" AND open_time <= ").push_bind(end);
        }

        let latest_first = options.limit.is_some() && options.start_time.is_none();
        qb.push(if latest_first {
            " ORDER BY open_time DESC"
        } else {
            " ORDER BY open_time ASC"
        });
        if let Some(limit) = options.limit {
            qb.push(" LIMIT ").push_bind(to_i64(limit));
        }

        let mut candles = fetch_candles(&pool, qb).await?;
        if latest_first {
            candles.reverse();
        }
        Ok(candles)
    }

    pub async fn query_latest(
        &self,
        symbol: &str,
        exchange: &str,
        timeframe: TimeFrame,
    ) -> Result<Option<FootprintCandle>, StoreError> {
        let mut latest = self
            .query_series(symbol, exchange, timeframe, &FindOptions::all().with_limit(1))
            .await?;
        Ok(latest.pop())
    }

    /// # Summary
    /// 高级过滤。
    ///
    /// # Logic
    /// 1. 每个分库取排序后的前 `offset + limit` 行。
    /// 2. 在内存中合并排序后再应用 `offset` / `limit`，单库与多库走同一条路径。
    pub async fn query_filter(&self, filter: &CandleFilter) -> Result<Vec<FootprintCandle>, StoreError> {
        let pools = self.pools_for(filter.exchange.as_deref()).await?;
        let offset = filter.offset.unwrap_or(0);
        let window = filter.limit.map(|l| l.saturating_add(offset));

        let per_shard = pools.iter().map(|pool| {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, data FROM candles WHERE 1 = 1");
            push_symbols(&mut qb, &filter.symbols);
            if let Some(exchange) = &filter.exchange {
                qb.push(" AND exchange = ").push_bind(exchange.as_str());
            }
            if let Some(timeframe) = filter.timeframe {
                qb.push(" AND timeframe = ").push_bind(timeframe.as_str());
            }
            if let Some(start) = filter.start_time {
                qb.push(" AND open_time >= ").push_bind(start);
            }
            if let Some(end) = filter.end_time {
                qb.push(" AND open_time <= ").push_bind(end);
            }
            qb.push(match filter.order {
                SortOrder::Asc => " ORDER BY open_time ASC, symbol ASC, exchange ASC",
                SortOrder::Desc => " ORDER BY open_time DESC, symbol ASC, exchange ASC",
            });
            if let Some(window) = window {
                qb.push(" LIMIT ").push_bind(to_i64(window));
            }
            fetch_candles(pool, qb)
        });

        let mut merged: Vec<FootprintCandle> = try_join_all(per_shard).await?.into_iter().flatten().collect();
        merged.sort_by(|a, b| compare_candles(a, b, filter.order));

        let iter = merged.into_iter().skip(offset);
        Ok(match filter.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    /// # Summary
    /// 按 (symbol, exchange, timeframe) 分组统计。
    ///
    /// # Logic
    /// 分库以交易所划分，同一分组不会跨库，各库结果直接拼接后排序。
    pub async fn query_aggregate(&self, query: &AggregateQuery) -> Result<Vec<AggregateRow>, StoreError> {
        let pools = self.pools_for(query.exchange.as_deref()).await?;
        let min_count = query.min_count.map(|c| i64::try_from(c).unwrap_or(i64::MAX));

        let per_shard = pools.iter().map(|pool| {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT symbol, exchange, timeframe, COUNT(*), MIN(open_time), MAX(open_time) FROM candles WHERE 1 = 1",
            );
            push_symbols(&mut qb, &query.symbols);
            if let Some(exchange) = &query.exchange {
                qb.push(" AND exchange = ").push_bind(exchange.as_str());
            }
            if let Some(timeframe) = query.timeframe {
                qb.push(" AND timeframe = ").push_bind(timeframe.as_str());
            }
            qb.push(" GROUP BY symbol, exchange, timeframe");
            if let Some(min) = min_count {
                qb.push(" HAVING COUNT(*) >= ").push_bind(min);
            }
            async move {
                qb.build_query_as::<(String, String, String, i64, i64, i64)>()
                    .fetch_all(pool)
                    .await
                    .map_err(|e| StoreError::Database(e.to_string()))
            }
        });

        let mut rows: Vec<AggregateRow> = try_join_all(per_shard)
            .await?
            .into_iter()
            .flatten()
            .filter_map(|(symbol, exchange, timeframe, count, earliest, latest)| {
                match timeframe.parse::<TimeFrame>() {
                    Ok(timeframe) => Some(AggregateRow {
                        symbol,
                        exchange,
                        timeframe,
                        count: u64::try_from(count).unwrap_or(0),
                        earliest,
                        latest,
                    }),
                    Err(e) => {
                        warn!(symbol = %symbol, exchange = %exchange, error = %e, "Skipping group with unknown timeframe");
                        None
                    }
                }
            })
            .collect();
        rows.sort_by(|a, b| {
            (&a.symbol, &a.exchange, a.timeframe).cmp(&(&b.symbol, &b.exchange, b.timeframe))
        });
        Ok(rows)
    }

    /// # Summary
    /// 多个交易对在同一时间窗口内的 K 线。
    ///
    /// # Returns
    /// 每个请求的交易对都有一个条目，没有数据时为空列表。
    pub async fn query_cross_symbol(
        &self,
        symbols: &[String],
        exchange: &str,
        timeframe: TimeFrame,
        start_time: i64,
        end_time: i64,
    ) -> Result<BTreeMap<String, Vec<FootprintCandle>>, StoreError> {
        let mut out: BTreeMap<String, Vec<FootprintCandle>> =
            symbols.iter().map(|s| (s.clone(), Vec::new())).collect();
        if symbols.is_empty() {
            return Ok(out);
        }
        let Some(pool) = self.pool(&self.shard_for(exchange), false).await? else {
            return Ok(out);
        };

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, data FROM candles WHERE exchange = ");
        qb.push_bind(exchange)
            .push(" AND timeframe = ")
            .push_bind(timeframe.as_str())
            .push(" AND open_time >= ")
            .push_bind(start_time)
            .push(" AND open_time <= ")
            .push_bind(end_time);
        push_symbols(&mut qb, symbols);
        qb.push(" ORDER BY symbol ASC, open_time ASC");

        for candle in fetch_candles(&pool, qb).await? {
            if let Some(list) = out.get_mut(&candle.symbol) {
                list.push(candle);
            }
        }
        Ok(out)
    }

    pub async fn query_symbols(&self, exchange: Option<&str>) -> Result<Vec<String>, StoreError> {
        let pools = self.pools_for(exchange).await?;
        let mut symbols = BTreeSet::new();
        for pool in pools {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT DISTINCT symbol FROM candles");
            if let Some(ex) = exchange {
                qb.push(" WHERE exchange = ").push_bind(ex);
            }
            let rows: Vec<(String,)> = qb
                .build_query_as()
                .fetch_all(&pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
            symbols.extend(rows.into_iter().map(|(s,)| s));
        }
        Ok(symbols.into_iter().collect())
    }

    /// 各分库统计之和。
    pub async fn query_summary(&self) -> Result<StorageSummary, StoreError> {
        let pools = self.pools_for(None).await?;
        let mut summary = StorageSummary {
            databases: u64::try_from(pools.len()).unwrap_or(u64::MAX),
            size_bytes: self.size_bytes().await?,
            ..StorageSummary::default()
        };

        for pool in pools {
            let (total, series, earliest, latest): (i64, i64, Option<i64>, Option<i64>) = sqlx::query_as(
                "SELECT COUNT(*), COUNT(DISTINCT symbol || ':' || exchange || ':' || timeframe), MIN(open_time), MAX(open_time) FROM candles",
            )
            .fetch_one(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            summary.total_candles += u64::try_from(total).unwrap_or(0);
            summary.series += u64::try_from(series).unwrap_or(0);
            summary.earliest = match (summary.earliest, earliest) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            summary.latest = match (summary.latest, latest) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        Ok(summary)
    }
}
