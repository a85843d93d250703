//! 关系型后端的分库管理。
//!
//! 分库名经过驻留后映射到连接池数组中的下标，首次访问时创建，之后按下标查找。

use dashmap::DashMap;
use footprint_core::config::{RelationalConfig, ShardMode};
use footprint_core::store::error::StoreError;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::SCHEMA_SQL;
use crate::fs;

const SINGLE_SHARD: &str = "candles";
const EXCHANGE_PREFIX: &str = "exchange_";
const DB_EXT: &str = "db";

/// # Summary
/// 一组 SQLite 库及其连接池。
///
/// # Invariants
/// - `keys` 中的下标始终指向 `pools` 中已存在的元素，连接池只增不减（`close` 时整体清空）。
/// - 只读实例从不创建库文件，也不执行建表语句。
pub struct ShardSet {
    base_path: PathBuf,
    config: RelationalConfig,
    read_only: bool,
    keys: DashMap<String, usize>,
    pools: RwLock<Vec<SqlitePool>>,
    init_lock: Mutex<()>,
}

impl ShardSet {
    pub fn new(base_path: PathBuf, config: RelationalConfig, read_only: bool) -> Self {
        Self {
            base_path,
            config,
            read_only,
            keys: DashMap::new(),
            pools: RwLock::new(Vec::new()),
            init_lock: Mutex::new(()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn config(&self) -> &RelationalConfig {
        &self.config
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// 交易所所属的分库名。
    pub fn shard_for(&self, exchange: &str) -> String {
        match self.config.shard_mode {
            ShardMode::Single => SINGLE_SHARD.to_string(),
            ShardMode::PerExchange => exchange.to_string(),
        }
    }

    fn db_path(&self, shard: &str) -> PathBuf {
        let name = match self.config.shard_mode {
            ShardMode::Single => format!("{}.{}", SINGLE_SHARD, DB_EXT),
            ShardMode::PerExchange => format!("{}{}.{}", EXCHANGE_PREFIX, shard, DB_EXT),
        };
        self.base_path.join(name)
    }

    /// # Summary
    /// 构造连接参数。
    ///
    /// # Logic
    /// WAL 允许写者活跃时并发读；mmap 与 cache 参数只影响读吞吐。
    fn connect_options(&self, path: &Path) -> SqliteConnectOptions {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .busy_timeout(Duration::from_secs(self.config.busy_timeout_secs))
            .pragma("mmap_size", self.config.mmap_size.to_string())
            .pragma("cache_size", format!("-{}", self.config.cache_size_kib));
        if self.read_only {
            options.read_only(true).create_if_missing(false)
        } else {
            options
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        }
    }

    async fn cached(&self, shard: &str) -> Option<SqlitePool> {
        let idx = self.keys.get(shard).map(|entry| *entry.value())?;
        self.pools.read().await.get(idx).cloned()
    }

    /// # Summary
    /// 获取或初始化分库的连接池。
    ///
    /// # Logic
    /// 1. 已缓存则直接返回。
    /// 2. 加初始化锁后再次检查，避免并发创建同一个库。
    /// 3. 库文件不存在且不允许创建（读路径或只读实例）时返回 `None`。
    /// 4. 否则创建库文件并执行建表语句。
    pub async fn pool(&self, shard: &str, create: bool) -> Result<Option<SqlitePool>, StoreError> {
        if let Some(pool) = self.cached(shard).await {
            return Ok(Some(pool));
        }

        let _guard = self.init_lock.lock().await;
        if let Some(pool) = self.cached(shard).await {
            return Ok(Some(pool));
        }

        let path = self.db_path(shard);
        let create = create && !self.read_only;
        if !create && !tokio::fs::try_exists(&path).await? {
            debug!(path = ?path, "Database not present");
            return Ok(None);
        }
        if create {
            tokio::fs::create_dir_all(&self.base_path).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(self.config.max_connections.max(1))
            .connect_with(self.connect_options(&path))
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if !self.read_only {
            sqlx::query(SCHEMA_SQL)
                .execute(&pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        let mut pools = self.pools.write().await;
        pools.push(pool.clone());
        self.keys.insert(shard.to_string(), pools.len() - 1);
        info!(path = ?path, read_only = self.read_only, "Opened candle database");
        Ok(Some(pool))
    }

    /// 写路径使用：读写实例总能拿到连接池。
    pub async fn writable_pool(&self, exchange: &str) -> Result<SqlitePool, StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.pool(&self.shard_for(exchange), true)
            .await?
            .ok_or_else(|| StoreError::InitError(format!("no database for exchange {}", exchange)))
    }

    /// 已存在的全部分库名，包括磁盘上尚未打开的库。
    async fn known_shards(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut shards: BTreeSet<String> = self.keys.iter().map(|e| e.key().clone()).collect();
        match self.config.shard_mode {
            ShardMode::Single => {
                shards.insert(SINGLE_SHARD.to_string());
            }
            ShardMode::PerExchange => {
                let suffix = format!(".{}", DB_EXT);
                for name in fs::list_file_names(&self.base_path).await? {
                    if let Some(shard) = name
                        .strip_prefix(EXCHANGE_PREFIX)
                        .and_then(|rest| rest.strip_suffix(suffix.as_str()))
                    {
                        shards.insert(shard.to_string());
                    }
                }
            }
        }
        Ok(shards)
    }

    /// # Summary
    /// 查询涉及的连接池，不会创建新的库文件。
    ///
    /// # Arguments
    /// * `exchange`: 指定交易所时只返回其所在分库，否则返回全部分库。
    pub async fn pools_for(&self, exchange: Option<&str>) -> Result<Vec<SqlitePool>, StoreError> {
        let shards = match exchange {
            Some(ex) => BTreeSet::from([self.shard_for(ex)]),
            None => self.known_shards().await?,
        };
        let mut out = Vec::with_capacity(shards.len());
        for shard in shards {
            if let Some(pool) = self.pool(&shard, false).await? {
                out.push(pool);
            }
        }
        Ok(out)
    }

    /// 全部库文件（含 WAL 文件）占用的字节数。
    pub async fn size_bytes(&self) -> Result<u64, StoreError> {
        let mut total = 0u64;
        for name in fs::list_file_names(&self.base_path).await? {
            if name.contains(&format!(".{}", DB_EXT)) {
                total += tokio::fs::metadata(self.base_path.join(&name)).await?.len();
            }
        }
        Ok(total)
    }

    /// 关闭全部连接池。
    pub async fn close(&self) {
        let mut pools = self.pools.write().await;
        for pool in pools.iter() {
            pool.close().await;
        }
        pools.clear();
        self.keys.clear();
        info!(path = ?self.base_path, "Closed candle databases");
    }
}
