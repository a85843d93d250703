use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// 全局应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    // EnvFilter 语法，例如 "info,footprint_store=debug"
    pub level: String,
    // 设置后额外按天滚动写入该目录
    pub dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

/// # Summary
/// 存储后端种类。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    // 分层追加写文件存储
    #[default]
    AppendOnly,
    // SQLite 压缩行存储
    Relational,
    // 整块二进制文件存储
    Block,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "append_only" | "append" | "file" => Ok(BackendKind::AppendOnly),
            "relational" | "sqlite" => Ok(BackendKind::Relational),
            "block" | "binary" => Ok(BackendKind::Block),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::AppendOnly => write!(f, "append_only"),
            BackendKind::Relational => write!(f, "relational"),
            BackendKind::Block => write!(f, "block"),
        }
    }
}

/// # Summary
/// 存储层配置，由调用方显式传入各后端构造函数。
///
/// # Invariants
/// - `data_dir` 是所有后端的数据根目录，各后端在其下使用独立子目录。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: String,
    pub backend: BackendKind,
    pub append: AppendConfig,
    pub relational: RelationalConfig,
    pub block: BlockConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            backend: BackendKind::default(),
            append: AppendConfig::default(),
            relational: RelationalConfig::default(),
            block: BlockConfig::default(),
        }
    }
}

impl StoreConfig {
    /// 以指定目录为根、其余取默认值的配置。
    pub fn with_data_dir(data_dir: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppendConfig {
    // 每个分区键在内存写缓存中保留的时间戳上限
    pub write_cache_per_key: usize,
    // 每次追加后是否 fsync 数据文件
    pub fsync: bool,
}

impl Default for AppendConfig {
    fn default() -> Self {
        Self {
            write_cache_per_key: 1000,
            fsync: false,
        }
    }
}

/// 关系型后端的分库方式。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardMode {
    // 所有交易所共用一个库
    #[default]
    Single,
    // 每个交易所一个库
    PerExchange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalConfig {
    pub shard_mode: ShardMode,
    // 单个事务内最多写入的行数
    pub batch_size: usize,
    // 以下参数只影响读吞吐，与正确性无关
    pub mmap_size: u64,
    pub cache_size_kib: u64,
    pub busy_timeout_secs: u64,
    pub max_connections: u32,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            shard_mode: ShardMode::Single,
            batch_size: 500,
            mmap_size: 256 * 1024 * 1024,
            cache_size_kib: 64 * 1024,
            busy_timeout_secs: 10,
            max_connections: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    // 每个数据块的 K 线数量
    pub block_size: usize,
    // 内存中最多缓存的序列数量
    pub max_cached_series: usize,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            block_size: 1000,
            max_cached_series: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.store.data_dir, "data");
        assert_eq!(config.store.backend, BackendKind::AppendOnly);
        assert_eq!(config.store.append.write_cache_per_key, 1000);
        assert_eq!(config.store.relational.batch_size, 500);
        assert_eq!(config.store.relational.shard_mode, ShardMode::Single);
        assert_eq!(config.store.block.block_size, 1000);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("append-only".parse::<BackendKind>().unwrap(), BackendKind::AppendOnly);
        assert_eq!("SQLite".parse::<BackendKind>().unwrap(), BackendKind::Relational);
        assert_eq!("block".parse::<BackendKind>().unwrap(), BackendKind::Block);
        assert!("parquet".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"backend":"relational","relational":{"shard_mode":"per_exchange"}}"#)
                .unwrap();
        assert_eq!(config.backend, BackendKind::Relational);
        assert_eq!(config.relational.shard_mode, ShardMode::PerExchange);
        assert_eq!(config.relational.batch_size, 500);
        assert_eq!(config.data_dir, "data");
    }
}
