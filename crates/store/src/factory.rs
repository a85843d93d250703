use crate::append::AppendOnlyStore;
use crate::block::BlockStore;
use crate::relational::{ReadOnlyRelationalStore, RelationalStore};
use footprint_core::config::{BackendKind, StoreConfig};
use footprint_core::store::error::StoreError;
use footprint_core::store::port::CandleStore;
use std::sync::Arc;
use tracing::info;

/// # Summary
/// 按配置构建存储后端。
///
/// # Logic
/// 根据 `backend` 选择具体实现，调用方只依赖 `CandleStore` 契约。
///
/// # Arguments
/// * `config`: 存储配置，`data_dir` 下各后端使用独立子目录。
///
/// # Returns
/// 初始化失败时返回 `StoreError::InitError` 或底层错误。
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn CandleStore>, StoreError> {
    info!(backend = %config.backend, data_dir = %config.data_dir, "Opening candle store");
    let store: Arc<dyn CandleStore> = match config.backend {
        BackendKind::AppendOnly => Arc::new(AppendOnlyStore::new(config)?),
        BackendKind::Relational => Arc::new(RelationalStore::new(config).await?),
        BackendKind::Block => Arc::new(BlockStore::new(config)?),
    };
    Ok(store)
}

/// # Summary
/// 打开关系型存储的只读实例。
///
/// # Logic
/// 与 `backend` 配置无关，总是读取 `data_dir` 下关系型后端的库文件；
/// 库文件不存在时查询返回空结果。
pub fn open_reader(config: &StoreConfig) -> Arc<ReadOnlyRelationalStore> {
    Arc::new(ReadOnlyRelationalStore::new(config))
}
