use thiserror::Error;

/// # Summary
/// 存储层错误枚举，覆盖输入校验、编解码、磁盘与数据库故障。
///
/// # Invariants
/// - 必须通过 `thiserror` 派生 `Error` trait。
/// - `Validation` 只会在任何 I/O 发生之前返回。
/// - 读路径上的 `NotFound` 由实现者转换为空结果，不向调用方抛出。
#[derive(Error, Debug)]
pub enum StoreError {
    /// 输入的 K 线不合法（缺少交易对、时间非正、未收盘等）
    #[error("Validation error: {0}")]
    Validation(String),
    /// 记录未找到
    #[error("Not found")]
    NotFound,
    /// 字节流损坏、截断或无法识别
    #[error("Codec error: {0}")]
    Codec(String),
    /// 磁盘或权限错误，原样向上传递
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// 数据库操作失败
    #[error("Database error: {0}")]
    Database(String),
    /// 初始化存储失败
    #[error("Initialization error: {0}")]
    InitError(String),
    /// 只读实例上调用了写操作
    #[error("Store is read-only")]
    ReadOnly,
    /// 未知或未分类的错误
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl StoreError {
    /// 是否属于调用方输入错误。
    pub fn is_validation(&self) -> bool {
        matches!(self, StoreError::Validation(_))
    }
}
