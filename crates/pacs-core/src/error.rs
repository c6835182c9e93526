//! 错误定义模块

use thiserror::Error;

/// PACS系统统一错误类型
#[derive(Error, Debug)]
pub enum PacsError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("DICOM处理错误: {0}")]
    Dicom(String),

    #[error("DICOM解析错误: {0}")]
    DicomParseError(String),

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("关联被拒绝: {0}")]
    AssociationRejected(String),

    #[error("不支持的传输语法: {0}")]
    UnsupportedTransferSyntax(String),

    #[error("存储处理失败: {0}")]
    StoreProcessing(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("资源未找到: {0}")]
    NotFound(String),
}

impl PacsError {
    /// 是否为传输层错误（需要由生命周期管理器重连）
    pub fn is_transport(&self) -> bool {
        matches!(self, PacsError::Network(_) | PacsError::Timeout(_))
    }
}

/// PACS系统统一结果类型
pub type Result<T> = std::result::Result<T, PacsError>;
