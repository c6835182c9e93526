//! 集成层错误定义

use pacs_core::PacsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntegrationError {
    #[error("传输错误: {0}")]
    Transport(String),

    #[error("HL7消息格式错误: {0}")]
    MalformedMessage(String),

    #[error("HL7消息为空")]
    EmptyMessage,

    #[error("等待确认超时: control_id={control_id}, timeout={timeout_ms}ms")]
    AcknowledgmentTimeout { control_id: String, timeout_ms: u64 },

    #[error("查询超时: tag={tag}, timeout={timeout_ms}ms")]
    QueryTimeout { tag: String, timeout_ms: u64 },

    #[error("对端拒绝消息 ({code}): {text}")]
    NegativeAcknowledgment { code: String, text: String },

    #[error("查询被拒绝 ({status}): {text}")]
    QueryRejected { status: String, text: String },

    #[error("连接已关闭")]
    ConnectionClosed,

    #[error("控制ID已存在未完成的请求: {0}")]
    DuplicateControlId(String),

    #[error("未连接")]
    NotConnected,

    #[error("端点已存在: {0}")]
    EndpointExists(String),

    #[error("端点不存在: {0}")]
    EndpointNotFound(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error(transparent)]
    Dicom(#[from] PacsError),
}

impl IntegrationError {
    /// 需要由生命周期管理器触发重连的错误
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport(_) | Self::ConnectionClosed | Self::NotConnected => true,
            Self::Dicom(e) => e.is_transport(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for IntegrationError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IntegrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(IntegrationError::from(io).is_transport());
        assert!(IntegrationError::ConnectionClosed.is_transport());
        assert!(IntegrationError::Dicom(PacsError::Timeout("echo".into())).is_transport());

        assert!(!IntegrationError::EmptyMessage.is_transport());
        let nak = IntegrationError::NegativeAcknowledgment {
            code: "AE".into(),
            text: "bad field".into(),
        };
        assert!(!nak.is_transport());
        assert!(nak.to_string().contains("bad field"));
    }
}
