//! 通知协作者接口

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ClinicalEvent, ClinicalEventKind};

/// 发送给通知层的类型化事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: ClinicalEventKind,
    pub patient_ref: String,
    pub payload: serde_json::Value,
}

impl From<&ClinicalEvent> for Notification {
    fn from(event: &ClinicalEvent) -> Self {
        Self {
            kind: event.kind,
            patient_ref: event.patient_ref.clone(),
            payload: event.payload.clone(),
        }
    }
}

/// 通知发送器特征
///
/// 对协议层而言是发后即忘：实现方自行处理失败。
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}
