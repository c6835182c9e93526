//! 核心数据模型定义
//!
//! 协议层与外部协作者（持久化、通知）之间交换的数据结构。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 临床事件类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ClinicalEventKind {
    NewOrder,      // 新检查申请
    NewReport,     // 新报告
    OrderUpdate,   // 申请变更
    ReportUpdate,  // 报告修订
    PatientUpdate, // 患者信息更新
    ScheduleChange, // 预约变更
}

impl ClinicalEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewOrder => "newOrder",
            Self::NewReport => "newReport",
            Self::OrderUpdate => "orderUpdate",
            Self::ReportUpdate => "reportUpdate",
            Self::PatientUpdate => "patientUpdate",
            Self::ScheduleChange => "scheduleChange",
        }
    }
}

impl std::fmt::Display for ClinicalEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 解码后的临床事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicalEvent {
    pub id: Uuid,
    pub kind: ClinicalEventKind,
    pub patient_ref: String,     // 患者标识 (PID-3)
    pub message_type: String,    // 例如 ORU^R01
    pub control_id: String,      // 原始消息控制ID
    pub source_endpoint: String, // 来源端点ID
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl ClinicalEvent {
    pub fn new(
        kind: ClinicalEventKind,
        patient_ref: impl Into<String>,
        message_type: impl Into<String>,
        control_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            patient_ref: patient_ref.into(),
            message_type: message_type.into(),
            control_id: control_id.into(),
            source_endpoint: String::new(),
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn with_source(mut self, endpoint_id: impl Into<String>) -> Self {
        self.source_endpoint = endpoint_id.into();
        self
    }
}

/// 从C-STORE数据集中提取的影像元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageMetadata {
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub sop_class_uid: Option<String>,
    pub modality: Option<String>,
    pub study_description: Option<String>,
    pub series_description: Option<String>,
    pub accession_number: Option<String>,
    pub instance_number: Option<i32>,
    /// 发送方AE标题
    pub calling_ae_title: Option<String>,
}

impl ImageMetadata {
    /// 获取DICOM对象的摘要信息
    pub fn summary(&self) -> String {
        format!(
            "患者ID={}, 检查UID={}, 序列UID={}, 模态={}",
            self.patient_id.as_deref().unwrap_or("未知"),
            self.study_instance_uid.as_deref().unwrap_or("未知"),
            self.series_instance_uid.as_deref().unwrap_or("未知"),
            self.modality.as_deref().unwrap_or("未知")
        )
    }
}

/// 已持久化的影像对象引用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectRef(pub String);

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
