//! # PACS集成模块
//!
//! 与RIS/HIS及影像设备之间的协议层：
//! - HL7 v2.5 消息模型与MLLP编解码
//! - HL7会话客户端（确认关联、查询关联、入站分发）
//! - 临床事件路由到持久化与通知协作者
//! - 端点连接生命周期管理（健康检查、退避重连）
//! - 运维HTTP接口

pub mod api;
pub mod client;
pub mod config;
pub mod connectors;
pub mod error;
pub mod events;
pub mod hl7;
pub mod lifecycle;
pub mod mllp;

pub use api::{ApiServer, ApiState};
pub use client::{ClientStats, Hl7Client, SessionEvent, SessionState};
pub use config::{DicomEndpointConfig, EndpointConfig, EndpointKind, HealthCheckConfig, Hl7TransportConfig, RetryPolicy};
pub use connectors::{Connector, ConnectorFactory, DefaultConnectorFactory, DicomConnector, Hl7Connector};
pub use error::{IntegrationError, Result};
pub use events::{ClinicalEventRouter, TracingNotifier};
pub use hl7::{AckCode, ControlIdGenerator, Hl7Message, Hl7Query, Hl7Segment, MessageHeader, OrderInfo, PatientInfo, ReportInfo, ScheduleInfo};
pub use lifecycle::{ConnectionState, ConnectionStatus, EndpointSummary, LifecycleEvent, LifecycleManager};
pub use mllp::MllpCodec;
