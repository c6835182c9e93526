//! 集成端点配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{IntegrationError, Result};
use crate::hl7::MessageHeader;

/// 端点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Hl7,
    Dicom,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::Hl7 => f.write_str("HL7"),
            EndpointKind::Dicom => f.write_str("DICOM"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// HL7传输配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hl7TransportConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "Hl7TransportConfig::default_sending_application")]
    pub sending_application: String,
    #[serde(default = "Hl7TransportConfig::default_facility")]
    pub sending_facility: String,
    #[serde(default = "Hl7TransportConfig::default_receiving_application")]
    pub receiving_application: String,
    #[serde(default = "Hl7TransportConfig::default_facility")]
    pub receiving_facility: String,
    /// P=生产, T=测试, D=调试
    #[serde(default = "Hl7TransportConfig::default_processing_id")]
    pub processing_id: String,
    #[serde(default = "Hl7TransportConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_true")]
    pub auto_ack: bool,
    #[serde(default = "Hl7TransportConfig::default_control_id_prefix")]
    pub control_id_prefix: String,
}

impl Hl7TransportConfig {
    fn default_sending_application() -> String {
        "PACS".to_string()
    }

    fn default_receiving_application() -> String {
        "RIS".to_string()
    }

    fn default_facility() -> String {
        "HOSPITAL".to_string()
    }

    fn default_processing_id() -> String {
        "P".to_string()
    }

    fn default_timeout_ms() -> u64 {
        30_000
    }

    fn default_control_id_prefix() -> String {
        "AXIS".to_string()
    }

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            sending_application: Self::default_sending_application(),
            sending_facility: Self::default_facility(),
            receiving_application: Self::default_receiving_application(),
            receiving_facility: Self::default_facility(),
            processing_id: Self::default_processing_id(),
            timeout_ms: Self::default_timeout_ms(),
            tls: false,
            auto_ack: true,
            control_id_prefix: Self::default_control_id_prefix(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            sending_application: self.sending_application.clone(),
            sending_facility: self.sending_facility.clone(),
            receiving_application: self.receiving_application.clone(),
            receiving_facility: self.receiving_facility.clone(),
            processing_id: self.processing_id.clone(),
        }
    }
}

/// DICOM监听端点配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DicomEndpointConfig {
    #[serde(default = "DicomEndpointConfig::default_ae_title")]
    pub ae_title: String,
    #[serde(default = "DicomEndpointConfig::default_bind_host")]
    pub bind_host: String,
    pub port: u16,
    #[serde(default = "DicomEndpointConfig::default_max_pdu_length")]
    pub max_pdu_length: u32,
    #[serde(default = "DicomEndpointConfig::default_max_associations")]
    pub max_associations: usize,
    #[serde(default = "DicomEndpointConfig::default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 健康检查C-ECHO使用的Calling AE
    #[serde(default = "DicomEndpointConfig::default_probe_ae_title")]
    pub probe_ae_title: String,
    #[serde(default)]
    pub strict_called_ae: bool,
}

impl DicomEndpointConfig {
    fn default_ae_title() -> String {
        "PACS_SERVER".to_string()
    }

    fn default_bind_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_max_pdu_length() -> u32 {
        16384
    }

    fn default_max_associations() -> usize {
        100
    }

    fn default_idle_timeout_secs() -> u64 {
        60
    }

    fn default_probe_ae_title() -> String {
        "PACS_PROBE".to_string()
    }

    pub fn new(port: u16) -> Self {
        Self {
            ae_title: Self::default_ae_title(),
            bind_host: Self::default_bind_host(),
            port,
            max_pdu_length: Self::default_max_pdu_length(),
            max_associations: Self::default_max_associations(),
            idle_timeout_secs: Self::default_idle_timeout_secs(),
            probe_ae_title: Self::default_probe_ae_title(),
            strict_called_ae: false,
        }
    }
}

/// 重连策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_multiplier: 2.0,
            max_delay_secs: 60,
        }
    }
}

impl RetryPolicy {
    /// 是否还允许安排下一次重连
    pub fn should_retry(&self, consecutive_failures: u32) -> bool {
        consecutive_failures < self.max_attempts
    }

    /// delay = min(multiplier * failures * 1s, max_delay)
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let secs = self.backoff_multiplier * consecutive_failures as f64;
        let max = Duration::from_secs(self.max_delay_secs);
        if !secs.is_finite() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(secs).min(max)
    }
}

/// 健康检查配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_secs: u64,
    pub timeout_ms: u64,
    /// 连续失败多少次后判定连接异常
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_ms: 5000,
            failure_threshold: 3,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 集成端点配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    pub kind: EndpointKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub hl7: Option<Hl7TransportConfig>,
    #[serde(default)]
    pub dicom: Option<DicomEndpointConfig>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

impl EndpointConfig {
    pub fn hl7(id: impl Into<String>, transport: Hl7TransportConfig) -> Self {
        Self {
            id: id.into(),
            kind: EndpointKind::Hl7,
            enabled: true,
            hl7: Some(transport),
            dicom: None,
            retry: RetryPolicy::default(),
            health_check: HealthCheckConfig::default(),
        }
    }

    pub fn dicom(id: impl Into<String>, listener: DicomEndpointConfig) -> Self {
        Self {
            id: id.into(),
            kind: EndpointKind::Dicom,
            enabled: true,
            hl7: None,
            dicom: Some(listener),
            retry: RetryPolicy::default(),
            health_check: HealthCheckConfig::default(),
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(IntegrationError::Config("端点ID不能为空".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(IntegrationError::Config(format!("{}: retry.max_attempts 必须大于0", self.id)));
        }
        if self.retry.backoff_multiplier < 0.0 || !self.retry.backoff_multiplier.is_finite() {
            return Err(IntegrationError::Config(format!("{}: retry.backoff_multiplier 无效", self.id)));
        }
        if self.health_check.interval_secs == 0 {
            return Err(IntegrationError::Config(format!("{}: health_check.interval_secs 必须大于0", self.id)));
        }

        match self.kind {
            EndpointKind::Hl7 => {
                let hl7 = self
                    .hl7
                    .as_ref()
                    .ok_or_else(|| IntegrationError::Config(format!("{}: 缺少 hl7 配置段", self.id)))?;
                if hl7.host.trim().is_empty() || hl7.port == 0 {
                    return Err(IntegrationError::Config(format!("{}: HL7主机或端口无效", self.id)));
                }
                if !matches!(hl7.processing_id.as_str(), "P" | "T" | "D") {
                    return Err(IntegrationError::Config(format!(
                        "{}: 未知的处理ID {}",
                        self.id, hl7.processing_id
                    )));
                }
                if hl7.tls {
                    return Err(IntegrationError::Config(format!(
                        "{}: 不支持TLS，请在外部终结TLS",
                        self.id
                    )));
                }
                if hl7.timeout_ms == 0 {
                    return Err(IntegrationError::Config(format!("{}: timeout_ms 必须大于0", self.id)));
                }
            }
            EndpointKind::Dicom => {
                let dicom = self
                    .dicom
                    .as_ref()
                    .ok_or_else(|| IntegrationError::Config(format!("{}: 缺少 dicom 配置段", self.id)))?;
                if dicom.port == 0 {
                    return Err(IntegrationError::Config(format!("{}: DICOM端口无效", self.id)));
                }
                if dicom.ae_title.is_empty() || dicom.ae_title.len() > 16 {
                    return Err(IntegrationError::Config(format!(
                        "{}: AE标题长度必须为1-16: {}",
                        self.id, dicom.ae_title
                    )));
                }
                if dicom.max_pdu_length == 0 {
                    return Err(IntegrationError::Config(format!(
                        "{}: max_pdu_length 必须大于0",
                        self.id
                    )));
                }
                if dicom.max_associations == 0 {
                    return Err(IntegrationError::Config(format!("{}: max_associations 必须大于0", self.id)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_multiplier: 1.0,
            max_delay_secs: 10,
        };
        let delays: Vec<u64> = (1..=3).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 3]);
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let capped = RetryPolicy {
            max_attempts: 10,
            backoff_multiplier: 4.0,
            max_delay_secs: 10,
        };
        assert_eq!(capped.delay_for(5), Duration::from_secs(10));
    }

    #[test]
    fn test_validation() {
        let config = EndpointConfig::hl7("ris", Hl7TransportConfig::new("10.0.0.5", 2575));
        assert!(config.validate().is_ok());

        let mut tls = config.clone();
        tls.hl7.as_mut().unwrap().tls = true;
        assert!(tls.validate().is_err());

        let mut processing = config.clone();
        processing.hl7.as_mut().unwrap().processing_id = "X".to_string();
        assert!(processing.validate().is_err());

        let mut missing = config.clone();
        missing.kind = EndpointKind::Dicom;
        assert!(matches!(missing.validate(), Err(IntegrationError::Config(_))));

        let mut no_retry = config;
        no_retry.retry.max_attempts = 0;
        assert!(no_retry.validate().is_err());

        let mut dicom = EndpointConfig::dicom("modality", DicomEndpointConfig::new(11112));
        assert!(dicom.validate().is_ok());
        dicom.dicom.as_mut().unwrap().max_pdu_length = 0;
        assert!(matches!(dicom.validate(), Err(IntegrationError::Config(_))));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "id": "modality-in",
            "kind": "dicom",
            "dicom": { "port": 11112 },
            "retry": { "max_attempts": 3 }
        }"#;
        let config: EndpointConfig = serde_json::from_str(json).unwrap();
        assert!(config.enabled);
        assert_eq!(config.kind, EndpointKind::Dicom);
        let dicom = config.dicom.as_ref().unwrap();
        assert_eq!(dicom.ae_title, "PACS_SERVER");
        assert_eq!(dicom.max_pdu_length, 16384);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.max_delay_secs, 60);
        assert_eq!(config.health_check.failure_threshold, 3);
        assert!(config.validate().is_ok());
    }
}
