//! 网关配置加载
//!
//! TOML文件加 `PACS__*` 环境变量覆盖，例如 `PACS__API_ADDR=0.0.0.0:9090`。

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use pacs_integration::EndpointConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::info;

/// 网关配置
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "GatewayConfig::default_api_addr")]
    pub api_addr: String,
    #[serde(default = "GatewayConfig::default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl GatewayConfig {
    fn default_api_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    fn default_storage_root() -> PathBuf {
        PathBuf::from("./data")
    }

    /// 加载配置；未指定文件时只读取环境变量
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("PACS").separator("__").try_parsing(true))
            .build()
            .context("读取配置失败")?;

        let config: GatewayConfig = settings.try_deserialize().context("配置格式错误")?;
        info!(
            "配置加载完成: {} ({} 个端点)",
            path.unwrap_or("<环境变量>"),
            config.endpoints.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_addr.trim().is_empty() {
            bail!("api_addr 不能为空");
        }
        let mut ids = HashSet::new();
        for endpoint in &self.endpoints {
            endpoint
                .validate()
                .with_context(|| format!("端点 {} 配置无效", endpoint.id))?;
            if !ids.insert(endpoint.id.as_str()) {
                bail!("端点ID重复: {}", endpoint.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_integration::EndpointKind;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_endpoints_from_toml() {
        let file = write_config(
            r#"
api_addr = "127.0.0.1:9000"
storage_root = "/var/lib/pacs"

[[endpoints]]
id = "ris-main"
kind = "hl7"

[endpoints.hl7]
host = "ris.hospital.local"
port = 2575
processing_id = "T"

[endpoints.retry]
max_attempts = 3
backoff_multiplier = 1.0
max_delay_secs = 10

[[endpoints]]
id = "modality-in"
kind = "dicom"

[endpoints.dicom]
port = 11112
ae_title = "GATEWAY"
"#,
        );

        let config = GatewayConfig::load(file.path().to_str()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.api_addr, "127.0.0.1:9000");
        assert_eq!(config.storage_root, PathBuf::from("/var/lib/pacs"));
        assert_eq!(config.endpoints.len(), 2);

        let ris = &config.endpoints[0];
        assert_eq!(ris.kind, EndpointKind::Hl7);
        let hl7 = ris.hl7.as_ref().unwrap();
        assert_eq!(hl7.processing_id, "T");
        assert_eq!(hl7.timeout_ms, 30_000);
        assert_eq!(ris.retry.max_attempts, 3);
        assert_eq!(ris.health_check.interval_secs, 30);

        let modality = &config.endpoints[1];
        assert_eq!(modality.dicom.as_ref().unwrap().ae_title, "GATEWAY");
        assert_eq!(modality.dicom.as_ref().unwrap().max_pdu_length, 16384);
    }

    #[test]
    fn test_duplicate_endpoint_ids_rejected() {
        let file = write_config(
            r#"
[[endpoints]]
id = "ris"
kind = "hl7"
hl7 = { host = "a", port = 2575 }

[[endpoints]]
id = "ris"
kind = "hl7"
hl7 = { host = "b", port = 2575 }
"#,
        );
        let config = GatewayConfig::load(file.path().to_str()).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_endpoint_rejected() {
        let file = write_config(
            r#"
[[endpoints]]
id = "ris"
kind = "hl7"
hl7 = { host = "a", port = 2575, tls = true }
"#,
        );
        let config = GatewayConfig::load(file.path().to_str()).unwrap();
        let error = config.validate().unwrap_err();
        assert!(format!("{:#}", error).contains("TLS"));
    }
}
