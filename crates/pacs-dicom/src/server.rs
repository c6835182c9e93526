//! DICOM服务器实现

use pacs_core::{ClinicalStore, PacsError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::association::{AssociationConfig, AssociationHandler};
use crate::pdu::DEFAULT_MAX_PDU_LENGTH;
use crate::services::{QueryService, ServiceManager, UnavailableQueryService};

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// 连续 accept 失败（如EMFILE）后的等待，逐次翻倍到上限
fn accept_backoff(consecutive_errors: u32) -> Duration {
    let factor = 1u32 << consecutive_errors.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_BASE.saturating_mul(factor).min(ACCEPT_BACKOFF_MAX)
}

/// DICOM服务器配置
#[derive(Debug, Clone)]
pub struct DicomServerConfig {
    pub ae_title: String,           // 应用实体标题
    pub bind_host: String,          // 监听地址
    pub port: u16,                  // 监听端口，0 表示随机端口
    pub max_associations: usize,    // 最大并发关联数
    pub max_pdu_length: u32,
    pub idle_timeout: Duration,
    pub strict_called_ae: bool,
}

impl Default for DicomServerConfig {
    fn default() -> Self {
        Self {
            ae_title: "PACS_SERVER".to_string(),
            bind_host: "0.0.0.0".to_string(),
            port: 11112,
            max_associations: 100,
            max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
            idle_timeout: Duration::from_secs(60),
            strict_called_ae: false,
        }
    }
}

impl DicomServerConfig {
    fn association_config(&self) -> AssociationConfig {
        AssociationConfig {
            ae_title: self.ae_title.clone(),
            strict_called_ae: self.strict_called_ae,
            max_pdu_length: self.max_pdu_length,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// DICOM服务器
///
/// 每个接受的连接由独立任务中的 [`AssociationHandler`] 处理。
pub struct DicomServer {
    config: DicomServerConfig,
    service_manager: Arc<ServiceManager>,
    listener: TcpListener,
}

impl DicomServer {
    /// 绑定监听端口
    pub async fn bind(config: DicomServerConfig, store: Arc<dyn ClinicalStore>) -> Result<Self> {
        Self::bind_with_query(config, store, Arc::new(UnavailableQueryService)).await
    }

    pub async fn bind_with_query(
        config: DicomServerConfig,
        store: Arc<dyn ClinicalStore>,
        query: Arc<dyn QueryService>,
    ) -> Result<Self> {
        if config.max_associations == 0 {
            return Err(PacsError::Config("max_associations 必须大于0".to_string()));
        }
        let listener = TcpListener::bind((config.bind_host.as_str(), config.port)).await?;
        info!(
            "DICOM服务器启动: AE={}, 地址={}",
            config.ae_title,
            listener.local_addr()?
        );

        Ok(Self {
            config,
            service_manager: Arc::new(ServiceManager::new(store, query)),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn ae_title(&self) -> &str {
        &self.config.ae_title
    }

    /// 接受连接直至 `shutdown` 被取消；取消后所有在途关联收到 A-ABORT
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.max_associations));
        let association_config = self.config.association_config();
        let mut accept_errors = 0u32;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => None,
                accepted = self.listener.accept() => Some(accepted),
            };
            let Some(accepted) = accepted else {
                break;
            };

            let (stream, remote_addr) = match accepted {
                Ok(conn) => {
                    accept_errors = 0;
                    conn
                }
                Err(e) => {
                    accept_errors = accept_errors.saturating_add(1);
                    let backoff = accept_backoff(accept_errors);
                    error!("接受连接失败 (连续 {} 次)，{:?} 后重试: {}", accept_errors, backoff, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            };

            let Ok(permit) = permits.clone().try_acquire_owned() else {
                warn!("并发关联数已达上限 {}，关闭来自 {} 的连接", self.config.max_associations, remote_addr);
                drop(stream);
                continue;
            };

            info!("接受连接: {}", remote_addr);
            if let Err(e) = stream.set_nodelay(true) {
                debug!("设置TCP_NODELAY失败: {}", e);
            }
            let handler = AssociationHandler::new(
                stream,
                remote_addr,
                association_config.clone(),
                self.service_manager.clone(),
            );
            let token = shutdown.child_token();
            tokio::spawn(async move {
                match handler.run(token).await {
                    Ok(summary) => debug!("关联 {} 结束: {:?}", remote_addr, summary.final_state),
                    Err(e) => warn!("关联 {} 异常结束: {}", remote_addr, e),
                }
                drop(permit);
            });
        }

        info!("DICOM服务器 {} 停止监听", self.config.ae_title);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scu;
    use crate::services::tests::MemoryStore;

    fn local_config() -> DicomServerConfig {
        DicomServerConfig {
            ae_title: "GATEWAY".to_string(),
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_accept_backoff_grows_to_cap() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(4), Duration::from_millis(80));
        assert_eq!(accept_backoff(8), Duration::from_secs(1));
        assert_eq!(accept_backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_echo_against_listener() {
        let server = DicomServer::bind(local_config(), Arc::new(MemoryStore::default()))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));

        let elapsed = scu::echo(&addr, "PROBE", "GATEWAY", Duration::from_secs(5)).await.unwrap();
        assert!(elapsed < Duration::from_secs(5));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_echo_fails_after_shutdown() {
        let server = DicomServer::bind(local_config(), Arc::new(MemoryStore::default()))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert!(scu::echo(&addr, "PROBE", "GATEWAY", Duration::from_secs(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_zero_association_limit_is_config_error() {
        let config = DicomServerConfig {
            max_associations: 0,
            ..local_config()
        };
        let result = DicomServer::bind(config, Arc::new(MemoryStore::default())).await;
        assert!(matches!(result, Err(PacsError::Config(_))));
    }
}
