//! 端点连接器
//!
//! 生命周期管理器通过 [`Connector`] 统一驱动HL7会话与DICOM监听器：
//! - HL7: 包装 [`Hl7Client`]，入站消息交给 [`ClinicalEventRouter`]
//! - DICOM: 包装 [`DicomServer`]，健康检查为一次C-ECHO

use async_trait::async_trait;
use pacs_core::{ClinicalStore, Notifier};
use pacs_dicom::{scu, DicomServer, DicomServerConfig};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::{Hl7Client, SessionEvent, SessionState};
use crate::config::{DicomEndpointConfig, EndpointConfig, EndpointKind};
use crate::error::{IntegrationError, Result};
use crate::events::ClinicalEventRouter;
use crate::hl7::Hl7Query;

/// 连接器接口
#[async_trait]
pub trait Connector: Send + Sync {
    fn endpoint_id(&self) -> &str;

    fn kind(&self) -> EndpointKind;

    /// 建立连接；失败不重试
    async fn connect(&self) -> Result<()>;

    /// 断开连接，可重复调用
    async fn disconnect(&self);

    /// 协议层探测
    async fn health_check(&self, timeout: Duration) -> Result<()>;

    /// 会话事件订阅；必须在 `connect` 之前调用才能收到连接期间的事件
    fn session_events(&self) -> Option<broadcast::Receiver<SessionEvent>>;

    fn hl7_client(&self) -> Option<Arc<Hl7Client>> {
        None
    }
}

/// 连接器工厂
pub trait ConnectorFactory: Send + Sync {
    fn create(&self, config: &EndpointConfig) -> Result<Arc<dyn Connector>>;
}

/// HL7连接器
pub struct Hl7Connector {
    client: Arc<Hl7Client>,
    router: ClinicalEventRouter,
    routing: Mutex<Option<JoinHandle<()>>>,
}

impl Hl7Connector {
    pub fn new(client: Hl7Client, router: ClinicalEventRouter) -> Self {
        Self {
            client: Arc::new(client),
            router,
            routing: Mutex::new(None),
        }
    }

    /// 启动入站消息路由任务（已在运行则跳过）
    fn ensure_routing(&self) {
        let Ok(mut routing) = self.routing.lock() else {
            return;
        };
        if routing.as_ref().map(|task| !task.is_finished()).unwrap_or(false) {
            return;
        }

        let mut inbound = self.client.inbound_messages();
        let router = self.router.clone();
        let endpoint_id = self.client.endpoint_id().to_string();
        *routing = Some(tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                router.route(&endpoint_id, &message).await;
            }
            debug!("端点 {} 路由任务结束", endpoint_id);
        }));
    }
}

impl Drop for Hl7Connector {
    fn drop(&mut self) {
        if let Ok(mut routing) = self.routing.lock() {
            if let Some(task) = routing.take() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Connector for Hl7Connector {
    fn endpoint_id(&self) -> &str {
        self.client.endpoint_id()
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Hl7
    }

    async fn connect(&self) -> Result<()> {
        self.ensure_routing();
        self.client.connect().await
    }

    async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    /// 发送探测查询；对端有任何应答都视为存活
    async fn health_check(&self, timeout: Duration) -> Result<()> {
        if self.client.state() != SessionState::Connected {
            return Err(IntegrationError::NotConnected);
        }
        match self.client.send_query(&Hl7Query::probe(), Some(timeout)).await {
            Ok(_) => Ok(()),
            Err(e @ (IntegrationError::QueryRejected { .. } | IntegrationError::NegativeAcknowledgment { .. })) => {
                debug!("端点 {} 探测被拒绝但对端在线: {}", self.endpoint_id(), e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn session_events(&self) -> Option<broadcast::Receiver<SessionEvent>> {
        Some(self.client.subscribe())
    }

    fn hl7_client(&self) -> Option<Arc<Hl7Client>> {
        Some(self.client.clone())
    }
}

struct RunningListener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// DICOM监听连接器
pub struct DicomConnector {
    endpoint_id: String,
    config: DicomEndpointConfig,
    store: Arc<dyn ClinicalStore>,
    events: broadcast::Sender<SessionEvent>,
    listener: tokio::sync::Mutex<Option<RunningListener>>,
}

impl DicomConnector {
    pub fn new(endpoint_id: impl Into<String>, config: DicomEndpointConfig, store: Arc<dyn ClinicalStore>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            endpoint_id: endpoint_id.into(),
            config,
            store,
            events,
            listener: tokio::sync::Mutex::new(None),
        }
    }

    fn server_config(&self) -> DicomServerConfig {
        DicomServerConfig {
            ae_title: self.config.ae_title.clone(),
            bind_host: self.config.bind_host.clone(),
            port: self.config.port,
            max_associations: self.config.max_associations,
            max_pdu_length: self.config.max_pdu_length,
            idle_timeout: Duration::from_secs(self.config.idle_timeout_secs),
            strict_called_ae: self.config.strict_called_ae,
        }
    }

    /// 当前监听地址（未连接时为 `None`）
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|l| l.local_addr)
    }
}

/// 通配地址改为回环地址以便本机探测
fn probe_address(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port()),
        _ => addr,
    }
}

#[async_trait]
impl Connector for DicomConnector {
    fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Dicom
    }

    async fn connect(&self) -> Result<()> {
        let mut slot = self.listener.lock().await;
        if slot.as_ref().map(|l| !l.task.is_finished()).unwrap_or(false) {
            return Ok(());
        }

        let server = DicomServer::bind(self.server_config(), self.store.clone()).await?;
        let local_addr = server.local_addr()?;
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let events = self.events.clone();
        let endpoint_id = self.endpoint_id.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                error!("DICOM监听 {} 异常退出: {}", endpoint_id, e);
                let _ = events.send(SessionEvent::ConnectionLost {
                    endpoint_id,
                    reason: e.to_string(),
                });
            }
        });

        info!("DICOM端点 {} 监听 {}", self.endpoint_id, local_addr);
        let _ = self.events.send(SessionEvent::Connected {
            endpoint_id: self.endpoint_id.clone(),
        });
        *slot = Some(RunningListener {
            local_addr,
            shutdown,
            task,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(listener) = self.listener.lock().await.take() else {
            return;
        };
        listener.shutdown.cancel();
        if let Err(e) = listener.task.await {
            error!("DICOM监听任务异常: {}", e);
        }
        info!("DICOM端点 {} 停止监听", self.endpoint_id);
        let _ = self.events.send(SessionEvent::Disconnected {
            endpoint_id: self.endpoint_id.clone(),
        });
    }

    async fn health_check(&self, timeout: Duration) -> Result<()> {
        let Some(addr) = self.local_addr().await else {
            return Err(IntegrationError::NotConnected);
        };
        let target = probe_address(addr).to_string();
        let elapsed = scu::echo(&target, &self.config.probe_ae_title, &self.config.ae_title, timeout).await?;
        debug!("DICOM端点 {} C-ECHO 耗时 {:?}", self.endpoint_id, elapsed);
        Ok(())
    }

    fn session_events(&self) -> Option<broadcast::Receiver<SessionEvent>> {
        Some(self.events.subscribe())
    }
}

/// 默认工厂：HL7端点路由到给定的存储与通知器，DICOM端点写入存储
pub struct DefaultConnectorFactory {
    store: Arc<dyn ClinicalStore>,
    notifier: Arc<dyn Notifier>,
}

impl DefaultConnectorFactory {
    pub fn new(store: Arc<dyn ClinicalStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }
}

impl ConnectorFactory for DefaultConnectorFactory {
    fn create(&self, config: &EndpointConfig) -> Result<Arc<dyn Connector>> {
        match config.kind {
            EndpointKind::Hl7 => {
                let transport = config
                    .hl7
                    .clone()
                    .ok_or_else(|| IntegrationError::Config(format!("{}: 缺少 hl7 配置段", config.id)))?;
                let client = Hl7Client::new(config.id.clone(), transport);
                let router = ClinicalEventRouter::new(self.store.clone(), self.notifier.clone());
                Ok(Arc::new(Hl7Connector::new(client, router)))
            }
            EndpointKind::Dicom => {
                let listener = config
                    .dicom
                    .clone()
                    .ok_or_else(|| IntegrationError::Config(format!("{}: 缺少 dicom 配置段", config.id)))?;
                Ok(Arc::new(DicomConnector::new(config.id.clone(), listener, self.store.clone())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Hl7TransportConfig;
    use crate::events::tests::{RecordingNotifier, RecordingStore};
    use crate::hl7::{self, Hl7Message, Hl7Segment, MessageHeader};
    use crate::mllp::MllpCodec;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use pacs_core::ClinicalEventKind;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    #[test]
    fn test_probe_address_rewrites_wildcard() {
        let wildcard: SocketAddr = "0.0.0.0:11112".parse().unwrap();
        assert_eq!(probe_address(wildcard).to_string(), "127.0.0.1:11112");
        let bound: SocketAddr = "10.0.0.5:104".parse().unwrap();
        assert_eq!(probe_address(bound), bound);
    }

    #[tokio::test]
    async fn test_dicom_connector_health_check() {
        let mut listener = DicomEndpointConfig::new(0);
        listener.bind_host = "127.0.0.1".to_string();
        listener.ae_title = "GATEWAY".to_string();
        let connector = DicomConnector::new("modality-in", listener, Arc::new(RecordingStore::default()));

        assert!(matches!(
            connector.health_check(Duration::from_secs(1)).await,
            Err(IntegrationError::NotConnected)
        ));
        connector.connect().await.unwrap();
        connector.health_check(Duration::from_secs(5)).await.unwrap();

        connector.disconnect().await;
        connector.disconnect().await;
        assert!(connector.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_hl7_connector_routes_unsolicited_messages() {
        let ris = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ris.local_addr().unwrap().port();
        let store = Arc::new(RecordingStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let factory = DefaultConnectorFactory::new(store.clone(), notifier.clone());
        let connector = factory
            .create(&EndpointConfig::hl7("ris-main", Hl7TransportConfig::new("127.0.0.1", port)))
            .unwrap();

        let (connected, accepted) = tokio::join!(connector.connect(), ris.accept());
        connected.unwrap();
        let mut peer = Framed::new(accepted.unwrap().0, MllpCodec::new());

        let mut fields = vec![""; 25];
        fields[0] = "1";
        fields[1] = "ORD001";
        fields[24] = "F";
        let oru = Hl7Message::new("ORU^R01", "RIS555")
            .with_segment(Hl7Segment::from_fields("PID", &["1", "", "PAT12345"]))
            .with_segment(Hl7Segment::from_fields("OBR", &fields));
        peer.send(Bytes::from(hl7::to_er7(&oru, &MessageHeader::default())))
            .await
            .unwrap();

        let ack = hl7::decode(&peer.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(ack.segment("MSA").unwrap().field(2), "RIS555");

        for _ in 0..100 {
            if !notifier.notifications.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let events = store.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ClinicalEventKind::NewReport);
        assert_eq!(events[0].source_endpoint, "ris-main");
        drop(events);

        connector.disconnect().await;
    }

    async fn hl7_connector(id: &str, store: Arc<RecordingStore>) -> (Arc<dyn Connector>, Framed<tokio::net::TcpStream, MllpCodec>) {
        let ris = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ris.local_addr().unwrap().port();
        let factory = DefaultConnectorFactory::new(store, Arc::new(RecordingNotifier::default()));
        let connector = factory
            .create(&EndpointConfig::hl7(id, Hl7TransportConfig::new("127.0.0.1", port)))
            .unwrap();
        let (connected, accepted) = tokio::join!(connector.connect(), ris.accept());
        connected.unwrap();
        (connector, Framed::new(accepted.unwrap().0, MllpCodec::new()))
    }

    #[tokio::test]
    async fn test_hl7_health_check_with_standard_query_responses() {
        let store = Arc::new(RecordingStore::default());
        let (connector, mut peer) = hl7_connector("ris-std", store.clone()).await;

        let ris = tokio::spawn(async move {
            // DSR^Q03 响应 QRY^Q01
            let query = hl7::decode(&peer.next().await.unwrap().unwrap()).unwrap();
            assert_eq!(query.message_type, "QRY^Q01");
            let response = Hl7Message::new("DSR^Q03", "RIS1")
                .with_segment(Hl7Segment::from_fields("MSA", &["AA", query.control_id.as_str()]))
                .with_segment(Hl7Segment::from_fields("QAK", &["PING", "OK"]));
            peer.send(Bytes::from(hl7::to_er7(&response, &MessageHeader::default())))
                .await
                .unwrap();

            // 按A19习惯回 ADR^A19 的RIS
            let query = hl7::decode(&peer.next().await.unwrap().unwrap()).unwrap();
            let response = Hl7Message::new("ADR^A19", "RIS2")
                .with_segment(Hl7Segment::from_fields("MSA", &["AA", query.control_id.as_str()]))
                .with_segment(Hl7Segment::from_fields("QAK", &["PING", "OK"]));
            peer.send(Bytes::from(hl7::to_er7(&response, &MessageHeader::default())))
                .await
                .unwrap();

            // 查询响应不应被当作入站消息确认
            let extra = tokio::time::timeout(Duration::from_millis(200), peer.next()).await;
            assert!(extra.is_err());
            peer
        });

        connector.health_check(Duration::from_secs(2)).await.unwrap();
        connector.health_check(Duration::from_secs(2)).await.unwrap();
        let _peer = ris.await.unwrap();
        assert!(store.events.lock().unwrap().is_empty());
        connector.disconnect().await;
    }

    #[tokio::test]
    async fn test_hl7_burst_with_slow_store_persists_every_acked_message() {
        const BURST: usize = 300;
        let store = Arc::new(RecordingStore {
            delay: Some(Duration::from_millis(2)),
            ..Default::default()
        });
        let (connector, mut peer) = hl7_connector("ris-burst", store.clone()).await;

        let mut acked = 0;
        for i in 0..BURST {
            let adt = Hl7Message::new("ADT^A08", format!("RIS{:04}", i))
                .with_segment(Hl7Segment::from_fields("PID", &["1", "", "PAT12345"]));
            peer.send(Bytes::from(hl7::to_er7(&adt, &MessageHeader::default())))
                .await
                .unwrap();
            let ack = hl7::decode(&peer.next().await.unwrap().unwrap()).unwrap();
            assert_eq!(ack.segment("MSA").unwrap().field(1), "AA");
            acked += 1;
        }
        assert_eq!(acked, BURST);

        for _ in 0..1000 {
            if store.events.lock().unwrap().len() == BURST {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let events = store.events.lock().unwrap();
        assert_eq!(events.len(), BURST);
        assert!(events.iter().all(|e| e.kind == ClinicalEventKind::PatientUpdate));
        drop(events);

        connector.disconnect().await;
    }

    #[tokio::test]
    async fn test_hl7_health_check_accepts_rejection() {
        let ris = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ris.local_addr().unwrap().port();
        let factory = DefaultConnectorFactory::new(
            Arc::new(RecordingStore::default()),
            Arc::new(RecordingNotifier::default()),
        );
        let connector = factory
            .create(&EndpointConfig::hl7("ris-probe", Hl7TransportConfig::new("127.0.0.1", port)))
            .unwrap();

        let (connected, accepted) = tokio::join!(connector.connect(), ris.accept());
        connected.unwrap();
        let mut peer = Framed::new(accepted.unwrap().0, MllpCodec::new());

        tokio::spawn(async move {
            let query = hl7::decode(&peer.next().await.unwrap().unwrap()).unwrap();
            let response = Hl7Message::new("DSR^Q03", "RIS1")
                .with_segment(Hl7Segment::from_fields("MSA", &["AA", query.control_id.as_str()]))
                .with_segment(Hl7Segment::from_fields("QAK", &["PING", "NF"]));
            peer.send(Bytes::from(hl7::to_er7(&response, &MessageHeader::default())))
                .await
                .unwrap();
            peer
        });

        connector.health_check(Duration::from_secs(2)).await.unwrap();
        connector.disconnect().await;
        assert!(connector.health_check(Duration::from_secs(1)).await.is_err());
    }
}
