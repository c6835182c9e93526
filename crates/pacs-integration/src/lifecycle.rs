//! 连接生命周期管理
//!
//! 每个已注册端点由一个监督任务独占：连接状态、健康检查计时与重连计时
//! 都只在该任务内修改。管理器的注册表只用于登记与查找。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::client::{Hl7Client, SessionEvent};
use crate::config::{EndpointConfig, EndpointKind};
use crate::connectors::{Connector, ConnectorFactory};
use crate::error::{IntegrationError, Result};

const EVENT_BUFFER: usize = 256;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// 端点连接状态快照
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// 重连次数已用尽，需要人工重连
    pub exhausted: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_connected_at: None,
            last_error: None,
            consecutive_failures: 0,
            exhausted: false,
        }
    }
}

/// 生命周期事件
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Connected { endpoint_id: String },
    Disconnected { endpoint_id: String },
    ConnectionLost { endpoint_id: String, reason: String },
    HealthCheckFailed { endpoint_id: String, consecutive: u32, reason: String },
    ReconnectScheduled { endpoint_id: String, attempt: u32, delay: Duration },
    ReconnectionExhausted { endpoint_id: String, attempts: u32 },
}

impl LifecycleEvent {
    pub fn endpoint_id(&self) -> &str {
        match self {
            Self::Connected { endpoint_id }
            | Self::Disconnected { endpoint_id }
            | Self::ConnectionLost { endpoint_id, .. }
            | Self::HealthCheckFailed { endpoint_id, .. }
            | Self::ReconnectScheduled { endpoint_id, .. }
            | Self::ReconnectionExhausted { endpoint_id, .. } => endpoint_id,
        }
    }
}

/// 端点概要
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSummary {
    pub id: String,
    pub kind: EndpointKind,
    pub enabled: bool,
    pub status: ConnectionStatus,
}

enum SupervisorCommand {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

struct EndpointHandle {
    config: EndpointConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::Sender<SupervisorCommand>,
    status: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

/// 连接生命周期管理器
pub struct LifecycleManager {
    endpoints: RwLock<HashMap<String, EndpointHandle>>,
    events: broadcast::Sender<LifecycleEvent>,
    factory: Arc<dyn ConnectorFactory>,
}

impl LifecycleManager {
    pub fn new(factory: Arc<dyn ConnectorFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            endpoints: RwLock::new(HashMap::new()),
            events,
            factory,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// 注册端点；启用的端点立即连接，连接失败按重连策略处理
    pub async fn register_endpoint(&self, config: EndpointConfig) -> Result<()> {
        config.validate()?;
        let id = config.id.clone();

        {
            let mut endpoints = self.endpoints.write().await;
            if endpoints.contains_key(&id) {
                return Err(IntegrationError::EndpointExists(id));
            }

            let connector = self.factory.create(&config)?;
            let (commands, receiver) = mpsc::channel(8);
            let (status_tx, status) = watch::channel(ConnectionStatus::default());
            let supervisor = Supervisor {
                endpoint_id: id.clone(),
                config: config.clone(),
                connector: connector.clone(),
                commands: receiver,
                status: status_tx,
                events: self.events.clone(),
                session_events: None,
                health_deadline: None,
                reconnect_deadline: None,
                health_failures: 0,
            };
            let task = tokio::spawn(supervisor.run());
            endpoints.insert(
                id.clone(),
                EndpointHandle {
                    config: config.clone(),
                    connector,
                    commands,
                    status,
                    task,
                },
            );
        }

        info!("注册{}端点: {}", config.kind, id);
        if config.enabled {
            if let Err(e) = self.connect(&id).await {
                warn!("端点 {} 初次连接失败: {}", id, e);
            }
        }
        Ok(())
    }

    async fn commands(&self, id: &str) -> Result<mpsc::Sender<SupervisorCommand>> {
        self.endpoints
            .read()
            .await
            .get(id)
            .map(|handle| handle.commands.clone())
            .ok_or_else(|| IntegrationError::EndpointNotFound(id.to_string()))
    }

    /// 手动连接；清零失败计数并解除耗尽状态
    pub async fn connect(&self, id: &str) -> Result<()> {
        let commands = self.commands(id).await?;
        let (reply, response) = oneshot::channel();
        commands
            .send(SupervisorCommand::Connect(reply))
            .await
            .map_err(|_| IntegrationError::EndpointNotFound(id.to_string()))?;
        response
            .await
            .map_err(|_| IntegrationError::EndpointNotFound(id.to_string()))?
    }

    /// 断开连接；先取消计时器再关闭传输
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let commands = self.commands(id).await?;
        let (reply, response) = oneshot::channel();
        commands
            .send(SupervisorCommand::Disconnect(reply))
            .await
            .map_err(|_| IntegrationError::EndpointNotFound(id.to_string()))?;
        response
            .await
            .map_err(|_| IntegrationError::EndpointNotFound(id.to_string()))
    }

    pub async fn unregister_endpoint(&self, id: &str) -> Result<()> {
        let handle = self
            .endpoints
            .write()
            .await
            .remove(id)
            .ok_or_else(|| IntegrationError::EndpointNotFound(id.to_string()))?;

        let (reply, response) = oneshot::channel();
        if handle.commands.send(SupervisorCommand::Shutdown(reply)).await.is_ok() {
            let _ = response.await;
        }
        if let Err(e) = handle.task.await {
            error!("端点 {} 监督任务异常: {}", id, e);
        }
        info!("注销端点: {}", id);
        Ok(())
    }

    pub async fn status(&self, id: &str) -> Result<ConnectionStatus> {
        self.endpoints
            .read()
            .await
            .get(id)
            .map(|handle| handle.status.borrow().clone())
            .ok_or_else(|| IntegrationError::EndpointNotFound(id.to_string()))
    }

    pub async fn watch_status(&self, id: &str) -> Result<watch::Receiver<ConnectionStatus>> {
        self.endpoints
            .read()
            .await
            .get(id)
            .map(|handle| handle.status.clone())
            .ok_or_else(|| IntegrationError::EndpointNotFound(id.to_string()))
    }

    pub async fn endpoint(&self, id: &str) -> Result<EndpointSummary> {
        self.endpoints
            .read()
            .await
            .get(id)
            .map(|handle| summarize(id, handle))
            .ok_or_else(|| IntegrationError::EndpointNotFound(id.to_string()))
    }

    /// 所有端点，按ID排序
    pub async fn endpoints(&self) -> Vec<EndpointSummary> {
        let endpoints = self.endpoints.read().await;
        let mut summaries: Vec<EndpointSummary> =
            endpoints.iter().map(|(id, handle)| summarize(id, handle)).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub async fn connector(&self, id: &str) -> Result<Arc<dyn Connector>> {
        self.endpoints
            .read()
            .await
            .get(id)
            .map(|handle| handle.connector.clone())
            .ok_or_else(|| IntegrationError::EndpointNotFound(id.to_string()))
    }

    /// HL7端点的会话客户端，用于发送消息与查询
    pub async fn hl7_client(&self, id: &str) -> Result<Arc<Hl7Client>> {
        self.connector(id)
            .await?
            .hl7_client()
            .ok_or_else(|| IntegrationError::Config(format!("{} 不是HL7端点", id)))
    }

    /// 注销所有端点
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.endpoints.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.unregister_endpoint(&id).await {
                debug!("关闭端点 {} 时出错: {}", id, e);
            }
        }
    }
}

fn summarize(id: &str, handle: &EndpointHandle) -> EndpointSummary {
    EndpointSummary {
        id: id.to_string(),
        kind: handle.config.kind,
        enabled: handle.config.enabled,
        status: handle.status.borrow().clone(),
    }
}

enum Wake {
    Command(Option<SupervisorCommand>),
    HealthCheck,
    Reconnect,
    Session(Option<std::result::Result<SessionEvent, broadcast::error::RecvError>>),
}

/// 单端点监督任务
struct Supervisor {
    endpoint_id: String,
    config: EndpointConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::Receiver<SupervisorCommand>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<LifecycleEvent>,
    session_events: Option<broadcast::Receiver<SessionEvent>>,
    health_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    health_failures: u32,
}

async fn next_session_event(
    receiver: &mut Option<broadcast::Receiver<SessionEvent>>,
) -> Option<std::result::Result<SessionEvent, broadcast::error::RecvError>> {
    match receiver {
        Some(receiver) => Some(receiver.recv().await),
        None => std::future::pending().await,
    }
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let health_at = self.health_deadline.unwrap_or_else(Instant::now);
            let reconnect_at = self.reconnect_deadline.unwrap_or_else(Instant::now);

            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                _ = sleep_until(reconnect_at), if self.reconnect_deadline.is_some() => Wake::Reconnect,
                _ = sleep_until(health_at), if self.health_deadline.is_some() => Wake::HealthCheck,
                event = next_session_event(&mut self.session_events) => Wake::Session(event),
            };

            match wake {
                Wake::Command(Some(SupervisorCommand::Connect(reply))) => {
                    self.modify(|status| {
                        status.consecutive_failures = 0;
                        status.exhausted = false;
                    });
                    let _ = reply.send(self.attempt_connect().await);
                }
                Wake::Command(Some(SupervisorCommand::Disconnect(reply))) => {
                    self.teardown().await;
                    let _ = reply.send(());
                }
                Wake::Command(Some(SupervisorCommand::Shutdown(reply))) => {
                    self.teardown().await;
                    let _ = reply.send(());
                    break;
                }
                Wake::Command(None) => {
                    self.teardown().await;
                    break;
                }
                Wake::Reconnect => {
                    let attempt = self.status.borrow().consecutive_failures;
                    info!("端点 {} 第 {} 次重连", self.endpoint_id, attempt);
                    let _ = self.attempt_connect().await;
                }
                Wake::HealthCheck => self.health_check().await,
                Wake::Session(Some(Ok(event))) => self.on_session_event(event).await,
                Wake::Session(Some(Err(broadcast::error::RecvError::Lagged(skipped)))) => {
                    debug!("端点 {} 会话事件落后 {} 条", self.endpoint_id, skipped);
                }
                Wake::Session(Some(Err(broadcast::error::RecvError::Closed))) | Wake::Session(None) => {
                    self.session_events = None;
                }
            }
        }
        debug!("端点 {} 监督任务退出", self.endpoint_id);
    }

    fn modify(&self, f: impl FnOnce(&mut ConnectionStatus)) {
        self.status.send_modify(f);
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }

    async fn attempt_connect(&mut self) -> Result<()> {
        self.reconnect_deadline = None;
        self.health_deadline = None;
        self.modify(|status| status.state = ConnectionState::Connecting);
        // 先订阅，避免错过连接期间的事件
        self.session_events = self.connector.session_events();

        match self.connector.connect().await {
            Ok(()) => {
                self.health_failures = 0;
                self.health_deadline = Some(Instant::now() + self.config.health_check.interval());
                self.modify(|status| {
                    status.state = ConnectionState::Connected;
                    status.last_connected_at = Some(Utc::now());
                    status.last_error = None;
                    status.consecutive_failures = 0;
                    status.exhausted = false;
                });
                info!("端点 {} 已连接", self.endpoint_id);
                self.emit(LifecycleEvent::Connected {
                    endpoint_id: self.endpoint_id.clone(),
                });
                Ok(())
            }
            Err(e) => {
                warn!("端点 {} 连接失败: {}", self.endpoint_id, e);
                self.on_failure(e.to_string());
                Err(e)
            }
        }
    }

    /// 失败后按策略安排重连，次数用尽则停在断开状态
    fn on_failure(&mut self, reason: String) {
        self.health_deadline = None;
        self.session_events = None;

        let failures = self.status.borrow().consecutive_failures;
        let policy = &self.config.retry;
        if policy.should_retry(failures) {
            let attempt = failures + 1;
            let delay = policy.delay_for(attempt);
            self.reconnect_deadline = Some(Instant::now() + delay);
            self.modify(|status| {
                status.state = ConnectionState::Error;
                status.last_error = Some(reason);
                status.consecutive_failures = attempt;
            });
            info!("端点 {} 将在 {:?} 后重连 (第 {} 次)", self.endpoint_id, delay, attempt);
            self.emit(LifecycleEvent::ReconnectScheduled {
                endpoint_id: self.endpoint_id.clone(),
                attempt,
                delay,
            });
        } else {
            self.reconnect_deadline = None;
            self.modify(|status| {
                status.state = ConnectionState::Disconnected;
                status.last_error = Some(reason);
                status.exhausted = true;
            });
            error!("端点 {} 重连 {} 次后放弃，需要人工处理", self.endpoint_id, failures);
            self.emit(LifecycleEvent::ReconnectionExhausted {
                endpoint_id: self.endpoint_id.clone(),
                attempts: failures,
            });
        }
    }

    async fn health_check(&mut self) {
        self.health_deadline = None;
        if self.state() != ConnectionState::Connected {
            return;
        }

        let timeout = self.config.health_check.timeout();
        let result = match tokio::time::timeout(timeout, self.connector.health_check(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(IntegrationError::Transport(format!("健康检查超过 {:?}", timeout))),
        };

        match result {
            Ok(()) => {
                debug!("端点 {} 健康检查通过", self.endpoint_id);
                self.health_failures = 0;
            }
            Err(e) => {
                self.health_failures += 1;
                warn!(
                    "端点 {} 健康检查失败 ({}/{}): {}",
                    self.endpoint_id, self.health_failures, self.config.health_check.failure_threshold, e
                );
                self.emit(LifecycleEvent::HealthCheckFailed {
                    endpoint_id: self.endpoint_id.clone(),
                    consecutive: self.health_failures,
                    reason: e.to_string(),
                });

                if self.health_failures >= self.config.health_check.failure_threshold {
                    self.health_failures = 0;
                    self.session_events = None;
                    self.connector.disconnect().await;
                    self.on_failure(format!("健康检查连续失败: {}", e));
                    return;
                }
            }
        }
        self.health_deadline = Some(Instant::now() + self.config.health_check.interval());
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        let SessionEvent::ConnectionLost { reason, .. } = event else {
            return;
        };
        if self.state() != ConnectionState::Connected {
            return;
        }

        warn!("端点 {} 连接丢失: {}", self.endpoint_id, reason);
        self.emit(LifecycleEvent::ConnectionLost {
            endpoint_id: self.endpoint_id.clone(),
            reason: reason.clone(),
        });
        self.session_events = None;
        self.connector.disconnect().await;
        self.on_failure(reason);
    }

    async fn teardown(&mut self) {
        self.reconnect_deadline = None;
        self.health_deadline = None;
        self.session_events = None;
        self.connector.disconnect().await;

        let was = self.state();
        self.modify(|status| status.state = ConnectionState::Disconnected);
        if was != ConnectionState::Disconnected {
            info!("端点 {} 已断开", self.endpoint_id);
            self.emit(LifecycleEvent::Disconnected {
                endpoint_id: self.endpoint_id.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthCheckConfig, Hl7TransportConfig, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct MockConnector {
        connects: AtomicU32,
        disconnects: AtomicU32,
        fail_connect: AtomicBool,
        healthy: AtomicBool,
        events: broadcast::Sender<SessionEvent>,
    }

    impl MockConnector {
        fn new(fail_connect: bool) -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                connects: AtomicU32::new(0),
                disconnects: AtomicU32::new(0),
                fail_connect: AtomicBool::new(fail_connect),
                healthy: AtomicBool::new(true),
                events,
            })
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        fn endpoint_id(&self) -> &str {
            "mock"
        }

        fn kind(&self) -> EndpointKind {
            EndpointKind::Hl7
        }

        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                Err(IntegrationError::Transport("connection refused".to_string()))
            } else {
                Ok(())
            }
        }

        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        async fn health_check(&self, _timeout: Duration) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(IntegrationError::QueryTimeout {
                    tag: "PING".to_string(),
                    timeout_ms: 100,
                })
            }
        }

        fn session_events(&self) -> Option<broadcast::Receiver<SessionEvent>> {
            Some(self.events.subscribe())
        }
    }

    struct MockFactory(Arc<MockConnector>);

    impl ConnectorFactory for MockFactory {
        fn create(&self, _config: &EndpointConfig) -> Result<Arc<dyn Connector>> {
            Ok(self.0.clone())
        }
    }

    fn endpoint(max_attempts: u32) -> EndpointConfig {
        let mut config = EndpointConfig::hl7("ris", Hl7TransportConfig::new("127.0.0.1", 2575));
        config.retry = RetryPolicy {
            max_attempts,
            backoff_multiplier: 1.0,
            max_delay_secs: 10,
        };
        config.health_check = HealthCheckConfig {
            interval_secs: 30,
            timeout_ms: 500,
            failure_threshold: 2,
        };
        config
    }

    async fn wait_for(events: &mut broadcast::Receiver<LifecycleEvent>, pred: impl Fn(&LifecycleEvent) -> bool) -> LifecycleEvent {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_and_exhaustion() {
        let connector = MockConnector::new(true);
        let manager = LifecycleManager::new(Arc::new(MockFactory(connector.clone())));
        let mut events = manager.subscribe();
        let started = Instant::now();

        manager.register_endpoint(endpoint(3)).await.unwrap();

        let mut delays = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                LifecycleEvent::ReconnectScheduled { delay, .. } => delays.push(delay),
                LifecycleEvent::ReconnectionExhausted { attempts, .. } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(
            delays,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(3)]
        );
        assert_eq!(connector.connects.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_secs(6));

        let status = manager.status("ris").await.unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.exhausted);
        assert_eq!(status.consecutive_failures, 3);
        assert!(status.last_error.unwrap().contains("connection refused"));

        // 用尽后不再自动重连
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_after_exhaustion_resets_status() {
        let connector = MockConnector::new(true);
        let manager = LifecycleManager::new(Arc::new(MockFactory(connector.clone())));
        let mut events = manager.subscribe();

        manager.register_endpoint(endpoint(1)).await.unwrap();
        wait_for(&mut events, |e| matches!(e, LifecycleEvent::ReconnectionExhausted { .. })).await;

        connector.fail_connect.store(false, Ordering::SeqCst);
        manager.connect("ris").await.unwrap();

        let status = manager.status("ris").await.unwrap();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.consecutive_failures, 0);
        assert!(!status.exhausted);
        assert!(status.last_connected_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_registration_rejected() {
        let manager = LifecycleManager::new(Arc::new(MockFactory(MockConnector::new(false))));
        manager.register_endpoint(endpoint(3)).await.unwrap();
        assert!(matches!(
            manager.register_endpoint(endpoint(3)).await,
            Err(IntegrationError::EndpointExists(id)) if id == "ris"
        ));
        assert!(matches!(
            manager.connect("missing").await,
            Err(IntegrationError::EndpointNotFound(_))
        ));
        assert_eq!(manager.endpoints().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let manager = LifecycleManager::new(Arc::new(MockFactory(MockConnector::new(false))));
        let mut config = endpoint(3);
        if let Some(hl7) = config.hl7.as_mut() {
            hl7.tls = true;
        }
        assert!(matches!(
            manager.register_endpoint(config).await,
            Err(IntegrationError::Config(_))
        ));
        assert!(manager.endpoints().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_failures_trigger_reconnect() {
        let connector = MockConnector::new(false);
        connector.healthy.store(false, Ordering::SeqCst);
        let manager = LifecycleManager::new(Arc::new(MockFactory(connector.clone())));
        let mut events = manager.subscribe();

        manager.register_endpoint(endpoint(3)).await.unwrap();
        assert_eq!(manager.status("ris").await.unwrap().state, ConnectionState::Connected);

        let first = wait_for(&mut events, |e| matches!(e, LifecycleEvent::HealthCheckFailed { .. })).await;
        assert!(matches!(first, LifecycleEvent::HealthCheckFailed { consecutive: 1, .. }));
        let second = wait_for(&mut events, |e| matches!(e, LifecycleEvent::HealthCheckFailed { .. })).await;
        assert!(matches!(second, LifecycleEvent::HealthCheckFailed { consecutive: 2, .. }));

        let scheduled = wait_for(&mut events, |e| matches!(e, LifecycleEvent::ReconnectScheduled { .. })).await;
        assert!(matches!(scheduled, LifecycleEvent::ReconnectScheduled { attempt: 1, .. }));
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);

        connector.healthy.store(true, Ordering::SeqCst);
        wait_for(&mut events, |e| matches!(e, LifecycleEvent::Connected { .. })).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(manager.status("ris").await.unwrap().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_schedules_reconnect() {
        let connector = MockConnector::new(false);
        let manager = LifecycleManager::new(Arc::new(MockFactory(connector.clone())));
        let mut events = manager.subscribe();
        manager.register_endpoint(endpoint(3)).await.unwrap();

        connector
            .events
            .send(SessionEvent::ConnectionLost {
                endpoint_id: "ris".to_string(),
                reason: "对端关闭连接".to_string(),
            })
            .unwrap();

        let lost = wait_for(&mut events, |e| matches!(e, LifecycleEvent::ConnectionLost { .. })).await;
        assert_eq!(lost.endpoint_id(), "ris");
        wait_for(&mut events, |e| matches!(e, LifecycleEvent::ReconnectScheduled { .. })).await;
        wait_for(&mut events, |e| matches!(e, LifecycleEvent::Connected { .. })).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let connector = MockConnector::new(true);
        let manager = LifecycleManager::new(Arc::new(MockFactory(connector.clone())));

        manager.register_endpoint(endpoint(5)).await.unwrap();
        assert_eq!(manager.status("ris").await.unwrap().state, ConnectionState::Error);

        manager.disconnect("ris").await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status("ris").await.unwrap().state, ConnectionState::Disconnected);

        manager.unregister_endpoint("ris").await.unwrap();
        assert!(matches!(
            manager.status("ris").await,
            Err(IntegrationError::EndpointNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_endpoint_is_not_connected() {
        let connector = MockConnector::new(false);
        let manager = LifecycleManager::new(Arc::new(MockFactory(connector.clone())));
        let mut config = endpoint(3);
        config.enabled = false;

        manager.register_endpoint(config).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert_eq!(manager.status("ris").await.unwrap().state, ConnectionState::Disconnected);
        assert!(matches!(
            manager.hl7_client("ris").await,
            Err(IntegrationError::Config(_))
        ));
    }
}
