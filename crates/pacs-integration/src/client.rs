//! HL7会话客户端
//!
//! 每个连接由一个会话任务独占：写出消息、登记待确认请求、处理超时、
//! 分发入站消息。外部通过 [`Hl7Client`] 句柄与会话任务通信。

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

use crate::config::Hl7TransportConfig;
use crate::error::{IntegrationError, Result};
use crate::hl7::{self, build_ack, unescape, AckCode, ControlIdGenerator, Hl7Message, Hl7Query, MessageHeader};
use crate::mllp::MllpCodec;

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;
/// 入站消息交付队列；满时会话暂停读取，由TCP向对端施加背压
pub const INBOUND_BUFFER: usize = 64;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// 会话事件
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected { endpoint_id: String },
    /// 非请求的入站消息（新申请、新报告、预约变更、患者更新）
    MessageReceived { endpoint_id: String, message: Hl7Message },
    ConnectionLost { endpoint_id: String, reason: String },
    Disconnected { endpoint_id: String },
}

/// 会话统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StatsCounters {
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
    last_activity: Mutex<Option<DateTime<Utc>>>,
}

impl StatsCounters {
    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Some(Utc::now());
        }
    }

    fn snapshot(&self) -> ClientStats {
        ClientStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_activity: self.last_activity.lock().ok().and_then(|last| *last),
        }
    }
}

#[derive(Debug)]
enum Expectation {
    Acknowledgment,
    Query { tag: String },
}

enum Command {
    Send {
        message: Hl7Message,
        expectation: Expectation,
        timeout: Duration,
        reply: oneshot::Sender<Result<Hl7Message>>,
    },
}

struct SessionHandle {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// HL7会话客户端
pub struct Hl7Client {
    endpoint_id: String,
    config: Hl7TransportConfig,
    ids: Arc<ControlIdGenerator>,
    state: Arc<watch::Sender<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
    stats: Arc<StatsCounters>,
    pending: Arc<AtomicUsize>,
    inbound: Mutex<Option<mpsc::Sender<Hl7Message>>>,
    session: Mutex<Option<SessionHandle>>,
}

impl Hl7Client {
    pub fn new(endpoint_id: impl Into<String>, config: Hl7TransportConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            endpoint_id: endpoint_id.into(),
            ids: Arc::new(ControlIdGenerator::new(config.control_id_prefix.clone())),
            config,
            state: Arc::new(state),
            events,
            stats: Arc::new(StatsCounters::default()),
            pending: Arc::new(AtomicUsize::new(0)),
            inbound: Mutex::new(None),
            session: Mutex::new(None),
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn config(&self) -> &Hl7TransportConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// 观察者订阅；广播通道有界，落后的订阅者会丢事件
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// 创建入站消息的可靠交付队列，替换之前的队列，下次 `connect` 起生效
    ///
    /// 每条非请求消息在确认之后逐条送入队列，不会丢失；
    /// 消费方处理不过来时会话停止读取新帧。
    pub fn inbound_messages(&self) -> mpsc::Receiver<Hl7Message> {
        let (sender, receiver) = mpsc::channel(INBOUND_BUFFER);
        if let Ok(mut slot) = self.inbound.lock() {
            *slot = Some(sender);
        }
        receiver
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.snapshot()
    }

    /// 当前待确认请求数
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn next_control_id(&self) -> String {
        self.ids.next_id()
    }

    fn is_running(&self) -> bool {
        self.session
            .lock()
            .map(|session| session.as_ref().map(|s| !s.task.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// 建立连接；失败时不重试
    pub async fn connect(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        // 清理上一次已结束的会话
        self.take_session();

        let address = self.config.address();
        self.state.send_replace(SessionState::Connecting);
        debug!("连接HL7端点 {} ({})", self.endpoint_id, address);

        let stream = match tokio::time::timeout(self.config.timeout(), TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state.send_replace(SessionState::Disconnected);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Err(IntegrationError::Transport(format!("连接 {} 失败: {}", address, e)));
            }
            Err(_) => {
                self.state.send_replace(SessionState::Disconnected);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Err(IntegrationError::Transport(format!(
                    "连接 {} 超时 ({}ms)",
                    address, self.config.timeout_ms
                )));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("设置TCP_NODELAY失败: {}", e);
        }

        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let cancel = CancellationToken::new();
        let session = Session {
            endpoint_id: self.endpoint_id.clone(),
            header: self.config.header(),
            auto_ack: self.config.auto_ack,
            framed: Framed::new(stream, MllpCodec::new()),
            commands: receiver,
            cancel: cancel.clone(),
            pending: HashMap::new(),
            timeouts: DelayQueue::new(),
            sequence: 0,
            pending_gauge: self.pending.clone(),
            inbound: self.inbound.lock().ok().and_then(|slot| slot.clone()),
            ids: self.ids.clone(),
            stats: self.stats.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
        };

        self.state.send_replace(SessionState::Connected);
        let task = tokio::spawn(session.run());
        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(SessionHandle { commands, cancel, task });
        }

        info!("HL7端点 {} 已连接: {}", self.endpoint_id, address);
        let _ = self.events.send(SessionEvent::Connected {
            endpoint_id: self.endpoint_id.clone(),
        });
        Ok(())
    }

    fn take_session(&self) -> Option<SessionHandle> {
        self.session.lock().ok().and_then(|mut slot| slot.take())
    }

    /// 断开连接，所有待确认请求以 `ConnectionClosed` 结束；可重复调用
    pub async fn disconnect(&self) {
        let Some(session) = self.take_session() else {
            self.state.send_replace(SessionState::Disconnected);
            return;
        };

        let was_running = !session.task.is_finished();
        if was_running {
            self.state.send_replace(SessionState::Closing);
        }
        session.cancel.cancel();
        if let Err(e) = session.task.await {
            error!("HL7会话任务异常结束: {}", e);
        }
        self.state.send_replace(SessionState::Disconnected);

        if was_running {
            info!("HL7端点 {} 已断开", self.endpoint_id);
            let _ = self.events.send(SessionEvent::Disconnected {
                endpoint_id: self.endpoint_id.clone(),
            });
        }
    }

    fn commands(&self) -> Result<mpsc::Sender<Command>> {
        self.session
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|s| s.commands.clone()))
            .ok_or(IntegrationError::NotConnected)
    }

    async fn submit(&self, message: Hl7Message, expectation: Expectation, timeout: Duration) -> Result<Hl7Message> {
        let commands = self.commands()?;
        let (reply, response) = oneshot::channel();
        commands
            .send(Command::Send {
                message,
                expectation,
                timeout,
                reply,
            })
            .await
            .map_err(|_| IntegrationError::ConnectionClosed)?;
        response.await.map_err(|_| IntegrationError::ConnectionClosed)?
    }

    /// 发送消息并等待 MSA 引用该控制ID的确认
    pub async fn send_message(&self, message: Hl7Message) -> Result<Hl7Message> {
        self.send_message_with_timeout(message, self.config.timeout()).await
    }

    pub async fn send_message_with_timeout(&self, mut message: Hl7Message, timeout: Duration) -> Result<Hl7Message> {
        if message.control_id.is_empty() {
            message.set_control_id(self.ids.next_id());
        }
        self.submit(message, Expectation::Acknowledgment, timeout).await
    }

    /// 发送查询并等待 QAK 回显查询标签的响应
    pub async fn send_query(&self, query: &Hl7Query, timeout: Option<Duration>) -> Result<Hl7Message> {
        let control_id = query.control_id.clone().unwrap_or_else(|| self.ids.next_id());
        let message = query.to_message(&control_id);
        self.submit(
            message,
            Expectation::Query { tag: query.tag.clone() },
            timeout.unwrap_or_else(|| self.config.timeout()),
        )
        .await
    }
}

impl Drop for Hl7Client {
    fn drop(&mut self) {
        if let Some(session) = self.take_session() {
            session.cancel.cancel();
        }
    }
}

struct PendingRequest {
    expectation: Expectation,
    reply: oneshot::Sender<Result<Hl7Message>>,
    timer: delay_queue::Key,
    timeout: Duration,
    sequence: u64,
}

enum Exit {
    Closed,
    Lost(String),
}

/// 单连接会话任务，独占连接与待确认表
struct Session {
    endpoint_id: String,
    header: MessageHeader,
    auto_ack: bool,
    framed: Framed<TcpStream, MllpCodec>,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    pending: HashMap<String, PendingRequest>,
    timeouts: DelayQueue<String>,
    sequence: u64,
    pending_gauge: Arc<AtomicUsize>,
    inbound: Option<mpsc::Sender<Hl7Message>>,
    ids: Arc<ControlIdGenerator>,
    stats: Arc<StatsCounters>,
    state: Arc<watch::Sender<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    async fn run(mut self) {
        let exit = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Exit::Closed,
                command = self.commands.recv() => match command {
                    Some(Command::Send { message, expectation, timeout, reply }) => {
                        if let Err(reason) = self.send(message, expectation, timeout, reply).await {
                            break Exit::Lost(reason);
                        }
                    }
                    None => break Exit::Closed,
                },
                frame = self.framed.next() => match frame {
                    Some(Ok(payload)) => {
                        if let Err(reason) = self.on_frame(&payload).await {
                            break Exit::Lost(reason);
                        }
                    }
                    Some(Err(e)) => break Exit::Lost(e.to_string()),
                    None => break Exit::Lost("对端关闭连接".to_string()),
                },
                Some(expired) = self.timeouts.next(), if !self.timeouts.is_empty() => {
                    self.on_timeout(expired.into_inner());
                }
            }
        };

        self.fail_all();
        let _ = self.framed.close().await;

        if let Exit::Lost(reason) = exit {
            warn!("HL7端点 {} 连接丢失: {}", self.endpoint_id, reason);
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            self.state.send_replace(SessionState::Disconnected);
            let _ = self.events.send(SessionEvent::ConnectionLost {
                endpoint_id: self.endpoint_id.clone(),
                reason,
            });
        }
    }

    fn update_gauge(&self) {
        self.pending_gauge.store(self.pending.len(), Ordering::SeqCst);
    }

    /// 写出失败返回 `Err(原因)`，会话随即结束
    async fn send(
        &mut self,
        message: Hl7Message,
        expectation: Expectation,
        timeout: Duration,
        reply: oneshot::Sender<Result<Hl7Message>>,
    ) -> std::result::Result<(), String> {
        let control_id = message.control_id.clone();
        if self.pending.contains_key(&control_id) {
            warn!("拒绝重复的控制ID: {}", control_id);
            let _ = reply.send(Err(IntegrationError::DuplicateControlId(control_id)));
            return Ok(());
        }

        let payload = hl7::to_er7(&message, &self.header);
        if let Err(e) = self.framed.send(Bytes::from(payload)).await {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            let reason = e.to_string();
            let _ = reply.send(Err(IntegrationError::Transport(reason.clone())));
            return Err(reason);
        }

        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        self.stats.touch();
        self.sequence += 1;
        let timer = self.timeouts.insert(control_id.clone(), timeout);
        debug!(
            "已发送 {} control_id={}, 等待响应 {:?}",
            message.message_type, control_id, timeout
        );
        self.pending.insert(
            control_id,
            PendingRequest {
                expectation,
                reply,
                timer,
                timeout,
                sequence: self.sequence,
            },
        );
        self.update_gauge();
        Ok(())
    }

    fn on_timeout(&mut self, control_id: String) {
        let Some(request) = self.pending.remove(&control_id) else {
            return;
        };
        self.update_gauge();
        let timeout_ms = request.timeout.as_millis() as u64;
        let error = match request.expectation {
            Expectation::Acknowledgment => {
                warn!("等待 {} 的确认超时 ({}ms)", control_id, timeout_ms);
                IntegrationError::AcknowledgmentTimeout { control_id, timeout_ms }
            }
            Expectation::Query { tag } => {
                warn!("查询 {} ({}) 超时 ({}ms)", tag, control_id, timeout_ms);
                IntegrationError::QueryTimeout { tag, timeout_ms }
            }
        };
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        let _ = request.reply.send(Err(error));
    }

    fn resolve(&mut self, control_id: &str, result: Result<Hl7Message>) {
        if let Some(request) = self.pending.remove(control_id) {
            self.timeouts.remove(&request.timer);
            self.update_gauge();
            let _ = request.reply.send(result);
        }
    }

    fn fail_all(&mut self) {
        for (_, request) in self.pending.drain() {
            let _ = request.reply.send(Err(IntegrationError::ConnectionClosed));
        }
        self.timeouts.clear();
        self.update_gauge();
    }

    /// 入站帧处理；解析失败只记录日志
    async fn on_frame(&mut self, payload: &[u8]) -> std::result::Result<(), String> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        self.stats.touch();

        let message = match hl7::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("丢弃无法解析的HL7帧 ({} 字节): {}", payload.len(), e);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        let code = message.message_code().to_string();
        match code.as_str() {
            "ACK" => self.on_acknowledgment(message),
            "QRY" | "DSR" => self.on_query_response(message),
            // QRY^A19 的标准响应
            "ADR" if self.correlate_query(&message).is_some() => self.on_query_response(message),
            _ => return self.on_unsolicited(message).await,
        }
        Ok(())
    }

    fn on_acknowledgment(&mut self, message: Hl7Message) {
        let Some(msa) = message.segment("MSA") else {
            warn!("ACK {} 缺少MSA段", message.control_id);
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let code = msa.field(1).trim().to_string();
        let referenced = msa.field(2).trim().to_string();
        let text = unescape(msa.field(3));
        let accepted = AckCode::parse(&code).map(|c| c.is_accept()).unwrap_or(false);

        let is_query = match self.pending.get(&referenced) {
            Some(request) => matches!(request.expectation, Expectation::Query { .. }),
            None => {
                debug!("收到未匹配的ACK: {} -> {}", code, referenced);
                return;
            }
        };

        if accepted {
            if is_query {
                // 查询的接收确认，继续等待查询响应
                debug!("查询 {} 已被接收", referenced);
                return;
            }
            debug!("消息 {} 已确认 ({})", referenced, code);
            self.resolve(&referenced, Ok(message));
        } else {
            warn!("消息 {} 被拒绝 ({}): {}", referenced, code, text);
            self.resolve(&referenced, Err(IntegrationError::NegativeAcknowledgment { code, text }));
        }
    }

    /// 查询响应关联：MSA-2 精确匹配，其次 QAK-1 标签精确匹配，
    /// 最后在控制ID中查找标签子串（仅唯一候选时采用）
    fn correlate_query(&self, message: &Hl7Message) -> Option<String> {
        if let Some(msa) = message.segment("MSA") {
            let referenced = msa.field(2).trim();
            if let Some(request) = self.pending.get(referenced) {
                if matches!(request.expectation, Expectation::Query { .. }) {
                    return Some(referenced.to_string());
                }
            }
        }

        let tag = message.segment("QAK").map(|qak| qak.field(1).trim())?;
        if tag.is_empty() {
            return None;
        }

        let exact = self
            .pending
            .iter()
            .filter(|(_, request)| matches!(&request.expectation, Expectation::Query { tag: t } if t == tag))
            .min_by_key(|(_, request)| request.sequence)
            .map(|(key, _)| key.clone());
        if exact.is_some() {
            return exact;
        }

        let candidates: Vec<&String> = self
            .pending
            .iter()
            .filter(|(key, request)| matches!(request.expectation, Expectation::Query { .. }) && key.contains(tag))
            .map(|(key, _)| key)
            .collect();
        match candidates.as_slice() {
            [only] => Some((*only).clone()),
            [] => None,
            many => {
                warn!("查询标签 {} 匹配到 {} 个待处理查询，放弃关联", tag, many.len());
                None
            }
        }
    }

    fn on_query_response(&mut self, message: Hl7Message) {
        let Some(key) = self.correlate_query(&message) else {
            warn!("收到未匹配的查询响应: {} {}", message.message_type, message.control_id);
            return;
        };

        let text = message
            .segment("MSA")
            .map(|msa| unescape(msa.field(3)))
            .unwrap_or_default();
        let status = match message.segment("QAK") {
            Some(qak) => qak.field(2).trim().to_string(),
            None => message
                .segment("MSA")
                .map(|msa| msa.field(1).trim().to_string())
                .unwrap_or_default(),
        };

        let succeeded = status == "OK" || AckCode::parse(&status).map(|c| c.is_accept()).unwrap_or(false);
        if succeeded {
            debug!("查询 {} 成功", key);
            self.resolve(&key, Ok(message));
        } else {
            warn!("查询 {} 失败: {} {}", key, status, text);
            self.resolve(&key, Err(IntegrationError::QueryRejected { status, text }));
        }
    }

    /// 先确认再分发
    async fn on_unsolicited(&mut self, message: Hl7Message) -> std::result::Result<(), String> {
        info!(
            "收到 {} control_id={} 来自 {}",
            message.message_type, message.control_id, message.sending_application
        );

        if self.auto_ack {
            let ack = build_ack(&message, AckCode::AA, &self.ids.next_id(), None);
            let payload = hl7::to_er7(&ack, &self.header);
            if let Err(e) = self.framed.send(Bytes::from(payload)).await {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e.to_string());
            }
            self.stats.sent.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(inbound) = &self.inbound {
            if inbound.send(message.clone()).await.is_err() {
                error!(
                    "端点 {} 入站队列已关闭，消息 {} 未交付",
                    self.endpoint_id, message.control_id
                );
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        let _ = self.events.send(SessionEvent::MessageReceived {
            endpoint_id: self.endpoint_id.clone(),
            message,
        });
        Ok(())
    }
}
