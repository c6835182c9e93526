//! DICOM关联处理
//!
//! 每个入站连接由一个 `AssociationHandler` 独占驱动：协商、接收P-DATA、
//! 分发DIMSE请求并写回响应。同一连接上的请求严格串行处理。

use futures::{SinkExt, StreamExt};
use pacs_core::{PacsError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dimse::{fragment, status, MessageAssembler};
use crate::pdu::{
    reject, AssociateAccept, AssociateReject, AssociateRequest, NegotiatedPresentationContext,
    PDataValue, Pdu, PduCodec, PresentationContextResult, UserInformation, APPLICATION_CONTEXT_NAME,
    DEFAULT_MAX_PDU_LENGTH,
};
use crate::services::{DimseRequest, ServiceManager};
use crate::transfer_syntax::TransferSyntaxManager;

/// 等待对端 A-RELEASE-RP 的时长
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// 关联状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Idle,
    Requested,
    Established,
    Releasing,
    Closed,
    Aborted,
}

/// 关联处理配置
#[derive(Debug, Clone)]
pub struct AssociationConfig {
    pub ae_title: String,
    /// 要求 Called AE 与本地AE一致
    pub strict_called_ae: bool,
    /// 本地可接收的最大PDU长度；0 按默认值处理，不通告无限制
    pub max_pdu_length: u32,
    pub idle_timeout: Duration,
}

impl AssociationConfig {
    /// A-ASSOCIATE-AC 中通告的长度，与实际执行的上限一致
    pub fn local_max_pdu_length(&self) -> u32 {
        match self.max_pdu_length {
            0 => DEFAULT_MAX_PDU_LENGTH,
            length => length,
        }
    }
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            ae_title: "PACS_SERVER".to_string(),
            strict_called_ae: false,
            max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// 已接受的表示上下文
#[derive(Debug, Clone)]
pub struct AcceptedContext {
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// DICOM关联信息
#[derive(Debug, Clone)]
pub struct AssociationInfo {
    pub id: String,
    pub remote_addr: SocketAddr,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    /// 对端可接收的最大PDU长度，0 表示不限制
    pub peer_max_pdu_length: u32,
    pub accepted_contexts: HashMap<u8, AcceptedContext>,
    pub established_at: chrono::DateTime<chrono::Utc>,
}

/// 关联结束时的汇总
#[derive(Debug, Clone)]
pub struct AssociationSummary {
    pub id: String,
    pub calling_ae_title: String,
    pub final_state: AssociationState,
    pub requests: usize,
    pub failures: usize,
}

/// 单个入站连接上的关联处理器
pub struct AssociationHandler<S> {
    framed: Framed<S, PduCodec>,
    config: AssociationConfig,
    services: Arc<ServiceManager>,
    transfer_syntaxes: TransferSyntaxManager,
    remote_addr: SocketAddr,
    state: AssociationState,
    info: Option<AssociationInfo>,
    assembler: MessageAssembler,
    requests: usize,
    failures: usize,
}

impl<S> AssociationHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        remote_addr: SocketAddr,
        config: AssociationConfig,
        services: Arc<ServiceManager>,
    ) -> Self {
        Self {
            framed: Framed::new(stream, PduCodec::default()),
            config,
            services,
            transfer_syntaxes: TransferSyntaxManager::new(),
            remote_addr,
            state: AssociationState::Idle,
            info: None,
            assembler: MessageAssembler::new(),
            requests: 0,
            failures: 0,
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn info(&self) -> Option<&AssociationInfo> {
        self.info.as_ref()
    }

    /// 驱动关联直至释放、中止或拒绝
    ///
    /// 协商失败返回 `AssociationRejected` / `UnsupportedTransferSyntax`。
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<AssociationSummary> {
        let idle_timeout = self.config.idle_timeout;
        let first = tokio::select! {
            _ = shutdown.cancelled() => None,
            next = tokio::time::timeout(idle_timeout, self.framed.next()) => Some(next),
        };
        let Some(first) = first else {
            self.state = AssociationState::Aborted;
            return Ok(self.summary());
        };

        match first {
            Err(_) => {
                debug!("{} 未在空闲期内发送关联请求", self.remote_addr);
                self.state = AssociationState::Closed;
                return Ok(self.summary());
            }
            Ok(None) => {
                self.state = AssociationState::Closed;
                return Ok(self.summary());
            }
            Ok(Some(Err(e))) => {
                self.abort(reject::SOURCE_SERVICE_PROVIDER_PRESENTATION, 0).await;
                return Err(e);
            }
            Ok(Some(Ok(Pdu::AssociateRq(request)))) => self.negotiate(request).await?,
            Ok(Some(Ok(other))) => {
                warn!("{} 在关联建立前发送了 {}", self.remote_addr, other.name());
                self.abort(reject::SOURCE_SERVICE_PROVIDER_PRESENTATION, 0).await;
                return Err(PacsError::Protocol(format!("关联建立前收到 {}", other.name())));
            }
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                next = tokio::time::timeout(idle_timeout, self.framed.next()) => Some(next),
            };
            let Some(next) = next else {
                info!("服务停止，中止关联 {}", self.remote_addr);
                self.abort(reject::SOURCE_SERVICE_USER, 0).await;
                break;
            };

            match next {
                Err(_) => {
                    info!("关联 {} 空闲超时，发起释放", self.remote_addr);
                    self.release_on_idle().await;
                    break;
                }
                Ok(None) => {
                    warn!("对端 {} 未释放即断开连接", self.remote_addr);
                    self.state = AssociationState::Aborted;
                    break;
                }
                Ok(Some(Err(e))) => {
                    error!("关联 {} 协议错误: {}", self.remote_addr, e);
                    self.abort(reject::SOURCE_SERVICE_PROVIDER_PRESENTATION, 0).await;
                    return Err(e);
                }
                Ok(Some(Ok(pdu))) => match pdu {
                    Pdu::PData(values) => {
                        if let Err(e) = self.on_pdata(values).await {
                            if matches!(e, PacsError::Network(_)) {
                                self.state = AssociationState::Aborted;
                                return Err(e);
                            }
                            error!("关联 {} P-DATA处理失败: {}", self.remote_addr, e);
                            self.abort(reject::SOURCE_SERVICE_PROVIDER_PRESENTATION, 0).await;
                            return Err(e);
                        }
                    }
                    Pdu::ReleaseRq => {
                        self.state = AssociationState::Releasing;
                        self.framed.send(Pdu::ReleaseRp).await?;
                        self.state = AssociationState::Closed;
                        debug!("关联 {} 已释放", self.remote_addr);
                        break;
                    }
                    Pdu::Abort { source, reason } => {
                        warn!("对端 {} 中止关联: source={} reason={}", self.remote_addr, source, reason);
                        self.state = AssociationState::Aborted;
                        break;
                    }
                    other => {
                        warn!("关联 {} 收到意外的 {}", self.remote_addr, other.name());
                        self.abort(reject::SOURCE_SERVICE_PROVIDER_PRESENTATION, 0).await;
                        break;
                    }
                },
            }
        }

        let _ = self.framed.close().await;
        let summary = self.summary();
        info!(
            "关联结束: {} ({}), 状态={:?}, 请求={}, 失败={}",
            summary.calling_ae_title, self.remote_addr, summary.final_state, summary.requests, summary.failures
        );
        Ok(summary)
    }

    /// 协商关联参数，成功后进入 Established
    async fn negotiate(&mut self, request: AssociateRequest) -> Result<()> {
        self.state = AssociationState::Requested;
        debug!(
            "收到关联请求: {} -> {}, {} 个表示上下文",
            request.calling_ae_title,
            request.called_ae_title,
            request.presentation_contexts.len()
        );

        if request.application_context != APPLICATION_CONTEXT_NAME {
            let rejection = AssociateReject::permanent(
                reject::SOURCE_SERVICE_USER,
                reject::REASON_APPLICATION_CONTEXT_NOT_SUPPORTED,
            );
            return self
                .reject(rejection, format!("不支持的应用上下文: {}", request.application_context))
                .await;
        }

        if request.protocol_version & 0x0001 == 0 {
            let rejection = AssociateReject::permanent(
                reject::SOURCE_SERVICE_PROVIDER_ACSE,
                reject::REASON_PROTOCOL_VERSION_NOT_SUPPORTED,
            );
            return self
                .reject(rejection, format!("不支持的协议版本: {}", request.protocol_version))
                .await;
        }

        if self.config.strict_called_ae && request.called_ae_title != self.config.ae_title {
            let rejection = AssociateReject::permanent(
                reject::SOURCE_SERVICE_USER,
                reject::REASON_CALLED_AE_NOT_RECOGNIZED,
            );
            return self
                .reject(rejection, format!("Called AE不匹配: {}", request.called_ae_title))
                .await;
        }

        let mut negotiated = Vec::with_capacity(request.presentation_contexts.len());
        let mut accepted = HashMap::new();
        let mut transfer_syntax_failures = 0usize;

        for context in &request.presentation_contexts {
            let first_proposed = context.transfer_syntaxes.first().cloned().unwrap_or_default();
            let (result, transfer_syntax) =
                match self.transfer_syntaxes.classify_abstract_syntax(&context.abstract_syntax) {
                    None => (PresentationContextResult::AbstractSyntaxNotSupported, first_proposed),
                    Some(_) => match self.transfer_syntaxes.select(&context.transfer_syntaxes) {
                        Some(uid) => (PresentationContextResult::Acceptance, uid.to_string()),
                        None => {
                            transfer_syntax_failures += 1;
                            (PresentationContextResult::TransferSyntaxesNotSupported, first_proposed)
                        }
                    },
                };

            debug!(
                "表示上下文 {} ({}): {:?}",
                context.id, context.abstract_syntax, result
            );
            if result == PresentationContextResult::Acceptance {
                accepted.insert(
                    context.id,
                    AcceptedContext {
                        abstract_syntax: context.abstract_syntax.clone(),
                        transfer_syntax: transfer_syntax.clone(),
                    },
                );
            }
            negotiated.push(NegotiatedPresentationContext {
                id: context.id,
                result,
                transfer_syntax,
            });
        }

        if accepted.is_empty() {
            let rejection =
                AssociateReject::permanent(reject::SOURCE_SERVICE_USER, reject::REASON_NO_REASON_GIVEN);
            self.framed.send(Pdu::AssociateRj(rejection)).await?;
            self.state = AssociationState::Closed;
            let _ = self.framed.close().await;
            warn!("拒绝来自 {} 的关联: 没有可接受的表示上下文", request.calling_ae_title);
            return Err(if transfer_syntax_failures > 0 {
                PacsError::UnsupportedTransferSyntax(format!(
                    "{} 提议的传输语法均不受支持",
                    request.calling_ae_title
                ))
            } else {
                PacsError::AssociationRejected(format!(
                    "{} 提议的抽象语法均不受支持",
                    request.calling_ae_title
                ))
            });
        }

        let accept = AssociateAccept {
            protocol_version: 1,
            called_ae_title: request.called_ae_title.clone(),
            calling_ae_title: request.calling_ae_title.clone(),
            application_context: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: negotiated,
            user_information: UserInformation {
                max_pdu_length: self.config.local_max_pdu_length(),
                ..Default::default()
            },
        };
        self.framed.send(Pdu::AssociateAc(accept)).await?;

        let info = AssociationInfo {
            id: uuid::Uuid::new_v4().to_string(),
            remote_addr: self.remote_addr,
            calling_ae_title: request.calling_ae_title,
            called_ae_title: request.called_ae_title,
            peer_max_pdu_length: request.user_information.max_pdu_length,
            accepted_contexts: accepted,
            established_at: chrono::Utc::now(),
        };
        info!(
            "建立DICOM关联: {} {} -> {}, 接受 {} 个表示上下文",
            info.id,
            info.calling_ae_title,
            info.called_ae_title,
            info.accepted_contexts.len()
        );
        // 协商完成后按本地上限约束后续PDU
        *self.framed.codec_mut() = PduCodec::new(self.config.local_max_pdu_length().max(DEFAULT_MAX_PDU_LENGTH));
        self.info = Some(info);
        self.state = AssociationState::Established;
        Ok(())
    }

    async fn reject(&mut self, rejection: AssociateReject, reason: String) -> Result<()> {
        warn!("拒绝来自 {} 的关联: {}", self.remote_addr, reason);
        self.framed.send(Pdu::AssociateRj(rejection)).await?;
        self.state = AssociationState::Closed;
        let _ = self.framed.close().await;
        Err(PacsError::AssociationRejected(reason))
    }

    async fn on_pdata(&mut self, values: Vec<PDataValue>) -> Result<()> {
        for pdv in values {
            let accepted = self
                .info
                .as_ref()
                .map(|info| info.accepted_contexts.contains_key(&pdv.presentation_context_id))
                .unwrap_or(false);
            if !accepted {
                return Err(PacsError::Protocol(format!(
                    "表示上下文 {} 未被接受",
                    pdv.presentation_context_id
                )));
            }

            if let Some(message) = self.assembler.push(pdv)? {
                let request = DimseRequest {
                    command: message.command,
                    presentation_context_id: message.presentation_context_id,
                    dataset: message.dataset,
                    calling_ae_title: self
                        .info
                        .as_ref()
                        .map(|info| info.calling_ae_title.clone())
                        .unwrap_or_default(),
                };
                self.dispatch(request).await?;
            }
        }
        Ok(())
    }

    /// 处理一条完整的DIMSE请求并写回全部响应
    async fn dispatch(&mut self, request: DimseRequest) -> Result<()> {
        self.requests += 1;
        debug!(
            "DIMSE请求 {:?} message_id={:?} 数据集={} 字节",
            request.command.command,
            request.command.message_id,
            request.dataset.as_ref().map(Vec::len).unwrap_or(0)
        );

        let responses = self.services.handle_request(&request).await;
        let peer_max = self
            .info
            .as_ref()
            .map(|info| info.peer_max_pdu_length)
            .unwrap_or(DEFAULT_MAX_PDU_LENGTH);

        for response in responses {
            let code = response.status_code();
            if code != status::SUCCESS && code != status::PENDING {
                self.failures += 1;
            }
            let command = if response.dataset.is_some() {
                response.command.with_data_set()
            } else {
                response.command
            };
            for pdu in fragment(
                request.presentation_context_id,
                &command,
                response.dataset.as_deref(),
                peer_max,
            ) {
                self.framed.feed(pdu).await?;
            }
            self.framed.flush().await?;
        }
        Ok(())
    }

    /// 空闲超时后由本端发起释放
    async fn release_on_idle(&mut self) {
        self.state = AssociationState::Releasing;
        if let Err(e) = self.framed.send(Pdu::ReleaseRq).await {
            warn!("发送A-RELEASE-RQ失败: {}", e);
            self.state = AssociationState::Aborted;
            return;
        }

        let waited = tokio::time::timeout(RELEASE_TIMEOUT, async {
            while let Some(pdu) = self.framed.next().await {
                match pdu {
                    Ok(Pdu::ReleaseRp) => return true,
                    Ok(Pdu::ReleaseRq) => {
                        // 释放冲突，直接应答
                        let _ = self.framed.send(Pdu::ReleaseRp).await;
                        return true;
                    }
                    Ok(Pdu::Abort { .. }) | Err(_) => return false,
                    Ok(other) => debug!("释放期间忽略 {}", other.name()),
                }
            }
            false
        })
        .await;

        self.state = match waited {
            Ok(true) => AssociationState::Closed,
            _ => AssociationState::Aborted,
        };
    }

    async fn abort(&mut self, source: u8, reason: u8) {
        if let Err(e) = self.framed.send(Pdu::Abort { source, reason }).await {
            debug!("发送A-ABORT失败: {}", e);
        }
        self.state = AssociationState::Aborted;
        let _ = self.framed.close().await;
    }

    fn summary(&self) -> AssociationSummary {
        AssociationSummary {
            id: self.info.as_ref().map(|info| info.id.clone()).unwrap_or_default(),
            calling_ae_title: self
                .info
                .as_ref()
                .map(|info| info.calling_ae_title.clone())
                .unwrap_or_default(),
            final_state: self.state,
            requests: self.requests,
            failures: self.failures,
        }
    }
}
