//! DICOM服务用户（SCU）
//!
//! 提供发起关联的最小客户端，健康检查用它对监听端执行 C-ECHO。

use futures::{SinkExt, StreamExt};
use pacs_core::{PacsError, Result};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::dimse::{fragment, status, CommandSet, CommandType, MessageAssembler};
use crate::pdu::{
    AssociateRequest, NegotiatedPresentationContext, Pdu, PduCodec, PresentationContextResult,
    ProposedPresentationContext, UserInformation, APPLICATION_CONTEXT_NAME, DEFAULT_MAX_PDU_LENGTH,
};
use crate::transfer_syntax::{sop_class_uids, transfer_syntax_uids};

/// 已建立的出站关联
pub struct ScuAssociation<S> {
    framed: Framed<S, PduCodec>,
    negotiated: Vec<NegotiatedPresentationContext>,
    fragment_length: u32,
    assembler: MessageAssembler,
}

impl<S> ScuAssociation<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// 发送 A-ASSOCIATE-RQ 并等待应答
    pub async fn establish(stream: S, request: AssociateRequest) -> Result<Self> {
        let mut framed = Framed::new(stream, PduCodec::default());
        framed.send(Pdu::AssociateRq(request)).await?;

        match framed.next().await {
            Some(Ok(Pdu::AssociateAc(accept))) => {
                let fragment_length = match accept.user_information.max_pdu_length {
                    0 => DEFAULT_MAX_PDU_LENGTH,
                    n => n,
                };
                Ok(Self {
                    framed,
                    negotiated: accept.presentation_contexts,
                    fragment_length,
                    assembler: MessageAssembler::new(),
                })
            }
            Some(Ok(Pdu::AssociateRj(rejection))) => Err(PacsError::AssociationRejected(format!(
                "result={} source={} reason={}",
                rejection.result, rejection.source, rejection.reason
            ))),
            Some(Ok(other)) => Err(PacsError::Protocol(format!("期望A-ASSOCIATE-AC，收到 {}", other.name()))),
            Some(Err(e)) => Err(e),
            None => Err(PacsError::Protocol("关联建立期间连接关闭".to_string())),
        }
    }

    pub fn negotiated(&self) -> &[NegotiatedPresentationContext] {
        &self.negotiated
    }

    /// 第一个被接受的表示上下文ID
    pub fn accepted_context(&self) -> Option<u8> {
        self.negotiated
            .iter()
            .find(|pc| pc.result == PresentationContextResult::Acceptance)
            .map(|pc| pc.id)
    }

    /// 覆盖发送时的分片上限
    pub fn set_fragment_length(&mut self, max_pdu_length: u32) {
        self.fragment_length = max_pdu_length;
    }

    pub async fn send(&mut self, context_id: u8, command: &CommandSet, dataset: Option<&[u8]>) -> Result<()> {
        for pdu in fragment(context_id, command, dataset, self.fragment_length) {
            self.framed.feed(pdu).await?;
        }
        self.framed.flush().await
    }

    /// 接收下一条完整的DIMSE消息
    pub async fn receive(&mut self) -> Result<(CommandSet, Option<Vec<u8>>)> {
        loop {
            match self.framed.next().await {
                Some(Ok(Pdu::PData(values))) => {
                    for pdv in values {
                        if let Some(message) = self.assembler.push(pdv)? {
                            return Ok((message.command, message.dataset));
                        }
                    }
                }
                Some(Ok(Pdu::Abort { source, reason })) => {
                    return Err(PacsError::Protocol(format!(
                        "对端中止关联: source={} reason={}",
                        source, reason
                    )));
                }
                Some(Ok(other)) => {
                    return Err(PacsError::Protocol(format!("等待P-DATA时收到 {}", other.name())));
                }
                Some(Err(e)) => return Err(e),
                None => return Err(PacsError::Protocol("连接已关闭".to_string())),
            }
        }
    }

    /// 等待对端发起释放并应答，对端释放返回 `true`
    pub async fn await_release_request(&mut self) -> Result<bool> {
        match self.framed.next().await {
            Some(Ok(Pdu::ReleaseRq)) => {
                self.framed.send(Pdu::ReleaseRp).await?;
                Ok(true)
            }
            Some(Ok(_)) | None => Ok(false),
            Some(Err(e)) => Err(e),
        }
    }

    /// 正常释放关联
    pub async fn release(mut self) -> Result<()> {
        self.framed.send(Pdu::ReleaseRq).await?;
        loop {
            match self.framed.next().await {
                Some(Ok(Pdu::ReleaseRp)) => break,
                Some(Ok(Pdu::PData(_))) => continue,
                Some(Ok(other)) => {
                    return Err(PacsError::Protocol(format!("等待A-RELEASE-RP时收到 {}", other.name())));
                }
                Some(Err(e)) => return Err(e),
                None => return Err(PacsError::Protocol("释放期间连接关闭".to_string())),
            }
        }
        let _ = self.framed.close().await;
        Ok(())
    }
}

/// 对远端执行一次 C-ECHO，返回往返耗时
pub async fn echo(addr: &str, calling_ae_title: &str, called_ae_title: &str, timeout: Duration) -> Result<Duration> {
    let started = Instant::now();
    let attempt = async {
        let stream = TcpStream::connect(addr).await?;
        let request = AssociateRequest {
            protocol_version: 1,
            called_ae_title: called_ae_title.to_string(),
            calling_ae_title: calling_ae_title.to_string(),
            application_context: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![ProposedPresentationContext {
                id: 1,
                abstract_syntax: sop_class_uids::VERIFICATION.to_string(),
                transfer_syntaxes: vec![transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string()],
            }],
            user_information: UserInformation::default(),
        };

        let mut association = ScuAssociation::establish(stream, request).await?;
        let context_id = association
            .accepted_context()
            .ok_or_else(|| PacsError::AssociationRejected("验证服务未被接受".to_string()))?;

        let command = CommandSet::request(CommandType::CEchoRq, 1, sop_class_uids::VERIFICATION);
        association.send(context_id, &command, None).await?;
        let (response, _) = association.receive().await?;
        association.release().await?;

        if response.status != Some(status::SUCCESS) {
            return Err(PacsError::Dicom(format!("C-ECHO返回状态 {:?}", response.status)));
        }
        Ok::<(), PacsError>(())
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| PacsError::Timeout(format!("C-ECHO {} 超过 {:?}", addr, timeout)))??;

    let elapsed = started.elapsed();
    debug!("C-ECHO {} -> {} 成功, 耗时 {:?}", calling_ae_title, addr, elapsed);
    Ok(elapsed)
}
