//! DICOM上层协议PDU编解码
//!
//! 所有PDU长度字段为大端序32位，变长项长度为大端序16位。

use bytes::{Buf, BufMut, BytesMut};
use pacs_core::{PacsError, Result};
use tokio_util::codec::{Decoder, Encoder};

/// PDU头部长度: 类型(1) + 保留(1) + 长度(4)
pub const PDU_HEADER_LEN: usize = 6;
/// 默认最大PDU长度
pub const DEFAULT_MAX_PDU_LENGTH: u32 = 16384;
/// DICOM应用上下文名称
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.9.7382.1.1";
pub const IMPLEMENTATION_VERSION_NAME: &str = "PACS_GW_010";

const AE_TITLE_LEN: usize = 16;

/// PDU类型码
pub mod pdu_type {
    pub const ASSOCIATE_RQ: u8 = 0x01;
    pub const ASSOCIATE_AC: u8 = 0x02;
    pub const ASSOCIATE_RJ: u8 = 0x03;
    pub const P_DATA_TF: u8 = 0x04;
    pub const RELEASE_RQ: u8 = 0x05;
    pub const RELEASE_RP: u8 = 0x06;
    pub const ABORT: u8 = 0x07;
}

mod item_type {
    pub const APPLICATION_CONTEXT: u8 = 0x10;
    pub const PRESENTATION_CONTEXT_RQ: u8 = 0x20;
    pub const PRESENTATION_CONTEXT_AC: u8 = 0x21;
    pub const ABSTRACT_SYNTAX: u8 = 0x30;
    pub const TRANSFER_SYNTAX: u8 = 0x40;
    pub const USER_INFORMATION: u8 = 0x50;
    pub const MAX_LENGTH: u8 = 0x51;
    pub const IMPLEMENTATION_CLASS_UID: u8 = 0x52;
    pub const IMPLEMENTATION_VERSION_NAME: u8 = 0x55;
}

/// A-ASSOCIATE-RJ 结果、来源与原因
pub mod reject {
    pub const RESULT_PERMANENT: u8 = 1;
    pub const RESULT_TRANSIENT: u8 = 2;

    pub const SOURCE_SERVICE_USER: u8 = 1;
    pub const SOURCE_SERVICE_PROVIDER_ACSE: u8 = 2;
    pub const SOURCE_SERVICE_PROVIDER_PRESENTATION: u8 = 3;

    // 来源为服务用户时
    pub const REASON_NO_REASON_GIVEN: u8 = 1;
    pub const REASON_APPLICATION_CONTEXT_NOT_SUPPORTED: u8 = 2;
    pub const REASON_CALLING_AE_NOT_RECOGNIZED: u8 = 3;
    pub const REASON_CALLED_AE_NOT_RECOGNIZED: u8 = 7;
    // 来源为ACSE时
    pub const REASON_PROTOCOL_VERSION_NOT_SUPPORTED: u8 = 2;
    // 来源为表示层时
    pub const REASON_LOCAL_LIMIT_EXCEEDED: u8 = 2;
}

/// 表示上下文结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationContextResult {
    Acceptance,
    UserRejection,
    NoReason,
    AbstractSyntaxNotSupported,
    TransferSyntaxesNotSupported,
}

impl PresentationContextResult {
    pub fn code(&self) -> u8 {
        match self {
            Self::Acceptance => 0,
            Self::UserRejection => 1,
            Self::NoReason => 2,
            Self::AbstractSyntaxNotSupported => 3,
            Self::TransferSyntaxesNotSupported => 4,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Acceptance,
            1 => Self::UserRejection,
            3 => Self::AbstractSyntaxNotSupported,
            4 => Self::TransferSyntaxesNotSupported,
            _ => Self::NoReason,
        }
    }
}

/// 请求方提议的表示上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedPresentationContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// 协商后的表示上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedPresentationContext {
    pub id: u8,
    pub result: PresentationContextResult,
    pub transfer_syntax: String,
}

/// 用户信息项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInformation {
    /// 0 表示不限制
    pub max_pdu_length: u32,
    pub implementation_class_uid: Option<String>,
    pub implementation_version_name: Option<String>,
}

impl Default for UserInformation {
    fn default() -> Self {
        Self {
            max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
            implementation_class_uid: Some(IMPLEMENTATION_CLASS_UID.to_string()),
            implementation_version_name: Some(IMPLEMENTATION_VERSION_NAME.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRequest {
    pub protocol_version: u16,
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<ProposedPresentationContext>,
    pub user_information: UserInformation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateAccept {
    pub protocol_version: u16,
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<NegotiatedPresentationContext>,
    pub user_information: UserInformation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociateReject {
    pub result: u8,
    pub source: u8,
    pub reason: u8,
}

impl AssociateReject {
    pub fn permanent(source: u8, reason: u8) -> Self {
        Self {
            result: reject::RESULT_PERMANENT,
            source,
            reason,
        }
    }
}

/// P-DATA-TF中的表示数据值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub is_command: bool,
    pub is_last: bool,
    pub data: Vec<u8>,
}

impl PDataValue {
    fn control_header(&self) -> u8 {
        (self.is_command as u8) | ((self.is_last as u8) << 1)
    }
}

/// DICOM上层协议数据单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    AssociateRq(AssociateRequest),
    AssociateAc(AssociateAccept),
    AssociateRj(AssociateReject),
    PData(Vec<PDataValue>),
    ReleaseRq,
    ReleaseRp,
    Abort { source: u8, reason: u8 },
}

impl Pdu {
    pub fn name(&self) -> &'static str {
        match self {
            Pdu::AssociateRq(_) => "A-ASSOCIATE-RQ",
            Pdu::AssociateAc(_) => "A-ASSOCIATE-AC",
            Pdu::AssociateRj(_) => "A-ASSOCIATE-RJ",
            Pdu::PData(_) => "P-DATA-TF",
            Pdu::ReleaseRq => "A-RELEASE-RQ",
            Pdu::ReleaseRp => "A-RELEASE-RP",
            Pdu::Abort { .. } => "A-ABORT",
        }
    }

    /// 将PDU编码到缓冲区
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut body = BytesMut::new();
        let pdu_type = match self {
            Pdu::AssociateRq(rq) => {
                write_association_header(
                    &mut body,
                    rq.protocol_version,
                    &rq.called_ae_title,
                    &rq.calling_ae_title,
                );
                write_item(&mut body, item_type::APPLICATION_CONTEXT, rq.application_context.as_bytes());
                for pc in &rq.presentation_contexts {
                    let mut value = BytesMut::new();
                    value.put_slice(&[pc.id, 0, 0, 0]);
                    write_item(&mut value, item_type::ABSTRACT_SYNTAX, pc.abstract_syntax.as_bytes());
                    for ts in &pc.transfer_syntaxes {
                        write_item(&mut value, item_type::TRANSFER_SYNTAX, ts.as_bytes());
                    }
                    write_item(&mut body, item_type::PRESENTATION_CONTEXT_RQ, &value);
                }
                write_user_information(&mut body, &rq.user_information);
                pdu_type::ASSOCIATE_RQ
            }
            Pdu::AssociateAc(ac) => {
                write_association_header(
                    &mut body,
                    ac.protocol_version,
                    &ac.called_ae_title,
                    &ac.calling_ae_title,
                );
                write_item(&mut body, item_type::APPLICATION_CONTEXT, ac.application_context.as_bytes());
                for pc in &ac.presentation_contexts {
                    let mut value = BytesMut::new();
                    value.put_slice(&[pc.id, 0, pc.result.code(), 0]);
                    write_item(&mut value, item_type::TRANSFER_SYNTAX, pc.transfer_syntax.as_bytes());
                    write_item(&mut body, item_type::PRESENTATION_CONTEXT_AC, &value);
                }
                write_user_information(&mut body, &ac.user_information);
                pdu_type::ASSOCIATE_AC
            }
            Pdu::AssociateRj(rj) => {
                body.put_slice(&[0, rj.result, rj.source, rj.reason]);
                pdu_type::ASSOCIATE_RJ
            }
            Pdu::PData(values) => {
                for pdv in values {
                    body.put_u32(pdv.data.len() as u32 + 2);
                    body.put_u8(pdv.presentation_context_id);
                    body.put_u8(pdv.control_header());
                    body.put_slice(&pdv.data);
                }
                pdu_type::P_DATA_TF
            }
            Pdu::ReleaseRq => {
                body.put_u32(0);
                pdu_type::RELEASE_RQ
            }
            Pdu::ReleaseRp => {
                body.put_u32(0);
                pdu_type::RELEASE_RP
            }
            Pdu::Abort { source, reason } => {
                body.put_slice(&[0, 0, *source, *reason]);
                pdu_type::ABORT
            }
        };

        dst.reserve(PDU_HEADER_LEN + body.len());
        dst.put_u8(pdu_type);
        dst.put_u8(0);
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// 从完整的PDU字节（含头部）解码
    pub fn decode(frame: &[u8]) -> Result<Pdu> {
        if frame.len() < PDU_HEADER_LEN {
            return Err(PacsError::Protocol(format!("PDU长度不足: {} bytes", frame.len())));
        }
        let pdu_type = frame[0];
        let length = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize;
        let mut body = frame
            .get(PDU_HEADER_LEN..PDU_HEADER_LEN + length)
            .ok_or_else(|| PacsError::Protocol(format!("PDU被截断: 声明长度 {}", length)))?;

        match pdu_type {
            pdu_type::ASSOCIATE_RQ => decode_associate_rq(&mut body).map(Pdu::AssociateRq),
            pdu_type::ASSOCIATE_AC => decode_associate_ac(&mut body).map(Pdu::AssociateAc),
            pdu_type::ASSOCIATE_RJ => {
                let fields = take(&mut body, 4)?;
                Ok(Pdu::AssociateRj(AssociateReject {
                    result: fields[1],
                    source: fields[2],
                    reason: fields[3],
                }))
            }
            pdu_type::P_DATA_TF => {
                let mut values = Vec::new();
                while body.has_remaining() {
                    let item_len = read_u32(&mut body)? as usize;
                    if item_len < 2 {
                        return Err(PacsError::Protocol(format!("PDV长度无效: {}", item_len)));
                    }
                    let item = take(&mut body, item_len)?;
                    values.push(PDataValue {
                        presentation_context_id: item[0],
                        is_command: item[1] & 0x01 != 0,
                        is_last: item[1] & 0x02 != 0,
                        data: item[2..].to_vec(),
                    });
                }
                Ok(Pdu::PData(values))
            }
            pdu_type::RELEASE_RQ => Ok(Pdu::ReleaseRq),
            pdu_type::RELEASE_RP => Ok(Pdu::ReleaseRp),
            pdu_type::ABORT => {
                let fields = take(&mut body, 4)?;
                Ok(Pdu::Abort {
                    source: fields[2],
                    reason: fields[3],
                })
            }
            other => Err(PacsError::Protocol(format!("未知PDU类型: 0x{:02X}", other))),
        }
    }
}

fn write_association_header(buf: &mut BytesMut, version: u16, called: &str, calling: &str) {
    buf.put_u16(version);
    buf.put_u16(0);
    buf.put_slice(&pad_ae_title(called));
    buf.put_slice(&pad_ae_title(calling));
    buf.put_bytes(0, 32);
}

fn write_item(buf: &mut BytesMut, item_type: u8, value: &[u8]) {
    buf.put_u8(item_type);
    buf.put_u8(0);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

fn write_user_information(buf: &mut BytesMut, info: &UserInformation) {
    let mut value = BytesMut::new();
    write_item(&mut value, item_type::MAX_LENGTH, &info.max_pdu_length.to_be_bytes());
    if let Some(uid) = &info.implementation_class_uid {
        write_item(&mut value, item_type::IMPLEMENTATION_CLASS_UID, uid.as_bytes());
    }
    if let Some(name) = &info.implementation_version_name {
        write_item(&mut value, item_type::IMPLEMENTATION_VERSION_NAME, name.as_bytes());
    }
    write_item(buf, item_type::USER_INFORMATION, &value);
}

fn pad_ae_title(title: &str) -> [u8; AE_TITLE_LEN] {
    let mut padded = [b' '; AE_TITLE_LEN];
    for (slot, byte) in padded.iter_mut().zip(title.bytes()) {
        *slot = byte;
    }
    padded
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(PacsError::Protocol(format!(
            "PDU字段被截断: 需要 {} bytes, 剩余 {} bytes",
            n,
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn read_u16(buf: &mut &[u8]) -> Result<u16> {
    let bytes = take(buf, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &mut &[u8]) -> Result<u32> {
    let bytes = take(buf, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

/// 读取变长项，返回 (类型, 值)
fn read_item<'a>(buf: &mut &'a [u8]) -> Result<(u8, &'a [u8])> {
    let header = take(buf, 2)?;
    let length = read_u16(buf)? as usize;
    Ok((header[0], take(buf, length)?))
}

struct AssociationFields {
    protocol_version: u16,
    called_ae_title: String,
    calling_ae_title: String,
}

fn read_association_header(body: &mut &[u8]) -> Result<AssociationFields> {
    let protocol_version = read_u16(body)?;
    take(body, 2)?;
    let called_ae_title = read_text(take(body, AE_TITLE_LEN)?);
    let calling_ae_title = read_text(take(body, AE_TITLE_LEN)?);
    take(body, 32)?;
    Ok(AssociationFields {
        protocol_version,
        called_ae_title,
        calling_ae_title,
    })
}

fn decode_user_information(mut value: &[u8]) -> Result<UserInformation> {
    let mut info = UserInformation {
        max_pdu_length: 0,
        implementation_class_uid: None,
        implementation_version_name: None,
    };
    while value.has_remaining() {
        let (sub_type, sub_value) = read_item(&mut value)?;
        match sub_type {
            item_type::MAX_LENGTH if sub_value.len() == 4 => {
                info.max_pdu_length =
                    u32::from_be_bytes([sub_value[0], sub_value[1], sub_value[2], sub_value[3]]);
            }
            item_type::IMPLEMENTATION_CLASS_UID => {
                info.implementation_class_uid = Some(read_text(sub_value));
            }
            item_type::IMPLEMENTATION_VERSION_NAME => {
                info.implementation_version_name = Some(read_text(sub_value));
            }
            // 角色选择、扩展协商等子项不处理
            _ => {}
        }
    }
    Ok(info)
}

fn decode_associate_rq(body: &mut &[u8]) -> Result<AssociateRequest> {
    let header = read_association_header(body)?;
    let mut application_context = String::new();
    let mut presentation_contexts = Vec::new();
    let mut user_information = None;

    while body.has_remaining() {
        let (item, mut value) = read_item(body)?;
        match item {
            item_type::APPLICATION_CONTEXT => application_context = read_text(value),
            item_type::PRESENTATION_CONTEXT_RQ => {
                let fixed = take(&mut value, 4)?;
                let mut pc = ProposedPresentationContext {
                    id: fixed[0],
                    abstract_syntax: String::new(),
                    transfer_syntaxes: Vec::new(),
                };
                while value.has_remaining() {
                    let (sub_type, sub_value) = read_item(&mut value)?;
                    match sub_type {
                        item_type::ABSTRACT_SYNTAX => pc.abstract_syntax = read_text(sub_value),
                        item_type::TRANSFER_SYNTAX => pc.transfer_syntaxes.push(read_text(sub_value)),
                        _ => {}
                    }
                }
                presentation_contexts.push(pc);
            }
            item_type::USER_INFORMATION => user_information = Some(decode_user_information(value)?),
            _ => {}
        }
    }

    Ok(AssociateRequest {
        protocol_version: header.protocol_version,
        called_ae_title: header.called_ae_title,
        calling_ae_title: header.calling_ae_title,
        application_context,
        presentation_contexts,
        user_information: user_information.unwrap_or(UserInformation {
            max_pdu_length: 0,
            implementation_class_uid: None,
            implementation_version_name: None,
        }),
    })
}

fn decode_associate_ac(body: &mut &[u8]) -> Result<AssociateAccept> {
    let header = read_association_header(body)?;
    let mut application_context = String::new();
    let mut presentation_contexts = Vec::new();
    let mut user_information = None;

    while body.has_remaining() {
        let (item, mut value) = read_item(body)?;
        match item {
            item_type::APPLICATION_CONTEXT => application_context = read_text(value),
            item_type::PRESENTATION_CONTEXT_AC => {
                let fixed = take(&mut value, 4)?;
                let mut transfer_syntax = String::new();
                while value.has_remaining() {
                    let (sub_type, sub_value) = read_item(&mut value)?;
                    if sub_type == item_type::TRANSFER_SYNTAX {
                        transfer_syntax = read_text(sub_value);
                    }
                }
                presentation_contexts.push(NegotiatedPresentationContext {
                    id: fixed[0],
                    result: PresentationContextResult::from_code(fixed[2]),
                    transfer_syntax,
                });
            }
            item_type::USER_INFORMATION => user_information = Some(decode_user_information(value)?),
            _ => {}
        }
    }

    Ok(AssociateAccept {
        protocol_version: header.protocol_version,
        called_ae_title: header.called_ae_title,
        calling_ae_title: header.calling_ae_title,
        application_context,
        presentation_contexts,
        user_information: user_information.unwrap_or(UserInformation {
            max_pdu_length: 0,
            implementation_class_uid: None,
            implementation_version_name: None,
        }),
    })
}

/// DICOM网络编解码器
///
/// 按PDU头部长度切分流，拒绝超过 `max_pdu_length` 的PDU。
#[derive(Debug, Clone)]
pub struct PduCodec {
    max_pdu_length: usize,
}

impl PduCodec {
    pub fn new(max_pdu_length: u32) -> Self {
        Self {
            max_pdu_length: max_pdu_length as usize,
        }
    }
}

impl Default for PduCodec {
    fn default() -> Self {
        // 关联请求不受协商的P-DATA长度约束，接收侧放宽上限
        Self::new(DEFAULT_MAX_PDU_LENGTH * 64)
    }
}

impl Decoder for PduCodec {
    type Item = Pdu;
    type Error = PacsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < PDU_HEADER_LEN {
            return Ok(None);
        }

        let pdu_length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if pdu_length > self.max_pdu_length {
            return Err(PacsError::Protocol(format!(
                "PDU长度 {} 超过上限 {}",
                pdu_length, self.max_pdu_length
            )));
        }

        let total_length = PDU_HEADER_LEN + pdu_length;
        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total_length);
        Pdu::decode(&frame).map(Some)
    }
}

impl Encoder<Pdu> for PduCodec {
    type Error = PacsError;

    fn encode(&mut self, item: Pdu, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> AssociateRequest {
        AssociateRequest {
            protocol_version: 1,
            called_ae_title: "PACS_SERVER".to_string(),
            calling_ae_title: "CT_SCANNER".to_string(),
            application_context: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![ProposedPresentationContext {
                id: 1,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2.1".to_string(), "1.2.840.10008.1.2".to_string()],
            }],
            user_information: UserInformation::default(),
        }
    }

    #[test]
    fn test_associate_rq_layout() {
        let bytes = Pdu::AssociateRq(sample_request()).to_bytes();

        assert_eq!(bytes[0], pdu_type::ASSOCIATE_RQ);
        let declared = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
        assert_eq!(declared, bytes.len() - PDU_HEADER_LEN);
        // 协议版本
        assert_eq!(&bytes[6..8], &[0, 1]);
        // 被叫AE标题空格填充至16字节
        assert_eq!(&bytes[10..26], b"PACS_SERVER     ");
        assert_eq!(&bytes[26..42], b"CT_SCANNER      ");
    }

    #[test]
    fn test_associate_rq_decode() {
        let request = sample_request();
        let decoded = Pdu::decode(&Pdu::AssociateRq(request.clone()).to_bytes()).unwrap();
        assert_eq!(decoded, Pdu::AssociateRq(request));
    }

    #[test]
    fn test_pdata_control_header() {
        let pdu = Pdu::PData(vec![PDataValue {
            presentation_context_id: 3,
            is_command: true,
            is_last: true,
            data: vec![0xAA, 0xBB],
        }]);
        let bytes = pdu.to_bytes();
        // PDV长度 = 数据 + 上下文ID + 控制头
        assert_eq!(&bytes[6..10], &[0, 0, 0, 4]);
        assert_eq!(bytes[10], 3);
        assert_eq!(bytes[11], 0x03);
        assert_eq!(Pdu::decode(&bytes).unwrap(), pdu);
    }

    #[test]
    fn test_reject_and_release_layout() {
        let rj = Pdu::AssociateRj(AssociateReject::permanent(
            reject::SOURCE_SERVICE_USER,
            reject::REASON_NO_REASON_GIVEN,
        ));
        assert_eq!(rj.to_bytes(), vec![0x03, 0, 0, 0, 0, 4, 0, 1, 1, 1]);
        assert_eq!(Pdu::ReleaseRp.to_bytes(), vec![0x06, 0, 0, 0, 0, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn test_codec_waits_for_complete_frame() {
        let bytes = Pdu::ReleaseRq.to_bytes();
        let mut codec = PduCodec::default();

        let mut partial = BytesMut::from(&bytes[..7]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&bytes[7..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(Pdu::ReleaseRq));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_codec_rejects_oversized_pdu() {
        let mut codec = PduCodec::new(16);
        let mut buf = BytesMut::from(&[0x04, 0, 0, 0, 1, 0][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_truncated_item_is_error() {
        let mut bytes = Pdu::AssociateRq(sample_request()).to_bytes();
        // 声明长度不变，截掉末尾
        let len = bytes.len();
        bytes.truncate(len - 3);
        let new_len = (bytes.len() - PDU_HEADER_LEN) as u32;
        bytes[2..6].copy_from_slice(&new_len.to_be_bytes());
        assert!(Pdu::decode(&bytes).is_err());
    }
}
