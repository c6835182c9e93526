//! DIMSE消息处理
//!
//! 命令集始终以隐式VR小端序编码（组 0000）。

use dicom_core::Tag;
use pacs_core::{PacsError, Result};

use crate::pdu::{PDataValue, Pdu};

/// 命令组标签
pub mod command_tags {
    use dicom_core::Tag;

    pub const COMMAND_GROUP_LENGTH: Tag = Tag(0x0000, 0x0000);
    pub const AFFECTED_SOP_CLASS_UID: Tag = Tag(0x0000, 0x0002);
    pub const COMMAND_FIELD: Tag = Tag(0x0000, 0x0100);
    pub const MESSAGE_ID: Tag = Tag(0x0000, 0x0110);
    pub const MESSAGE_ID_BEING_RESPONDED_TO: Tag = Tag(0x0000, 0x0120);
    pub const MOVE_DESTINATION: Tag = Tag(0x0000, 0x0600);
    pub const PRIORITY: Tag = Tag(0x0000, 0x0700);
    pub const COMMAND_DATA_SET_TYPE: Tag = Tag(0x0000, 0x0800);
    pub const STATUS: Tag = Tag(0x0000, 0x0900);
    pub const ERROR_COMMENT: Tag = Tag(0x0000, 0x0902);
    pub const AFFECTED_SOP_INSTANCE_UID: Tag = Tag(0x0000, 0x1000);
}

/// 无数据集标记
pub const NO_DATA_SET: u16 = 0x0101;
/// 有数据集时常用的标记值
pub const DATA_SET_PRESENT: u16 = 0x0000;

/// DIMSE状态码
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    pub const GENERAL_FAILURE: u16 = 0xC000;
    pub const UNABLE_TO_PROCESS: u16 = 0xC001;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
    pub const MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;
}

/// 命令类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    CStoreRq,
    CStoreRsp,
    CEchoRq,
    CEchoRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CGetRq,
    CCancelRq,
    Unknown(u16),
}

impl CommandType {
    pub fn from_field(field: u16) -> Self {
        match field {
            0x0001 => CommandType::CStoreRq,
            0x8001 => CommandType::CStoreRsp,
            0x0030 => CommandType::CEchoRq,
            0x8030 => CommandType::CEchoRsp,
            0x0020 => CommandType::CFindRq,
            0x8020 => CommandType::CFindRsp,
            0x0021 => CommandType::CMoveRq,
            0x8021 => CommandType::CMoveRsp,
            0x0010 => CommandType::CGetRq,
            0x0FFF => CommandType::CCancelRq,
            other => CommandType::Unknown(other),
        }
    }

    pub fn field(&self) -> u16 {
        match self {
            CommandType::CStoreRq => 0x0001,
            CommandType::CStoreRsp => 0x8001,
            CommandType::CEchoRq => 0x0030,
            CommandType::CEchoRsp => 0x8030,
            CommandType::CFindRq => 0x0020,
            CommandType::CFindRsp => 0x8020,
            CommandType::CMoveRq => 0x0021,
            CommandType::CMoveRsp => 0x8021,
            CommandType::CGetRq => 0x0010,
            CommandType::CCancelRq => 0x0FFF,
            CommandType::Unknown(other) => *other,
        }
    }

    /// 请求对应的响应命令
    pub fn response(&self) -> Option<CommandType> {
        match self {
            CommandType::CStoreRq => Some(CommandType::CStoreRsp),
            CommandType::CEchoRq => Some(CommandType::CEchoRsp),
            CommandType::CFindRq => Some(CommandType::CFindRsp),
            CommandType::CMoveRq => Some(CommandType::CMoveRsp),
            _ => None,
        }
    }
}

/// DICOM命令集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
    pub command: CommandType,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub priority: Option<u16>,
    pub data_set_type: u16,
    pub status: Option<u16>,
    pub move_destination: Option<String>,
    pub error_comment: Option<String>,
}

impl CommandSet {
    fn empty(command: CommandType) -> Self {
        Self {
            command,
            affected_sop_class_uid: None,
            affected_sop_instance_uid: None,
            message_id: None,
            message_id_being_responded_to: None,
            priority: None,
            data_set_type: NO_DATA_SET,
            status: None,
            move_destination: None,
            error_comment: None,
        }
    }

    /// 构造请求命令
    pub fn request(command: CommandType, message_id: u16, sop_class_uid: &str) -> Self {
        let mut set = Self::empty(command);
        set.message_id = Some(message_id);
        set.affected_sop_class_uid = Some(sop_class_uid.to_string());
        set
    }

    /// 针对请求构造响应命令
    pub fn response_to(request: &CommandSet, status: u16) -> Self {
        let command = request
            .command
            .response()
            .unwrap_or(CommandType::Unknown(request.command.field() | 0x8000));
        let mut set = Self::empty(command);
        set.affected_sop_class_uid = request.affected_sop_class_uid.clone();
        set.affected_sop_instance_uid = request.affected_sop_instance_uid.clone();
        set.message_id_being_responded_to = request.message_id;
        set.status = Some(status);
        set
    }

    pub fn with_data_set(mut self) -> Self {
        self.data_set_type = DATA_SET_PRESENT;
        self
    }

    pub fn has_data_set(&self) -> bool {
        self.data_set_type != NO_DATA_SET
    }

    /// 解析命令集
    pub fn parse(data: &[u8]) -> Result<CommandSet> {
        let mut command_field = None;
        let mut set = Self::empty(CommandType::Unknown(0));
        let mut pos = 0usize;

        while pos + 8 <= data.len() {
            let group = u16::from_le_bytes([data[pos], data[pos + 1]]);
            let element = u16::from_le_bytes([data[pos + 2], data[pos + 3]]);
            let length =
                u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]) as usize;
            pos += 8;

            let value = data.get(pos..pos + length).ok_or_else(|| {
                PacsError::DicomParseError(format!(
                    "命令元素 ({:04X},{:04X}) 被截断",
                    group, element
                ))
            })?;
            pos += length;

            // 命令集中可能夹带非0000组的元素，直接略过
            if group != 0x0000 {
                continue;
            }

            match Tag(group, element) {
                command_tags::COMMAND_FIELD => command_field = Some(read_us(value)?),
                command_tags::AFFECTED_SOP_CLASS_UID => set.affected_sop_class_uid = Some(read_uid(value)),
                command_tags::AFFECTED_SOP_INSTANCE_UID => {
                    set.affected_sop_instance_uid = Some(read_uid(value))
                }
                command_tags::MESSAGE_ID => set.message_id = Some(read_us(value)?),
                command_tags::MESSAGE_ID_BEING_RESPONDED_TO => {
                    set.message_id_being_responded_to = Some(read_us(value)?)
                }
                command_tags::PRIORITY => set.priority = Some(read_us(value)?),
                command_tags::COMMAND_DATA_SET_TYPE => set.data_set_type = read_us(value)?,
                command_tags::STATUS => set.status = Some(read_us(value)?),
                command_tags::MOVE_DESTINATION => set.move_destination = Some(read_uid(value)),
                command_tags::ERROR_COMMENT => set.error_comment = Some(read_uid(value)),
                _ => {}
            }
        }

        if pos != data.len() {
            return Err(PacsError::DicomParseError("命令集末尾存在残缺元素".to_string()));
        }

        let field = command_field
            .ok_or_else(|| PacsError::DicomParseError("命令集缺少 Command Field".to_string()))?;
        set.command = CommandType::from_field(field);
        Ok(set)
    }

    /// 编码命令集（含组长度元素）
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some(uid) = &self.affected_sop_class_uid {
            put_uid(&mut body, command_tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        put_us(&mut body, command_tags::COMMAND_FIELD, self.command.field());
        if let Some(id) = self.message_id {
            put_us(&mut body, command_tags::MESSAGE_ID, id);
        }
        if let Some(id) = self.message_id_being_responded_to {
            put_us(&mut body, command_tags::MESSAGE_ID_BEING_RESPONDED_TO, id);
        }
        if let Some(destination) = &self.move_destination {
            put_text(&mut body, command_tags::MOVE_DESTINATION, destination);
        }
        if let Some(priority) = self.priority {
            put_us(&mut body, command_tags::PRIORITY, priority);
        }
        put_us(&mut body, command_tags::COMMAND_DATA_SET_TYPE, self.data_set_type);
        if let Some(status) = self.status {
            put_us(&mut body, command_tags::STATUS, status);
        }
        if let Some(comment) = &self.error_comment {
            put_text(&mut body, command_tags::ERROR_COMMENT, comment);
        }
        if let Some(uid) = &self.affected_sop_instance_uid {
            put_uid(&mut body, command_tags::AFFECTED_SOP_INSTANCE_UID, uid);
        }

        let mut encoded = Vec::with_capacity(body.len() + 12);
        put_header(&mut encoded, command_tags::COMMAND_GROUP_LENGTH, 4);
        encoded.extend_from_slice(&(body.len() as u32).to_le_bytes());
        encoded.extend_from_slice(&body);
        encoded
    }
}

/// 完整的DIMSE消息（命令 + 可选数据集）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: CommandSet,
    pub dataset: Option<Vec<u8>>,
}

/// 将P-DATA片段重组为DIMSE消息
#[derive(Debug, Default)]
pub struct MessageAssembler {
    context_id: Option<u8>,
    command_bytes: Vec<u8>,
    command: Option<CommandSet>,
    dataset: Vec<u8>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否有未完成的消息
    pub fn is_idle(&self) -> bool {
        self.context_id.is_none()
    }

    /// 追加一个PDV，消息完整时返回
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>> {
        match self.context_id {
            Some(id) if id != pdv.presentation_context_id => {
                return Err(PacsError::Protocol(format!(
                    "消息片段的表示上下文不一致: {} != {}",
                    pdv.presentation_context_id, id
                )));
            }
            Some(_) => {}
            None => self.context_id = Some(pdv.presentation_context_id),
        }

        if pdv.is_command {
            if self.command.is_some() {
                return Err(PacsError::Protocol("数据集传输期间收到命令片段".to_string()));
            }
            self.command_bytes.extend_from_slice(&pdv.data);
            if !pdv.is_last {
                return Ok(None);
            }
            let command = CommandSet::parse(&self.command_bytes)?;
            self.command_bytes.clear();
            if command.has_data_set() {
                self.command = Some(command);
                return Ok(None);
            }
            return Ok(Some(self.finish(command, None)));
        }

        if self.command.is_none() {
            return Err(PacsError::Protocol("数据集片段早于命令到达".to_string()));
        }
        self.dataset.extend_from_slice(&pdv.data);
        if !pdv.is_last {
            return Ok(None);
        }
        match self.command.take() {
            Some(command) => {
                let dataset = std::mem::take(&mut self.dataset);
                Ok(Some(self.finish(command, Some(dataset))))
            }
            None => Ok(None),
        }
    }

    fn finish(&mut self, command: CommandSet, dataset: Option<Vec<u8>>) -> DimseMessage {
        let presentation_context_id = self.context_id.take().unwrap_or_default();
        DimseMessage {
            presentation_context_id,
            command,
            dataset,
        }
    }
}

/// 按对端最大PDU长度把消息切分为P-DATA-TF（每个PDU一个PDV）
pub fn fragment(
    context_id: u8,
    command: &CommandSet,
    dataset: Option<&[u8]>,
    max_pdu_length: u32,
) -> Vec<Pdu> {
    // PDV项开销: 长度(4) + 上下文ID(1) + 控制头(1)
    let max_chunk = match max_pdu_length as usize {
        0 => usize::MAX,
        n => n.saturating_sub(6).max(1),
    };

    let mut pdus = Vec::new();
    let mut push_chunks = |data: &[u8], is_command: bool| {
        if data.is_empty() {
            pdus.push(Pdu::PData(vec![PDataValue {
                presentation_context_id: context_id,
                is_command,
                is_last: true,
                data: Vec::new(),
            }]));
            return;
        }
        let chunks: Vec<&[u8]> = data.chunks(max_chunk).collect();
        let total = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            pdus.push(Pdu::PData(vec![PDataValue {
                presentation_context_id: context_id,
                is_command,
                is_last: index + 1 == total,
                data: chunk.to_vec(),
            }]));
        }
    };

    push_chunks(&command.encode(), true);
    if let Some(dataset) = dataset {
        push_chunks(dataset, false);
    }
    pdus
}

fn read_us(value: &[u8]) -> Result<u16> {
    match value {
        [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
        _ => Err(PacsError::DicomParseError("US元素长度不足".to_string())),
    }
}

fn read_uid(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_end_matches(|c: char| c == '\0' || c == ' ')
        .to_string()
}

fn put_header(buf: &mut Vec<u8>, tag: Tag, length: u32) {
    buf.extend_from_slice(&tag.group().to_le_bytes());
    buf.extend_from_slice(&tag.element().to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
}

fn put_us(buf: &mut Vec<u8>, tag: Tag, value: u16) {
    put_header(buf, tag, 2);
    buf.extend_from_slice(&value.to_le_bytes());
}

/// UID以NUL填充至偶数长度
fn put_uid(buf: &mut Vec<u8>, tag: Tag, uid: &str) {
    put_padded(buf, tag, uid, 0x00);
}

/// 文本以空格填充至偶数长度
fn put_text(buf: &mut Vec<u8>, tag: Tag, text: &str) {
    put_padded(buf, tag, text, b' ');
}

fn put_padded(buf: &mut Vec<u8>, tag: Tag, value: &str, pad: u8) {
    let bytes = value.as_bytes();
    let padded_len = bytes.len() + bytes.len() % 2;
    put_header(buf, tag, padded_len as u32);
    buf.extend_from_slice(bytes);
    if bytes.len() % 2 == 1 {
        buf.push(pad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_request_parse() {
        let mut request = CommandSet::request(CommandType::CStoreRq, 7, "1.2.840.10008.5.1.4.1.1.2").with_data_set();
        request.affected_sop_instance_uid = Some("1.2.3.4.5".to_string());
        request.priority = Some(0);

        let parsed = CommandSet::parse(&request.encode()).unwrap();
        assert_eq!(parsed.command, CommandType::CStoreRq);
        assert_eq!(parsed.message_id, Some(7));
        assert_eq!(parsed.affected_sop_instance_uid.as_deref(), Some("1.2.3.4.5"));
        assert!(parsed.has_data_set());
    }

    #[test]
    fn test_response_mirrors_request() {
        let mut request = CommandSet::request(CommandType::CStoreRq, 42, "1.2.840.10008.5.1.4.1.1.4");
        request.affected_sop_instance_uid = Some("9.8.7".to_string());

        let response = CommandSet::response_to(&request, status::GENERAL_FAILURE);
        assert_eq!(response.command, CommandType::CStoreRsp);
        assert_eq!(response.message_id_being_responded_to, Some(42));
        assert_eq!(response.status, Some(0xC000));
        assert!(!response.has_data_set());
    }

    #[test]
    fn test_group_length_matches_body() {
        let encoded = CommandSet::request(CommandType::CEchoRq, 1, "1.2.840.10008.1.1").encode();
        let group_length = u32::from_le_bytes([encoded[8], encoded[9], encoded[10], encoded[11]]) as usize;
        assert_eq!(group_length, encoded.len() - 12);
        // 偶数长度
        assert_eq!(encoded.len() % 2, 0);
    }

    #[test]
    fn test_missing_command_field() {
        let mut buf = Vec::new();
        put_us(&mut buf, command_tags::MESSAGE_ID, 1);
        assert!(CommandSet::parse(&buf).is_err());
    }

    #[test]
    fn test_truncated_command_element() {
        let mut encoded = CommandSet::request(CommandType::CEchoRq, 1, "1.2.840.10008.1.1").encode();
        encoded.truncate(encoded.len() - 1);
        assert!(CommandSet::parse(&encoded).is_err());
    }

    fn pdvs(pdus: Vec<Pdu>) -> Vec<PDataValue> {
        pdus.into_iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData(values) => values,
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_fragment_and_reassemble() {
        let command = CommandSet::request(CommandType::CStoreRq, 3, "1.2.840.10008.5.1.4.1.1.7").with_data_set();
        let dataset: Vec<u8> = (0..100u8).collect();

        let pdus = fragment(5, &command, Some(&dataset), 38);
        assert!(pdus.len() > 4);

        let mut assembler = MessageAssembler::new();
        let mut completed = None;
        for pdv in pdvs(pdus) {
            assert!(pdv.data.len() <= 32);
            if let Some(message) = assembler.push(pdv).unwrap() {
                completed = Some(message);
            }
        }
        let message = completed.unwrap();
        assert_eq!(message.presentation_context_id, 5);
        assert_eq!(message.command, command);
        assert_eq!(message.dataset, Some(dataset));
        assert!(assembler.is_idle());
    }

    #[test]
    fn test_command_without_dataset_completes_immediately() {
        let command = CommandSet::request(CommandType::CEchoRq, 1, "1.2.840.10008.1.1");
        let mut assembler = MessageAssembler::new();
        let mut result = None;
        for pdv in pdvs(fragment(1, &command, None, 0)) {
            result = assembler.push(pdv).unwrap();
        }
        assert_eq!(result.unwrap().dataset, None);
    }

    #[test]
    fn test_dataset_before_command_is_protocol_error() {
        let mut assembler = MessageAssembler::new();
        let pdv = PDataValue {
            presentation_context_id: 1,
            is_command: false,
            is_last: true,
            data: vec![0; 4],
        };
        assert!(assembler.push(pdv).is_err());
    }
}
