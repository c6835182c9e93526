//! HL7接口模块
//!
//! HL7 v2.5 消息模型与线路编解码：
//! - 段与字段按原始字符串保存，组件在访问时再拆分
//! - MSH 段由连接配置与消息自身的类型、控制ID、时间戳合成
//! - ACK 构造、控制ID生成、转义处理
//! - ADT/ORM/ORU/SIU 的临床信息提取

use chrono::{DateTime, NaiveDate, Utc};
use pacs_core::utils::{format_hl7_timestamp, parse_hl7_timestamp};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use crate::error::{IntegrationError, Result};

pub const FIELD_SEPARATOR: char = '|';
pub const COMPONENT_SEPARATOR: char = '^';
pub const REPETITION_SEPARATOR: char = '~';
pub const ESCAPE_CHARACTER: char = '\\';
pub const SUBCOMPONENT_SEPARATOR: char = '&';
pub const ENCODING_CHARACTERS: &str = "^~\\&";
pub const SEGMENT_TERMINATOR: char = '\r';
pub const HL7_VERSION: &str = "2.5";

pub const MLLP_START_BLOCK: u8 = 0x0B;
pub const MLLP_END_BLOCK: u8 = 0x1C;
pub const MLLP_CARRIAGE_RETURN: u8 = 0x0D;

/// HL7段
///
/// `fields` 不含段名；MSH 的 `fields[0]` 为编码字符（MSH-2）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hl7Segment {
    pub segment_type: String,
    pub fields: Vec<String>,
}

impl Hl7Segment {
    pub fn new(segment_type: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            segment_type: segment_type.into(),
            fields,
        }
    }

    /// 由字符串切片构造，便于编写消息体
    pub fn from_fields(segment_type: &str, fields: &[&str]) -> Self {
        Self::new(segment_type, fields.iter().map(|f| f.to_string()).collect())
    }

    fn is_header(&self) -> bool {
        self.segment_type == "MSH"
    }

    /// 按HL7字段序号（从1开始）取原始字段，缺失时返回空串
    pub fn field(&self, index: usize) -> &str {
        if index == 0 {
            return &self.segment_type;
        }
        let position = if self.is_header() {
            if index == 1 {
                return "|";
            }
            index - 2
        } else {
            index - 1
        };
        self.fields.get(position).map(String::as_str).unwrap_or("")
    }

    /// 取字段的第 `component` 个组件（从1开始），只看第一个重复
    pub fn component(&self, index: usize, component: usize) -> &str {
        if component == 0 {
            return "";
        }
        self.field(index)
            .split(REPETITION_SEPARATOR)
            .next()
            .and_then(|rep| rep.split(COMPONENT_SEPARATOR).nth(component - 1))
            .unwrap_or("")
    }

    /// 字段的所有重复
    pub fn repetitions(&self, index: usize) -> Vec<&str> {
        let field = self.field(index);
        if field.is_empty() {
            return Vec::new();
        }
        field.split(REPETITION_SEPARATOR).collect()
    }

    fn to_er7(&self) -> String {
        let mut line = self.segment_type.clone();
        for field in &self.fields {
            line.push(FIELD_SEPARATOR);
            line.push_str(field);
        }
        line
    }
}

/// 由连接配置提供的MSH路由字段
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageHeader {
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    pub processing_id: String,
}

/// HL7消息解析后的结构化数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hl7Message {
    pub message_type: String,
    pub control_id: String,
    pub timestamp: DateTime<Utc>,
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    pub processing_id: String,
    pub version: String,
    /// 第一个段始终是 MSH
    pub segments: Vec<Hl7Segment>,
}

impl Hl7Message {
    /// 构造出站消息，路由字段在编码时由连接配置填充
    pub fn new(message_type: impl Into<String>, control_id: impl Into<String>) -> Self {
        let mut message = Self {
            message_type: message_type.into(),
            control_id: control_id.into(),
            timestamp: Utc::now(),
            sending_application: String::new(),
            sending_facility: String::new(),
            receiving_application: String::new(),
            receiving_facility: String::new(),
            processing_id: "P".to_string(),
            version: HL7_VERSION.to_string(),
            segments: Vec::new(),
        };
        let header = message.header_segment(&MessageHeader {
            processing_id: "P".to_string(),
            ..Default::default()
        });
        message.segments.push(header);
        message
    }

    pub fn with_segment(mut self, segment: Hl7Segment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn push_segment(&mut self, segment: Hl7Segment) {
        self.segments.push(segment);
    }

    /// 按控制ID重新生成头部
    pub fn set_control_id(&mut self, control_id: impl Into<String>) {
        self.control_id = control_id.into();
        let header = self.routing();
        if let Some(first) = self.segments.first_mut() {
            *first = Self::build_header(&header, &self.message_type, &self.control_id, &self.timestamp, &self.version);
        }
    }

    pub fn header(&self) -> Option<&Hl7Segment> {
        self.segments.first()
    }

    /// MSH之后的段
    pub fn body(&self) -> &[Hl7Segment] {
        self.segments.get(1..).unwrap_or(&[])
    }

    pub fn segment(&self, segment_type: &str) -> Option<&Hl7Segment> {
        self.segments.iter().find(|s| s.segment_type == segment_type)
    }

    pub fn segments_of<'a>(&'a self, segment_type: &'a str) -> impl Iterator<Item = &'a Hl7Segment> + 'a {
        self.segments.iter().filter(move |s| s.segment_type == segment_type)
    }

    /// 消息代码，如 `ORU`
    pub fn message_code(&self) -> &str {
        self.message_type.split(COMPONENT_SEPARATOR).next().unwrap_or("")
    }

    /// 触发事件，如 `R01`
    pub fn trigger_event(&self) -> &str {
        self.message_type.split(COMPONENT_SEPARATOR).nth(1).unwrap_or("")
    }

    pub fn routing(&self) -> MessageHeader {
        MessageHeader {
            sending_application: self.sending_application.clone(),
            sending_facility: self.sending_facility.clone(),
            receiving_application: self.receiving_application.clone(),
            receiving_facility: self.receiving_facility.clone(),
            processing_id: self.processing_id.clone(),
        }
    }

    fn header_segment(&self, header: &MessageHeader) -> Hl7Segment {
        Self::build_header(header, &self.message_type, &self.control_id, &self.timestamp, &self.version)
    }

    fn build_header(
        header: &MessageHeader,
        message_type: &str,
        control_id: &str,
        timestamp: &DateTime<Utc>,
        version: &str,
    ) -> Hl7Segment {
        Hl7Segment::new(
            "MSH",
            vec![
                ENCODING_CHARACTERS.to_string(),
                header.sending_application.clone(),
                header.sending_facility.clone(),
                header.receiving_application.clone(),
                header.receiving_facility.clone(),
                format_hl7_timestamp(timestamp),
                String::new(),
                message_type.to_string(),
                control_id.to_string(),
                header.processing_id.clone(),
                version.to_string(),
            ],
        )
    }
}

/// 编码为不带MLLP包装的ER7文本（段以CR结尾）
pub fn to_er7(message: &Hl7Message, header: &MessageHeader) -> String {
    let mut out = message.header_segment(header).to_er7();
    out.push(SEGMENT_TERMINATOR);
    for segment in message.body() {
        out.push_str(&segment.to_er7());
        out.push(SEGMENT_TERMINATOR);
    }
    out
}

/// 编码为带MLLP包装的字节
pub fn encode(message: &Hl7Message, header: &MessageHeader) -> Vec<u8> {
    let payload = to_er7(message, header);
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(MLLP_START_BLOCK);
    out.extend_from_slice(payload.as_bytes());
    out.push(MLLP_END_BLOCK);
    out.push(MLLP_CARRIAGE_RETURN);
    out
}

/// 解码线路字节，MLLP包装可有可无
pub fn decode(bytes: &[u8]) -> Result<Hl7Message> {
    let mut payload = bytes;
    if let Some(start) = payload.iter().position(|b| *b == MLLP_START_BLOCK) {
        payload = &payload[start + 1..];
    }
    if let Some(end) = payload.iter().position(|b| *b == MLLP_END_BLOCK) {
        payload = &payload[..end];
    }
    match std::str::from_utf8(payload) {
        Ok(text) => decode_str(text),
        Err(e) => {
            // 常见于按Latin-1等本地编码发送的RIS，保留可读部分
            warn!(
                "HL7消息含非UTF-8字节 ({} 字节，首个无效位置 {})，已替换为U+FFFD",
                payload.len(),
                e.valid_up_to()
            );
            decode_str(&String::from_utf8_lossy(payload))
        }
    }
}

/// 解码ER7文本
pub fn decode_str(text: &str) -> Result<Hl7Message> {
    let lines: Vec<&str> = text
        .split(|c| c == '\r' || c == '\n')
        .filter(|line| !line.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return Err(IntegrationError::EmptyMessage);
    }

    let mut segments = Vec::with_capacity(lines.len());
    for line in lines {
        let mut parts = line.split(FIELD_SEPARATOR);
        let segment_type = parts.next().unwrap_or("").trim().to_string();
        if segment_type.is_empty() {
            return Err(IntegrationError::MalformedMessage(format!(
                "段缺少类型: {}",
                line.chars().take(20).collect::<String>()
            )));
        }
        segments.push(Hl7Segment::new(segment_type, parts.map(str::to_string).collect()));
    }

    let msh = &segments[0];
    if msh.segment_type != "MSH" {
        return Err(IntegrationError::MalformedMessage(format!(
            "消息必须以MSH段开始，实际为 {}",
            msh.segment_type
        )));
    }

    let timestamp = parse_hl7_timestamp(msh.field(7)).unwrap_or_else(Utc::now);
    Ok(Hl7Message {
        message_type: msh.field(9).to_string(),
        control_id: msh.field(10).to_string(),
        timestamp,
        sending_application: msh.field(3).to_string(),
        sending_facility: msh.field(4).to_string(),
        receiving_application: msh.field(5).to_string(),
        receiving_facility: msh.field(6).to_string(),
        processing_id: msh.field(11).to_string(),
        version: msh.field(12).to_string(),
        segments,
    })
}

/// 将分隔符转义为HL7转义序列
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            ESCAPE_CHARACTER => out.push_str("\\E\\"),
            FIELD_SEPARATOR => out.push_str("\\F\\"),
            COMPONENT_SEPARATOR => out.push_str("\\S\\"),
            SUBCOMPONENT_SEPARATOR => out.push_str("\\T\\"),
            REPETITION_SEPARATOR => out.push_str("\\R\\"),
            '\r' | '\n' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}

/// 还原HL7转义序列，未知序列原样保留
pub fn unescape(text: &str) -> String {
    if !text.contains(ESCAPE_CHARACTER) {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(ESCAPE_CHARACTER) {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find(ESCAPE_CHARACTER) {
            Some(end) => {
                let sequence = &after[..end];
                match sequence {
                    "F" => out.push(FIELD_SEPARATOR),
                    "S" => out.push(COMPONENT_SEPARATOR),
                    "T" => out.push(SUBCOMPONENT_SEPARATOR),
                    "R" => out.push(REPETITION_SEPARATOR),
                    "E" => out.push(ESCAPE_CHARACTER),
                    ".br" => out.push('\n'),
                    _ => {
                        out.push(ESCAPE_CHARACTER);
                        out.push_str(sequence);
                        out.push(ESCAPE_CHARACTER);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// 确认代码（MSA-1）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckCode {
    AA,
    AE,
    AR,
    CA,
    CE,
    CR,
}

impl AckCode {
    pub fn parse(code: &str) -> Option<Self> {
        match code.trim() {
            "AA" => Some(Self::AA),
            "AE" => Some(Self::AE),
            "AR" => Some(Self::AR),
            "CA" => Some(Self::CA),
            "CE" => Some(Self::CE),
            "CR" => Some(Self::CR),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AA => "AA",
            Self::AE => "AE",
            Self::AR => "AR",
            Self::CA => "CA",
            Self::CE => "CE",
            Self::CR => "CR",
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Self::AA | Self::CA)
    }
}

/// 生成HL7 ACK消息
pub fn build_ack(original: &Hl7Message, code: AckCode, control_id: &str, error_text: Option<&str>) -> Hl7Message {
    let message_type = match original.trigger_event() {
        "" => "ACK".to_string(),
        trigger => format!("ACK^{}", trigger),
    };
    let mut fields = vec![code.as_str().to_string(), original.control_id.clone()];
    if let Some(text) = error_text {
        fields.push(escape(text));
    }
    Hl7Message::new(message_type, control_id).with_segment(Hl7Segment::new("MSA", fields))
}

/// 查询请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hl7Query {
    /// 查询消息类型，如 `QRY^A19`
    pub message_type: String,
    /// 查询标签（QRD-4），响应的 QAK-1 回显该值
    pub tag: String,
    /// 查询对象定义（QRD-8 who subject filter）
    pub definition: String,
    /// 查询内容（QRD-9 what subject filter）
    pub what: String,
    /// 响应格式（QRD-2），`R` 表示记录格式
    pub format_code: String,
    pub quantity: u32,
    /// 未指定时由客户端生成
    pub control_id: Option<String>,
}

impl Hl7Query {
    pub fn new(tag: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            message_type: "QRY^A19".to_string(),
            tag: tag.into(),
            definition: definition.into(),
            what: "DEM".to_string(),
            format_code: "R".to_string(),
            quantity: 1,
            control_id: None,
        }
    }

    /// 健康检查使用的最小查询，`QRY^Q01` 的标准响应为 `DSR^Q03`
    pub fn probe() -> Self {
        Self::new("PING", "PING").with_message_type("QRY^Q01")
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = message_type.into();
        self
    }

    pub fn with_control_id(mut self, control_id: impl Into<String>) -> Self {
        self.control_id = Some(control_id.into());
        self
    }

    /// 生成QRY消息
    pub fn to_message(&self, control_id: &str) -> Hl7Message {
        let now = format_hl7_timestamp(&Utc::now());
        Hl7Message::new(self.message_type.clone(), control_id).with_segment(Hl7Segment::new(
            "QRD",
            vec![
                now,
                self.format_code.clone(),
                "I".to_string(),
                self.tag.clone(),
                String::new(),
                String::new(),
                format!("{}^RD", self.quantity),
                escape(&self.definition),
                escape(&self.what),
                String::new(),
            ],
        ))
    }
}

/// 控制ID生成器，格式为 `<前缀><6位序号>`
#[derive(Debug)]
pub struct ControlIdGenerator {
    prefix: String,
    sequence: AtomicU64,
}

impl ControlIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed) % 999_999 + 1;
        format!("{}{:06}", self.prefix, n)
    }
}

/// 患者信息（从PID段提取）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientInfo {
    pub patient_id: String,
    pub patient_name: String,
    pub birth_date: Option<NaiveDate>,
    pub sex: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
}

/// 检查申请信息（从ORC/OBR段提取）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order_control: String,
    pub placer_order_number: String,
    pub filler_order_number: Option<String>,
    pub order_status: Option<String>,
    pub procedure_code: String,
    pub procedure_description: String,
    pub ordering_physician: Option<String>,
    pub priority: String,
    pub modality: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
}

/// 观察结果（OBX）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub value_type: String,
    pub identifier: String,
    pub value: String,
    pub result_status: Option<String>,
}

/// 报告信息（从OBR/OBX段提取）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportInfo {
    pub placer_order_number: String,
    pub filler_order_number: Option<String>,
    pub procedure_code: String,
    pub result_status: String,
    pub observation_time: Option<DateTime<Utc>>,
    pub observations: Vec<Observation>,
}

/// 预约信息（从SCH段提取）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub placer_appointment_id: String,
    pub filler_appointment_id: Option<String>,
    pub reason: Option<String>,
    pub duration: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub filler_status: Option<String>,
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(unescape(value))
    }
}

fn joined_components(value: &str) -> String {
    value
        .split(REPETITION_SEPARATOR)
        .next()
        .unwrap_or("")
        .split(COMPONENT_SEPARATOR)
        .filter(|c| !c.is_empty())
        .map(unescape)
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_birth_date(value: &str) -> Option<NaiveDate> {
    if value.len() < 8 {
        return None;
    }
    NaiveDate::from_ymd_opt(
        value.get(0..4)?.parse().ok()?,
        value.get(4..6)?.parse().ok()?,
        value.get(6..8)?.parse().ok()?,
    )
}

impl Hl7Message {
    /// PID-3 第一个组件
    pub fn patient_ref(&self) -> &str {
        self.segment("PID").map(|pid| pid.component(3, 1)).unwrap_or("")
    }

    /// 从消息中提取患者信息
    pub fn patient_info(&self) -> Option<PatientInfo> {
        let pid = self.segment("PID")?;
        let patient_id = pid.component(3, 1);
        if patient_id.is_empty() {
            return None;
        }
        Some(PatientInfo {
            patient_id: unescape(patient_id),
            patient_name: joined_components(pid.field(5)),
            birth_date: parse_birth_date(pid.field(7)),
            sex: non_empty(pid.field(8)),
            address: non_empty(&joined_components(pid.field(11))),
            phone: non_empty(pid.component(13, 1)),
        })
    }

    /// 从消息中提取检查申请信息
    pub fn order_info(&self) -> Option<OrderInfo> {
        let orc = self.segment("ORC");
        let obr = self.segment("OBR");
        if orc.is_none() && obr.is_none() {
            return None;
        }

        let placer_order_number = orc
            .map(|s| s.component(2, 1))
            .filter(|v| !v.is_empty())
            .or_else(|| obr.map(|s| s.component(2, 1)))
            .unwrap_or("");

        Some(OrderInfo {
            order_control: orc.map(|s| s.field(1).to_string()).unwrap_or_default(),
            placer_order_number: unescape(placer_order_number),
            filler_order_number: orc
                .and_then(|s| non_empty(s.component(3, 1)))
                .or_else(|| obr.and_then(|s| non_empty(s.component(3, 1)))),
            order_status: orc.and_then(|s| non_empty(s.field(5))),
            procedure_code: obr.map(|s| unescape(s.component(4, 1))).unwrap_or_default(),
            procedure_description: obr.map(|s| unescape(s.component(4, 2))).unwrap_or_default(),
            ordering_physician: obr.and_then(|s| non_empty(&joined_components(s.field(16)))),
            priority: obr
                .and_then(|s| non_empty(s.field(5)))
                .unwrap_or_else(|| "R".to_string()), // 默认Routine
            modality: obr.and_then(|s| non_empty(s.field(24))),
            scheduled_time: obr.and_then(|s| parse_hl7_timestamp(s.field(7))),
        })
    }

    /// 从消息中提取报告信息
    pub fn report_info(&self) -> Option<ReportInfo> {
        let obr = self.segment("OBR")?;
        let observations = self
            .segments_of("OBX")
            .map(|obx| Observation {
                value_type: obx.field(2).to_string(),
                identifier: joined_components(obx.field(3)),
                value: obx
                    .repetitions(5)
                    .into_iter()
                    .map(unescape)
                    .collect::<Vec<_>>()
                    .join("\n"),
                result_status: non_empty(obx.field(11)),
            })
            .collect();

        Some(ReportInfo {
            placer_order_number: unescape(obr.component(2, 1)),
            filler_order_number: non_empty(obr.component(3, 1)),
            procedure_code: unescape(obr.component(4, 1)),
            result_status: obr.field(25).trim().to_string(),
            observation_time: parse_hl7_timestamp(obr.field(7)),
            observations,
        })
    }

    /// 从消息中提取预约信息
    pub fn schedule_info(&self) -> Option<ScheduleInfo> {
        let sch = self.segment("SCH")?;
        Some(ScheduleInfo {
            placer_appointment_id: unescape(sch.component(1, 1)),
            filler_appointment_id: non_empty(sch.component(2, 1)),
            reason: non_empty(&joined_components(sch.field(7))),
            duration: non_empty(sch.field(9)),
            start_time: parse_hl7_timestamp(sch.component(11, 4)),
            filler_status: non_empty(sch.component(25, 1)),
        })
    }
}
