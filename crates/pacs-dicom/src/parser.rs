//! DICOM数据集元数据提取
//!
//! 对显式VR小端序元素流做有界线性扫描，只提取归档所需的少量头部字段。
//! 像素数据不解码，整个对象作为不透明负载交给存储协作者。

use dicom_core::{Tag, VR};
use dicom_dictionary_std::tags;
use pacs_core::{ImageMetadata, PacsError, Result};
use tracing::{debug, warn};

/// 单个对象最多扫描的元素数
const MAX_ELEMENTS: usize = 10_000;
/// 被提取字段的最大值长度，超出的元素跳过
const MAX_TRACKED_VALUE_LEN: usize = 1024;
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;

const PREAMBLE_LEN: usize = 128;
const DICM_MAGIC: &[u8; 4] = b"DICM";

type FieldSetter = fn(&mut ImageMetadata, String);

/// 标签到字段的映射表
const METADATA_TAGS: &[(Tag, FieldSetter)] = &[
    (tags::PATIENT_ID, |m, v| m.patient_id = Some(v)),
    (tags::PATIENT_NAME, |m, v| m.patient_name = Some(v)),
    (tags::STUDY_INSTANCE_UID, |m, v| m.study_instance_uid = Some(v)),
    (tags::SERIES_INSTANCE_UID, |m, v| m.series_instance_uid = Some(v)),
    (tags::SOP_INSTANCE_UID, |m, v| m.sop_instance_uid = Some(v)),
    (tags::SOP_CLASS_UID, |m, v| m.sop_class_uid = Some(v)),
    (tags::MODALITY, |m, v| m.modality = Some(v)),
    (tags::STUDY_DESCRIPTION, |m, v| m.study_description = Some(v)),
    (tags::SERIES_DESCRIPTION, |m, v| m.series_description = Some(v)),
    (tags::ACCESSION_NUMBER, |m, v| m.accession_number = Some(v)),
    (tags::INSTANCE_NUMBER, |m, v| m.instance_number = v.trim().parse().ok()),
];

fn setter_for(tag: Tag) -> Option<FieldSetter> {
    METADATA_TAGS
        .iter()
        .find(|(known, _)| *known == tag)
        .map(|(_, setter)| *setter)
}

/// 显式VR中使用4字节长度的VR
fn has_long_length(vr: [u8; 2]) -> bool {
    matches!(
        &vr,
        b"OB" | b"OD" | b"OF" | b"OL" | b"OV" | b"OW" | b"SQ" | b"SV" | b"UC" | b"UN" | b"UR" | b"UT" | b"UV"
    )
}

/// DICOM数据解析器
#[derive(Debug, Default, Clone, Copy)]
pub struct DicomParser;

impl DicomParser {
    /// 创建新的DICOM解析器
    pub fn new() -> Self {
        Self
    }

    /// 解析DICOM字节数据
    ///
    /// 接受网络传输的裸数据集，也接受带128字节前导和 `DICM` 标记的文件格式。
    /// 元素被截断或VR无法识别时返回错误；未知或超长元素被跳过。
    pub fn parse_bytes(data: &[u8]) -> Result<ImageMetadata> {
        debug!("开始扫描DICOM数据集，大小: {} bytes", data.len());

        let mut pos = 0usize;
        if data.len() >= PREAMBLE_LEN + 4 && &data[PREAMBLE_LEN..PREAMBLE_LEN + 4] == DICM_MAGIC {
            pos = PREAMBLE_LEN + 4;
        }

        let mut metadata = ImageMetadata::default();
        // 未定义长度的序列/条目嵌套深度，只提取顶层元素
        let mut depth = 0usize;
        let mut scanned = 0usize;

        while pos < data.len() {
            if scanned >= MAX_ELEMENTS {
                warn!("达到元素扫描上限 {}，停止扫描", MAX_ELEMENTS);
                break;
            }
            scanned += 1;

            let header = data
                .get(pos..pos + 8)
                .ok_or_else(|| truncated(pos, "元素头"))?;
            let tag = Tag(
                u16::from_le_bytes([header[0], header[1]]),
                u16::from_le_bytes([header[2], header[3]]),
            );

            // 条目与分隔符没有VR
            if tag.group() == 0xFFFE {
                let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
                pos += 8;
                match tag.element() {
                    0xE000 if length == UNDEFINED_LENGTH => depth += 1,
                    0xE000 => pos = skip(data, pos, length as usize)?,
                    0xE00D | 0xE0DD => depth = depth.saturating_sub(1),
                    other => {
                        return Err(PacsError::DicomParseError(format!(
                            "未知的分隔标签 (FFFE,{:04X})",
                            other
                        )))
                    }
                }
                continue;
            }

            let vr_code = [header[4], header[5]];
            let vr = VR::from_binary(vr_code).ok_or_else(|| {
                PacsError::DicomParseError(format!(
                    "元素 ({:04X},{:04X}) 的VR无效: {:?}",
                    tag.group(),
                    tag.element(),
                    String::from_utf8_lossy(&vr_code)
                ))
            })?;

            let length = if has_long_length(vr_code) {
                let ext = data
                    .get(pos + 8..pos + 12)
                    .ok_or_else(|| truncated(pos, "长度字段"))?;
                pos += 12;
                u32::from_le_bytes([ext[0], ext[1], ext[2], ext[3]])
            } else {
                pos += 8;
                u16::from_le_bytes([header[6], header[7]]) as u32
            };

            if length == UNDEFINED_LENGTH {
                depth += 1;
                continue;
            }

            let start = pos;
            pos = skip(data, pos, length as usize)?;

            if depth > 0 {
                continue;
            }

            if let Some(setter) = setter_for(tag) {
                if (length as usize) > MAX_TRACKED_VALUE_LEN {
                    debug!(
                        "跳过超长元素 ({:04X},{:04X}) {:?}: {} bytes",
                        tag.group(),
                        tag.element(),
                        vr,
                        length
                    );
                    continue;
                }
                let value = decode_text(&data[start..pos]);
                if !value.is_empty() {
                    setter(&mut metadata, value);
                }
            }
        }

        debug!("扫描完成: {} 个元素, {}", scanned, metadata.summary());
        Ok(metadata)
    }
}

fn skip(data: &[u8], pos: usize, length: usize) -> Result<usize> {
    pos.checked_add(length)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| truncated(pos, "元素值"))
}

fn truncated(pos: usize, what: &str) -> PacsError {
    PacsError::DicomParseError(format!("数据集在偏移 {} 处被截断 ({})", pos, what))
}

/// 取多值字符串的第一个值并去除填充
fn decode_text(value: &[u8]) -> String {
    let text = String::from_utf8_lossy(value);
    text.split('\\')
        .next()
        .unwrap_or_default()
        .trim_matches(|c: char| c == '\0' || c == ' ')
        .to_string()
}
