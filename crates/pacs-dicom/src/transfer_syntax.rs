//! DICOM传输语法与SOP类支持模块
//!
//! 协商时只接受显式VR小端序；SOP类限定为验证服务、查询服务与固定的一组存储类。

use tracing::debug;

/// 传输语法UID
pub mod transfer_syntax_uids {
    pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
    pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
    pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
    pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
    pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
    pub const JPEG_LOSSLESS: &str = "1.2.840.10008.1.2.4.70";
    pub const JPEG_2000_LOSSLESS: &str = "1.2.840.10008.1.2.4.90";
    pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";
}

/// SOP类UID
pub mod sop_class_uids {
    pub const VERIFICATION: &str = "1.2.840.10008.1.1";

    pub const COMPUTED_RADIOGRAPHY_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.1";
    pub const DIGITAL_XRAY_IMAGE_STORAGE_PRESENTATION: &str = "1.2.840.10008.5.1.4.1.1.1.1";
    pub const DIGITAL_MAMMOGRAPHY_IMAGE_STORAGE_PRESENTATION: &str = "1.2.840.10008.5.1.4.1.1.1.2";
    pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    pub const ULTRASOUND_MULTIFRAME_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.3.1";
    pub const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
    pub const ULTRASOUND_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.6.1";
    pub const SECONDARY_CAPTURE_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7";
    pub const XRAY_ANGIOGRAPHIC_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.12.1";
    pub const NUCLEAR_MEDICINE_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.20";
    pub const PET_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.128";

    pub const STUDY_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
    pub const STUDY_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";
    pub const PATIENT_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";
    pub const PATIENT_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.1.2";
}

use sop_class_uids::*;

const STORAGE_CLASSES: &[&str] = &[
    COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    DIGITAL_XRAY_IMAGE_STORAGE_PRESENTATION,
    DIGITAL_MAMMOGRAPHY_IMAGE_STORAGE_PRESENTATION,
    CT_IMAGE_STORAGE,
    ULTRASOUND_MULTIFRAME_IMAGE_STORAGE,
    MR_IMAGE_STORAGE,
    ULTRASOUND_IMAGE_STORAGE,
    SECONDARY_CAPTURE_IMAGE_STORAGE,
    XRAY_ANGIOGRAPHIC_IMAGE_STORAGE,
    NUCLEAR_MEDICINE_IMAGE_STORAGE,
    PET_IMAGE_STORAGE,
];

const QUERY_CLASSES: &[&str] = &[
    STUDY_ROOT_QR_FIND,
    STUDY_ROOT_QR_MOVE,
    PATIENT_ROOT_QR_FIND,
    PATIENT_ROOT_QR_MOVE,
];

/// 抽象语法类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractSyntaxKind {
    Verification,
    Storage,
    Query,
}

/// DICOM传输语法管理器
#[derive(Debug, Clone, Default)]
pub struct TransferSyntaxManager;

impl TransferSyntaxManager {
    /// 创建新的传输语法管理器
    pub fn new() -> Self {
        Self
    }

    /// 检查传输语法是否支持
    pub fn is_supported(&self, uid: &str) -> bool {
        uid == transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN
    }

    /// 获取所有支持的传输语法
    pub fn get_supported_syntaxes(&self) -> Vec<&'static str> {
        vec![transfer_syntax_uids::EXPLICIT_VR_LITTLE_ENDIAN]
    }

    /// 从提议列表中选出可接受的传输语法
    pub fn select<'a>(&self, proposed: &'a [String]) -> Option<&'a str> {
        let selected = proposed
            .iter()
            .map(String::as_str)
            .find(|uid| self.is_supported(uid));
        if selected.is_none() {
            debug!("提议的传输语法均不受支持: {:?}", proposed);
        }
        selected
    }

    /// 抽象语法分类，不支持的返回 None
    pub fn classify_abstract_syntax(&self, uid: &str) -> Option<AbstractSyntaxKind> {
        if uid == VERIFICATION {
            Some(AbstractSyntaxKind::Verification)
        } else if STORAGE_CLASSES.contains(&uid) {
            Some(AbstractSyntaxKind::Storage)
        } else if QUERY_CLASSES.contains(&uid) {
            Some(AbstractSyntaxKind::Query)
        } else {
            None
        }
    }
}
