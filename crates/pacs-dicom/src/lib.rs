//! # DICOM服务模块
//!
//! 提供DICOM上层协议的实现：PDU编解码、关联协商、C-STORE/C-ECHO服务，
//! 以及用于健康检查的C-ECHO服务用户。

pub mod association;
pub mod dimse;
pub mod parser;
pub mod pdu;
pub mod scu;
pub mod server;
pub mod services;
pub mod transfer_syntax;

pub use association::{AssociationConfig, AssociationHandler, AssociationState, AssociationSummary};
pub use parser::DicomParser;
pub use pdu::{Pdu, PduCodec};
pub use server::{DicomServer, DicomServerConfig};
pub use services::*;
pub use transfer_syntax::TransferSyntaxManager;
