//! # PACS Core
//!
//! PACS集成协议层的核心模块，提供基础数据结构、错误定义、协作者接口和通用工具。

pub mod error;
pub mod models;
pub mod notification;
pub mod persistence;
pub mod utils;

pub use error::{PacsError, Result};
pub use models::*;
pub use notification::{Notification, Notifier};
pub use persistence::ClinicalStore;
