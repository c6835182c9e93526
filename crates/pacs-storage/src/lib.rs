//! # PACS存储模块
//!
//! 持久化协作者的文件系统实现。

pub mod storage;

pub use storage::FileStore;
