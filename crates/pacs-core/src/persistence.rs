//! 持久化协作者接口
//!
//! 协议层在解码/提取成功后调用该接口；实现方需保证可被多个端点并发调用。

use async_trait::async_trait;

use crate::{ClinicalEvent, ImageMetadata, ObjectRef, Result};

/// 临床数据存储
#[async_trait]
pub trait ClinicalStore: Send + Sync {
    /// 保存解码后的临床事件
    async fn save_clinical_event(&self, event: &ClinicalEvent) -> Result<()>;

    /// 保存影像对象原始字节，返回对象引用
    async fn save_image_object(&self, data: &[u8], metadata: &ImageMetadata) -> Result<ObjectRef>;
}
