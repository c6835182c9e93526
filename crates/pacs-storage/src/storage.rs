//! 文件系统存储
//!
//! 目录布局：
//! - 影像对象: `<root>/images/<study>/<series>/<sop>.dcm`
//! - 临床事件: `<root>/events/<kind>.jsonl`，每行一个JSON对象

use async_trait::async_trait;
use pacs_core::utils::is_valid_dicom_uid;
use pacs_core::{ClinicalEvent, ClinicalStore, ImageMetadata, ObjectRef, PacsError, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const UNKNOWN_COMPONENT: &str = "unknown";

/// 文件存储
pub struct FileStore {
    root: PathBuf,
    // 串行化事件追加，保证每行完整
    event_lock: Mutex<()>,
}

impl FileStore {
    /// 创建存储并确保目录存在
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("images")).await?;
        tokio::fs::create_dir_all(root.join("events")).await?;
        info!("文件存储根目录: {}", root.display());
        Ok(Self {
            root,
            event_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 影像对象的相对路径
    pub fn image_path(metadata: &ImageMetadata) -> Result<PathBuf> {
        let sop = metadata
            .sop_instance_uid
            .as_deref()
            .filter(|uid| is_valid_dicom_uid(uid))
            .ok_or_else(|| PacsError::Validation("缺少有效的SOP Instance UID".to_string()))?;

        Ok(PathBuf::from("images")
            .join(path_component(metadata.study_instance_uid.as_deref()))
            .join(path_component(metadata.series_instance_uid.as_deref()))
            .join(format!("{}.dcm", sop)))
    }

    /// 读取已保存的影像对象
    pub async fn read_image(&self, object: &ObjectRef) -> Result<Vec<u8>> {
        let relative = Path::new(&object.0);
        if relative.is_absolute() || relative.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(PacsError::Validation(format!("非法对象引用: {}", object)));
        }
        match tokio::fs::read(self.root.join(relative)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PacsError::NotFound(object.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn events_path(&self, event: &ClinicalEvent) -> PathBuf {
        self.root.join("events").join(format!("{}.jsonl", event.kind))
    }
}

/// UID作为目录名；无效或缺失时归入 `unknown`
fn path_component(uid: Option<&str>) -> String {
    match uid {
        Some(uid) if is_valid_dicom_uid(uid) => uid.to_string(),
        Some(uid) => {
            warn!("UID格式无效，归入 {}: {:?}", UNKNOWN_COMPONENT, uid);
            UNKNOWN_COMPONENT.to_string()
        }
        None => UNKNOWN_COMPONENT.to_string(),
    }
}

#[async_trait]
impl ClinicalStore for FileStore {
    async fn save_clinical_event(&self, event: &ClinicalEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let path = self.events_path(event);
        let _guard = self.event_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!("事件 {} ({}) 写入 {}", event.id, event.kind, path.display());
        Ok(())
    }

    async fn save_image_object(&self, data: &[u8], metadata: &ImageMetadata) -> Result<ObjectRef> {
        if data.is_empty() {
            return Err(PacsError::Validation("影像对象为空".to_string()));
        }
        let relative = Self::image_path(metadata)?;
        let path = self.root.join(&relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // 先写临时文件再改名，避免留下半个对象
        let staging = path.with_extension("dcm.part");
        tokio::fs::write(&staging, data).await?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(PacsError::Storage(format!("写入 {} 失败: {}", path.display(), e)));
        }

        info!("保存影像 {} ({} 字节): {}", relative.display(), data.len(), metadata.summary());
        Ok(ObjectRef(relative.to_string_lossy().replace('\\', "/")))
    }
}
