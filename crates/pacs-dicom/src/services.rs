//! DICOM服务实现

use async_trait::async_trait;
use pacs_core::{utils::is_valid_dicom_uid, ClinicalStore, PacsError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::dimse::{status, CommandSet, CommandType};
use crate::parser::DicomParser;

/// DICOM服务特征
#[async_trait]
pub trait DicomService: Send + Sync {
    async fn handle_request(&self, request: &DimseRequest) -> Result<Vec<DimseResponse>>;
}

/// DICOM消息服务元素请求
#[derive(Debug, Clone)]
pub struct DimseRequest {
    pub command: CommandSet,
    pub presentation_context_id: u8,
    pub dataset: Option<Vec<u8>>,
    pub calling_ae_title: String,
}

/// DICOM消息服务元素响应
#[derive(Debug, Clone)]
pub struct DimseResponse {
    pub command: CommandSet,
    pub dataset: Option<Vec<u8>>,
}

impl DimseResponse {
    pub fn status(request: &CommandSet, code: u16) -> Self {
        Self {
            command: CommandSet::response_to(request, code),
            dataset: None,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.command.status.unwrap_or(status::GENERAL_FAILURE)
    }
}

/// 外部查询服务（C-FIND / C-MOVE 直通）
#[async_trait]
pub trait QueryService: Send + Sync {
    /// 返回匹配的标识符数据集
    async fn find(&self, sop_class_uid: &str, identifier: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// 将匹配对象发送到目标AE；目标未知时返回 `PacsError::NotFound`
    async fn retrieve(&self, sop_class_uid: &str, destination: &str, identifier: &[u8]) -> Result<()>;
}

/// 未配置查询服务时的默认实现
pub struct UnavailableQueryService;

#[async_trait]
impl QueryService for UnavailableQueryService {
    async fn find(&self, _sop_class_uid: &str, _identifier: &[u8]) -> Result<Vec<Vec<u8>>> {
        Err(PacsError::Internal("未配置查询服务".to_string()))
    }

    async fn retrieve(&self, _sop_class_uid: &str, _destination: &str, _identifier: &[u8]) -> Result<()> {
        Err(PacsError::Internal("未配置查询服务".to_string()))
    }
}

/// C-ECHO服务
pub struct CEchoService;

#[async_trait]
impl DicomService for CEchoService {
    async fn handle_request(&self, request: &DimseRequest) -> Result<Vec<DimseResponse>> {
        debug!("处理C-ECHO请求, 来自 {}", request.calling_ae_title);
        Ok(vec![DimseResponse::status(&request.command, status::SUCCESS)])
    }
}

/// C-STORE服务
pub struct CStoreService {
    store: Arc<dyn ClinicalStore>,
}

impl CStoreService {
    pub fn new(store: Arc<dyn ClinicalStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DicomService for CStoreService {
    async fn handle_request(&self, request: &DimseRequest) -> Result<Vec<DimseResponse>> {
        let dataset = request
            .dataset
            .as_deref()
            .ok_or_else(|| PacsError::StoreProcessing("C-STORE请求缺少数据集".to_string()))?;
        debug!("接收到DICOM数据集，大小: {} bytes", dataset.len());

        let mut metadata = DicomParser::parse_bytes(dataset)?;

        match (&metadata.sop_instance_uid, &request.command.affected_sop_instance_uid) {
            (Some(in_dataset), Some(in_command)) if in_dataset != in_command => {
                warn!("数据集SOP实例UID {} 与命令 {} 不一致", in_dataset, in_command);
            }
            (None, Some(in_command)) => metadata.sop_instance_uid = Some(in_command.clone()),
            _ => {}
        }

        let sop_instance_uid = metadata
            .sop_instance_uid
            .clone()
            .ok_or_else(|| PacsError::DicomParseError("缺少SOP实例UID".to_string()))?;
        if !is_valid_dicom_uid(&sop_instance_uid) {
            return Err(PacsError::Validation(format!("SOP实例UID无效: {}", sop_instance_uid)));
        }
        metadata.calling_ae_title = Some(request.calling_ae_title.clone());

        let object_ref = self
            .store
            .save_image_object(dataset, &metadata)
            .await
            .map_err(|e| PacsError::StoreProcessing(e.to_string()))?;

        info!("DICOM对象已存储: {} -> {} ({})", sop_instance_uid, object_ref, metadata.summary());
        Ok(vec![DimseResponse::status(&request.command, status::SUCCESS)])
    }
}

/// C-FIND直通服务
pub struct CFindService {
    query: Arc<dyn QueryService>,
}

impl CFindService {
    pub fn new(query: Arc<dyn QueryService>) -> Self {
        Self { query }
    }
}

#[async_trait]
impl DicomService for CFindService {
    async fn handle_request(&self, request: &DimseRequest) -> Result<Vec<DimseResponse>> {
        let sop_class = request.command.affected_sop_class_uid.clone().unwrap_or_default();
        let identifier = request.dataset.as_deref().unwrap_or_default();

        match self.query.find(&sop_class, identifier).await {
            Ok(matches) => {
                debug!("C-FIND返回 {} 条匹配", matches.len());
                let mut responses: Vec<DimseResponse> = matches
                    .into_iter()
                    .map(|dataset| DimseResponse {
                        command: CommandSet::response_to(&request.command, status::PENDING).with_data_set(),
                        dataset: Some(dataset),
                    })
                    .collect();
                responses.push(DimseResponse::status(&request.command, status::SUCCESS));
                Ok(responses)
            }
            Err(e) => {
                warn!("C-FIND查询服务失败: {}", e);
                Ok(vec![DimseResponse::status(&request.command, status::UNABLE_TO_PROCESS)])
            }
        }
    }
}

/// C-MOVE直通服务
pub struct CMoveService {
    query: Arc<dyn QueryService>,
}

impl CMoveService {
    pub fn new(query: Arc<dyn QueryService>) -> Self {
        Self { query }
    }
}

#[async_trait]
impl DicomService for CMoveService {
    async fn handle_request(&self, request: &DimseRequest) -> Result<Vec<DimseResponse>> {
        let sop_class = request.command.affected_sop_class_uid.clone().unwrap_or_default();
        let destination = request.command.move_destination.clone().unwrap_or_default();
        let identifier = request.dataset.as_deref().unwrap_or_default();

        let code = match self.query.retrieve(&sop_class, &destination, identifier).await {
            Ok(()) => status::SUCCESS,
            Err(PacsError::NotFound(_)) => status::MOVE_DESTINATION_UNKNOWN,
            Err(e) => {
                warn!("C-MOVE到 {} 失败: {}", destination, e);
                status::UNABLE_TO_PROCESS
            }
        };
        Ok(vec![DimseResponse::status(&request.command, code)])
    }
}

/// DICOM服务管理器
pub struct ServiceManager {
    services: HashMap<CommandType, Box<dyn DicomService>>,
}

impl ServiceManager {
    pub fn new(store: Arc<dyn ClinicalStore>, query: Arc<dyn QueryService>) -> Self {
        let mut services: HashMap<CommandType, Box<dyn DicomService>> = HashMap::new();
        services.insert(CommandType::CEchoRq, Box::new(CEchoService));
        services.insert(CommandType::CStoreRq, Box::new(CStoreService::new(store)));
        services.insert(CommandType::CFindRq, Box::new(CFindService::new(query.clone())));
        services.insert(CommandType::CMoveRq, Box::new(CMoveService::new(query)));
        Self { services }
    }

    pub fn register_service(&mut self, command: CommandType, service: Box<dyn DicomService>) {
        self.services.insert(command, service);
    }

    /// 分发请求；服务内部错误统一转换为 0xC000 响应
    pub async fn handle_request(&self, request: &DimseRequest) -> Vec<DimseResponse> {
        match self.services.get(&request.command.command) {
            Some(service) => match service.handle_request(request).await {
                Ok(responses) => responses,
                Err(e) => {
                    error!("处理 {:?} 失败: {}", request.command.command, e);
                    let mut response = DimseResponse::status(&request.command, status::GENERAL_FAILURE);
                    response.command.error_comment = Some(truncate_comment(&e.to_string()));
                    vec![response]
                }
            },
            None => {
                warn!("不支持的DIMSE命令: {:?}", request.command.command);
                vec![DimseResponse::status(&request.command, status::UNRECOGNIZED_OPERATION)]
            }
        }
    }
}

/// Error Comment 最长64字符
fn truncate_comment(message: &str) -> String {
    message.chars().take(64).collect()
}
