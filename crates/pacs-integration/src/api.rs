//! 运维HTTP接口
//!
//! 只读的端点状态查询，以及手动连接/断开入口。

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::error::IntegrationError;
use crate::lifecycle::{ConnectionState, ConnectionStatus, EndpointSummary, LifecycleManager};

/// API状态
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<LifecycleManager>,
}

/// 健康检查响应
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub endpoints: usize,
    pub connected: usize,
}

fn status_code(error: &IntegrationError) -> StatusCode {
    match error {
        IntegrationError::EndpointNotFound(_) => StatusCode::NOT_FOUND,
        IntegrationError::Config(_) => StatusCode::BAD_REQUEST,
        e if e.is_transport() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// API处理器
pub struct ApiHandler;

impl ApiHandler {
    pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
        let endpoints = state.manager.endpoints().await;
        let connected = endpoints
            .iter()
            .filter(|e| e.status.state == ConnectionState::Connected)
            .count();
        Json(HealthResponse {
            status: "healthy",
            version: env!("CARGO_PKG_VERSION"),
            timestamp: chrono::Utc::now().to_rfc3339(),
            endpoints: endpoints.len(),
            connected,
        })
    }

    pub async fn list_endpoints(State(state): State<ApiState>) -> Json<Vec<EndpointSummary>> {
        Json(state.manager.endpoints().await)
    }

    pub async fn get_endpoint(
        State(state): State<ApiState>,
        Path(id): Path<String>,
    ) -> Result<Json<EndpointSummary>, StatusCode> {
        debug!("查询端点 {}", id);
        state
            .manager
            .endpoint(&id)
            .await
            .map(Json)
            .map_err(|e| status_code(&e))
    }

    /// 手动重连，同时清除重连耗尽状态
    pub async fn connect_endpoint(
        State(state): State<ApiState>,
        Path(id): Path<String>,
    ) -> Result<Json<ConnectionStatus>, StatusCode> {
        info!("手动连接端点 {}", id);
        if let Err(e) = state.manager.connect(&id).await {
            warn!("手动连接 {} 失败: {}", id, e);
            return Err(status_code(&e));
        }
        state.manager.status(&id).await.map(Json).map_err(|e| status_code(&e))
    }

    pub async fn disconnect_endpoint(
        State(state): State<ApiState>,
        Path(id): Path<String>,
    ) -> Result<Json<ConnectionStatus>, StatusCode> {
        info!("手动断开端点 {}", id);
        state.manager.disconnect(&id).await.map_err(|e| status_code(&e))?;
        state.manager.status(&id).await.map(Json).map_err(|e| status_code(&e))
    }
}

/// 创建API路由
pub fn create_api_routes(manager: Arc<LifecycleManager>) -> Router {
    Router::new()
        .route("/health", get(ApiHandler::health_check))
        .route("/endpoints", get(ApiHandler::list_endpoints))
        .route("/endpoints/:id", get(ApiHandler::get_endpoint))
        .route("/endpoints/:id/connect", post(ApiHandler::connect_endpoint))
        .route("/endpoints/:id/disconnect", post(ApiHandler::disconnect_endpoint))
        .with_state(ApiState { manager })
        .layer(TraceLayer::new_for_http())
}

/// API服务器
pub struct ApiServer {
    app: Router,
}

impl ApiServer {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        let app = create_api_routes(manager).layer(CorsLayer::permissive());
        Self { app }
    }

    pub fn router(&self) -> Router {
        self.app.clone()
    }

    pub async fn run(self, addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("API服务器监听 {}", listener.local_addr()?);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        info!("API服务器已停止");
        Ok(())
    }
}
