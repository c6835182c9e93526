//! PACS集成网关主程序

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use pacs_integration::{ApiServer, DefaultConnectorFactory, LifecycleEvent, LifecycleManager, TracingNotifier};
use pacs_storage::FileStore;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "pacs-server")]
#[command(about = "PACS集成网关：HL7 (RIS/HIS) 与 DICOM (影像设备) 协议层")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别（RUST_LOG 优先）
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// 覆盖配置中的API监听地址
    #[arg(long)]
    api_addr: Option<String>,
}

/// 记录生命周期事件，重连耗尽时提示人工介入
async fn log_lifecycle_events(mut events: broadcast::Receiver<LifecycleEvent>) {
    loop {
        match events.recv().await {
            Ok(LifecycleEvent::ReconnectionExhausted { endpoint_id, attempts }) => {
                error!(
                    "端点 {} 重连 {} 次失败，请检查后调用 POST /endpoints/{}/connect",
                    endpoint_id, attempts, endpoint_id
                );
            }
            Ok(event) => info!("生命周期事件: {:?}", event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => warn!("生命周期事件丢失 {} 条", skipped),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("启动PACS集成网关...");

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(api_addr) = args.api_addr {
        config.api_addr = api_addr;
    }
    config.validate()?;

    let store = Arc::new(
        FileStore::open(&config.storage_root)
            .await
            .with_context(|| format!("无法打开存储目录 {}", config.storage_root.display()))?,
    );
    let factory = DefaultConnectorFactory::new(store, Arc::new(TracingNotifier));
    let manager = Arc::new(LifecycleManager::new(Arc::new(factory)));
    let events = tokio::spawn(log_lifecycle_events(manager.subscribe()));

    for endpoint in config.endpoints.clone() {
        let id = endpoint.id.clone();
        manager
            .register_endpoint(endpoint)
            .await
            .with_context(|| format!("注册端点 {} 失败", id))?;
    }

    let shutdown = CancellationToken::new();
    let api = {
        let server = ApiServer::new(manager.clone());
        let addr = config.api_addr.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { server.run(&addr, token).await })
    };

    info!("网关已就绪，按 Ctrl+C 退出");
    tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
    info!("收到退出信号，正在关闭...");

    shutdown.cancel();
    manager.shutdown().await;
    match api.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("API服务器异常: {:#}", e),
        Err(e) => error!("API任务异常: {}", e),
    }
    events.abort();

    info!("网关已退出");
    Ok(())
}
