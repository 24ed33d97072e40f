mod config;
mod error;
mod launch;
mod monitor;
mod policy;
mod process;
mod state;
mod supervisor;
mod web;

#[cfg(test)]
mod test_support;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use clap::Parser;
use config::AppConfig;
use process::OsLauncher;
use state::AppState;
use std::{sync::Arc, time::Duration};
use supervisor::StreamSupervisor;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// stream-keeper - 24/7 RTMP push supervisor
/// 解析命令行参数，加载配置，启动推流守护、健康检查和 HTTP 控制接口
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径 (不存在时使用默认配置 + 环境变量)
    #[arg(short, long, default_value = "stream-keeper.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，LOG_LEVEL 优先于 RUST_LOG，默认 info
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // 解析命令行参数，获取配置文件路径
    let args = Args::parse();

    // 加载配置文件
    let config = AppConfig::load(&args.config)?;
    info!(
        "stream-keeper initialized. Encoder: {}, max restarts: {}",
        config.encoder.binary, config.supervisor.max_restart_attempts
    );

    // 推流守护只有一个实例，由应用上下文持有
    let supervisor = StreamSupervisor::new(config.clone(), Arc::new(OsLauncher));
    let state = Arc::new(AppState::new(config.clone(), supervisor.clone()));
    let shutdown = CancellationToken::new();

    // 启动后台健康检查
    tokio::spawn(monitor::run_health_monitor(
        supervisor.clone(),
        config.server.health_check_interval_ms,
        shutdown.clone(),
    ));

    // 延迟自动开始推流
    if config.auto_start {
        let supervisor = supervisor.clone();
        let shutdown = shutdown.clone();
        let delay = Duration::from_millis(config.auto_start_delay_ms);
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    info!("Auto-start stream enabled, starting stream...");
                    supervisor.start().await;
                }
            }
        });
    }

    // 注册HTTP路由
    let app = Router::new()
        .route("/", get(web::admin::index_handler)) // 首页
        .route("/health", get(web::admin::health)) // 健康检查
        .route("/api/status", get(web::admin::stream_status)) // 推流状态
        .route("/api/system", get(web::admin::sys_status)) // 系统状态
        .route("/api/test-ffmpeg", get(web::admin::test_encoder)) // 编码器自检
        .route("/api/stream/start", post(web::control::handle_start)) // 启动推流
        .route("/api/stream/stop", post(web::control::handle_stop)) // 停止推流
        .route("/api/stream/restart", post(web::control::handle_restart)) // 重启推流
        .fallback(web::admin::not_found)
        .layer(middleware::from_fn(web::log_request))
        .with_state(state);

    // 启动HTTP服务，监听指定的地址和端口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 退出前停止健康检查和推流
    info!("Shutting down...");
    shutdown.cancel();
    supervisor.stop().await;
    info!("Shutdown completed");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}
