use crate::state::{epoch_millis, SharedState};
use axum::{extract::State, http::StatusCode, Json};
use std::time::SystemTime;
use tokio::process::Command;
use tracing::{error, info};

/// 服务首页，列出可用接口
pub async fn index_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "message": "stream-keeper is running",
        "endpoints": {
            "health": "/health",
            "status": "/api/status",
            "system": "/api/system",
        },
    }))
}

/// 健康检查 API
/// 返回服务运行时长、推流状态和系统内存
pub async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let uptime = state.booted_at.elapsed().as_secs();
    let stats = state.supervisor.stats();
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));

    Json(serde_json::json!({
        "status": "ok",
        "timestamp": epoch_millis(SystemTime::now()),
        "uptime": uptime,
        "uptimeFormatted": format_uptime(uptime),
        "streaming": stats.streaming,
        "streamStartTime": stats.stream_start_time,
        "streamUptime": stats.uptime / 1000,
        "memory": {
            "total": format!("{}MB", mem.0 / 1024),
            "avail": format!("{}MB", mem.1 / 1024),
        },
        "streamStats": stats,
        "version": env!("CARGO_PKG_VERSION"),
        "platform": std::env::consts::OS,
    }))
}

/// 推流状态 API
pub async fn stream_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let stats = state.supervisor.stats();
    Json(serde_json::to_value(&stats).unwrap_or_default())
}

/// 获取系统状态 API
/// 返回主机的 CPU、内存和负载信息
pub async fn sys_status() -> Json<serde_json::Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.free)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg()
        .map(|l| [l.one, l.five, l.fifteen])
        .unwrap_or([0.0; 3]);

    Json(serde_json::json!({
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "osRelease": sys_info::os_release().unwrap_or_default(),
        "cpus": sys_info::cpu_num().unwrap_or(0),
        "totalMemory": format!("{}MB", mem.0 / 1024),
        "freeMemory": format!("{}MB", mem.1 / 1024),
        "loadAverage": load,
        "hostname": sys_info::hostname().unwrap_or_default(),
    }))
}

/// 检查编码器是否可用 (`<binary> -version`)
pub async fn test_encoder(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let binary = &state.config.encoder.binary;
    info!("Testing encoder installation: {}", binary);

    match Command::new(binary).arg("-version").output().await {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Json(serde_json::json!({
                "success": true,
                "message": "FFmpeg is working correctly",
                "version": stdout.lines().next().unwrap_or_default(),
                "path": binary,
            }))
        }
        Ok(output) => Json(serde_json::json!({
            "success": false,
            "message": "FFmpeg test failed",
            "code": output.status.code(),
            "output": String::from_utf8_lossy(&output.stderr),
        })),
        Err(e) => {
            error!("Encoder test failed: {}", e);
            Json(serde_json::json!({
                "success": false,
                "message": "FFmpeg test error",
                "error": e.to_string(),
            }))
        }
    }
}

pub async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Endpoint not found" })),
    )
}

/// 将秒数格式化为 `1d 2h 3m 4s`，省略前导的零单位
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
