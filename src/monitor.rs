use crate::state::{Phase, StreamStats};
use crate::supervisor::StreamSupervisor;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 可用内存低于该值 (KB) 时告警
const LOW_MEMORY_KB: u64 = 5120;

/// 周期性健康检查
///
/// 只读取守护状态并记录日志，重启决策完全由 StreamSupervisor 负责，
/// 避免出现两个相互竞争的重启来源。
pub async fn run_health_monitor(
    supervisor: StreamSupervisor,
    interval_ms: u64,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    info!("Health monitoring started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let stats = supervisor.stats();
        info!("{}", summarize(&stats));

        if stats.phase == Phase::Failed {
            if stats.pending_restart {
                info!("Stream down, automatic restart pending");
            } else {
                warn!("Stream down with no restart scheduled. Manual start required.");
            }
        }

        // 内存检查失败只记录，不影响推流
        match sys_info::mem_info() {
            Ok(mem) if mem.avail < LOW_MEMORY_KB => {
                warn!("Low system memory: {} KB available", mem.avail);
            }
            Ok(_) => {}
            Err(e) => debug!("Failed to check memory usage: {}", e),
        }
    }

    info!("Health monitoring stopped");
}

pub fn summarize(stats: &StreamStats) -> String {
    format!(
        "Health check - Stream: {}, Phase: {:?}, Uptime: {}s, Restarts: {}/{}",
        stats.streaming,
        stats.phase,
        stats.uptime / 1000,
        stats.restart_attempts,
        stats.max_restart_attempts
    )
}
