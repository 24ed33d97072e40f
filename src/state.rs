use crate::config::AppConfig;
use crate::process::ProcessHandle;
use crate::supervisor::StreamSupervisor;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// 推流生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl Phase {
    /// 持有进程句柄的阶段
    pub fn is_active(self) -> bool {
        matches!(self, Phase::Starting | Phase::Running | Phase::Stopping)
    }
}

/// 推流运行时状态，只由 StreamSupervisor 修改
pub struct StreamState {
    pub phase: Phase,
    /// 当前编码进程，仅在 Starting/Running/Stopping 阶段存在
    pub process: Option<ProcessHandle>,
    /// 确认进程存活后才设置
    pub started_at: Option<SystemTime>,
    /// 连续自动重启次数，外部 start 成功后清零
    pub restart_attempts: u32,
    /// 最近一次自动重启的时间 (冷却计算)
    pub last_restart_at: Option<Instant>,
    /// 由本服务发起的终止，对应的退出事件不触发重启
    pub stopping: bool,
    /// 每次创建进程加一，用于识别过期的退出事件
    pub generation: u64,
    /// 每次外部 start/stop/restart 加一，使已排期的自动重启失效
    pub epoch: u64,
    /// 已排期但尚未执行的自动重启
    pub pending_restart: bool,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            process: None,
            started_at: None,
            restart_attempts: 0,
            last_restart_at: None,
            stopping: false,
            generation: 0,
            epoch: 0,
            pending_restart: false,
        }
    }

    pub fn snapshot(&self, now: SystemTime, max_restart_attempts: u32) -> StreamStats {
        let streaming = self.phase == Phase::Running;
        let uptime = match (streaming, self.started_at) {
            (true, Some(started)) => now
                .duration_since(started)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            _ => 0,
        };

        StreamStats {
            streaming,
            phase: self.phase,
            stream_start_time: self.started_at.map(epoch_millis),
            uptime,
            restart_attempts: self.restart_attempts,
            max_restart_attempts,
            pending_restart: self.pending_restart,
        }
    }
}

/// 对外暴露的状态快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub streaming: bool,
    pub phase: Phase,
    /// Unix 毫秒时间戳
    pub stream_start_time: Option<u64>,
    /// 推流时长 (毫秒)
    pub uptime: u64,
    pub restart_attempts: u32,
    pub max_restart_attempts: u32,
    pub pending_restart: bool,
}

pub fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 全局应用上下文
pub struct AppState {
    pub config: AppConfig,
    pub supervisor: StreamSupervisor,
    /// 服务启动时间 (用于计算进程运行时长)
    pub booted_at: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, supervisor: StreamSupervisor) -> Self {
        Self {
            config,
            supervisor,
            booted_at: Instant::now(),
        }
    }
}

pub type SharedState = Arc<AppState>;
