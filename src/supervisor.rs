//! 推流进程守护
//!
//! 同一时刻只有一个编码进程。`start`/`stop`/`restart` 与退出事件的处理
//! 通过同一把操作锁串行执行；`stats` 只读取状态快照，不等待操作锁。
//!
//! ```text
//! Idle ─start─► Starting ─首行输出─► Running ─stop─► Stopping ─► Idle
//!                  │                    │
//!                  └─超时/提前退出─► Failed ◄─意外退出 (策略拒绝)
//!                                       │
//!                                       └─策略允许─► 延迟后自动 start
//! ```

use crate::config::AppConfig;
use crate::error::{SpawnError, StartError};
use crate::launch::LaunchSpec;
use crate::policy::{self, DenyReason, RestartDecision, RestartLimits};
use crate::process::{DiagnosticLines, ExitOutcome, Launcher, ProcessHandle};
use crate::state::{Phase, StreamState, StreamStats};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartKind {
    /// 外部请求 (HTTP、自动启动、restart)
    External,
    /// 意外退出后的自动重启
    Automatic,
}

/// 退出观察者投递到收件箱的事件
struct ExitEvent {
    generation: u64,
    outcome: ExitOutcome,
}

#[derive(Clone)]
pub struct StreamSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: AppConfig,
    launcher: Arc<dyn Launcher>,
    /// 串行化所有会修改状态的操作
    ops: tokio::sync::Mutex<()>,
    state: Mutex<StreamState>,
    inbox: mpsc::UnboundedSender<ExitEvent>,
}

impl StreamSupervisor {
    /// 创建守护实例并启动退出事件处理任务，需在 tokio 运行时内调用
    pub fn new(config: AppConfig, launcher: Arc<dyn Launcher>) -> Self {
        let (inbox, events) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            launcher,
            ops: tokio::sync::Mutex::new(()),
            state: Mutex::new(StreamState::new()),
            inbox,
        });
        tokio::spawn(drain_inbox(Arc::downgrade(&inner), events));
        Self { inner }
    }

    /// 启动推流，已在运行或启动失败时返回 false
    pub async fn start(&self) -> bool {
        match self.try_start().await {
            Ok(()) => true,
            Err(StartError::AlreadyRunning) => {
                info!("Stream already running");
                false
            }
            Err(StartError::Configuration(e)) => {
                warn!("No RTMP configuration ({}). Streaming disabled.", e);
                false
            }
            Err(StartError::Spawn(e)) => {
                error!("Failed to start stream: {}", e);
                false
            }
        }
    }

    /// 同 `start`，但返回失败原因。并发的 start 直接被拒绝，不排队。
    pub async fn try_start(&self) -> Result<(), StartError> {
        if self.phase().is_active() {
            return Err(StartError::AlreadyRunning);
        }

        let _guard = self.inner.ops.lock().await;
        self.bump_epoch();
        self.start_locked(StartKind::External).await
    }

    /// 停止推流。空闲时直接返回 true。
    pub async fn stop(&self) -> bool {
        let _guard = self.inner.ops.lock().await;
        self.bump_epoch();
        self.stop_locked().await;
        true
    }

    /// 完整停止，等待 settle_delay 后重新启动，返回启动结果
    pub async fn restart(&self) -> bool {
        let _guard = self.inner.ops.lock().await;
        self.bump_epoch();
        info!("Restarting stream...");

        self.stop_locked().await;
        tokio::time::sleep(self.inner.config.supervisor.settle_delay()).await;

        match self.start_locked(StartKind::External).await {
            Ok(()) => {
                info!("Stream restart successful");
                true
            }
            Err(e) => {
                error!("Stream restart failed: {}", e);
                false
            }
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.state().snapshot(
            SystemTime::now(),
            self.inner.config.supervisor.max_restart_attempts,
        )
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn bump_epoch(&self) {
        let mut state = self.state();
        state.epoch += 1;
        state.pending_restart = false;
    }

    fn limits(&self) -> RestartLimits {
        let cfg = &self.inner.config.supervisor;
        RestartLimits {
            max_attempts: cfg.max_restart_attempts,
            cooldown: cfg.restart_cooldown(),
        }
    }

    /// 调用方必须持有操作锁
    async fn start_locked(&self, kind: StartKind) -> Result<(), StartError> {
        if self.phase().is_active() {
            return Err(StartError::AlreadyRunning);
        }

        let cfg = &self.inner.config;
        let spec = LaunchSpec::build(&cfg.encoder, &cfg.destination, &cfg.source, &cfg.encoding)?;
        info!("Starting stream to {} ({:?})", spec.redacted_target, kind);

        // 创建进程与登记句柄在同一临界区内完成
        let (handle, generation) = {
            let mut state = self.state();
            state.pending_restart = false;
            let handle = match self.inner.launcher.launch(&spec) {
                Ok(handle) => handle,
                Err(e) => {
                    state.phase = Phase::Failed;
                    return Err(e.into());
                }
            };
            state.generation += 1;
            state.phase = Phase::Starting;
            state.process = Some(handle.clone());
            state.stopping = false;
            (handle, state.generation)
        };

        let inbox = self.inner.inbox.clone();
        handle.on_exit(move |outcome| {
            // 收件箱关闭说明守护已销毁
            let _ = inbox.send(ExitEvent {
                generation,
                outcome,
            });
        });
        tokio::spawn(forward_diagnostics(handle.diagnostic_lines()));

        if let Err(e) = self.await_liveness(&handle).await {
            self.state().stopping = true;
            handle
                .terminate(self.inner.config.supervisor.termination_grace())
                .await;

            let mut state = self.state();
            state.process = None;
            state.started_at = None;
            state.phase = Phase::Failed;
            return Err(e.into());
        }

        let mut state = self.state();
        state.phase = Phase::Running;
        state.started_at = Some(SystemTime::now());
        if kind == StartKind::External {
            state.restart_attempts = 0;
        }
        info!(
            pid = ?handle.pid(),
            "Stream started successfully (restarts {}/{})",
            state.restart_attempts,
            cfg.supervisor.max_restart_attempts
        );
        Ok(())
    }

    /// 以首行诊断输出作为存活信号，超时或提前退出视为启动失败
    async fn await_liveness(&self, handle: &ProcessHandle) -> Result<(), SpawnError> {
        let timeout = self.inner.config.supervisor.startup_timeout();
        tokio::select! {
            biased;
            true = handle.first_output() => Ok(()),
            outcome = handle.wait() => Err(SpawnError::ExitedDuringStartup { outcome }),
            _ = tokio::time::sleep(timeout) => Err(SpawnError::StartupTimeout { timeout }),
        }
    }

    /// 调用方必须持有操作锁
    async fn stop_locked(&self) {
        let handle = {
            let mut state = self.state();
            match state.phase {
                Phase::Idle => {
                    debug!("Stop requested while idle");
                    return;
                }
                Phase::Failed => {
                    state.phase = Phase::Idle;
                    info!("Cleared failed stream");
                    return;
                }
                _ => {}
            }
            state.stopping = true;
            state.phase = Phase::Stopping;
            state.process.clone()
        };

        if let Some(handle) = handle {
            info!(pid = ?handle.pid(), "Stopping stream...");
            let outcome = handle
                .terminate(self.inner.config.supervisor.termination_grace())
                .await;
            info!("Stream stopped ({})", outcome);
        }

        let mut state = self.state();
        state.phase = Phase::Idle;
        state.process = None;
        state.started_at = None;
    }

    async fn handle_exit(&self, event: ExitEvent) {
        let _guard = self.inner.ops.lock().await;
        let now = Instant::now();

        let epoch = {
            let mut state = self.state();
            if event.generation != state.generation {
                debug!(generation = event.generation, "Ignoring stale exit event");
                return;
            }
            if state.stopping {
                state.stopping = false;
                debug!("Encoder exited after stop request ({})", event.outcome);
                return;
            }
            if state.phase != Phase::Running {
                return;
            }

            warn!("Encoder exited unexpectedly with {}", event.outcome);
            state.phase = Phase::Failed;
            state.process = None;
            state.started_at = None;

            match policy::may_restart(now, state.last_restart_at, state.restart_attempts, self.limits()) {
                RestartDecision::Allow { next_attempt } => {
                    state.restart_attempts = next_attempt;
                    state.last_restart_at = Some(now);
                    state.pending_restart = true;
                    info!(
                        "Scheduling stream restart (attempt {}/{})",
                        next_attempt, self.inner.config.supervisor.max_restart_attempts
                    );
                    state.epoch
                }
                RestartDecision::Deny(reason @ DenyReason::MaxAttemptsReached) => {
                    error!("Restart denied: {}. Stream left in failed state.", reason);
                    return;
                }
                RestartDecision::Deny(reason) => {
                    warn!("Restart denied: {}. Skipping restart.", reason);
                    return;
                }
            }
        };

        self.schedule_restart(epoch);
    }

    fn schedule_restart(&self, epoch: u64) {
        let supervisor = self.clone();
        let delay = self.inner.config.supervisor.restart_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let _guard = supervisor.inner.ops.lock().await;
            {
                let state = supervisor.state();
                if state.epoch != epoch || state.phase != Phase::Failed {
                    debug!("Scheduled restart superseded");
                    return;
                }
            }

            info!("Attempting stream restart...");
            if let Err(e) = supervisor.start_locked(StartKind::Automatic).await {
                error!("Automatic restart failed: {}", e);
            }
        });
    }
}

/// 逐个处理退出事件；守护被销毁后退出
async fn drain_inbox(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ExitEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        StreamSupervisor { inner }.handle_exit(event).await;
    }
}

async fn forward_diagnostics(mut lines: DiagnosticLines) {
    while let Some(line) = lines.next().await {
        if line.to_ascii_lowercase().contains("error") {
            warn!(target: "encoder", "{}", line);
        } else {
            debug!(target: "encoder", "{}", line);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{test_config, wait_until, within, ScriptLauncher};
    use std::sync::atomic::Ordering;
    use std::time::{Duration, UNIX_EPOCH};

    const LONG_RUNNING: &str = "echo up >&2; exec sleep 30";
    const CRASHES_SOON: &str = "echo up >&2; sleep 0.3; exit 1";
    const SLOW_START: &str = "sleep 0.5; echo up >&2; exec sleep 30";

    fn supervisor(config: AppConfig, script: &str) -> (StreamSupervisor, Arc<ScriptLauncher>) {
        let launcher = Arc::new(ScriptLauncher::new(script));
        (StreamSupervisor::new(config, launcher.clone()), launcher)
    }

    #[tokio::test]
    async fn start_reports_running_with_fresh_counters() {
        let (sup, launcher) = supervisor(test_config(5, 60_000), LONG_RUNNING);

        assert!(sup.start().await);
        let stats = sup.stats();
        assert!(stats.streaming);
        assert_eq!(stats.phase, Phase::Running);
        assert_eq!(stats.restart_attempts, 0);

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        assert!(stats.stream_start_time.unwrap() <= now_ms);
        assert_eq!(launcher.spawned(), 1);

        assert!(sup.stop().await);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (sup, launcher) = supervisor(test_config(5, 60_000), LONG_RUNNING);

        assert!(sup.start().await);
        assert!(!sup.start().await);
        assert!(matches!(sup.try_start().await, Err(StartError::AlreadyRunning)));
        assert_eq!(launcher.spawned(), 1);

        sup.stop().await;
    }

    #[tokio::test]
    async fn start_during_startup_is_rejected_without_spawning() {
        let (sup, launcher) = supervisor(test_config(5, 60_000), SLOW_START);

        let first = tokio::spawn({
            let sup = sup.clone();
            async move { sup.start().await }
        });
        wait_until("startup in flight", || sup.phase() == Phase::Starting).await;

        assert!(matches!(sup.try_start().await, Err(StartError::AlreadyRunning)));
        assert!(!sup.start().await);
        assert_eq!(launcher.spawned(), 1);

        assert!(within(5, first).await.unwrap());
        assert_eq!(sup.phase(), Phase::Running);
        assert_eq!(launcher.spawned(), 1);

        within(5, sup.stop()).await;
    }

    #[tokio::test]
    async fn stop_waits_for_inflight_start() {
        let (sup, launcher) = supervisor(test_config(5, 60_000), SLOW_START);

        let start = tokio::spawn({
            let sup = sup.clone();
            async move { sup.start().await }
        });
        wait_until("startup in flight", || sup.phase() == Phase::Starting).await;

        assert!(within(10, sup.stop()).await);
        // start 在 stop 拆除之前已到达 Running
        assert!(within(5, start).await.unwrap());

        let stats = sup.stats();
        assert_eq!(stats.phase, Phase::Idle);
        assert!(!stats.streaming);
        assert_eq!(launcher.spawned(), 1);
        assert!(!launcher.any_alive());
    }

    #[tokio::test]
    async fn stop_when_idle_is_noop() {
        let (sup, launcher) = supervisor(test_config(5, 60_000), LONG_RUNNING);

        assert!(sup.stop().await);
        assert_eq!(sup.phase(), Phase::Idle);
        assert_eq!(launcher.spawned(), 0);
    }

    #[tokio::test]
    async fn stop_terminates_and_clears_state() {
        let (sup, launcher) = supervisor(test_config(5, 60_000), LONG_RUNNING);

        assert!(sup.start().await);
        assert!(sup.stop().await);

        let stats = sup.stats();
        assert_eq!(stats.phase, Phase::Idle);
        assert!(!stats.streaming);
        assert_eq!(stats.stream_start_time, None);
        assert!(!launcher.any_alive());

        // 主动停止不会触发自动重启
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(launcher.spawned(), 1);
        assert_eq!(sup.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn empty_key_never_spawns() {
        let mut config = test_config(5, 60_000);
        config.destination.key = String::new();
        let (sup, launcher) = supervisor(config, LONG_RUNNING);

        assert!(!sup.start().await);
        assert!(matches!(sup.try_start().await, Err(StartError::Configuration(_))));
        assert_eq!(sup.phase(), Phase::Idle);
        assert_eq!(launcher.spawned(), 0);
    }

    #[tokio::test]
    async fn silent_encoder_times_out() {
        let mut config = test_config(5, 60_000);
        config.supervisor.startup_timeout_ms = 200;
        let (sup, launcher) = supervisor(config, "exec sleep 30");

        let err = sup.try_start().await.unwrap_err();
        assert!(matches!(err, StartError::Spawn(SpawnError::StartupTimeout { .. })));

        let stats = sup.stats();
        assert_eq!(stats.phase, Phase::Failed);
        assert_eq!(stats.restart_attempts, 0);
        assert!(!launcher.any_alive());

        // 启动失败不消耗重启次数，也不排期重启
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(launcher.spawned(), 1);
        assert!(!sup.stats().pending_restart);
    }

    #[tokio::test]
    async fn exit_during_startup_fails_start() {
        let (sup, _launcher) = supervisor(test_config(5, 60_000), "exit 2");

        let err = sup.try_start().await.unwrap_err();
        match err {
            StartError::Spawn(SpawnError::ExitedDuringStartup { outcome }) => {
                assert_eq!(outcome.code, Some(2));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(sup.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn unexpected_exit_schedules_restart() {
        let (sup, launcher) = supervisor(test_config(5, 0), CRASHES_SOON);

        assert!(sup.start().await);
        wait_until("automatic restart", || launcher.spawned() >= 2).await;
        assert!(sup.stats().restart_attempts >= 1);

        assert!(sup.stop().await);
        let spawned = launcher.spawned();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(launcher.spawned(), spawned);
        assert_eq!(sup.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn restarts_stop_at_max_attempts() {
        let (sup, launcher) = supervisor(test_config(2, 50), CRASHES_SOON);

        assert!(sup.start().await);
        wait_until("restart budget exhausted", || {
            let stats = sup.stats();
            launcher.spawned() == 3 && stats.phase == Phase::Failed && !stats.pending_restart
        })
        .await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        let stats = sup.stats();
        assert_eq!(launcher.spawned(), 3);
        assert_eq!(stats.restart_attempts, 2);
        assert_eq!(stats.phase, Phase::Failed);
        assert!(!stats.streaming);
    }

    #[tokio::test]
    async fn crash_inside_cooldown_is_not_counted() {
        let (sup, launcher) = supervisor(test_config(5, 60_000), CRASHES_SOON);

        assert!(sup.start().await);
        wait_until("second crash denied", || {
            let stats = sup.stats();
            launcher.spawned() == 2 && stats.phase == Phase::Failed && !stats.pending_restart
        })
        .await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(launcher.spawned(), 2);
        assert_eq!(sup.stats().restart_attempts, 1);

        // 外部 start 清零尝试次数
        assert!(sup.start().await);
        assert_eq!(sup.stats().restart_attempts, 0);
        sup.stop().await;
    }

    #[tokio::test]
    async fn restart_never_overlaps_processes() {
        let (sup, launcher) = supervisor(test_config(5, 60_000), LONG_RUNNING);

        assert!(sup.start().await);
        assert!(sup.restart().await);

        assert_eq!(launcher.spawned(), 2);
        assert!(!launcher.overlap.load(Ordering::SeqCst));
        assert_eq!(sup.phase(), Phase::Running);

        sup.stop().await;
    }

    #[tokio::test]
    async fn restart_from_idle_starts() {
        let (sup, launcher) = supervisor(test_config(5, 60_000), LONG_RUNNING);

        assert!(sup.restart().await);
        assert!(sup.stats().streaming);
        assert_eq!(launcher.spawned(), 1);

        sup.stop().await;
    }
}
