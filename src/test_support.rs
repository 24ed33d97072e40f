//! 测试用的进程启动器与配置

use crate::config::{AppConfig, SupervisorConfig};
use crate::error::SpawnError;
use crate::launch::LaunchSpec;
use crate::process::{Launcher, ProcessHandle};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// 忽略 FFmpeg 参数，改为执行 `sh -c <script>`；记录创建次数和进程是否重叠
pub struct ScriptLauncher {
    script: String,
    spawned: AtomicUsize,
    handles: Mutex<Vec<ProcessHandle>>,
    pub overlap: AtomicBool,
}

impl ScriptLauncher {
    pub fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
            spawned: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
            overlap: AtomicBool::new(false),
        }
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn any_alive(&self) -> bool {
        self.handles.lock().unwrap().iter().any(ProcessHandle::is_alive)
    }
}

impl Launcher for ScriptLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, SpawnError> {
        let mut handles = self.handles.lock().unwrap();
        if handles.iter().any(ProcessHandle::is_alive) {
            self.overlap.store(true, Ordering::SeqCst);
        }

        let script_spec = LaunchSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), self.script.clone()],
            env: spec.env.clone(),
            redacted_target: spec.redacted_target.clone(),
        };
        let handle = ProcessHandle::spawn(&script_spec)?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        handles.push(handle.clone());
        Ok(handle)
    }
}

/// 毫秒级时序的配置，推流目标有效
pub fn test_config(max_restart_attempts: u32, restart_cooldown_ms: u64) -> AppConfig {
    let mut config = AppConfig::default();
    config.destination.key = "test-key".to_string();
    config.supervisor = SupervisorConfig {
        max_restart_attempts,
        restart_cooldown_ms,
        startup_timeout_ms: 2_000,
        settle_delay_ms: 50,
        restart_delay_ms: 50,
        termination_grace_ms: 500,
    };
    config
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// 带超时的等待，回归时测试失败而不是挂起
pub async fn within<F: Future>(secs: u64, fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(secs), fut)
        .await
        .expect("timed out waiting on child process")
}
