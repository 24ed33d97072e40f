//! 推流守护相关的错误类型
//!
//! - [`ConfigurationError`]：推流目标配置缺失，不重试
//! - [`SpawnError`]：编码进程无法启动或启动期内没有存活信号，不消耗重启次数
//! - [`StartError`]：`start()` 被拒绝或失败的原因汇总

use std::time::Duration;
use thiserror::Error;

use crate::process::ExitOutcome;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("destination url is empty")]
    EmptyUrl,
    #[error("destination key is empty")]
    EmptyKey,
}

#[derive(Error, Debug)]
pub enum SpawnError {
    /// 找不到可执行文件
    #[error("encoder executable not found: {program}")]
    NotFound { program: String },

    /// 操作系统拒绝创建进程
    #[error("failed to spawn {program}: {source}")]
    Os {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// 启动超时内没有任何诊断输出
    #[error("no diagnostic output within {timeout:?}")]
    StartupTimeout { timeout: Duration },

    /// 启动阶段进程已经退出
    #[error("encoder exited during startup ({outcome})")]
    ExitedDuringStartup { outcome: ExitOutcome },
}

impl SpawnError {
    pub fn from_io(program: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            SpawnError::NotFound {
                program: program.to_string(),
            }
        } else {
            SpawnError::Os {
                program: program.to_string(),
                source: err,
            }
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            SpawnError::NotFound { .. } => "spawn_not_found",
            SpawnError::Os { .. } => "spawn_os",
            SpawnError::StartupTimeout { .. } => "spawn_startup_timeout",
            SpawnError::ExitedDuringStartup { .. } => "spawn_exited_during_startup",
        }
    }
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("stream already running")]
    AlreadyRunning,
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("spawn error: {0}")]
    Spawn(#[from] SpawnError),
}

impl StartError {
    pub fn as_label(&self) -> &'static str {
        match self {
            StartError::AlreadyRunning => "already_running",
            StartError::Configuration(_) => "configuration",
            StartError::Spawn(e) => e.as_label(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err = SpawnError::from_io(
            "ffmpeg",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(matches!(err, SpawnError::NotFound { ref program } if program == "ffmpeg"));
        assert_eq!(err.as_label(), "spawn_not_found");

        let err = SpawnError::from_io(
            "ffmpeg",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        assert_eq!(err.as_label(), "spawn_os");
    }

    #[test]
    fn start_error_wraps_sources() {
        let err: StartError = ConfigurationError::EmptyKey.into();
        assert_eq!(err.to_string(), "configuration error: destination key is empty");
        assert_eq!(err.as_label(), "configuration");
    }
}
