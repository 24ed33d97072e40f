use crate::error::StartError;
use crate::state::{Phase, SharedState};
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::future::Future;
use tokio::task::JoinError;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

type ActionReply = (StatusCode, Json<ActionResponse>);

fn reply(success: bool, message: &str) -> ActionReply {
    (
        StatusCode::OK,
        Json(ActionResponse {
            success,
            message: message.to_string(),
        }),
    )
}

fn internal_error(action: &str, err: JoinError) -> ActionReply {
    error!("Error {} stream: {}", action, err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ActionResponse {
            success: false,
            message: "Internal server error".to_string(),
        }),
    )
}

/// 在独立任务中执行守护操作：客户端断开不会中断状态迁移，
/// 任务 panic 则映射为 500
async fn detached<F>(op: F) -> Result<F::Output, JoinError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(op).await
}

/// 手动启动推流 API
pub async fn handle_start(State(state): State<SharedState>) -> ActionReply {
    let supervisor = state.supervisor.clone();
    match detached(async move { supervisor.try_start().await }).await {
        Ok(Ok(())) => reply(true, "Stream started"),
        Ok(Err(StartError::AlreadyRunning)) => reply(false, "Stream already running"),
        Ok(Err(e)) => {
            error!(reason = e.as_label(), "Failed to start stream: {}", e);
            reply(false, "Failed to start stream")
        }
        Err(e) => internal_error("starting", e),
    }
}

/// 手动停止推流 API
pub async fn handle_stop(State(state): State<SharedState>) -> ActionReply {
    if state.supervisor.phase() == Phase::Idle {
        return reply(false, "No stream running");
    }

    let supervisor = state.supervisor.clone();
    match detached(async move { supervisor.stop().await }).await {
        Ok(true) => reply(true, "Stream stopped"),
        Ok(false) => reply(false, "Failed to stop stream"),
        Err(e) => internal_error("stopping", e),
    }
}

/// 重启推流 API
pub async fn handle_restart(State(state): State<SharedState>) -> ActionReply {
    let supervisor = state.supervisor.clone();
    match detached(async move { supervisor.restart().await }).await {
        Ok(true) => reply(true, "Stream restarted"),
        Ok(false) => reply(false, "Failed to restart stream"),
        Err(e) => internal_error("restarting", e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::state::AppState;
    use crate::supervisor::StreamSupervisor;
    use crate::test_support::{test_config, ScriptLauncher};
    use std::sync::Arc;

    fn app_state(key: &str) -> SharedState {
        let mut config = test_config(5, 60_000);
        config.destination.key = key.to_string();
        let launcher = Arc::new(ScriptLauncher::new("echo up >&2; exec sleep 30"));
        let supervisor = StreamSupervisor::new(config.clone(), launcher);
        Arc::new(AppState::new(config, supervisor))
    }

    #[tokio::test]
    async fn stop_without_stream_is_declined() {
        let (status, Json(body)) = handle_stop(State(app_state("key"))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.success);
        assert_eq!(body.message, "No stream running");
    }

    #[tokio::test]
    async fn start_without_key_is_declined() {
        let (status, Json(body)) = handle_start(State(app_state(""))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.success);
        assert_eq!(body.message, "Failed to start stream");
    }

    #[tokio::test]
    async fn start_stop_cycle() {
        let state = app_state("key");

        let (_, Json(body)) = handle_start(State(state.clone())).await;
        assert!(body.success);
        assert_eq!(body.message, "Stream started");

        let (_, Json(body)) = handle_start(State(state.clone())).await;
        assert!(!body.success);
        assert_eq!(body.message, "Stream already running");

        let (_, Json(body)) = handle_restart(State(state.clone())).await;
        assert!(body.success);

        let (_, Json(body)) = handle_stop(State(state.clone())).await;
        assert!(body.success);
        assert_eq!(body.message, "Stream stopped");
        assert_eq!(state.supervisor.phase(), Phase::Idle);
    }
}
