//! 自动重启决策
//!
//! 所有自动重启共用一个冷却窗口 (不是逐次递增的退避)。
//! 冷却期内的拒绝不增加尝试次数，只有真正执行的重启才计数；
//! 被拒绝的重启不会另行排队，等下一次意外退出时重新判断。

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartLimits {
    pub max_attempts: u32,
    pub cooldown: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// 达到上限，直到外部 start/restart 才会重置
    MaxAttemptsReached,
    /// 冷却期内，暂时拒绝
    CooldownActive { remaining: Duration },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::MaxAttemptsReached => write!(f, "max attempts reached"),
            DenyReason::CooldownActive { remaining } => {
                write!(f, "cooldown active ({:?} remaining)", remaining)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// 允许重启，携带新的尝试计数
    Allow { next_attempt: u32 },
    Deny(DenyReason),
}

/// 判断此刻是否允许自动重启
///
/// 规则按顺序：
/// 1. `attempts >= max_attempts` → 拒绝 (上限)
/// 2. 距上次自动重启不足 `cooldown` → 拒绝 (冷却)
/// 3. 否则允许，`attempts + 1`
pub fn may_restart(
    now: Instant,
    last_restart_at: Option<Instant>,
    attempts: u32,
    limits: RestartLimits,
) -> RestartDecision {
    if attempts >= limits.max_attempts {
        return RestartDecision::Deny(DenyReason::MaxAttemptsReached);
    }

    if let Some(last) = last_restart_at {
        let elapsed = now.saturating_duration_since(last);
        if elapsed < limits.cooldown {
            return RestartDecision::Deny(DenyReason::CooldownActive {
                remaining: limits.cooldown - elapsed,
            });
        }
    }

    RestartDecision::Allow {
        next_attempt: attempts + 1,
    }
}
