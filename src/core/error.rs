//! 引擎错误类型与运行失败原因
//!
//! EngineError 是控制面（start_run / confirm_tool 等）同步返回的错误；
//! 运行内部的终止原因不会作为错误抛出，而是记录为 RunFailure 写进运行快照。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 控制面错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Session {0} already has an active run")]
    RunInProgress(String),

    #[error("Session {0} has no active run")]
    NoActiveRun(String),

    #[error("Run {got} is not the active run of this session (active: {expected})")]
    RunMismatch { expected: String, got: String },

    #[error("Run {0} has no pending tool confirmation")]
    NoPendingConfirmation(String),

    #[error("Run {0} has already finished")]
    RunFinished(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

/// 超出的预算类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    Iterations,
    Tokens,
    Time,
}

/// 机器可读的失败原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    BudgetExceeded { budget: BudgetKind },
    Cancelled,
    ProviderError,
    NoProviderAvailable,
    TooManyToolFailures,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::BudgetExceeded { .. } => "budget_exceeded",
            FailureReason::Cancelled => "cancelled",
            FailureReason::ProviderError => "provider_error",
            FailureReason::NoProviderAvailable => "no_provider_available",
            FailureReason::TooManyToolFailures => "too_many_tool_failures",
            FailureReason::Internal => "internal",
        }
    }
}

/// 运行终止于 error 状态时的原因 + 可读信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl RunFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn budget(budget: BudgetKind, message: impl Into<String>) -> Self {
        Self::new(FailureReason::BudgetExceeded { budget }, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FailureReason::Cancelled, "Run cancelled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_serializes_snake_case() {
        let failure = RunFailure::budget(BudgetKind::Iterations, "max iterations (3) reached");
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["reason"]["kind"], "budget_exceeded");
        assert_eq!(json["reason"]["budget"], "iterations");
        assert_eq!(failure.reason.as_str(), "budget_exceeded");
        assert_eq!(FailureReason::NoProviderAvailable.as_str(), "no_provider_available");
    }
}
