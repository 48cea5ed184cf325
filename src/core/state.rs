//! 运行状态：RunStatus 状态机、运行配置快照与对外可见的 RunSnapshot
//!
//! idle → running → {awaiting_confirmation, paused, error, idle(completed)}；尚未开始即被取消时 idle → error；
//! awaiting_confirmation 与 paused 都回到 running；error 对该运行是终态（会话仍可发起新运行）。

use std::time::Duration;

use serde::Serialize;

use crate::config::AppConfig;
use crate::core::error::RunFailure;
use crate::llm::{RetryConfig, RoutingDecision};
use crate::memory::TokenUsage;

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    AwaitingConfirmation,
    Paused,
    Error,
}

impl RunStatus {
    /// 合法迁移；自迁移视为合法（幂等）
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Error)
                | (Running, AwaitingConfirmation)
                | (Running, Paused)
                | (Running, Error)
                | (Running, Idle)
                | (AwaitingConfirmation, Running)
                | (AwaitingConfirmation, Error)
                | (Paused, Running)
                | (Paused, Error)
        )
    }
}

/// 运行开始时固定下来的配置快照
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    /// 显式指定 provider/model 时跳过任务路由
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_iterations: usize,
    pub max_run_time: Duration,
    pub max_total_tokens: Option<u64>,
    pub retry: RetryConfig,
    pub system_prompt: Option<String>,
    /// 限制本次运行可用的工具；None 表示全部（减去禁用）
    pub allowed_tools: Option<Vec<String>>,
    pub stream: bool,
}

impl RunConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        let engine = &config.engine;
        Self {
            provider: None,
            model: None,
            temperature: Some(engine.temperature),
            max_tokens: engine.max_tokens,
            max_iterations: engine.max_iterations.max(1),
            max_run_time: Duration::from_secs(engine.max_run_secs.max(1)),
            max_total_tokens: engine.max_total_tokens,
            retry: RetryConfig::from(&engine.retry),
            system_prompt: engine.system_prompt.clone(),
            allowed_tools: None,
            stream: true,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// 固定 provider/model（不经过路由）
    pub fn with_model(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = Some(tools);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 运行快照（run_status 查询与 run_status 事件使用）
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub session_id: String,
    pub status: RunStatus,
    pub iteration: usize,
    pub config: RunConfig,
    pub usage: TokenUsage,
    /// 后端给出最终回答、以 idle 结束
    pub completed: bool,
    pub failure: Option<RunFailure>,
    /// 当前生效的路由决策（重路由后为最新一条）
    pub routing: Option<RoutingDecision>,
    /// 本次运行追加到会话历史的消息数（不含用户消息）
    pub appended_messages: usize,
    /// 已请求暂停；运行在下一轮迭代开始前才进入 paused
    pub pause_requested: bool,
}

impl RunSnapshot {
    pub fn new(run_id: impl Into<String>, session_id: impl Into<String>, config: RunConfig) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            status: RunStatus::Idle,
            iteration: 0,
            config,
            usage: TokenUsage::default(),
            completed: false,
            failure: None,
            routing: None,
            appended_messages: 0,
            pause_requested: false,
        }
    }

    /// 运行是否已经结束（完成或出错）
    pub fn is_finished(&self) -> bool {
        self.completed || self.status == RunStatus::Error
    }
}
