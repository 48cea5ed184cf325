//! 运行事件：按顺序推送给单个消费者（UI / IPC 层）的类型化事件流
//!
//! 每个运行一条 mpsc 通道；RunReporter 同时持有运行快照（watch 通道），
//! 状态迁移先写快照再发 run_status 事件，两者顺序一致。

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

use crate::core::{RecoverySuggestion, RunFailure, RunSnapshot, RunStatus};
use crate::llm::{RoutingDecision, StreamDelta};
use crate::memory::{ContextMetrics, ContextPressure, TokenUsage, ToolCallResult};

/// 运行过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// 后端输出增量（正文 / 思考 / 工具调用片段）
    StreamDelta { run_id: String, delta: StreamDelta },
    /// 本次后端尝试在流中途失败：此前推送的增量作废，后续增量属于重试或切换后的新尝试
    StreamReset {
        run_id: String,
        provider: String,
        error: String,
    },
    /// 状态迁移
    RunStatus {
        run_id: String,
        session_id: String,
        status: RunStatus,
        iteration: usize,
        completed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure: Option<RunFailure>,
    },
    RoutingDecision { run_id: String, decision: RoutingDecision },
    ToolQueued {
        run_id: String,
        call_id: String,
        tool: String,
        arguments: Map<String, Value>,
    },
    ToolStarted { run_id: String, call_id: String, tool: String },
    ToolResult { run_id: String, result: ToolCallResult },
    /// 需要外部确认（运行进入 awaiting_confirmation）
    ConfirmationRequired {
        run_id: String,
        call_id: String,
        tool: String,
        reason: String,
        arguments: Map<String, Value>,
    },
    /// 策略拒绝（禁用工具、本次运行未开放的工具）
    ComplianceViolation {
        run_id: String,
        call_id: String,
        tool: String,
        reason: String,
    },
    RecoverySuggestion {
        run_id: String,
        call_id: String,
        tool: String,
        suggestion: RecoverySuggestion,
    },
    ContextMetrics {
        run_id: String,
        metrics: ContextMetrics,
        pressure: ContextPressure,
    },
    ContextPruned {
        run_id: String,
        removed: usize,
        removed_tokens: usize,
        summary_inserted: bool,
    },
    /// 本轮用量 + 运行累计
    TokenUsage {
        run_id: String,
        usage: TokenUsage,
        cumulative: TokenUsage,
    },
}

impl RunEvent {
    /// 事件类型名（与序列化后的 type 字段一致）
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::StreamDelta { .. } => "stream_delta",
            RunEvent::StreamReset { .. } => "stream_reset",
            RunEvent::RunStatus { .. } => "run_status",
            RunEvent::RoutingDecision { .. } => "routing_decision",
            RunEvent::ToolQueued { .. } => "tool_queued",
            RunEvent::ToolStarted { .. } => "tool_started",
            RunEvent::ToolResult { .. } => "tool_result",
            RunEvent::ConfirmationRequired { .. } => "confirmation_required",
            RunEvent::ComplianceViolation { .. } => "compliance_violation",
            RunEvent::RecoverySuggestion { .. } => "recovery_suggestion",
            RunEvent::ContextMetrics { .. } => "context_metrics",
            RunEvent::ContextPruned { .. } => "context_pruned",
            RunEvent::TokenUsage { .. } => "token_usage",
        }
    }
}

/// 运行的事件出口 + 快照写入端
#[derive(Clone)]
pub struct RunReporter {
    run_id: String,
    session_id: String,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
    snapshot: Arc<watch::Sender<RunSnapshot>>,
}

impl RunReporter {
    pub fn new(snapshot: Arc<watch::Sender<RunSnapshot>>, events: Option<mpsc::UnboundedSender<RunEvent>>) -> Self {
        let (run_id, session_id) = {
            let current = snapshot.borrow();
            (current.run_id.clone(), current.session_id.clone())
        };
        Self {
            run_id,
            session_id,
            events,
            snapshot,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 发送事件；消费者已关闭时静默丢弃
    pub fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut RunSnapshot)) {
        self.snapshot.send_modify(f);
    }

    /// 状态迁移；非法迁移记录警告并忽略，真正发生变化时推送 run_status
    pub fn set_status(&self, status: RunStatus) {
        self.transition(status, |_| {});
    }

    /// 状态迁移并在同一次快照写入中修改其他字段（迁移非法时两者都不生效）
    pub fn transition(&self, status: RunStatus, f: impl FnOnce(&mut RunSnapshot)) -> bool {
        let mut changed = false;
        self.snapshot.send_if_modified(|s| {
            if s.status == status {
                return false;
            }
            if !s.status.can_transition_to(status) {
                tracing::warn!(run_id = %s.run_id, from = ?s.status, to = ?status, "illegal run status transition ignored");
                return false;
            }
            f(s);
            s.status = status;
            changed = true;
            true
        });
        if changed {
            self.emit(self.status_event());
        }
        changed
    }

    /// 当前快照对应的 run_status 事件
    pub fn status_event(&self) -> RunEvent {
        let s = self.snapshot.borrow();
        RunEvent::RunStatus {
            run_id: s.run_id.clone(),
            session_id: s.session_id.clone(),
            status: s.status,
            iteration: s.iteration,
            completed: s.completed,
            failure: s.failure.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunConfig;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let ev = RunEvent::ToolStarted {
            run_id: "r1".into(),
            call_id: "c1".into(),
            tool: "read_file".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], ev.kind());
        assert_eq!(json["tool"], "read_file");
    }

    #[test]
    fn test_status_events_only_on_legal_change() {
        let (tx, _rx) = watch::channel(RunSnapshot::new("r1", "s1", RunConfig::default()));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let reporter = RunReporter::new(Arc::new(tx), Some(events_tx));

        reporter.set_status(RunStatus::Running);
        reporter.set_status(RunStatus::Running);
        reporter.set_status(RunStatus::Paused);
        reporter.set_status(RunStatus::AwaitingConfirmation); // paused → awaiting 非法

        let mut statuses = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let RunEvent::RunStatus { status, .. } = ev {
                statuses.push(status);
            }
        }
        assert_eq!(statuses, vec![RunStatus::Running, RunStatus::Paused]);
        assert_eq!(reporter.snapshot().status, RunStatus::Paused);
    }

    #[test]
    fn test_illegal_transition_leaves_snapshot_untouched() {
        let (tx, _rx) = watch::channel(RunSnapshot::new("r1", "s1", RunConfig::default()));
        let reporter = RunReporter::new(Arc::new(tx), None);
        reporter.set_status(RunStatus::Running);
        reporter.set_status(RunStatus::Paused);

        assert!(!reporter.transition(RunStatus::Idle, |s| s.completed = true));
        assert!(!reporter.snapshot().completed);
        assert!(reporter.transition(RunStatus::Error, |s| s.iteration = 2));
        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.status, RunStatus::Error);
        assert_eq!(snapshot.iteration, 2);
    }
}
