//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(call, ctx) 依次做：查找工具 → 按 schema 校验参数 →
//! 在超时与取消令牌下调用 Tool::execute。任何结局（未知工具、参数错误、超时、取消、panic）
//! 都转为一个与请求同 call_id 的 ToolCallResult；每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::Value;

use crate::memory::{ToolCallRequest, ToolCallResult};
use crate::tools::schema::validate_arguments;
use crate::tools::{ExecutionContext, Tool, ToolError, ToolRegistry};

/// 审计日志中参数预览的最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

/// 工具执行器：对每次调用施加超时，并把所有结局映射为 ToolCallResult
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    /// 测试中使用毫秒级超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 执行一次工具调用；永远返回恰好一个结果
    pub async fn execute(&self, call: &ToolCallRequest, ctx: &ExecutionContext) -> ToolCallResult {
        let start = Instant::now();
        let (outcome, mut result) = self.run(call, ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        result.duration_ms = duration_ms;

        let audit = serde_json::json!({
            "event": "tool_audit",
            "session_id": ctx.session_id,
            "run_id": ctx.run_id,
            "call_id": call.id,
            "tool": call.name,
            "ok": result.success,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }

    async fn run(&self, call: &ToolCallRequest, ctx: &ExecutionContext) -> (&'static str, ToolCallResult) {
        let Some(tool) = self.registry.get(&call.name) else {
            let err = ToolError::UnknownTool(call.name.clone());
            return ("unknown_tool", ToolCallResult::failure(&call.id, &call.name, err.to_string()));
        };

        if let Err(e) = validate_arguments(&tool.parameters_schema(), &call.arguments) {
            return (
                "invalid_arguments",
                ToolCallResult::failure(&call.id, &call.name, format!("Invalid arguments for {}: {}", call.name, e)),
            );
        }

        let args = Value::Object(call.arguments.clone());
        let guarded = AssertUnwindSafe(tool.execute(args, ctx)).catch_unwind();
        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => None,
            timed = tokio::time::timeout(self.timeout, guarded) => Some(timed),
        };

        match outcome {
            None => (
                "cancelled",
                ToolCallResult::failure(&call.id, &call.name, "Tool execution cancelled"),
            ),
            Some(Err(_)) => (
                "timeout",
                ToolCallResult::failure(
                    &call.id,
                    &call.name,
                    format!("Tool '{}' timed out after {}s", call.name, self.timeout.as_secs_f32()),
                ),
            ),
            Some(Ok(Err(panic))) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(tool = %call.name, call_id = %call.id, panic = %detail, "tool panicked");
                (
                    "panic",
                    ToolCallResult::failure(&call.id, &call.name, format!("Tool '{}' panicked: {}", call.name, detail)),
                )
            }
            Some(Ok(Ok(Err(message)))) => ("error", ToolCallResult::failure(&call.id, &call.name, message)),
            Some(Ok(Ok(Ok(output)))) => {
                let mut result = if output.success {
                    ToolCallResult::success(&call.id, &call.name, output.output)
                } else {
                    ToolCallResult::failure(&call.id, &call.name, output.output)
                };
                result.metadata = output.metadata;
                (if result.success { "ok" } else { "failed" }, result)
            }
        }
    }
}

fn args_preview(args: &serde_json::Map<String, Value>) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}
