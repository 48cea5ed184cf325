//! 工具执行流水线
//!
//! 对一批工具调用（同一条后端响应）依次做：
//! 1. 策略判定：禁用 / 未开放 → 合成失败结果；需确认 → 进入 awaiting_confirmation，按请求顺序逐个等待答复
//! 2. 缓存查找：可缓存工具命中即短路；同一批中的重复调用只执行一次
//! 3. 并发执行：JoinSet + 共享信号量限制并发，等待整批完成
//! 4. 结果按请求顺序重排；成功的写/删类工具按路径失效缓存
//!
//! 每个请求恰好对应一个结果（含超时、拒绝、取消产生的合成结果）。

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::core::{RunControl, RunStatus, TaskScheduler};
use crate::memory::{ToolCallRequest, ToolCallResult};
use crate::run::events::{RunEvent, RunReporter};
use crate::tools::{ExecutionContext, Fingerprint, PolicyDecision, ToolExecutor, ToolPolicy, ToolResultCache};

/// 工具流水线（运行开始时由引擎设置快照构建）
#[derive(Clone)]
pub struct ToolPipeline {
    pub executor: ToolExecutor,
    pub cache: Arc<ToolResultCache>,
    pub policy: ToolPolicy,
    pub scheduler: TaskScheduler,
    pub workspace_root: PathBuf,
}

fn cancelled_result(call: &ToolCallRequest) -> ToolCallResult {
    ToolCallResult::failure(&call.id, &call.name, "Tool execution cancelled")
}

impl ToolPipeline {
    /// 处理一批调用，返回与 calls 一一对应、顺序相同的结果
    pub async fn process(
        &self,
        calls: &[ToolCallRequest],
        active_tools: &HashSet<String>,
        control: &RunControl,
        reporter: &RunReporter,
    ) -> Vec<ToolCallResult> {
        let mut slots: Vec<Option<ToolCallResult>> = vec![None; calls.len()];
        let mut approved: Vec<usize> = Vec::with_capacity(calls.len());

        for (i, call) in calls.iter().enumerate() {
            reporter.emit(RunEvent::ToolQueued {
                run_id: reporter.run_id().to_string(),
                call_id: call.id.clone(),
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
            });
            if control.is_cancelled() {
                slots[i] = Some(cancelled_result(call));
                continue;
            }
            match self.gate(call, active_tools) {
                PolicyDecision::Allow => approved.push(i),
                PolicyDecision::Reject { reason } => {
                    tracing::warn!(run_id = %reporter.run_id(), tool = %call.name, %reason, "tool call rejected by policy");
                    reporter.emit(RunEvent::ComplianceViolation {
                        run_id: reporter.run_id().to_string(),
                        call_id: call.id.clone(),
                        tool: call.name.clone(),
                        reason: reason.clone(),
                    });
                    slots[i] = Some(ToolCallResult::failure(&call.id, &call.name, reason));
                }
                PolicyDecision::Confirm { reason } => match self.confirm(call, &reason, control, reporter).await {
                    Ok(()) => approved.push(i),
                    Err(result) => slots[i] = Some(result),
                },
            }
        }

        self.dispatch(calls, &approved, &mut slots, control, reporter).await;

        calls
            .iter()
            .zip(slots)
            .map(|(call, slot)| {
                slot.unwrap_or_else(|| ToolCallResult::failure(&call.id, &call.name, "Tool task aborted"))
            })
            .collect()
    }

    fn gate(&self, call: &ToolCallRequest, active_tools: &HashSet<String>) -> PolicyDecision {
        let tool = self.executor.get_tool(&call.name);
        if tool.is_some() && !active_tools.contains(&call.name) && !self.policy.is_disabled(&call.name) {
            return PolicyDecision::Reject {
                reason: format!("Tool '{}' is not enabled for this run", call.name),
            };
        }
        self.policy.evaluate(&call.name, tool.as_deref())
    }

    /// 等待外部确认；拒绝或取消时返回合成失败结果
    async fn confirm(
        &self,
        call: &ToolCallRequest,
        reason: &str,
        control: &RunControl,
        reporter: &RunReporter,
    ) -> Result<(), ToolCallResult> {
        let rx = control.request_confirmation(&call.id, &call.name, reason);
        reporter.set_status(RunStatus::AwaitingConfirmation);
        reporter.emit(RunEvent::ConfirmationRequired {
            run_id: reporter.run_id().to_string(),
            call_id: call.id.clone(),
            tool: call.name.clone(),
            reason: reason.to_string(),
            arguments: call.arguments.clone(),
        });
        tracing::info!(run_id = %reporter.run_id(), tool = %call.name, call_id = %call.id, "awaiting tool confirmation");

        let token = control.cancel_token();
        let response = tokio::select! {
            _ = token.cancelled() => None,
            answer = rx => answer.ok(),
        };
        if control.is_cancelled() {
            return Err(cancelled_result(call));
        }
        reporter.set_status(RunStatus::Running);

        match response {
            Some(answer) if answer.approved => Ok(()),
            Some(answer) => {
                let mut message = format!("Tool '{}' was denied by user", call.name);
                if let Some(feedback) = answer.feedback.filter(|f| !f.trim().is_empty()) {
                    message.push_str(": ");
                    message.push_str(&feedback);
                }
                Err(ToolCallResult::failure(&call.id, &call.name, message))
            }
            None => Err(ToolCallResult::failure(&call.id, &call.name, "Tool confirmation was dropped")),
        }
    }

    async fn dispatch(
        &self,
        calls: &[ToolCallRequest],
        approved: &[usize],
        slots: &mut [Option<ToolCallResult>],
        control: &RunControl,
        reporter: &RunReporter,
    ) {
        let mut first_of: HashMap<Fingerprint, usize> = HashMap::new();
        let mut duplicates: Vec<(usize, usize)> = Vec::new();
        let mut set: JoinSet<(usize, ToolCallResult)> = JoinSet::new();

        for &i in approved {
            let call = &calls[i];
            let cacheable = self.cache.is_enabled()
                && self
                    .executor
                    .get_tool(&call.name)
                    .is_some_and(|t| t.is_cacheable());
            if cacheable {
                if let Some(mut hit) = self.cache.get(&call.name, &call.arguments) {
                    hit.call_id = call.id.clone();
                    tracing::debug!(tool = %call.name, call_id = %call.id, "tool cache hit");
                    reporter.emit(RunEvent::ToolResult {
                        run_id: reporter.run_id().to_string(),
                        result: hit.clone(),
                    });
                    slots[i] = Some(hit);
                    continue;
                }
                let fp = Fingerprint::new(&call.name, &call.arguments);
                if let Some(&first) = first_of.get(&fp) {
                    duplicates.push((i, first));
                    continue;
                }
                first_of.insert(fp, i);
            }

            let ctx = ExecutionContext {
                session_id: reporter.session_id().to_string(),
                run_id: reporter.run_id().to_string(),
                call_id: call.id.clone(),
                workspace_root: self.workspace_root.clone(),
                cancel: control.child_token(),
            };
            let executor = self.executor.clone();
            let scheduler = self.scheduler.clone();
            let reporter = reporter.clone();
            let call = call.clone();
            set.spawn(async move {
                let permit = tokio::select! {
                    _ = ctx.cancel.cancelled() => None,
                    permit = scheduler.acquire_tool() => Some(permit),
                };
                let _permit = match permit {
                    Some(Ok(p)) => p,
                    Some(Err(_)) => {
                        return (i, ToolCallResult::failure(&call.id, &call.name, "Tool pool is closed"));
                    }
                    None => return (i, cancelled_result(&call)),
                };
                reporter.emit(RunEvent::ToolStarted {
                    run_id: reporter.run_id().to_string(),
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                });
                (i, executor.execute(&call, &ctx).await)
            });
        }

        // 工具任务自身响应取消令牌，这里等待整批结束
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, result)) => {
                    self.after_execution(&calls[i], &result);
                    reporter.emit(RunEvent::ToolResult {
                        run_id: reporter.run_id().to_string(),
                        result: result.clone(),
                    });
                    slots[i] = Some(result);
                }
                Err(e) => tracing::error!(run_id = %reporter.run_id(), error = %e, "tool task failed to join"),
            }
        }

        for (i, first) in duplicates {
            let Some(source) = slots[first].clone() else {
                continue;
            };
            let mut result = source;
            result.call_id = calls[i].id.clone();
            result.cached = true;
            reporter.emit(RunEvent::ToolResult {
                run_id: reporter.run_id().to_string(),
                result: result.clone(),
            });
            slots[i] = Some(result);
        }
    }

    /// 成功结果写入缓存；写/删类工具按路径失效缓存
    fn after_execution(&self, call: &ToolCallRequest, result: &ToolCallResult) {
        if !result.success {
            return;
        }
        let Some(tool) = self.executor.get_tool(&call.name) else {
            return;
        };
        let paths = tool.affected_paths(&call.arguments);
        if tool.category().is_mutating() {
            for path in &paths {
                let removed = self.cache.invalidate_path_prefix(path);
                if removed > 0 {
                    tracing::debug!(tool = %call.name, %path, removed, "cache invalidated by write");
                }
            }
        } else if self.cache.is_enabled() && tool.is_cacheable() {
            let ttl = self.cache.ttl_for(&call.name, tool.cache_ttl());
            self.cache.put(&call.name, &call.arguments, result, ttl, paths);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolsSection;
    use crate::core::{RunConfig, RunSnapshot};
    use crate::tools::{EchoTool, Tool, ToolCategory, ToolOutput, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};

    struct CountingRead(Arc<AtomicUsize>);

    #[async_trait]
    impl Tool for CountingRead {
        fn name(&self) -> &str {
            "read_file"
        }
        fn description(&self) -> &str {
            "read"
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::Read
        }
        async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> Result<ToolOutput, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::ok(format!("contents of {}", args["path"].as_str().unwrap_or(""))))
        }
    }

    struct Writer;

    #[async_trait]
    impl Tool for Writer {
        fn name(&self) -> &str {
            "write_file"
        }
        fn description(&self) -> &str {
            "write"
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::Write
        }
        async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> Result<ToolOutput, String> {
            Ok(ToolOutput::ok("written"))
        }
    }

    struct Fixture {
        pipeline: ToolPipeline,
        executions: Arc<AtomicUsize>,
        control: RunControl,
        reporter: RunReporter,
        events: mpsc::UnboundedReceiver<RunEvent>,
        active: HashSet<String>,
    }

    fn fixture(tools_section: ToolsSection) -> Fixture {
        let executions = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(CountingRead(Arc::clone(&executions)));
        registry.register(Writer);
        registry.register(EchoTool);
        let active: HashSet<String> = registry.tool_names().into_iter().collect();
        let pipeline = ToolPipeline {
            executor: ToolExecutor::new(Arc::new(registry), 5),
            cache: Arc::new(ToolResultCache::new(64, 4, Duration::from_secs(60))),
            policy: ToolPolicy::from_section(&tools_section),
            scheduler: TaskScheduler::new(2),
            workspace_root: std::env::temp_dir(),
        };
        let (snap_tx, _) = watch::channel(RunSnapshot::new("r1", "s1", RunConfig::default()));
        let (tx, events) = mpsc::unbounded_channel();
        let reporter = RunReporter::new(Arc::new(snap_tx), Some(tx));
        reporter.set_status(RunStatus::Running);
        Fixture {
            pipeline,
            executions,
            control: RunControl::new("r1", "s1"),
            reporter,
            events,
            active,
        }
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCallRequest {
        let map: Map<String, Value> = args.as_object().cloned().unwrap_or_default();
        ToolCallRequest::new(id, name, map)
    }

    #[tokio::test]
    async fn test_cache_short_circuits_second_read() {
        let f = fixture(ToolsSection::default());
        let first = [call("c1", "read_file", json!({"path": "parser.go"}))];
        let r1 = f.pipeline.process(&first, &f.active, &f.control, &f.reporter).await;
        assert!(!r1[0].cached);

        let second = [call("c2", "read_file", json!({"path": "./parser.go"}))];
        // 参数字面不同（./ 前缀）→ 不同指纹，仍会执行
        f.pipeline.process(&second, &f.active, &f.control, &f.reporter).await;
        let third = [call("c3", "read_file", json!({"path": "parser.go"}))];
        let r3 = f.pipeline.process(&third, &f.active, &f.control, &f.reporter).await;
        assert!(r3[0].cached);
        assert_eq!(r3[0].call_id, "c3");
        assert_eq!(f.executions.load(Ordering::SeqCst), 2);
        assert_eq!(f.pipeline.cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_duplicate_calls_in_one_batch_execute_once() {
        let f = fixture(ToolsSection::default());
        let batch = [
            call("c1", "read_file", json!({"path": "a.go"})),
            call("c2", "read_file", json!({"path": "a.go"})),
        ];
        let results = f.pipeline.process(&batch, &f.active, &f.control, &f.reporter).await;
        assert_eq!(f.executions.load(Ordering::SeqCst), 1);
        assert_eq!(results[1].call_id, "c2");
        assert!(results[1].cached);
        assert_eq!(results[0].output, results[1].output);
    }

    #[tokio::test]
    async fn test_write_invalidates_cached_read() {
        let f = fixture(ToolsSection::default());
        let read = [call("c1", "read_file", json!({"path": "src/parser.go"}))];
        f.pipeline.process(&read, &f.active, &f.control, &f.reporter).await;
        assert_eq!(f.pipeline.cache.len(), 1);
        let write = [call("c2", "write_file", json!({"path": "src/parser.go", "content": "x"}))];
        f.pipeline.process(&write, &f.active, &f.control, &f.reporter).await;
        assert_eq!(f.pipeline.cache.len(), 0);
    }

    #[tokio::test]
    async fn test_disabled_and_inactive_tools_are_rejected() {
        let mut f = fixture(ToolsSection {
            disabled: vec!["echo".into()],
            ..ToolsSection::default()
        });
        f.active.remove("read_file");
        let batch = [
            call("c1", "echo", json!({"text": "hi"})),
            call("c2", "read_file", json!({"path": "a"})),
        ];
        let results = f.pipeline.process(&batch, &f.active, &f.control, &f.reporter).await;
        assert!(results[0].output.contains("disabled by policy"));
        assert!(results[1].output.contains("not enabled for this run"));
        assert_eq!(f.executions.load(Ordering::SeqCst), 0);

        let mut violations = 0;
        while let Ok(ev) = f.events.try_recv() {
            if matches!(ev, RunEvent::ComplianceViolation { .. }) {
                violations += 1;
            }
        }
        assert_eq!(violations, 2);
    }

    #[tokio::test]
    async fn test_confirmation_denied_with_feedback() {
        let f = fixture(ToolsSection {
            always_confirm: vec!["write_file".into()],
            ..ToolsSection::default()
        });
        let control = Arc::new(f.control);
        let answer = {
            let control = Arc::clone(&control);
            tokio::spawn(async move {
                while control.pending_confirmation().is_none() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                control.resolve_confirmation(false, Some("use a scratch file".into())).unwrap()
            })
        };
        let batch = [call("c1", "write_file", json!({"path": "a", "content": "x"}))];
        let results = f.pipeline.process(&batch, &f.active, &control, &f.reporter).await;
        assert_eq!(answer.await.unwrap(), "c1");
        assert!(!results[0].success);
        assert_eq!(results[0].output, "Tool 'write_file' was denied by user: use a scratch file");
        assert_eq!(f.reporter.snapshot().status, RunStatus::Running);
    }
}
