//! 运行引擎：对外的运行生命周期 API
//!
//! start_run 预备一个运行（返回事件接收端与快照），send_message 在后台任务中驱动主循环；
//! 确认、取消、暂停、恢复通过 SessionSupervisor 找到运行的控制句柄。
//! 运行结束时先合并会话历史、注销运行，再发布终态，所以观察到终态时历史已可读。
//! 设置热更新只影响之后开始的运行：进行中的运行持有旧的依赖快照。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{reload_config, AppConfig};
use crate::core::error::{EngineError, FailureReason, RunFailure};
use crate::core::recovery::{RecoveryEngine, SessionErrors, SessionStats};
use crate::core::session_store::PerSessionStore;
use crate::core::session_supervisor::{PendingToolConfirmation, RunControl, SessionSupervisor};
use crate::core::state::{RunConfig, RunSnapshot, RunStatus};
use crate::core::task_scheduler::TaskScheduler;
use crate::llm::{ProviderRegistry, RoutingSettings, TaskRouter};
use crate::memory::{Attachment, ContextWindowManager, HistoryStore, Message};
use crate::run::{run_loop, RunDeps, RunEvent, RunInput, RunOutcome, RunReporter, RunSession, ToolPipeline};
use crate::tools::{CacheStats, ToolExecutor, ToolPolicy, ToolRegistry, ToolResultCache};

/// 由 AppConfig 派生的引擎设置
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub config: AppConfig,
    pub policy: ToolPolicy,
    pub routing: RoutingSettings,
    pub workspace_root: PathBuf,
}

impl EngineSettings {
    pub fn from_config(config: AppConfig) -> Self {
        let policy = ToolPolicy::from_section(&config.tools);
        let routing = RoutingSettings::from_section(&config.routing);
        let workspace_root = config
            .engine
            .workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"));
        Self {
            config,
            policy,
            routing,
            workspace_root,
        }
    }
}

/// start_run 返回的句柄：事件流 + 快照
pub struct RunHandle {
    pub run_id: String,
    pub session_id: String,
    pub events: mpsc::UnboundedReceiver<RunEvent>,
    snapshot: watch::Receiver<RunSnapshot>,
}

impl RunHandle {
    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot.borrow().clone()
    }

    /// 等待运行结束，返回终态快照
    pub async fn wait(&mut self) -> RunSnapshot {
        loop {
            {
                let current = self.snapshot.borrow_and_update();
                if current.is_finished() {
                    return current.clone();
                }
            }
            if self.snapshot.changed().await.is_err() {
                return self.snapshot.borrow().clone();
            }
        }
    }

    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// 取出当前已到达的全部事件（不等待）
    pub fn drain_events(&mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// 已预备、尚未收到用户消息的运行
struct PreparedRun {
    config: RunConfig,
    events: mpsc::UnboundedSender<RunEvent>,
}

/// 会话最近一次运行
struct RunEntry {
    run_id: String,
    control: Arc<RunControl>,
    snapshot: Arc<watch::Sender<RunSnapshot>>,
    prepared: Option<PreparedRun>,
}

/// 运行引擎
pub struct RunEngine {
    providers: Arc<ProviderRegistry>,
    router: Arc<TaskRouter>,
    tools: Arc<ToolRegistry>,
    history: Arc<dyn HistoryStore>,
    errors: Arc<PerSessionStore<SessionErrors>>,
    supervisor: Arc<SessionSupervisor>,
    deps: RwLock<Arc<RunDeps>>,
    /// 当前缓存清理任务的停止信号
    sweeper: Mutex<CancellationToken>,
    runs: tokio::sync::Mutex<HashMap<String, RunEntry>>,
}

impl RunEngine {
    pub fn new(
        config: AppConfig,
        providers: Arc<ProviderRegistry>,
        tools: ToolRegistry,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let router = Arc::new(TaskRouter::new());
        let tools = Arc::new(tools);
        let errors = Arc::new(PerSessionStore::new());
        let sweeper = CancellationToken::new();
        let deps = build_deps(config, &providers, &router, &tools, &errors, &sweeper);
        tracing::info!(
            tools = tools.len(),
            providers = providers.ids().len(),
            "run engine ready"
        );
        Self {
            providers,
            router,
            tools,
            history,
            errors,
            supervisor: Arc::new(SessionSupervisor::new()),
            deps: RwLock::new(deps),
            sweeper: Mutex::new(sweeper),
            runs: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// 按当前设置生成默认运行配置
    pub async fn default_run_config(&self) -> RunConfig {
        RunConfig::from_config(&self.deps.read().await.settings.config)
    }

    /// 预备运行（idle）；会话已有活跃运行时返回 RunInProgress
    pub async fn start_run(&self, session_id: &str, config: Option<RunConfig>) -> Result<RunHandle, EngineError> {
        let config = match config {
            Some(config) => config,
            None => self.default_run_config().await,
        };
        let run_id = Uuid::new_v4().to_string();
        let control = Arc::new(RunControl::new(&run_id, session_id));
        self.supervisor.register(Arc::clone(&control)).await?;

        let (snapshot_tx, snapshot_rx) = watch::channel(RunSnapshot::new(&run_id, session_id, config.clone()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.runs.lock().await.insert(
            session_id.to_string(),
            RunEntry {
                run_id: run_id.clone(),
                control,
                snapshot: Arc::new(snapshot_tx),
                prepared: Some(PreparedRun {
                    config,
                    events: events_tx,
                }),
            },
        );
        tracing::info!(session_id, run_id = %run_id, "run prepared");

        Ok(RunHandle {
            run_id,
            session_id: session_id.to_string(),
            events: events_rx,
            snapshot: snapshot_rx,
        })
    }

    /// 提交用户消息并在后台开始运行，返回 run_id
    pub async fn send_message(
        &self,
        session_id: &str,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<String, EngineError> {
        let (run_id, control, snapshot, prepared) = {
            let mut runs = self.runs.lock().await;
            let entry = runs
                .get_mut(session_id)
                .ok_or_else(|| EngineError::NoActiveRun(session_id.to_string()))?;
            let Some(prepared) = entry.prepared.take() else {
                let finished = entry.snapshot.borrow().is_finished();
                return Err(if finished {
                    EngineError::RunFinished(entry.run_id.clone())
                } else {
                    EngineError::RunInProgress(session_id.to_string())
                });
            };
            (
                entry.run_id.clone(),
                Arc::clone(&entry.control),
                Arc::clone(&entry.snapshot),
                prepared,
            )
        };

        let user_message = Message::user(content).with_attachments(attachments);
        let history = self.history.load(session_id).await;
        let deps = Arc::clone(&*self.deps.read().await);
        let session = RunSession {
            deps,
            control,
            reporter: RunReporter::new(snapshot, Some(prepared.events)),
            config: prepared.config,
        };
        let store = Arc::clone(&self.history);
        let supervisor = Arc::clone(&self.supervisor);

        tokio::spawn(async move {
            let input = RunInput {
                history,
                user_message: user_message.clone(),
            };
            let outcome = run_loop(&session, input).await;
            finish_run(&session, outcome, user_message, store.as_ref(), &supervisor).await;
        });
        Ok(run_id)
    }

    /// 答复最早的待确认工具调用，返回其 call_id
    pub async fn confirm_tool(
        &self,
        session_id: &str,
        run_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<String, EngineError> {
        let control = self.active_control(session_id, Some(run_id)).await?;
        let call_id = control.resolve_confirmation(approved, feedback)?;
        tracing::info!(session_id, run_id, call_id = %call_id, approved, "tool confirmation resolved");
        Ok(call_id)
    }

    /// 当前等待确认的工具调用
    pub async fn pending_confirmation(&self, session_id: &str) -> Option<PendingToolConfirmation> {
        let control = self.supervisor.get(session_id).await.ok()?;
        control.pending_confirmation()
    }

    /// 取消运行；尚未开始的运行直接以 cancelled 结束
    pub async fn cancel_run(&self, session_id: &str) -> Result<(), EngineError> {
        let control = self.active_control(session_id, None).await?;
        control.cancel();
        tracing::info!(session_id, run_id = %control.run_id(), "run cancellation requested");

        let prepared = {
            let mut runs = self.runs.lock().await;
            runs.get_mut(session_id)
                .filter(|entry| entry.run_id == control.run_id())
                .and_then(|entry| {
                    entry
                        .prepared
                        .take()
                        .map(|prepared| (prepared, Arc::clone(&entry.snapshot)))
                })
        };
        if let Some((prepared, snapshot)) = prepared {
            self.supervisor.release(session_id, control.run_id()).await;
            let reporter = RunReporter::new(snapshot, Some(prepared.events));
            publish_terminal(&reporter, Err(RunFailure::cancelled()));
        }
        Ok(())
    }

    /// 请求暂停：快照立即标记 pause_requested，进行中的后端调用与工具批次完成后进入 paused
    pub async fn pause_run(&self, session_id: &str) -> Result<(), EngineError> {
        let control = self.active_control(session_id, None).await?;
        control.pause();
        self.mark_pause_requested(session_id, control.run_id(), true).await;
        tracing::info!(session_id, run_id = %control.run_id(), "run pause requested");
        Ok(())
    }

    pub async fn resume_run(&self, session_id: &str) -> Result<(), EngineError> {
        let control = self.active_control(session_id, None).await?;
        control.resume();
        self.mark_pause_requested(session_id, control.run_id(), false).await;
        tracing::info!(session_id, run_id = %control.run_id(), "run resume requested");
        Ok(())
    }

    async fn mark_pause_requested(&self, session_id: &str, run_id: &str, requested: bool) {
        let runs = self.runs.lock().await;
        if let Some(entry) = runs.get(session_id).filter(|entry| entry.run_id == run_id) {
            entry.snapshot.send_modify(|s| s.pause_requested = requested);
        }
    }

    /// 会话最近一次运行的快照
    pub async fn run_status(&self, session_id: &str) -> Option<RunSnapshot> {
        self.runs
            .lock()
            .await
            .get(session_id)
            .map(|entry| entry.snapshot.borrow().clone())
    }

    /// 热更新：之后开始的运行使用新设置
    pub async fn update_settings(&self, config: AppConfig) {
        let sweeper = CancellationToken::new();
        let deps = build_deps(
            config,
            &self.providers,
            &self.router,
            &self.tools,
            &self.errors,
            &sweeper,
        );
        let previous = std::mem::replace(
            &mut *self.sweeper.lock().unwrap_or_else(PoisonError::into_inner),
            sweeper,
        );
        previous.cancel();
        *self.deps.write().await = deps;
        tracing::info!("engine settings updated");
    }

    /// 从磁盘与环境变量重新加载配置并热更新
    pub async fn reload_settings(&self) -> Result<(), EngineError> {
        let config = reload_config().map_err(|e| EngineError::ConfigError(e.to_string()))?;
        self.update_settings(config).await;
        Ok(())
    }

    pub async fn history(&self, session_id: &str) -> Vec<Message> {
        self.history.load(session_id).await
    }

    pub async fn recovery_stats(&self, session_id: &str) -> SessionStats {
        self.deps.read().await.recovery.session_stats(session_id)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.deps.read().await.pipeline.cache.stats()
    }

    /// 取消所有运行并停止后台任务（进程退出时）
    pub async fn shutdown(&self) {
        self.supervisor.cancel_all().await;
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        tracing::info!("run engine shut down");
    }

    async fn active_control(&self, session_id: &str, run_id: Option<&str>) -> Result<Arc<RunControl>, EngineError> {
        let control = self.supervisor.get(session_id).await?;
        if let Some(run_id) = run_id {
            if control.run_id() != run_id {
                return Err(EngineError::RunMismatch {
                    expected: control.run_id().to_string(),
                    got: run_id.to_string(),
                });
            }
        }
        Ok(control)
    }
}

impl Drop for RunEngine {
    fn drop(&mut self) {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

fn build_deps(
    config: AppConfig,
    providers: &Arc<ProviderRegistry>,
    router: &Arc<TaskRouter>,
    tools: &Arc<ToolRegistry>,
    errors: &Arc<PerSessionStore<SessionErrors>>,
    sweeper: &CancellationToken,
) -> Arc<RunDeps> {
    let settings = Arc::new(EngineSettings::from_config(config));
    let cfg = &settings.config;

    let cache = Arc::new(ToolResultCache::from_section(&cfg.cache));
    if cache.is_enabled() && cfg.cache.sweep_interval_secs > 0 && tokio::runtime::Handle::try_current().is_ok() {
        cache.spawn_sweeper(Duration::from_secs(cfg.cache.sweep_interval_secs), sweeper.clone());
    }

    let pipeline = ToolPipeline {
        executor: ToolExecutor::new(Arc::clone(tools), cfg.tools.tool_timeout_secs),
        cache,
        policy: settings.policy.clone(),
        scheduler: TaskScheduler::new(cfg.tools.max_concurrent_tools),
        workspace_root: settings.workspace_root.clone(),
    };

    Arc::new(RunDeps {
        providers: Arc::clone(providers),
        router: Arc::clone(router),
        pipeline,
        recovery: Arc::new(RecoveryEngine::with_store(cfg.recovery.clone(), Arc::clone(errors))),
        context_window: ContextWindowManager::new(cfg.context.clone()),
        settings,
    })
}

/// 合并历史 → 注销运行 → 发布终态
async fn finish_run(
    session: &RunSession,
    outcome: RunOutcome,
    user_message: Message,
    store: &dyn HistoryStore,
    supervisor: &SessionSupervisor,
) {
    let reporter = &session.reporter;
    let session_id = reporter.session_id();
    let cancelled = matches!(&outcome.result, Err(f) if f.reason == FailureReason::Cancelled);

    if !cancelled {
        match outcome.replacement {
            Some(messages) => store.replace(session_id, messages).await,
            None => {
                let mut messages = Vec::with_capacity(outcome.appended.len() + 1);
                messages.push(user_message);
                messages.extend(outcome.appended);
                store.append(session_id, messages).await;
            }
        }
    }

    supervisor.release(session_id, reporter.run_id()).await;
    publish_terminal(reporter, outcome.result);
}

fn publish_terminal(reporter: &RunReporter, result: Result<(), RunFailure>) {
    let applied = match result {
        Ok(()) => reporter.transition(RunStatus::Idle, |s| {
            s.completed = true;
            s.pause_requested = false;
        }),
        Err(failure) => reporter.transition(RunStatus::Error, |s| {
            s.failure = Some(failure);
            s.pause_requested = false;
        }),
    };
    if !applied {
        tracing::error!(run_id = %reporter.run_id(), "terminal status rejected by the run state machine");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{BackendFormat, FinishReason, ScriptedLlmClient};
    use crate::memory::{InMemoryHistoryStore, ToolCallRequest};
    use crate::tools::EchoTool;
    use serde_json::{json, Map, Value};

    fn engine_with(client: ScriptedLlmClient, config: AppConfig) -> RunEngine {
        let mut providers = ProviderRegistry::new();
        providers.register("scripted", Arc::new(client), true, Some(100_000));
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        RunEngine::new(
            config,
            Arc::new(providers),
            tools,
            Arc::new(InMemoryHistoryStore::new()),
        )
    }

    fn pinned() -> RunConfig {
        RunConfig::default().with_model("scripted", "scripted-model")
    }

    fn echo_call(id: &str) -> Message {
        let args: Map<String, Value> = json!({"text": "hi"}).as_object().cloned().unwrap();
        Message::assistant_with_tool_calls("", vec![ToolCallRequest::new(id, "echo", args)])
    }

    #[tokio::test]
    async fn test_simple_run_completes_and_merges_history() {
        let client = ScriptedLlmClient::new(BackendFormat::OpenAi).with_text("hello there");
        let engine = engine_with(client, AppConfig::default());

        let mut handle = engine.start_run("s1", Some(pinned())).await.unwrap();
        assert_eq!(handle.snapshot().status, RunStatus::Idle);
        engine.send_message("s1", "hi", Vec::new()).await.unwrap();
        let snapshot = handle.wait().await;

        assert!(snapshot.completed);
        assert_eq!(snapshot.status, RunStatus::Idle);
        assert_eq!(snapshot.iteration, 1);
        let history = engine.history("s1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "hello there");
        // 运行结束后可以开始新的运行
        engine.start_run("s1", Some(pinned())).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_run_rejected_while_active() {
        let client = ScriptedLlmClient::new(BackendFormat::OpenAi).with_text("ok");
        let engine = engine_with(client, AppConfig::default());
        let _handle = engine.start_run("s1", Some(pinned())).await.unwrap();
        assert!(matches!(
            engine.start_run("s1", Some(pinned())).await,
            Err(EngineError::RunInProgress(_))
        ));
        assert!(engine.start_run("s2", Some(pinned())).await.is_ok());
    }

    #[tokio::test]
    async fn test_send_message_without_run() {
        let client = ScriptedLlmClient::new(BackendFormat::OpenAi).with_text("ok");
        let engine = engine_with(client, AppConfig::default());
        assert!(matches!(
            engine.send_message("nope", "hi", Vec::new()).await,
            Err(EngineError::NoActiveRun(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_prepared_run() {
        let client = ScriptedLlmClient::new(BackendFormat::OpenAi).with_text("ok");
        let engine = engine_with(client, AppConfig::default());
        let mut handle = engine.start_run("s1", Some(pinned())).await.unwrap();
        engine.cancel_run("s1").await.unwrap();

        let snapshot = handle.wait().await;
        assert_eq!(snapshot.status, RunStatus::Error);
        assert_eq!(snapshot.failure.unwrap().reason, FailureReason::Cancelled);
        let events = handle.drain_events();
        assert!(matches!(
            events.last(),
            Some(RunEvent::RunStatus {
                status: RunStatus::Error,
                failure: Some(_),
                ..
            })
        ));
        assert!(matches!(
            engine.send_message("s1", "hi", Vec::new()).await,
            Err(EngineError::RunFinished(_))
        ));
        assert!(engine.history("s1").await.is_empty());
    }

    #[tokio::test]
    async fn test_confirm_tool_checks_run_id() {
        let client = ScriptedLlmClient::new(BackendFormat::OpenAi).with_text("ok");
        let engine = engine_with(client, AppConfig::default());
        let _handle = engine.start_run("s1", Some(pinned())).await.unwrap();
        assert!(matches!(
            engine.confirm_tool("s1", "other-run", true, None).await,
            Err(EngineError::RunMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let client = ScriptedLlmClient::new(BackendFormat::OpenAi)
            .with_response(echo_call("c1"), FinishReason::ToolCalls)
            .with_text("done");
        let engine = engine_with(client, AppConfig::default());
        let mut handle = engine.start_run("s1", Some(pinned())).await.unwrap();
        engine.send_message("s1", "say hi", Vec::new()).await.unwrap();
        let snapshot = handle.wait().await;

        assert!(snapshot.completed);
        assert_eq!(snapshot.iteration, 2);
        assert_eq!(snapshot.appended_messages, 3);
        let history = engine.history("s1").await;
        assert_eq!(history.len(), 4);
        assert!(history[2].is_tool_result());
        assert_eq!(history[2].content, "hi");
    }

    #[tokio::test]
    async fn test_update_settings_applies_to_next_run() {
        let client = ScriptedLlmClient::new(BackendFormat::OpenAi).with_text("ok");
        let engine = engine_with(client, AppConfig::default());
        assert_eq!(engine.default_run_config().await.max_iterations, 25);

        let mut config = AppConfig::default();
        config.engine.max_iterations = 4;
        engine.update_settings(config).await;
        assert_eq!(engine.default_run_config().await.max_iterations, 4);

        let handle = engine.start_run("s1", None).await.unwrap();
        assert_eq!(handle.snapshot().config.max_iterations, 4);
    }
}
