//! 运行主循环
//!
//! 每轮：预算检查 → 上下文压力检查（必要时剪枝）→ 按路由到的后端格式化历史并流式请求 →
//! 增量累积为 assistant 消息 → 无工具调用且后端表示完成则结束，否则经 ToolPipeline 执行并按请求顺序追加结果。
//! 失败的工具结果交给恢复引擎，建议的工具在下一轮开放；后端瞬时错误按退避重试，耗尽后冷却该 provider 并重新路由。
//! 取消在每个挂起点检查，观察到取消后立即返回，不再修改任何状态。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;

use crate::core::{
    BudgetKind, EngineSettings, FailureReason, ProviderRecovery, RecoveryEngine, RunConfig, RunControl, RunFailure,
    RunStatus,
};
use crate::llm::{
    BackendRequest, BackendResponse, LlmError, ProviderAvailability, ProviderRegistry, RequestOptions,
    RoutingDecision, StreamAccumulator, TaskRouter,
};
use crate::memory::{ContextPressure, ContextWindowManager, Message, Role, TokenUsage};
use crate::run::events::{RunEvent, RunReporter};
use crate::run::pipeline::ToolPipeline;

/// 运行依赖（引擎设置快照；热更新时整体替换，进行中的运行继续使用旧快照）
pub struct RunDeps {
    pub providers: Arc<ProviderRegistry>,
    pub router: Arc<TaskRouter>,
    pub pipeline: ToolPipeline,
    pub recovery: Arc<RecoveryEngine>,
    pub context_window: ContextWindowManager,
    pub settings: Arc<EngineSettings>,
}

/// 单次运行所需的全部句柄
pub struct RunSession {
    pub deps: Arc<RunDeps>,
    pub control: Arc<RunControl>,
    pub reporter: RunReporter,
    pub config: RunConfig,
}

/// 运行输入：会话已有历史 + 本次用户消息
pub struct RunInput {
    pub history: Vec<Message>,
    pub user_message: Message,
}

/// 运行结果
#[derive(Debug)]
pub struct RunOutcome {
    pub result: Result<(), RunFailure>,
    /// 用户消息之后追加的消息（assistant 与 tool 结果）
    pub appended: Vec<Message>,
    /// 运行中发生过剪枝时，用于整体替换会话历史（已含用户消息与追加消息）
    pub replacement: Option<Vec<Message>>,
}

/// 当前生效的 provider/model
struct ActiveRoute {
    provider: String,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    /// 显式指定 provider 时为 None，不参与重新路由
    decision: Option<RoutingDecision>,
    tried: HashSet<String>,
}

impl ActiveRoute {
    fn pinned(provider: &str, model: &str, config: &RunConfig) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            decision: None,
            tried: HashSet::from([provider.to_string()]),
        }
    }

    fn from_decision(decision: RoutingDecision, config: &RunConfig, mut tried: HashSet<String>) -> Self {
        tried.insert(decision.provider.clone());
        Self {
            provider: decision.provider.clone(),
            model: decision.model.clone(),
            temperature: decision.temperature.or(config.temperature),
            max_tokens: decision.max_tokens.or(config.max_tokens),
            decision: Some(decision),
            tried,
        }
    }
}

struct LoopState {
    messages: Vec<Message>,
    appended: Vec<Message>,
    /// 本次运行注入的系统提示（不写回会话历史）
    system_id: Option<String>,
    pruned: bool,
    active_tools: HashSet<String>,
    route: ActiveRoute,
    usage: TokenUsage,
    iteration: usize,
}

impl LoopState {
    fn new(session: &RunSession, input: RunInput, route: ActiveRoute) -> Self {
        let mut messages = Vec::with_capacity(input.history.len() + 2);
        let mut system_id = None;
        if let Some(prompt) = &session.config.system_prompt {
            let has_system = input.history.iter().any(|m| m.role == Role::System && !m.summary);
            if !has_system {
                let system = Message::system(prompt.clone());
                system_id = Some(system.id.clone());
                messages.push(system);
            }
        }
        messages.extend(input.history);
        messages.push(input.user_message);

        Self {
            messages,
            appended: Vec::new(),
            system_id,
            pruned: false,
            active_tools: initial_tools(session),
            route,
            usage: TokenUsage::default(),
            iteration: 0,
        }
    }

    fn push(&mut self, message: Message) {
        self.appended.push(message.clone());
        self.messages.push(message);
    }

    fn into_outcome(self, result: Result<(), RunFailure>) -> RunOutcome {
        let replacement = if self.pruned {
            let system_id = self.system_id;
            let mut messages = self.messages;
            messages.retain(|m| Some(&m.id) != system_id.as_ref());
            Some(messages)
        } else {
            None
        };
        RunOutcome {
            result,
            appended: self.appended,
            replacement,
        }
    }
}

/// 运行开始时可用的工具：注册表 - 禁用，若配置了 allowed_tools 再取交集
fn initial_tools(session: &RunSession) -> HashSet<String> {
    let deps = &session.deps;
    deps.pipeline
        .executor
        .tool_names()
        .into_iter()
        .filter(|name| !deps.settings.policy.is_disabled(name))
        .filter(|name| {
            session
                .config
                .allowed_tools
                .as_ref()
                .map_or(true, |allowed| allowed.contains(name))
        })
        .collect()
}

/// 执行一次运行直到完成或失败；终态由调用方在合并历史后发布
pub async fn run_loop(session: &RunSession, input: RunInput) -> RunOutcome {
    let started = Instant::now();
    let reporter = &session.reporter;
    reporter.set_status(RunStatus::Running);
    tracing::info!(
        session_id = %reporter.session_id(),
        run_id = %reporter.run_id(),
        max_iterations = session.config.max_iterations,
        "run started"
    );

    let route = match initial_route(session, &input) {
        Ok(route) => route,
        Err(failure) => {
            return RunOutcome {
                result: Err(failure),
                appended: Vec::new(),
                replacement: None,
            }
        }
    };
    let mut state = LoopState::new(session, input, route);
    let result = drive(session, &mut state, started).await;

    match &result {
        Ok(()) => tracing::info!(
            run_id = %reporter.run_id(),
            iterations = state.iteration,
            total_tokens = state.usage.total(),
            "run completed"
        ),
        Err(failure) => tracing::warn!(
            run_id = %reporter.run_id(),
            iterations = state.iteration,
            reason = failure.reason.as_str(),
            message = %failure.message,
            "run failed"
        ),
    }
    state.into_outcome(result)
}

fn initial_route(session: &RunSession, input: &RunInput) -> Result<ActiveRoute, RunFailure> {
    let deps = &session.deps;
    let config = &session.config;
    let reporter = &session.reporter;

    if let (Some(provider), Some(model)) = (&config.provider, &config.model) {
        if !deps.providers.is_available(provider) {
            return Err(RunFailure::new(
                FailureReason::NoProviderAvailable,
                format!("Provider '{provider}' is not available (missing credentials or cooling down)"),
            ));
        }
        return Ok(ActiveRoute::pinned(provider, model, config));
    }

    let decision = deps.router.route(
        &input.user_message.content,
        &input.history,
        &deps.settings.routing,
        &*deps.providers,
    );
    publish_decision(reporter, &decision);
    if decision.no_provider_available {
        return Err(RunFailure::new(
            FailureReason::NoProviderAvailable,
            format!("No provider available for task category '{}'", decision.category),
        ));
    }
    Ok(ActiveRoute::from_decision(decision, config, HashSet::new()))
}

fn publish_decision(reporter: &RunReporter, decision: &RoutingDecision) {
    reporter.update(|s| s.routing = Some(decision.clone()));
    reporter.emit(RunEvent::RoutingDecision {
        run_id: reporter.run_id().to_string(),
        decision: decision.clone(),
    });
}

async fn drive(session: &RunSession, state: &mut LoopState, started: Instant) -> Result<(), RunFailure> {
    let deps = &session.deps;
    let control = &session.control;
    let reporter = &session.reporter;
    let session_id = reporter.session_id().to_string();

    loop {
        if control.is_cancelled() {
            return Err(RunFailure::cancelled());
        }
        if control.is_paused() {
            reporter.set_status(RunStatus::Paused);
            tracing::info!(run_id = %reporter.run_id(), "run paused");
            if !control.wait_if_paused().await {
                return Err(RunFailure::cancelled());
            }
            reporter.set_status(RunStatus::Running);
            tracing::info!(run_id = %reporter.run_id(), "run resumed");
        }
        check_budgets(&session.config, state, started)?;

        manage_context(session, state);

        let response = request_with_recovery(session, state, started).await?;
        state.iteration += 1;
        let iteration = state.iteration;
        if let Some(usage) = response.message.usage {
            state.usage.add(usage);
            reporter.emit(RunEvent::TokenUsage {
                run_id: reporter.run_id().to_string(),
                usage,
                cumulative: state.usage,
            });
        }
        let cumulative = state.usage;
        reporter.update(|s| {
            s.iteration = iteration;
            s.usage = cumulative;
        });

        let calls = response.message.tool_calls.clone();
        state.push(response.message);

        if calls.is_empty() {
            if response.finish.signals_completion() {
                record_appended(reporter, state);
                return Ok(());
            }
            tracing::warn!(run_id = %reporter.run_id(), finish = ?response.finish, "response ended without completion, continuing");
            record_appended(reporter, state);
            continue;
        }

        tracing::info!(run_id = %reporter.run_id(), iteration, tools = calls.len(), "dispatching tool calls");
        let results = deps
            .pipeline
            .process(&calls, &state.active_tools, control, reporter)
            .await;
        if control.is_cancelled() {
            return Err(RunFailure::cancelled());
        }

        let mut any_failed = false;
        for mut result in results {
            if !result.success {
                any_failed = true;
                let suggestion = deps
                    .recovery
                    .analyze_error(&result.output, &result.tool_name, &session_id);
                for tool in &suggestion.suggested_tools {
                    let usable = deps.pipeline.executor.registry().contains(tool)
                        && !deps.settings.policy.is_disabled(tool);
                    if usable && state.active_tools.insert(tool.clone()) {
                        tracing::info!(run_id = %reporter.run_id(), tool = %tool, "tool enabled by recovery suggestion");
                    }
                }
                result.output = format!("{}\n\n[recovery hint] {}", result.output, suggestion.remediation);
                reporter.emit(RunEvent::RecoverySuggestion {
                    run_id: reporter.run_id().to_string(),
                    call_id: result.call_id.clone(),
                    tool: result.tool_name.clone(),
                    suggestion,
                });
            }
            state.push(Message::tool_result(&result));
        }
        record_appended(reporter, state);

        if any_failed {
            if let Some(reason) = deps.recovery.failure_verdict(&session_id) {
                return Err(RunFailure::new(FailureReason::TooManyToolFailures, reason));
            }
        }
    }
}

fn record_appended(reporter: &RunReporter, state: &LoopState) {
    let appended = state.appended.len();
    reporter.update(|s| s.appended_messages = appended);
}

fn check_budgets(config: &RunConfig, state: &LoopState, started: Instant) -> Result<(), RunFailure> {
    if state.iteration >= config.max_iterations {
        return Err(RunFailure::budget(
            BudgetKind::Iterations,
            format!(
                "Reached the iteration limit ({}) without a final answer",
                config.max_iterations
            ),
        ));
    }
    if let Some(limit) = config.max_total_tokens {
        if state.usage.total() >= limit {
            return Err(RunFailure::budget(
                BudgetKind::Tokens,
                format!("Used {} tokens, limit is {}", state.usage.total(), limit),
            ));
        }
    }
    if started.elapsed() >= config.max_run_time {
        return Err(time_budget(config.max_run_time));
    }
    Ok(())
}

fn time_budget(limit: Duration) -> RunFailure {
    RunFailure::budget(BudgetKind::Time, format!("Run exceeded its time limit of {}s", limit.as_secs()))
}

fn provider_limit(session: &RunSession, state: &LoopState) -> usize {
    let deps = &session.deps;
    deps.providers
        .context_window(&state.route.provider, deps.context_window.settings().default_context_window)
}

/// 推送用量快照；超过剪枝阈值时剪枝
fn manage_context(session: &RunSession, state: &mut LoopState) {
    let deps = &session.deps;
    let reporter = &session.reporter;
    let limit = provider_limit(session, state);
    let metrics = deps.context_window.metrics(&state.messages, limit);
    let pressure = deps.context_window.pressure(&state.messages, limit);
    let utilization = metrics.utilization;
    reporter.emit(RunEvent::ContextMetrics {
        run_id: reporter.run_id().to_string(),
        metrics,
        pressure,
    });
    match pressure {
        ContextPressure::Critical => {
            prune_to_target(session, state, limit);
        }
        ContextPressure::Warning => {
            tracing::warn!(run_id = %reporter.run_id(), utilization, "context window above warning threshold");
        }
        ContextPressure::Normal => {}
    }
}

/// 剪枝到目标利用率；没有可移除的消息时返回 false
fn prune_to_target(session: &RunSession, state: &mut LoopState, limit: usize) -> bool {
    let manager = &session.deps.context_window;
    let reporter = &session.reporter;
    let outcome = manager.prune(&state.messages, limit, manager.settings().target_utilization);
    if outcome.removed == 0 {
        tracing::warn!(run_id = %reporter.run_id(), "context over threshold but nothing can be pruned");
        return false;
    }
    reporter.emit(RunEvent::ContextPruned {
        run_id: reporter.run_id().to_string(),
        removed: outcome.removed,
        removed_tokens: outcome.removed_tokens,
        summary_inserted: outcome.summary_inserted,
    });
    state.messages = outcome.messages;
    state.pruned = true;
    true
}

/// 请求后端；按恢复计划重试、剪枝、切换 provider 或放弃
async fn request_with_recovery(
    session: &RunSession,
    state: &mut LoopState,
    started: Instant,
) -> Result<BackendResponse, RunFailure> {
    let deps = &session.deps;
    let config = &session.config;
    let reporter = &session.reporter;
    let mut attempt: u32 = 0;

    loop {
        let mut streamed = false;
        let remaining = config.max_run_time.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(time_budget(config.max_run_time));
        }
        let err = match tokio::time::timeout(remaining, call_backend(session, state, &mut streamed)).await {
            Err(_) => return Err(time_budget(config.max_run_time)),
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(LlmError::Cancelled)) => return Err(RunFailure::cancelled()),
            Ok(Err(e)) => e,
        };
        attempt += 1;
        tracing::warn!(
            run_id = %reporter.run_id(),
            provider = %state.route.provider,
            attempt,
            error = %err,
            "backend request failed"
        );
        if streamed {
            reporter.emit(RunEvent::StreamReset {
                run_id: reporter.run_id().to_string(),
                provider: state.route.provider.clone(),
                error: err.to_string(),
            });
        }

        match deps.recovery.plan_provider_recovery(&err, attempt, &config.retry) {
            ProviderRecovery::Retry { delay } => {
                let token = session.control.cancel_token();
                tokio::select! {
                    _ = token.cancelled() => return Err(RunFailure::cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            ProviderRecovery::PruneAndRetry => {
                let limit = provider_limit(session, state);
                if !prune_to_target(session, state, limit) {
                    reroute(session, state, &err)?;
                    attempt = 0;
                }
            }
            ProviderRecovery::Fallback => {
                reroute(session, state, &err)?;
                attempt = 0;
            }
            ProviderRecovery::Abort => {
                return Err(RunFailure::new(
                    FailureReason::ProviderError,
                    format!("Provider '{}' failed: {}", state.route.provider, err),
                ));
            }
        }
    }
}

/// 冷却失败的 provider 并重新路由（产生新的路由决策记录）
fn reroute(session: &RunSession, state: &mut LoopState, err: &LlmError) -> Result<(), RunFailure> {
    let deps = &session.deps;
    let failed = state.route.provider.clone();
    let cooldown = Duration::from_secs(deps.settings.config.engine.retry.provider_cooldown_secs);
    deps.providers.mark_unavailable(&failed, cooldown);

    let Some(previous) = state.route.decision.as_ref() else {
        return Err(RunFailure::new(
            FailureReason::ProviderError,
            format!("Provider '{failed}' failed: {err}"),
        ));
    };
    let next = deps
        .router
        .reroute_after_failure(previous, &deps.settings.routing, &*deps.providers);
    publish_decision(&session.reporter, &next);

    if next.no_provider_available {
        return Err(RunFailure::new(
            FailureReason::NoProviderAvailable,
            format!("No provider available after '{failed}' failed: {err}"),
        ));
    }
    if state.route.tried.contains(&next.provider) {
        return Err(RunFailure::new(
            FailureReason::ProviderError,
            format!("All candidate providers failed; last error from '{failed}': {err}"),
        ));
    }
    let tried = std::mem::take(&mut state.route.tried);
    state.route = ActiveRoute::from_decision(next, &session.config, tried);
    Ok(())
}

/// 一次后端调用：格式化 → 流式接收 → 累积；取消时中止流。已推送过增量时置 streamed
async fn call_backend(
    session: &RunSession,
    state: &LoopState,
    streamed: &mut bool,
) -> Result<BackendResponse, LlmError> {
    let deps = &session.deps;
    let reporter = &session.reporter;
    let route = &state.route;
    let client = deps
        .providers
        .client(&route.provider)
        .ok_or_else(|| LlmError::Unavailable(format!("provider '{}' is not registered", route.provider)))?;

    let format = client.format();
    let definitions = deps
        .pipeline
        .executor
        .registry()
        .definitions_for(&state.active_tools);
    let options = RequestOptions {
        model: route.model.clone(),
        temperature: route.temperature,
        max_tokens: route.max_tokens,
        stream: session.config.stream,
    };
    let request = BackendRequest {
        model: route.model.clone(),
        payload: format.to_backend_request(&state.messages, &definitions, &options),
    };
    tracing::debug!(
        run_id = %reporter.run_id(),
        provider = %route.provider,
        model = %route.model,
        %format,
        messages = state.messages.len(),
        tools = definitions.len(),
        "sending backend request"
    );

    let token = session.control.cancel_token();
    let mut stream = tokio::select! {
        _ = token.cancelled() => return Err(LlmError::Cancelled),
        stream = client.complete_stream(&request) => stream?,
    };

    let mut accumulator = StreamAccumulator::new();
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return Err(LlmError::Cancelled),
            next = stream.next() => next,
        };
        match next {
            None => break,
            Some(Ok(delta)) => {
                accumulator.push(&delta);
                *streamed = true;
                reporter.emit(RunEvent::StreamDelta {
                    run_id: reporter.run_id().to_string(),
                    delta,
                });
            }
            Some(Err(e)) => return Err(e),
        }
    }
    Ok(accumulator.finish())
}
