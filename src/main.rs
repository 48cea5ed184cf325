//! bee-engine 演示入口
//!
//! 用法：`bee-engine [消息]`。配置了 API Key 时按任务路由走真实后端，
//! 否则注册脚本化客户端演示一轮工具调用。运行事件逐行以 JSON 打印到 stdout，
//! 需要确认的工具调用在终端询问（y 批准）。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use bee_engine::config::{load_config, AppConfig};
use bee_engine::core::{RunConfig, RunEngine};
use bee_engine::llm::{BackendFormat, FinishReason, ProviderRegistry, ScriptedLlmClient};
use bee_engine::memory::{InMemoryHistoryStore, Message, ToolCallRequest};
use bee_engine::run::RunEvent;
use bee_engine::tools::{
    DeleteFileTool, EchoTool, ListDirTool, ReadFileTool, SearchFilesTool, ToolRegistry, WriteFileTool,
};

const SESSION: &str = "cli";

fn demo_client() -> ScriptedLlmClient {
    let args: Map<String, Value> = json!({ "path": "." }).as_object().cloned().unwrap_or_default();
    ScriptedLlmClient::new(BackendFormat::OpenAi)
        .with_response(
            Message::assistant_with_tool_calls(
                "Let me look at the workspace first.",
                vec![ToolCallRequest::new("call_demo_1", "list_dir", args)],
            ),
            FinishReason::ToolCalls,
        )
        .with_text("That is everything in the workspace. (scripted demo: set an API key for a real backend)")
}

fn build_tools(workspace: &Path) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(ReadFileTool::new(workspace));
    tools.register(ListDirTool::new(workspace));
    tools.register(SearchFilesTool::new(workspace));
    tools.register(WriteFileTool::new(workspace));
    tools.register(DeleteFileTool::new(workspace));
    tools.register(EchoTool);
    tools
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bee_engine::observability::init();

    let config = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let message = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let message = if message.trim().is_empty() {
        "List the files in the workspace".to_string()
    } else {
        message
    };

    let workspace = config
        .engine
        .workspace_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("workspace"));
    std::fs::create_dir_all(&workspace).context("Failed to create workspace directory")?;
    let tools = build_tools(&workspace);

    let mut providers = ProviderRegistry::from_config(&config);
    let mut run_config = RunConfig::from_config(&config);
    if !providers.any_credentials() {
        tracing::warn!("No API key set, using scripted demo backend");
        providers.register("demo", Arc::new(demo_client()), true, None);
        run_config = run_config.with_model("demo", "scripted");
    }

    let engine = RunEngine::new(
        config,
        Arc::new(providers),
        tools,
        Arc::new(InMemoryHistoryStore::new()),
    );
    let mut handle = engine
        .start_run(SESSION, Some(run_config))
        .await
        .context("Failed to start run")?;
    engine
        .send_message(SESSION, message, Vec::new())
        .await
        .context("Failed to send message")?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let event = tokio::select! {
            event = handle.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, cancelling run");
                let _ = engine.cancel_run(SESSION).await;
                continue;
            }
        };
        let Some(event) = event else { break };
        println!("{}", serde_json::to_string(&event)?);

        if let RunEvent::ConfirmationRequired { run_id, tool, reason, .. } = &event {
            eprint!("Allow tool '{}' ({})? [y/N] ", tool, reason);
            let answer = stdin.next_line().await?.unwrap_or_default();
            let approved = answer.trim().eq_ignore_ascii_case("y");
            let feedback = (!approved).then(|| "declined at the terminal".to_string());
            if let Err(e) = engine.confirm_tool(SESSION, run_id, approved, feedback).await {
                tracing::warn!("Confirmation failed: {}", e);
            }
        }
    }

    let snapshot = handle.wait().await;
    eprintln!(
        "run {} finished: status={:?} completed={} iterations={} tokens={}",
        snapshot.run_id,
        snapshot.status,
        snapshot.completed,
        snapshot.iteration,
        snapshot.usage.total()
    );
    if let Some(failure) = &snapshot.failure {
        eprintln!("failure: {} ({})", failure.message, failure.reason.as_str());
    }
    engine.shutdown().await;
    Ok(())
}
