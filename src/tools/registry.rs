//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时做参数校验、加超时并输出审计日志。
//! category 决定默认的缓存与确认策略：read/search 可缓存，delete 视为破坏性。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// 工具类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Read,
    Search,
    Write,
    Execute,
    Delete,
    Network,
    Other,
}

impl ToolCategory {
    /// 会修改工作区的类别，结果永不缓存
    pub fn is_mutating(&self) -> bool {
        matches!(self, ToolCategory::Write | ToolCategory::Execute | ToolCategory::Delete)
    }
}

/// 工具层错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Path escapes workspace: {0}")]
    PathEscape(String),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// 工具执行输出
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    pub metadata: Option<Value>,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            metadata: None,
        }
    }

    /// 工具自身判定的失败（非异常）
    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// 单次工具调用的执行上下文
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub session_id: String,
    pub run_id: String,
    pub call_id: String,
    pub workspace_root: PathBuf,
    /// 运行被取消时触发，长耗时工具应检查
    pub cancel: CancellationToken,
}

/// 发给后端的工具定义
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、类别、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（后端 tool call 中的 name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认表示无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Other
    }

    fn is_cacheable(&self) -> bool {
        matches!(self.category(), ToolCategory::Read | ToolCategory::Search)
    }

    /// 工具自带的缓存 TTL；配置中的按工具 TTL 优先
    fn cache_ttl(&self) -> Option<Duration> {
        None
    }

    fn is_destructive(&self) -> bool {
        self.category() == ToolCategory::Delete
    }

    /// 参数中引用的工作区路径（缓存按路径失效时使用）
    fn affected_paths(&self, args: &Map<String, Value>) -> Vec<String> {
        ["path", "file_path", "file", "dir", "target"]
            .iter()
            .filter_map(|key| args.get(*key).and_then(Value::as_str))
            .map(normalize_path)
            .collect()
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> Result<ToolOutput, String>;
}

/// 工作区相对路径的规范形式：去掉 ./ 前缀与末尾 /
pub fn normalize_path(path: &str) -> String {
    let mut p = path.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    let p = p.trim_end_matches('/');
    if p.is_empty() {
        ".".to_string()
    } else {
        p.to_string()
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous implementation replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 已注册的工具名（排序后）
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 指定工具的定义（按名排序，忽略未注册的名字）
    pub fn definitions_for<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = names
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs.dedup_by(|a, b| a.name == b.name);
        defs
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions_for(self.tools.keys())
    }
}
