//! 消息模型：与后端无关的对话轮次
//!
//! Message 是运行期间唯一的消息表示；各后端的请求/响应格式由 `llm::format` 负责转换。
//! 追加到历史后即视为不可变（流式生成期间由 StreamAccumulator 在追加前增长内容）。

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::token_budget::TokenEstimator;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 工具调用请求：名称 + 参数表 + 关联 id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// 参数序列化为紧凑 JSON（OpenAI 的 arguments 字段要求字符串）
    pub fn arguments_json(&self) -> String {
        Value::Object(self.arguments.clone()).to_string()
    }
}

/// 工具调用结果：与请求同一个 call_id，无论成功、超时还是被拒绝都恰好产生一个
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// 是否来自缓存命中
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ToolCallResult {
    pub fn success(call_id: impl Into<String>, tool_name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            success: true,
            output: output.into(),
            metadata: None,
            cached: false,
            duration_ms: 0,
        }
    }

    /// 合成失败结果（策略拒绝、超时、取消、panic 等）
    pub fn failure(call_id: impl Into<String>, tool_name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::success(call_id, tool_name, output)
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// tool 消息与其请求之间的关联
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultLink {
    pub call_id: String,
    /// Gemini 的 functionResponse 需要函数名
    pub tool_name: String,
    pub success: bool,
}

/// 二进制附件（图片、PDF、文本等）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime_type: String,
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Attachment {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// 无法被后端接受时的文字替代
    pub fn text_fallback(&self) -> String {
        format!(
            "[attachment omitted: {} ({}, {} bytes) is not supported by this model]",
            self.name.as_deref().unwrap_or("unnamed"),
            self.mime_type,
            self.data.len()
        )
    }

    /// text/* 且是合法 UTF-8 时返回文本内容
    pub fn as_text(&self) -> Option<&str> {
        if self.mime_type.starts_with("text/") {
            std::str::from_utf8(&self.data).ok()
        } else {
            None
        }
    }
}

/// Token 使用统计（单条响应或累计）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// 固定消息不会被上下文剪枝移除
    #[serde(default)]
    pub pinned: bool,
    /// 剪枝时生成的摘要消息
    #[serde(default)]
    pub summary: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    token_estimate: OnceLock<usize>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_result: None,
            attachments: Vec::new(),
            thinking: None,
            usage: None,
            pinned: false,
            summary: false,
            created_at: Utc::now(),
            token_estimate: OnceLock::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// 系统提示默认固定，不参与剪枝
    pub fn system(content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::System, content);
        msg.pinned = true;
        msg
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::new(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    pub fn tool_result(result: &ToolCallResult) -> Self {
        let mut msg = Self::new(Role::Tool, result.output.clone());
        msg.tool_result = Some(ToolResultLink {
            call_id: result.call_id.clone(),
            tool_name: result.tool_name.clone(),
            success: result.success,
        });
        msg
    }

    /// 剪枝摘要消息（以 system 角色插入，summary 标记为 true）
    pub fn summary(content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::System, content);
        msg.summary = true;
        msg
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool && self.tool_result.is_some()
    }

    /// 估算 token 数，首次计算后缓存在消息上
    pub fn estimated_tokens(&self) -> usize {
        *self.token_estimate.get_or_init(|| TokenEstimator::estimate_message(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_result_message_links_call() {
        let result = ToolCallResult::failure("call_1", "read_file", "not found");
        let msg = Message::tool_result(&result);
        assert_eq!(msg.role, Role::Tool);
        let link = msg.tool_result.as_ref().unwrap();
        assert_eq!(link.call_id, "call_1");
        assert_eq!(link.tool_name, "read_file");
        assert!(!link.success);
        assert!(msg.is_tool_result());
    }

    #[test]
    fn test_system_message_is_pinned() {
        assert!(Message::system("rules").pinned);
        assert!(!Message::user("hi").pinned);
        let summary = Message::summary("earlier turns");
        assert!(summary.summary);
        assert!(!summary.pinned);
    }

    #[test]
    fn test_token_estimate_is_cached() {
        let msg = Message::user("hello world, this is a message");
        let first = msg.estimated_tokens();
        assert!(first > 0);
        assert_eq!(first, msg.estimated_tokens());
    }

    #[test]
    fn test_arguments_json_is_object() {
        let mut args = Map::new();
        args.insert("path".into(), json!("parser.go"));
        let call = ToolCallRequest::new("c1", "read_file", args);
        let parsed: Value = serde_json::from_str(&call.arguments_json()).unwrap();
        assert_eq!(parsed, json!({"path": "parser.go"}));
    }

    #[test]
    fn test_attachment_text_fallback() {
        let att = Attachment::new("application/zip", vec![0, 1, 2]).with_name("bundle.zip");
        assert!(!att.is_image());
        assert!(att.text_fallback().contains("bundle.zip"));
        assert!(att.as_text().is_none());
        let txt = Attachment::new("text/plain", b"notes".to_vec());
        assert_eq!(txt.as_text(), Some("notes"));
    }
}
