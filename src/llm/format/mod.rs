//! 消息格式化：内部 Message 与各后端请求/响应格式之间的纯函数映射
//!
//! 后端格式是一个封闭的枚举，新增后端即新增一个变体，调用方不需要改动：
//! - OpenAi：OpenAI Chat Completions（同时用于 DeepSeek、Ollama 等兼容端点）
//! - Anthropic：Messages API
//! - Gemini：generateContent
//!
//! 所有函数无副作用；非法的工具参数不会报错，而是降级为空参数，交给工具 schema 校验拒绝。

pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::Message;
use crate::tools::ToolDefinition;

/// 后端格式（封闭变体集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendFormat {
    OpenAi,
    Anthropic,
    Gemini,
}

/// 生成参数
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

impl RequestOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
            stream: false,
        }
    }
}

/// 结束原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    /// 输出被 max_tokens 截断
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    /// 后端是否表示本轮回答已完成（无工具调用时据此结束运行）
    pub fn signals_completion(&self) -> bool {
        !matches!(self, FinishReason::Length | FinishReason::ToolCalls)
    }
}

/// 解析后的后端响应
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub message: Message,
    pub finish: FinishReason,
}

impl BackendFormat {
    /// 历史 + 工具定义 -> 后端请求体
    pub fn to_backend_request(&self, history: &[Message], tools: &[ToolDefinition], options: &RequestOptions) -> Value {
        match self {
            BackendFormat::OpenAi => openai::to_request(history, tools, options),
            BackendFormat::Anthropic => anthropic::to_request(history, tools, options),
            BackendFormat::Gemini => gemini::to_request(history, tools, options),
        }
    }

    /// 后端响应 -> assistant 消息
    pub fn from_backend_response(&self, payload: &Value) -> Message {
        self.parse_response(payload).message
    }

    /// 后端响应 -> assistant 消息 + 结束原因
    pub fn parse_response(&self, payload: &Value) -> BackendResponse {
        match self {
            BackendFormat::OpenAi => openai::parse_response(payload),
            BackendFormat::Anthropic => anthropic::parse_response(payload),
            BackendFormat::Gemini => gemini::parse_response(payload),
        }
    }

    /// 把一条 assistant 消息渲染成该后端的响应形状（脚本化客户端与往返测试使用）
    pub fn synthesize_response(&self, message: &Message, finish: &FinishReason) -> Value {
        match self {
            BackendFormat::OpenAi => openai::synthesize_response(message, finish),
            BackendFormat::Anthropic => anthropic::synthesize_response(message, finish),
            BackendFormat::Gemini => gemini::synthesize_response(message, finish),
        }
    }

    /// 该后端能否内联接收此 MIME 类型的附件
    pub fn accepts_attachment(&self, mime_type: &str) -> bool {
        let image = mime_type.starts_with("image/");
        match self {
            BackendFormat::OpenAi => image,
            BackendFormat::Anthropic => image || mime_type == "application/pdf",
            BackendFormat::Gemini => {
                image
                    || mime_type == "application/pdf"
                    || mime_type.starts_with("audio/")
                    || mime_type.starts_with("video/")
            }
        }
    }
}

impl fmt::Display for BackendFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendFormat::OpenAi => "openai",
            BackendFormat::Anthropic => "anthropic",
            BackendFormat::Gemini => "gemini",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "open_ai" | "deepseek" | "ollama" => Ok(BackendFormat::OpenAi),
            "anthropic" | "claude" => Ok(BackendFormat::Anthropic),
            "gemini" | "google" => Ok(BackendFormat::Gemini),
            other => Err(format!("unknown backend format: {other}")),
        }
    }
}

/// 解析 JSON 文本形式的工具参数；非法或非对象时返回空参数表并记录警告
pub fn parse_arguments(tool_name: &str, raw: &str) -> Map<String, Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => arguments_from_value(tool_name, &value),
        Err(e) => {
            tracing::warn!(tool = %tool_name, error = %e, "malformed tool arguments from backend, using empty map");
            Map::new()
        }
    }
}

/// 对象形式的工具参数；字符串则按 JSON 文本再解析一次
pub fn arguments_from_value(tool_name: &str, value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::String(raw) => parse_arguments(tool_name, raw),
        Value::Null => Map::new(),
        other => {
            tracing::warn!(tool = %tool_name, kind = %json_kind(other), "tool arguments are not an object, using empty map");
            Map::new()
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 附件无法内联时拼接到正文的说明文字
pub(crate) fn append_fallbacks(content: &str, fallbacks: &[String]) -> String {
    if fallbacks.is_empty() {
        return content.to_string();
    }
    let mut out = content.to_string();
    for fallback in fallbacks {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(fallback);
    }
    out
}

/// 文本附件内联时的展示形式
pub(crate) fn inline_text_attachment(name: Option<&str>, text: &str) -> String {
    format!("[attachment: {}]\n{}", name.unwrap_or("text"), text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Attachment, ToolCallRequest, ToolCallResult};
    use serde_json::json;

    const ALL: [BackendFormat; 3] = [BackendFormat::OpenAi, BackendFormat::Anthropic, BackendFormat::Gemini];

    /// 线性同余伪随机数，避免引入额外依赖，结果可复现
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }

        fn below(&mut self, n: u64) -> u64 {
            self.next() % n
        }
    }

    fn random_value(rng: &mut Lcg, depth: u32) -> Value {
        match rng.below(if depth > 2 { 4 } else { 6 }) {
            0 => json!(rng.below(1000)),
            1 => json!(format!("s{}-{}", rng.below(100), "ü/é path")),
            2 => json!(rng.below(2) == 0),
            3 => Value::Null,
            4 => Value::Array((0..rng.below(3)).map(|_| random_value(rng, depth + 1)).collect()),
            _ => {
                let mut map = Map::new();
                for i in 0..rng.below(3) {
                    map.insert(format!("k{i}"), random_value(rng, depth + 1));
                }
                Value::Object(map)
            }
        }
    }

    fn random_calls(rng: &mut Lcg, k: usize) -> Vec<ToolCallRequest> {
        (0..k)
            .map(|i| {
                let mut args = Map::new();
                for j in 0..rng.below(4) {
                    args.insert(format!("arg{j}"), random_value(rng, 0));
                }
                ToolCallRequest::new(format!("call_{i}_{}", rng.below(10_000)), format!("tool_{}", rng.below(5)), args)
            })
            .collect()
    }

    #[test]
    fn test_tool_calls_round_trip_all_formats() {
        let mut rng = Lcg(42);
        for format in ALL {
            for k in 0..8 {
                let calls = random_calls(&mut rng, k);
                let assistant = Message::assistant_with_tool_calls(if k % 2 == 0 { "" } else { "working" }, calls.clone());
                let history = vec![Message::user("go"), assistant.clone()];
                let request = format.to_backend_request(&history, &[], &RequestOptions::new("m"));
                assert!(request.is_object());

                let finish = if k == 0 { FinishReason::Stop } else { FinishReason::ToolCalls };
                let payload = format.synthesize_response(&assistant, &finish);
                let parsed = format.parse_response(&payload);
                assert_eq!(parsed.message.tool_calls.len(), k, "{format} k={k}");
                for (orig, got) in calls.iter().zip(&parsed.message.tool_calls) {
                    assert_eq!(orig.name, got.name);
                    assert_eq!(orig.arguments, got.arguments);
                    assert_eq!(orig.id, got.id);
                }
                assert_eq!(parsed.finish, finish, "{format} k={k}");
            }
        }
    }

    #[test]
    fn test_every_format_serializes_tool_results() {
        let call = ToolCallRequest::new("call_1", "read_file", Map::new());
        let history = vec![
            Message::system("sys"),
            Message::user("read it"),
            Message::assistant_with_tool_calls("", vec![call]),
            Message::tool_result(&ToolCallResult::success("call_1", "read_file", "package main")),
        ];
        for format in ALL {
            let request = format.to_backend_request(&history, &[], &RequestOptions::new("m"));
            let text = request.to_string();
            assert!(text.contains("package main"), "{format} lost tool output");
            assert!(text.contains("call_1"), "{format} lost correlation id");
        }
    }

    #[test]
    fn test_unsupported_attachment_falls_back_to_text() {
        let msg = Message::user("see attached").with_attachments(vec![
            Attachment::new("application/zip", vec![1, 2, 3]).with_name("logs.zip"),
            Attachment::new("image/png", vec![137, 80, 78, 71]),
        ]);
        for format in ALL {
            let request = format.to_backend_request(&[msg.clone()], &[], &RequestOptions::new("m"));
            let text = request.to_string();
            assert!(text.contains("attachment omitted: logs.zip"), "{format}");
            assert!(text.contains("iVBORw=="), "{format} did not inline the image");
        }
    }

    #[test]
    fn test_parse_arguments_degrades() {
        assert!(parse_arguments("t", "").is_empty());
        assert!(parse_arguments("t", "[1,2]").is_empty());
        assert!(parse_arguments("t", "{oops").is_empty());
        assert_eq!(parse_arguments("t", "{\"a\":1}").get("a"), Some(&json!(1)));
        assert_eq!(arguments_from_value("t", &json!("{\"b\":true}")).get("b"), Some(&json!(true)));
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("OpenAI".parse::<BackendFormat>(), Ok(BackendFormat::OpenAi));
        assert_eq!("deepseek".parse::<BackendFormat>(), Ok(BackendFormat::OpenAi));
        assert_eq!("claude".parse::<BackendFormat>(), Ok(BackendFormat::Anthropic));
        assert_eq!("gemini".parse::<BackendFormat>(), Ok(BackendFormat::Gemini));
        assert!("cohere".parse::<BackendFormat>().is_err());
    }

    #[test]
    fn test_attachment_acceptance_differs_per_backend() {
        assert!(!BackendFormat::OpenAi.accepts_attachment("application/pdf"));
        assert!(BackendFormat::Anthropic.accepts_attachment("application/pdf"));
        assert!(BackendFormat::Gemini.accepts_attachment("audio/wav"));
        assert!(ALL.iter().all(|f| f.accepts_attachment("image/jpeg")));
    }
}
