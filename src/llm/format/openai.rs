//! OpenAI Chat Completions 格式（DeepSeek、Ollama 等兼容端点共用）

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};

use super::{append_fallbacks, inline_text_attachment, parse_arguments, BackendResponse, FinishReason, RequestOptions};
use crate::llm::stream::StreamDelta;
use crate::memory::{Message, Role, TokenUsage, ToolCallRequest};
use crate::tools::ToolDefinition;

pub(crate) fn to_request(history: &[Message], tools: &[ToolDefinition], options: &RequestOptions) -> Value {
    let messages: Vec<Value> = history.iter().map(message_to_json).collect();
    let mut body = json!({
        "model": options.model,
        "messages": messages,
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(
            tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect(),
        );
    }
    if let Some(t) = options.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(max) = options.max_tokens {
        body["max_tokens"] = json!(max);
    }
    if options.stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({ "include_usage": true });
    }
    body
}

fn message_to_json(msg: &Message) -> Value {
    match msg.role {
        Role::System => json!({ "role": "system", "content": msg.content }),
        Role::User => json!({ "role": "user", "content": user_content(msg) }),
        Role::Assistant => {
            // reasoning_content 不回传：DeepSeek 会拒绝带推理内容的输入
            let content = append_fallbacks(&msg.content, &fallbacks(msg));
            let mut out = json!({ "role": "assistant" });
            out["content"] = if content.is_empty() && msg.has_tool_calls() {
                Value::Null
            } else {
                json!(content)
            };
            if msg.has_tool_calls() {
                out["tool_calls"] = Value::Array(msg.tool_calls.iter().map(tool_call_to_json).collect());
            }
            out
        }
        Role::Tool => {
            let content = append_fallbacks(&msg.content, &fallbacks(msg));
            match &msg.tool_result {
                Some(link) => json!({
                    "role": "tool",
                    "tool_call_id": link.call_id,
                    "content": content,
                }),
                None => json!({ "role": "user", "content": content }),
            }
        }
    }
}

/// 只有 assistant/tool 消息携带附件时无法内联，统一转成文字
fn fallbacks(msg: &Message) -> Vec<String> {
    msg.attachments
        .iter()
        .map(|a| match a.as_text() {
            Some(text) => inline_text_attachment(a.name.as_deref(), text),
            None => a.text_fallback(),
        })
        .collect()
}

fn user_content(msg: &Message) -> Value {
    if msg.attachments.is_empty() {
        return json!(msg.content);
    }
    let mut parts = Vec::new();
    if !msg.content.is_empty() {
        parts.push(json!({ "type": "text", "text": msg.content }));
    }
    for att in &msg.attachments {
        if att.is_image() {
            parts.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", att.mime_type, STANDARD.encode(&att.data)) }
            }));
        } else if let Some(text) = att.as_text() {
            parts.push(json!({ "type": "text", "text": inline_text_attachment(att.name.as_deref(), text) }));
        } else {
            parts.push(json!({ "type": "text", "text": att.text_fallback() }));
        }
    }
    Value::Array(parts)
}

fn tool_call_to_json(call: &ToolCallRequest) -> Value {
    json!({
        "id": call.id,
        "type": "function",
        "function": { "name": call.name, "arguments": call.arguments_json() }
    })
}

fn finish_from_str(raw: &str) -> FinishReason {
    match raw {
        "stop" => FinishReason::Stop,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn finish_to_str(finish: &FinishReason) -> &str {
    match finish {
        FinishReason::Stop => "stop",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::Length => "length",
        FinishReason::ContentFilter => "content_filter",
        FinishReason::Other(raw) => raw,
    }
}

fn usage_from(value: &Value) -> Option<TokenUsage> {
    let usage = value.as_object()?;
    Some(TokenUsage::new(
        usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
    ))
}

pub(crate) fn parse_response(payload: &Value) -> BackendResponse {
    let choice = &payload["choices"][0];
    let raw = &choice["message"];

    let content = raw["content"].as_str().unwrap_or_default().to_string();
    let mut tool_calls: Vec<ToolCallRequest> = raw["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(i, call)| {
                    let name = call["function"]["name"].as_str()?.to_string();
                    let id = call["id"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{i}"));
                    let arguments = match &call["function"]["arguments"] {
                        Value::String(raw) => parse_arguments(&name, raw),
                        other => super::arguments_from_value(&name, other),
                    };
                    Some(ToolCallRequest::new(id, name, arguments))
                })
                .collect()
        })
        .unwrap_or_default();
    if tool_calls.is_empty() {
        tool_calls.extend(legacy_function_call(raw));
    }

    let finish = match choice["finish_reason"].as_str() {
        Some(raw) => finish_from_str(raw),
        None if !tool_calls.is_empty() => FinishReason::ToolCalls,
        None => FinishReason::Stop,
    };

    let mut message = Message::assistant_with_tool_calls(content, tool_calls);
    if let Some(reasoning) = raw["reasoning_content"].as_str().filter(|s| !s.is_empty()) {
        message = message.with_thinking(reasoning);
    }
    if let Some(usage) = usage_from(&payload["usage"]) {
        message = message.with_usage(usage);
    }
    BackendResponse { message, finish }
}

/// 旧版 function_call 字段（部分兼容端点仍返回）
fn legacy_function_call(raw: &Value) -> Option<ToolCallRequest> {
    let name = raw["function_call"]["name"].as_str()?;
    let args = raw["function_call"]["arguments"].as_str().unwrap_or_default();
    Some(ToolCallRequest::new("call_0", name, parse_arguments(name, args)))
}

pub(crate) fn synthesize_response(message: &Message, finish: &FinishReason) -> Value {
    let mut raw = json!({ "role": "assistant", "content": message.content });
    if message.has_tool_calls() {
        raw["tool_calls"] = Value::Array(message.tool_calls.iter().map(tool_call_to_json).collect());
    }
    if let Some(thinking) = &message.thinking {
        raw["reasoning_content"] = json!(thinking);
    }
    let usage = message.usage.unwrap_or_default();
    json!({
        "id": format!("chatcmpl-{}", message.id),
        "object": "chat.completion",
        "created": message.created_at.timestamp(),
        "model": "scripted",
        "choices": [{ "index": 0, "message": raw, "finish_reason": finish_to_str(finish) }],
        "usage": {
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total(),
        }
    })
}

/// 单个 SSE chunk（chat.completion.chunk）-> 增量
pub fn deltas_from_chunk(chunk: &Value) -> Vec<StreamDelta> {
    let mut deltas = Vec::new();
    let choice = &chunk["choices"][0];
    let delta = &choice["delta"];

    if let Some(text) = delta["reasoning_content"].as_str().filter(|s| !s.is_empty()) {
        deltas.push(StreamDelta::Thinking { text: text.to_string() });
    }
    if let Some(text) = delta["content"].as_str().filter(|s| !s.is_empty()) {
        deltas.push(StreamDelta::Content { text: text.to_string() });
    }
    if let Some(calls) = delta["tool_calls"].as_array() {
        for (pos, call) in calls.iter().enumerate() {
            let index = call["index"].as_u64().map(|i| i as usize).unwrap_or(pos);
            deltas.push(StreamDelta::ToolCall {
                index,
                id: call["id"].as_str().map(str::to_string),
                name: call["function"]["name"].as_str().map(str::to_string),
                arguments: call["function"]["arguments"].as_str().unwrap_or_default().to_string(),
            });
        }
    }
    if let Some(raw) = choice["finish_reason"].as_str() {
        deltas.push(StreamDelta::Finish { reason: finish_from_str(raw) });
    }
    if let Some(usage) = usage_from(&chunk["usage"]) {
        deltas.push(StreamDelta::Usage { usage });
    }
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::stream::StreamAccumulator;
    use crate::memory::{Attachment, ToolCallResult};
    use serde_json::Map;

    #[test]
    fn test_request_shape() {
        let call = ToolCallRequest::new("call_1", "read_file", Map::new());
        let history = vec![
            Message::system("be brief"),
            Message::user("open parser.go"),
            Message::assistant_with_tool_calls("", vec![call]),
            Message::tool_result(&ToolCallResult::success("call_1", "read_file", "package main")),
        ];
        let tools = vec![ToolDefinition {
            name: "read_file".into(),
            description: "Read a file".into(),
            parameters: json!({"type": "object"}),
        }];
        let mut options = RequestOptions::new("gpt-4o");
        options.temperature = Some(0.1);
        let body = to_request(&history, &tools, &options);

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body["messages"][2]["content"].is_null());
        assert_eq!(body["messages"][2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(body["messages"][3]["role"], "tool");
        assert_eq!(body["messages"][3]["tool_call_id"], "call_1");
        assert_eq!(body["tools"][0]["function"]["name"], "read_file");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_image_becomes_data_url() {
        let msg = Message::user("what is this").with_attachments(vec![Attachment::new("image/png", vec![1, 2, 3])]);
        let body = to_request(&[msg], &[], &RequestOptions::new("gpt-4o"));
        let url = body["messages"][0]["content"][1]["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_parse_reasoning_and_usage() {
        let payload = json!({
            "choices": [{
                "message": {"role": "assistant", "content": "42", "reasoning_content": "think"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        let parsed = parse_response(&payload);
        assert_eq!(parsed.message.content, "42");
        assert_eq!(parsed.message.thinking.as_deref(), Some("think"));
        assert_eq!(parsed.message.usage, Some(TokenUsage::new(12, 3)));
        assert_eq!(parsed.finish, FinishReason::Stop);
    }

    #[test]
    fn test_stream_chunks_accumulate() {
        let chunks = [
            json!({"choices": [{"delta": {"content": "Hel"}, "finish_reason": null}]}),
            json!({"choices": [{"delta": {"content": "lo", "tool_calls": [{"index": 0, "id": "c1", "function": {"name": "grep", "arguments": "{\"q\""}}]}, "finish_reason": null}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": ":\"x\"}"}}]}, "finish_reason": "tool_calls"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2}}),
        ];
        let mut acc = StreamAccumulator::new();
        for chunk in &chunks {
            for delta in deltas_from_chunk(chunk) {
                acc.push(&delta);
            }
        }
        let response = acc.finish();
        assert_eq!(response.message.content, "Hello");
        assert_eq!(response.message.tool_calls[0].arguments.get("q"), Some(&json!("x")));
        assert_eq!(response.finish, FinishReason::ToolCalls);
        assert_eq!(response.message.usage, Some(TokenUsage::new(5, 2)));
    }
}
