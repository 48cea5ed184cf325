//! Gemini generateContent 格式
//!
//! 模型名在 URL 中，不进入请求体；assistant 对应 role "model"；
//! 工具结果以 functionResponse part 放在 user 轮次中。

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};

use super::{arguments_from_value, inline_text_attachment, BackendFormat, BackendResponse, FinishReason, RequestOptions};
use crate::memory::{Attachment, Message, Role, TokenUsage, ToolCallRequest};
use crate::tools::ToolDefinition;

pub(crate) fn to_request(history: &[Message], tools: &[ToolDefinition], options: &RequestOptions) -> Value {
    let system: Vec<&str> = history
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    let mut contents: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for msg in history.iter().filter(|m| m.role != Role::System) {
        let (role, parts) = match msg.role {
            Role::User => ("user", user_parts(msg)),
            Role::Assistant => ("model", model_parts(msg)),
            Role::Tool => ("user", tool_parts(msg)),
            Role::System => continue,
        };
        match contents.last_mut() {
            Some((last_role, last_parts)) if *last_role == role => last_parts.extend(parts),
            _ => contents.push((role, parts)),
        }
    }

    let mut body = json!({
        "contents": contents
            .into_iter()
            .map(|(role, parts)| json!({ "role": role, "parts": parts }))
            .collect::<Vec<_>>(),
    });
    if !system.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
    }
    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| json!({ "name": t.name, "description": t.description, "parameters": t.parameters }))
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    let mut generation = serde_json::Map::new();
    if let Some(t) = options.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(max) = options.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(max));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    body
}

fn attachment_part(att: &Attachment) -> Value {
    if BackendFormat::Gemini.accepts_attachment(&att.mime_type) {
        json!({ "inlineData": { "mimeType": att.mime_type, "data": STANDARD.encode(&att.data) } })
    } else if let Some(text) = att.as_text() {
        json!({ "text": inline_text_attachment(att.name.as_deref(), text) })
    } else {
        json!({ "text": att.text_fallback() })
    }
}

fn user_parts(msg: &Message) -> Vec<Value> {
    let mut parts = Vec::new();
    if !msg.content.is_empty() {
        parts.push(json!({ "text": msg.content }));
    }
    parts.extend(msg.attachments.iter().map(attachment_part));
    if parts.is_empty() {
        parts.push(json!({ "text": "" }));
    }
    parts
}

fn function_call_part(call: &ToolCallRequest) -> Value {
    json!({
        "functionCall": {
            "id": call.id,
            "name": call.name,
            "args": Value::Object(call.arguments.clone()),
        }
    })
}

fn model_parts(msg: &Message) -> Vec<Value> {
    let mut parts = Vec::new();
    if !msg.content.is_empty() {
        parts.push(json!({ "text": msg.content }));
    }
    for att in &msg.attachments {
        parts.push(json!({ "text": att.text_fallback() }));
    }
    parts.extend(msg.tool_calls.iter().map(function_call_part));
    if parts.is_empty() {
        parts.push(json!({ "text": "" }));
    }
    parts
}

fn tool_parts(msg: &Message) -> Vec<Value> {
    let Some(link) = &msg.tool_result else {
        return user_parts(msg);
    };
    let mut parts = vec![json!({
        "functionResponse": {
            "id": link.call_id,
            "name": link.tool_name,
            "response": { "content": msg.content, "success": link.success },
        }
    })];
    parts.extend(msg.attachments.iter().map(attachment_part));
    parts
}

fn finish_from_str(raw: &str, has_calls: bool) -> FinishReason {
    match raw {
        // 函数调用同样以 STOP 结束
        "STOP" if has_calls => FinishReason::ToolCalls,
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn finish_to_str(finish: &FinishReason) -> &str {
    match finish {
        FinishReason::Stop | FinishReason::ToolCalls => "STOP",
        FinishReason::Length => "MAX_TOKENS",
        FinishReason::ContentFilter => "SAFETY",
        FinishReason::Other(raw) => raw,
    }
}

pub(crate) fn parse_response(payload: &Value) -> BackendResponse {
    let candidate = &payload["candidates"][0];
    let mut content = String::new();
    let mut thinking = String::new();
    let mut tool_calls = Vec::new();

    for (i, part) in candidate["content"]["parts"].as_array().into_iter().flatten().enumerate() {
        if let Some(call) = part.get("functionCall") {
            let Some(name) = call["name"].as_str() else {
                continue;
            };
            let id = call["id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("gemini_call_{i}"));
            tool_calls.push(ToolCallRequest::new(id, name, arguments_from_value(name, &call["args"])));
        } else if let Some(text) = part["text"].as_str() {
            if part["thought"].as_bool().unwrap_or(false) {
                thinking.push_str(text);
            } else {
                content.push_str(text);
            }
        }
    }

    let finish = match candidate["finishReason"].as_str() {
        Some(raw) => finish_from_str(raw, !tool_calls.is_empty()),
        None if !tool_calls.is_empty() => FinishReason::ToolCalls,
        None => FinishReason::Stop,
    };

    let mut message = Message::assistant_with_tool_calls(content, tool_calls);
    if !thinking.is_empty() {
        message = message.with_thinking(thinking);
    }
    if let Some(usage) = payload["usageMetadata"].as_object() {
        message = message.with_usage(TokenUsage::new(
            usage.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0),
            usage.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0),
        ));
    }
    BackendResponse { message, finish }
}

pub(crate) fn synthesize_response(message: &Message, finish: &FinishReason) -> Value {
    let mut parts = Vec::new();
    if let Some(thinking) = &message.thinking {
        parts.push(json!({ "text": thinking, "thought": true }));
    }
    if !message.content.is_empty() {
        parts.push(json!({ "text": message.content }));
    }
    parts.extend(message.tool_calls.iter().map(function_call_part));
    let usage = message.usage.unwrap_or_default();
    json!({
        "candidates": [{
            "content": { "role": "model", "parts": parts },
            "finishReason": finish_to_str(finish),
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": usage.prompt_tokens,
            "candidatesTokenCount": usage.completion_tokens,
            "totalTokenCount": usage.total(),
        }
    })
}
