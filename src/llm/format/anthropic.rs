//! Anthropic Messages API 格式
//!
//! system 消息提升为顶层 system 字段；tool 结果作为 user 轮次中的 tool_result 块；
//! 相邻同角色轮次合并（API 要求 user/assistant 交替）。

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};

use super::{arguments_from_value, inline_text_attachment, BackendResponse, FinishReason, RequestOptions};
use crate::memory::{Attachment, Message, Role, TokenUsage, ToolCallRequest};
use crate::tools::ToolDefinition;

/// max_tokens 在该 API 中是必填项
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub(crate) fn to_request(history: &[Message], tools: &[ToolDefinition], options: &RequestOptions) -> Value {
    let system: Vec<&str> = history
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for msg in history.iter().filter(|m| m.role != Role::System) {
        let (role, blocks) = match msg.role {
            Role::User => ("user", user_blocks(msg)),
            Role::Assistant => ("assistant", assistant_blocks(msg)),
            Role::Tool => ("user", tool_blocks(msg)),
            Role::System => continue,
        };
        match turns.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => turns.push((role, blocks)),
        }
    }

    let messages: Vec<Value> = turns
        .into_iter()
        .map(|(role, blocks)| json!({ "role": role, "content": blocks }))
        .collect();

    let mut body = json!({
        "model": options.model,
        "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = json!(system.join("\n\n"));
    }
    if !tools.is_empty() {
        body["tools"] = Value::Array(
            tools
                .iter()
                .map(|t| json!({ "name": t.name, "description": t.description, "input_schema": t.parameters }))
                .collect(),
        );
    }
    if let Some(t) = options.temperature {
        body["temperature"] = json!(t);
    }
    body
}

fn text_block(text: impl Into<String>) -> Value {
    json!({ "type": "text", "text": text.into() })
}

fn attachment_block(att: &Attachment) -> Value {
    let source = json!({
        "type": "base64",
        "media_type": att.mime_type,
        "data": STANDARD.encode(&att.data),
    });
    if att.is_image() {
        json!({ "type": "image", "source": source })
    } else if att.mime_type == "application/pdf" {
        json!({ "type": "document", "source": source })
    } else if let Some(text) = att.as_text() {
        text_block(inline_text_attachment(att.name.as_deref(), text))
    } else {
        text_block(att.text_fallback())
    }
}

fn user_blocks(msg: &Message) -> Vec<Value> {
    let mut blocks = Vec::new();
    if !msg.content.is_empty() {
        blocks.push(text_block(msg.content.as_str()));
    }
    blocks.extend(msg.attachments.iter().map(attachment_block));
    if blocks.is_empty() {
        // 空文本块会被拒绝
        blocks.push(text_block("(empty message)"));
    }
    blocks
}

fn assistant_blocks(msg: &Message) -> Vec<Value> {
    // 不回传 thinking：该 API 要求带签名的原始块，本地无法还原
    let mut blocks = Vec::new();
    if !msg.content.is_empty() {
        blocks.push(text_block(msg.content.as_str()));
    }
    for att in &msg.attachments {
        blocks.push(text_block(att.text_fallback()));
    }
    for call in &msg.tool_calls {
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": Value::Object(call.arguments.clone()),
        }));
    }
    if blocks.is_empty() {
        blocks.push(text_block("(empty response)"));
    }
    blocks
}

fn tool_blocks(msg: &Message) -> Vec<Value> {
    let Some(link) = &msg.tool_result else {
        return user_blocks(msg);
    };
    let mut content = vec![text_block(msg.content.as_str())];
    content.extend(msg.attachments.iter().filter(|a| a.is_image()).map(attachment_block));
    content.extend(
        msg.attachments
            .iter()
            .filter(|a| !a.is_image())
            .map(|a| text_block(a.text_fallback())),
    );
    vec![json!({
        "type": "tool_result",
        "tool_use_id": link.call_id,
        "content": content,
        "is_error": !link.success,
    })]
}

fn finish_from_str(raw: &str) -> FinishReason {
    match raw {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "tool_use" => FinishReason::ToolCalls,
        "max_tokens" => FinishReason::Length,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn finish_to_str(finish: &FinishReason) -> &str {
    match finish {
        FinishReason::Stop => "end_turn",
        FinishReason::ToolCalls => "tool_use",
        FinishReason::Length => "max_tokens",
        FinishReason::ContentFilter => "refusal",
        FinishReason::Other(raw) => raw,
    }
}

pub(crate) fn parse_response(payload: &Value) -> BackendResponse {
    let mut content = String::new();
    let mut thinking = String::new();
    let mut tool_calls = Vec::new();

    for (i, block) in payload["content"].as_array().into_iter().flatten().enumerate() {
        match block["type"].as_str() {
            Some("text") => content.push_str(block["text"].as_str().unwrap_or_default()),
            Some("thinking") => thinking.push_str(block["thinking"].as_str().unwrap_or_default()),
            Some("tool_use") => {
                let Some(name) = block["name"].as_str() else {
                    continue;
                };
                let id = block["id"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("toolu_{i}"));
                tool_calls.push(ToolCallRequest::new(id, name, arguments_from_value(name, &block["input"])));
            }
            _ => {}
        }
    }

    let finish = match payload["stop_reason"].as_str() {
        Some(raw) => finish_from_str(raw),
        None if !tool_calls.is_empty() => FinishReason::ToolCalls,
        None => FinishReason::Stop,
    };

    let mut message = Message::assistant_with_tool_calls(content, tool_calls);
    if !thinking.is_empty() {
        message = message.with_thinking(thinking);
    }
    if let Some(usage) = payload["usage"].as_object() {
        message = message.with_usage(TokenUsage::new(
            usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
            usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        ));
    }
    BackendResponse { message, finish }
}

pub(crate) fn synthesize_response(message: &Message, finish: &FinishReason) -> Value {
    let mut blocks = Vec::new();
    if let Some(thinking) = &message.thinking {
        blocks.push(json!({ "type": "thinking", "thinking": thinking, "signature": "" }));
    }
    if !message.content.is_empty() {
        blocks.push(text_block(message.content.as_str()));
    }
    for call in &message.tool_calls {
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": Value::Object(call.arguments.clone()),
        }));
    }
    let usage = message.usage.unwrap_or_default();
    json!({
        "id": format!("msg_{}", message.id),
        "type": "message",
        "role": "assistant",
        "model": "scripted",
        "content": blocks,
        "stop_reason": finish_to_str(finish),
        "usage": { "input_tokens": usage.prompt_tokens, "output_tokens": usage.completion_tokens },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCallResult;
    use serde_json::Map;

    #[test]
    fn test_system_hoisted_and_tool_results_merged() {
        let calls = vec![
            ToolCallRequest::new("toolu_1", "read_file", Map::new()),
            ToolCallRequest::new("toolu_2", "list_dir", Map::new()),
        ];
        let history = vec![
            Message::system("rules"),
            Message::user("look around"),
            Message::assistant_with_tool_calls("", calls),
            Message::tool_result(&ToolCallResult::success("toolu_1", "read_file", "contents")),
            Message::tool_result(&ToolCallResult::failure("toolu_2", "list_dir", "denied")),
        ];
        let body = to_request(&history, &[], &RequestOptions::new("claude-sonnet"));

        assert_eq!(body["system"], "rules");
        assert_eq!(body["max_tokens"], 4096);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        let results = messages[2]["content"].as_array().unwrap();
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "toolu_1");
        assert_eq!(results[1]["is_error"], true);
    }

    #[test]
    fn test_pdf_becomes_document_block() {
        let msg = Message::user("summarize").with_attachments(vec![Attachment::new("application/pdf", vec![37, 80, 68, 70])]);
        let body = to_request(&[msg], &[], &RequestOptions::new("claude-sonnet"));
        assert_eq!(body["messages"][0]["content"][1]["type"], "document");
        assert_eq!(body["messages"][0]["content"][1]["source"]["media_type"], "application/pdf");
    }

    #[test]
    fn test_parse_thinking_and_tool_use() {
        let payload = json!({
            "content": [
                {"type": "thinking", "thinking": "need the file"},
                {"type": "text", "text": "Reading."},
                {"type": "tool_use", "id": "toolu_9", "name": "read_file", "input": {"path": "a.rs"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 7}
        });
        let parsed = parse_response(&payload);
        assert_eq!(parsed.message.thinking.as_deref(), Some("need the file"));
        assert_eq!(parsed.message.content, "Reading.");
        assert_eq!(parsed.message.tool_calls[0].id, "toolu_9");
        assert_eq!(parsed.message.tool_calls[0].arguments.get("path"), Some(&json!("a.rs")));
        assert_eq!(parsed.finish, FinishReason::ToolCalls);
        assert_eq!(parsed.message.usage, Some(TokenUsage::new(20, 7)));
    }
}
