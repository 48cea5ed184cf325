//! 流式增量：后端输出的统一表示
//!
//! 流式后端逐块产生 StreamDelta；非流式后端的整包响应由 deltas_from_response 拆成同样的增量。
//! StreamAccumulator 把增量还原为 BackendResponse，两条路径因此汇合。

use std::collections::BTreeMap;

use serde::Serialize;

use crate::llm::format::{parse_arguments, BackendResponse, FinishReason};
use crate::memory::{Message, TokenUsage, ToolCallRequest};

/// 单个流式增量
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamDelta {
    /// 正文片段
    Content { text: String },
    /// 思考/推理片段
    Thinking { text: String },
    /// 工具调用片段：同一 index 的片段拼接为一个调用（arguments 为 JSON 文本片段）
    ToolCall {
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        arguments: String,
    },
    /// token 用量
    Usage { usage: TokenUsage },
    /// 结束信号
    Finish { reason: FinishReason },
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// 增量累加器：在追加到历史之前原地增长 assistant 消息
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    thinking: String,
    calls: BTreeMap<usize, PartialCall>,
    usage: Option<TokenUsage>,
    finish: Option<FinishReason>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &StreamDelta) {
        match delta {
            StreamDelta::Content { text } => self.content.push_str(text),
            StreamDelta::Thinking { text } => self.thinking.push_str(text),
            StreamDelta::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                let call = self.calls.entry(*index).or_default();
                if let Some(id) = id {
                    call.id = Some(id.clone());
                }
                if let Some(name) = name {
                    call.name.push_str(name);
                }
                call.arguments.push_str(arguments);
            }
            StreamDelta::Usage { usage } => {
                let total = self.usage.get_or_insert_with(TokenUsage::default);
                total.add(*usage);
            }
            StreamDelta::Finish { reason } => self.finish = Some(reason.clone()),
        }
    }

    /// 结束累积：解析工具参数（非法 JSON 降级为空参数），生成 assistant 消息
    pub fn finish(self) -> BackendResponse {
        let tool_calls: Vec<ToolCallRequest> = self
            .calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let id = c
                    .id
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                let arguments = parse_arguments(&c.name, &c.arguments);
                ToolCallRequest::new(id, c.name, arguments)
            })
            .collect();

        let finish = match self.finish {
            Some(reason) => reason,
            None if !tool_calls.is_empty() => FinishReason::ToolCalls,
            None => FinishReason::Stop,
        };

        let mut message = Message::assistant_with_tool_calls(self.content, tool_calls);
        if !self.thinking.is_empty() {
            message = message.with_thinking(self.thinking);
        }
        if let Some(usage) = self.usage {
            message = message.with_usage(usage);
        }
        BackendResponse { message, finish }
    }
}

/// 把整包响应拆成增量（非流式后端适配到流式契约）
pub fn deltas_from_response(response: &BackendResponse) -> Vec<StreamDelta> {
    let message = &response.message;
    let mut deltas = Vec::new();
    if let Some(thinking) = &message.thinking {
        deltas.push(StreamDelta::Thinking {
            text: thinking.clone(),
        });
    }
    if !message.content.is_empty() {
        deltas.push(StreamDelta::Content {
            text: message.content.clone(),
        });
    }
    for (index, call) in message.tool_calls.iter().enumerate() {
        deltas.push(StreamDelta::ToolCall {
            index,
            id: Some(call.id.clone()),
            name: Some(call.name.clone()),
            arguments: call.arguments_json(),
        });
    }
    if let Some(usage) = message.usage {
        deltas.push(StreamDelta::Usage { usage });
    }
    deltas.push(StreamDelta::Finish {
        reason: response.finish.clone(),
    });
    deltas
}
