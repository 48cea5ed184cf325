//! Token 估算与上下文用量统计
//!
//! 按字符近似估算（英文约 4 字符/token，中文约 1.5 字符/token），
//! 每条消息的估算值缓存在 Message 上，避免反复计算。

use std::collections::HashMap;

use serde::Serialize;

use crate::memory::{Message, Role};

/// 每条消息的结构开销（角色、分隔符等）
const MESSAGE_OVERHEAD_TOKENS: usize = 4;
/// 图片附件的固定估算值
const IMAGE_ATTACHMENT_TOKENS: usize = 765;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0usize;
        let mut non_ascii_chars = 0usize;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars.div_ceil(4) + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 估算整条消息：正文 + 思考内容 + 工具调用参数 + 附件
    pub fn estimate_message(message: &Message) -> usize {
        let mut tokens = MESSAGE_OVERHEAD_TOKENS + Self::estimate(&message.content);
        if let Some(thinking) = &message.thinking {
            tokens += Self::estimate(thinking);
        }
        for call in &message.tool_calls {
            tokens += Self::estimate(&call.name) + Self::estimate(&call.arguments_json());
        }
        for attachment in &message.attachments {
            tokens += match attachment.as_text() {
                Some(text) => Self::estimate(text),
                None if attachment.is_image() => IMAGE_ATTACHMENT_TOKENS,
                None => Self::estimate(&attachment.text_fallback()),
            };
        }
        tokens
    }

    /// 历史消息总量（使用消息上的缓存值）
    pub fn estimate_history(history: &[Message]) -> usize {
        history.iter().map(Message::estimated_tokens).sum()
    }
}

/// 上下文用量快照（推送给 UI：利用率与按角色拆分）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextMetrics {
    pub total_tokens: usize,
    pub limit: usize,
    /// total / limit，0.0 ~ 1.0+（超限时大于 1）
    pub utilization: f64,
    pub message_count: usize,
    pub by_role: HashMap<Role, usize>,
}

impl ContextMetrics {
    pub fn measure(history: &[Message], limit: usize) -> Self {
        let mut by_role: HashMap<Role, usize> = HashMap::new();
        let mut total_tokens = 0usize;
        for message in history {
            let tokens = message.estimated_tokens();
            *by_role.entry(message.role).or_default() += tokens;
            total_tokens += tokens;
        }
        let utilization = if limit == 0 {
            1.0
        } else {
            total_tokens as f64 / limit as f64
        };
        Self {
            total_tokens,
            limit,
            utilization,
            message_count: history.len(),
            by_role,
        }
    }
}
