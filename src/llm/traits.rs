//! LLM 客户端抽象
//!
//! 所有后端实现 LlmClient：complete（非流式，返回后端原始 JSON）、complete_stream（增量流）。
//! 请求体由 `llm::format::BackendFormat` 生成，客户端只负责传输。

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use serde_json::Value;
use thiserror::Error;

use crate::config::RetrySection;
use crate::llm::format::BackendFormat;
use crate::llm::stream::{deltas_from_response, StreamDelta};

/// 增量流
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, LlmError>> + Send>>;

/// 后端调用错误；is_transient 区分可重试（限流、超时、网络）与不可重试
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider overloaded: {0}")]
    Overloaded(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Context length exceeded: {0}")]
    ContextLength(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl LlmError {
    /// 限流、超时、网络抖动、过载视为瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::Timeout
                | LlmError::Network(_)
                | LlmError::Overloaded(_)
        )
    }

    /// 根据 HTTP 状态码与响应体归类
    pub fn from_status(status: u16, body: &str, retry_after_ms: Option<u64>) -> Self {
        match status {
            429 => LlmError::RateLimited { retry_after_ms },
            401 | 403 => LlmError::Auth(truncate(body)),
            408 | 504 => LlmError::Timeout,
            500 | 502 | 503 | 529 => LlmError::Overloaded(truncate(body)),
            _ if looks_like_context_overflow(body) => LlmError::ContextLength(truncate(body)),
            _ => LlmError::Api {
                status,
                message: truncate(body),
            },
        }
    }

    /// SDK 只给出错误文本时按关键词归类
    pub fn classify_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests") {
            LlmError::RateLimited { retry_after_ms: None }
        } else if lower.contains("timed out") || lower.contains("timeout") {
            LlmError::Timeout
        } else if lower.contains("overloaded") || lower.contains("503") || lower.contains("502") {
            LlmError::Overloaded(truncate(text))
        } else if lower.contains("api key") || lower.contains("unauthorized") || lower.contains("401") {
            LlmError::Auth(truncate(text))
        } else if looks_like_context_overflow(&lower) {
            LlmError::ContextLength(truncate(text))
        } else if lower.contains("connection") || lower.contains("dns") || lower.contains("error sending request") {
            LlmError::Network(truncate(text))
        } else {
            LlmError::Api {
                status: 0,
                message: truncate(text),
            }
        }
    }
}

fn looks_like_context_overflow(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("context length") || lower.contains("maximum context") || lower.contains("too many tokens")
}

fn truncate(text: &str) -> String {
    const MAX: usize = 500;
    if text.chars().count() > MAX {
        format!("{}...", text.chars().take(MAX).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 重试策略：指数退避
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    /// 第 attempt 次重试（从 1 开始）前的等待时间；限流响应给出 retry-after 时优先使用
    pub fn backoff_for(&self, attempt: u32, err: &LlmError) -> Duration {
        if let LlmError::RateLimited {
            retry_after_ms: Some(ms),
        } = err
        {
            return Duration::from_millis((*ms).min(self.max_backoff_ms));
        }
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_retries: section.max_retries,
            initial_backoff_ms: section.initial_backoff_ms,
            max_backoff_ms: section.max_backoff_ms,
        }
    }
}

/// 发给后端的请求：格式化后的载荷 + 目标模型
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub model: String,
    pub payload: Value,
}

/// LLM 客户端 trait：非流式完成与流式完成（返回增量流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 后端使用的请求/响应格式
    fn format(&self) -> BackendFormat;

    /// 非流式完成，返回后端原始响应 JSON
    async fn complete(&self, request: &BackendRequest) -> Result<Value, LlmError>;

    /// 流式完成；默认把整包响应拆成增量，真正支持流式的后端可覆盖
    async fn complete_stream(&self, request: &BackendRequest) -> Result<DeltaStream, LlmError> {
        let payload = self.complete(request).await?;
        let response = self.format().parse_response(&payload);
        let deltas = deltas_from_response(&response);
        Ok(Box::pin(stream::iter(deltas.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::RateLimited { retry_after_ms: None }.is_transient());
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::Network("reset".into()).is_transient());
        assert!(!LlmError::Auth("bad key".into()).is_transient());
        assert!(!LlmError::Api { status: 400, message: "bad".into() }.is_transient());
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(LlmError::from_status(429, "", Some(1200)), LlmError::RateLimited { retry_after_ms: Some(1200) }));
        assert!(matches!(LlmError::from_status(401, "nope", None), LlmError::Auth(_)));
        assert!(matches!(LlmError::from_status(529, "overloaded", None), LlmError::Overloaded(_)));
        assert!(matches!(
            LlmError::from_status(400, "maximum context length is 8192 tokens", None),
            LlmError::ContextLength(_)
        ));
        assert!(matches!(LlmError::from_status(404, "missing", None), LlmError::Api { status: 404, .. }));
    }

    #[test]
    fn test_classify_text() {
        assert!(matches!(LlmError::classify_text("Rate limit reached for gpt-4o"), LlmError::RateLimited { .. }));
        assert!(matches!(LlmError::classify_text("operation timed out"), LlmError::Timeout));
        assert!(matches!(LlmError::classify_text("invalid request"), LlmError::Api { .. }));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        let err = LlmError::Timeout;
        assert_eq!(retry.backoff_for(1, &err), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2, &err), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(3, &err), Duration::from_millis(400));
        assert_eq!(retry.backoff_for(10, &err), Duration::from_millis(1000));
        let limited = LlmError::RateLimited { retry_after_ms: Some(300) };
        assert_eq!(retry.backoff_for(1, &limited), Duration::from_millis(300));
    }
}
