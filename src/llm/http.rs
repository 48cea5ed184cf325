//! 直连 HTTP 客户端：Anthropic Messages API 与 Gemini generateContent
//!
//! 两者都不是 OpenAI 兼容协议，直接用 reqwest 发送 `BackendFormat` 生成的请求体；
//! 非 2xx 状态码按 LlmError::from_status 归类（429 读取 retry-after）。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde_json::Value;

use crate::llm::format::BackendFormat;
use crate::llm::traits::{BackendRequest, LlmClient, LlmError};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// 基于 reqwest 的后端客户端
pub struct HttpLlmClient {
    http: reqwest::Client,
    format: BackendFormat,
    base_url: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    pub fn new(format: BackendFormat, base_url: Option<&str>, api_key: Option<String>) -> Self {
        let base_url = base_url
            .map(String::from)
            .unwrap_or_else(|| match format {
                BackendFormat::Anthropic => ANTHROPIC_BASE_URL.to_string(),
                BackendFormat::Gemini => GEMINI_BASE_URL.to_string(),
                BackendFormat::OpenAi => "https://api.openai.com/v1".to_string(),
            })
            .trim_end_matches('/')
            .to_string();
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            format,
            base_url,
            api_key,
        }
    }

    pub fn anthropic(api_key: Option<String>) -> Self {
        Self::new(BackendFormat::Anthropic, None, api_key)
    }

    pub fn gemini(api_key: Option<String>) -> Self {
        Self::new(BackendFormat::Gemini, None, api_key)
    }

    fn endpoint(&self, model: &str) -> String {
        match self.format {
            BackendFormat::Anthropic => format!("{}/v1/messages", self.base_url),
            BackendFormat::Gemini => format!("{}/v1beta/models/{}:generateContent", self.base_url, model),
            BackendFormat::OpenAi => format!("{}/chat/completions", self.base_url),
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let Some(key) = self.api_key.as_deref() else {
            return builder;
        };
        match self.format {
            BackendFormat::Anthropic => builder
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            BackendFormat::Gemini => builder.header("x-goog-api-key", key),
            BackendFormat::OpenAi => builder.bearer_auth(key),
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Network(err.to_string())
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    fn format(&self) -> BackendFormat {
        self.format
    }

    async fn complete(&self, request: &BackendRequest) -> Result<Value, LlmError> {
        let url = self.endpoint(&request.model);
        tracing::debug!(format = %self.format, %url, "backend request");

        let response = self
            .authorize(self.http.post(&url).json(&request.payload))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let retry_after_ms = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| secs.saturating_mul(1000));
        let body = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            tracing::warn!(format = %self.format, status = status.as_u16(), "backend returned error status");
            return Err(LlmError::from_status(status.as_u16(), &body, retry_after_ms));
        }
        serde_json::from_str(&body).map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 单次响应的本地 HTTP 桩
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_endpoints() {
        let gemini = HttpLlmClient::new(BackendFormat::Gemini, Some("http://host/"), None);
        assert_eq!(
            gemini.endpoint("gemini-2.0-flash"),
            "http://host/v1beta/models/gemini-2.0-flash:generateContent"
        );
        let anthropic = HttpLlmClient::new(BackendFormat::Anthropic, None, None);
        assert_eq!(anthropic.endpoint("x"), "https://api.anthropic.com/v1/messages");
    }

    #[tokio::test]
    async fn test_rate_limit_status_is_classified() {
        let base = serve_once("HTTP/1.1 429 Too Many Requests\r\nretry-after: 2\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").await;
        let client = HttpLlmClient::new(BackendFormat::Anthropic, Some(&base), Some("k".into()));
        let request = BackendRequest {
            model: "claude".into(),
            payload: json!({"messages": []}),
        };
        let err = client.complete(&request).await.unwrap_err();
        assert_eq!(err, LlmError::RateLimited { retry_after_ms: Some(2000) });
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_huge_retry_after_saturates() {
        let base = serve_once(
            "HTTP/1.1 429 Too Many Requests\r\nretry-after: 18446744073709551615\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let client = HttpLlmClient::new(BackendFormat::Gemini, Some(&base), Some("k".into()));
        let request = BackendRequest {
            model: "gemini-2.0-flash".into(),
            payload: json!({}),
        };
        let err = client.complete(&request).await.unwrap_err();
        assert_eq!(err, LlmError::RateLimited { retry_after_ms: Some(u64::MAX) });
    }

    #[tokio::test]
    async fn test_success_body_is_parsed() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 47\r\nconnection: close\r\n\r\n{\"content\":[{\"type\":\"text\",\"text\":\"hi\"}],\"x\":1}",
        )
        .await;
        let client = HttpLlmClient::new(BackendFormat::Anthropic, Some(&base), None);
        let request = BackendRequest {
            model: "claude".into(),
            payload: json!({}),
        };
        let payload = client.complete(&request).await.unwrap();
        assert_eq!(BackendFormat::Anthropic.from_backend_response(&payload).content, "hi");
    }
}
