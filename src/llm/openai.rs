//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 OpenAI、DeepSeek、自建代理等。
//! 请求体由 `BackendFormat::OpenAi` 生成，这里以 byot 方式透传 JSON，不丢失厂商扩展字段。

use std::pin::Pin;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use serde_json::{json, Value};

use crate::llm::format::openai::deltas_from_chunk;
use crate::llm::format::BackendFormat;
use crate::llm::stream::StreamDelta;
use crate::llm::traits::{BackendRequest, DeltaStream, LlmClient, LlmError};

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value, OpenAIError>> + Send>>;

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    provider: String,
}

impl OpenAiClient {
    /// api_key 为 None 时读取 OPENAI_API_KEY；本地端点（Ollama）可以没有 key
    pub fn new(base_url: Option<&str>, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            provider: "openai".to_string(),
        }
    }

    /// 日志中显示的 provider 名
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    fn payload(request: &BackendRequest, stream: bool) -> Value {
        let mut payload = request.payload.clone();
        if let Some(body) = payload.as_object_mut() {
            body.insert("model".into(), json!(request.model));
            if stream {
                body.insert("stream".into(), json!(true));
                body.insert("stream_options".into(), json!({ "include_usage": true }));
            } else {
                body.remove("stream");
                body.remove("stream_options");
            }
        }
        payload
    }
}

fn map_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::Reqwest(e) if e.is_timeout() => LlmError::Timeout,
        OpenAIError::Reqwest(e) => match e.status() {
            Some(status) => LlmError::from_status(status.as_u16(), &e.to_string(), None),
            None => LlmError::Network(e.to_string()),
        },
        OpenAIError::JSONDeserialize(e, _) => LlmError::InvalidResponse(e.to_string()),
        other => LlmError::classify_text(&other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn format(&self) -> BackendFormat {
        BackendFormat::OpenAi
    }

    async fn complete(&self, request: &BackendRequest) -> Result<Value, LlmError> {
        tracing::debug!(provider = %self.provider, model = %request.model, "chat completion request");
        let response: Value = self
            .client
            .chat()
            .create_byot(Self::payload(request, false))
            .await
            .map_err(map_error)?;
        Ok(response)
    }

    async fn complete_stream(&self, request: &BackendRequest) -> Result<DeltaStream, LlmError> {
        tracing::debug!(provider = %self.provider, model = %request.model, "chat completion stream request");
        let chunks: ChunkStream = self
            .client
            .chat()
            .create_stream_byot(Self::payload(request, true))
            .await
            .map_err(map_error)?;

        let deltas = chunks.flat_map(|item| {
            let out: Vec<Result<StreamDelta, LlmError>> = match item {
                Ok(chunk) => deltas_from_chunk(&chunk).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(map_error(e))],
            };
            stream::iter(out)
        });
        Ok(Box::pin(deltas))
    }
}
