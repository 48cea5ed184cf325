//! 脚本化 LLM 客户端（用于测试与无凭据演示，无需 API）
//!
//! 按顺序返回预设响应或错误；响应按客户端声明的格式渲染成后端原始 JSON，
//! 因此引擎走的是与真实后端完全相同的解析路径。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::Value;

use crate::llm::format::{BackendFormat, FinishReason};
use crate::llm::stream::{deltas_from_response, StreamDelta};
use crate::llm::traits::{BackendRequest, DeltaStream, LlmClient, LlmError};
use crate::memory::Message;

/// 脚本中的一步
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond { message: Message, finish: FinishReason },
    Fail(LlmError),
    /// 流式调用先推送部分正文，随后流中断并报错；非流式调用直接返回错误
    Interrupt { partial: String, error: LlmError },
}

#[derive(Debug, Clone)]
struct Scripted {
    step: ScriptStep,
    delay: Option<Duration>,
}

/// 脚本化客户端
pub struct ScriptedLlmClient {
    format: BackendFormat,
    steps: Mutex<VecDeque<Scripted>>,
    /// 脚本耗尽后重复返回的步骤
    fallback: Option<Scripted>,
    calls: AtomicUsize,
    requests: Mutex<Vec<BackendRequest>>,
}

impl ScriptedLlmClient {
    pub fn new(format: BackendFormat) -> Self {
        Self {
            format,
            steps: Mutex::new(VecDeque::new()),
            fallback: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn push(self, step: ScriptStep) -> Self {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Scripted { step, delay: None });
        self
    }

    pub fn with_response(self, message: Message, finish: FinishReason) -> Self {
        self.push(ScriptStep::Respond { message, finish })
    }

    /// 以纯文本结束本轮
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_response(Message::assistant(text), FinishReason::Stop)
    }

    pub fn with_error(self, err: LlmError) -> Self {
        self.push(ScriptStep::Fail(err))
    }

    /// 推送 partial 后流中断
    pub fn with_interrupted_stream(self, partial: impl Into<String>, error: LlmError) -> Self {
        self.push(ScriptStep::Interrupt {
            partial: partial.into(),
            error,
        })
    }

    /// 给最后一个脚本步骤加上响应延迟
    pub fn with_delay(self, delay: Duration) -> Self {
        if let Some(last) = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back_mut()
        {
            last.delay = Some(delay);
        }
        self
    }

    /// 脚本耗尽后一直返回该响应
    pub fn with_fallback(mut self, message: Message, finish: FinishReason) -> Self {
        self.fallback = Some(Scripted {
            step: ScriptStep::Respond { message, finish },
            delay: None,
        });
        self
    }

    /// 已收到的请求次数
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 已收到的请求（按顺序）
    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 记录请求并取出下一步（已等待该步的延迟）
    async fn next_step(&self, request: &BackendRequest) -> Result<ScriptStep, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let next = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .or_else(|| self.fallback.clone());
        let Some(scripted) = next else {
            return Err(LlmError::InvalidResponse("script exhausted".to_string()));
        };

        if let Some(delay) = scripted.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(scripted.step)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn format(&self) -> BackendFormat {
        self.format
    }

    async fn complete(&self, request: &BackendRequest) -> Result<Value, LlmError> {
        match self.next_step(request).await? {
            ScriptStep::Respond { message, finish } => Ok(self.format.synthesize_response(&message, &finish)),
            ScriptStep::Fail(err) | ScriptStep::Interrupt { error: err, .. } => Err(err),
        }
    }

    async fn complete_stream(&self, request: &BackendRequest) -> Result<DeltaStream, LlmError> {
        let items: Vec<Result<StreamDelta, LlmError>> = match self.next_step(request).await? {
            ScriptStep::Respond { message, finish } => {
                let payload = self.format.synthesize_response(&message, &finish);
                let response = self.format.parse_response(&payload);
                deltas_from_response(&response).into_iter().map(Ok).collect()
            }
            ScriptStep::Fail(err) => return Err(err),
            ScriptStep::Interrupt { partial, error } => {
                vec![Ok(StreamDelta::Content { text: partial }), Err(error)]
            }
        };
        Ok(Box::pin(stream::iter(items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    fn request() -> BackendRequest {
        BackendRequest {
            model: "m".into(),
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn test_script_order_and_exhaustion() {
        let client = ScriptedLlmClient::new(BackendFormat::Anthropic)
            .with_error(LlmError::Timeout)
            .with_text("done");

        assert_eq!(client.complete(&request()).await, Err(LlmError::Timeout));
        let payload = client.complete(&request()).await.unwrap();
        assert_eq!(BackendFormat::Anthropic.from_backend_response(&payload).content, "done");
        assert!(client.complete(&request()).await.is_err());
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_fallback_repeats() {
        let client = ScriptedLlmClient::new(BackendFormat::Gemini).with_fallback(Message::assistant("again"), FinishReason::Stop);
        for _ in 0..3 {
            let payload = client.complete(&request()).await.unwrap();
            assert_eq!(BackendFormat::Gemini.from_backend_response(&payload).content, "again");
        }
    }

    #[tokio::test]
    async fn test_interrupted_stream_yields_partial_then_error() {
        let client = ScriptedLlmClient::new(BackendFormat::OpenAi)
            .with_interrupted_stream("The answer is", LlmError::Network("connection reset".into()));
        let items: Vec<_> = client.complete_stream(&request()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(StreamDelta::Content { text: "The answer is".into() }));
        assert_eq!(items[1], Err(LlmError::Network("connection reset".into())));
    }

    #[tokio::test]
    async fn test_default_stream_adapter() {
        let client = ScriptedLlmClient::new(BackendFormat::OpenAi).with_text("hello");
        let deltas: Vec<_> = client.complete_stream(&request()).await.unwrap().collect().await;
        assert!(deltas.iter().all(|d| d.is_ok()));
        assert!(deltas.len() >= 2);
    }
}
