//! LLM 层：消息格式化、客户端抽象与实现（OpenAI 兼容 / DeepSeek / Anthropic / Gemini / 脚本化）、provider 注册表与任务路由

pub mod deepseek;
pub mod format;
pub mod http;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod router;
pub mod stream;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use format::{BackendFormat, BackendResponse, FinishReason, RequestOptions};
pub use http::HttpLlmClient;
pub use mock::{ScriptStep, ScriptedLlmClient};
pub use openai::OpenAiClient;
pub use provider::{ProviderAvailability, ProviderRegistry};
pub use router::{RoutingDecision, RoutingRule, RoutingSettings, TaskCategory, TaskRouter};
pub use stream::{StreamAccumulator, StreamDelta};
pub use traits::{BackendRequest, DeltaStream, LlmClient, LlmError, RetryConfig};
