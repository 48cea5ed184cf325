//! DeepSeek API 客户端（OpenAI 兼容格式）
//!
//! DeepSeek 提供与 OpenAI 兼容的 API 接口。
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat (常规对话), deepseek-reasoner (思考模式，响应带 reasoning_content)

use crate::llm::openai::OpenAiClient;

/// DeepSeek API 常量
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// 创建 DeepSeek 客户端
///
/// - api_key 为 None 时读取环境变量 `DEEPSEEK_API_KEY`
/// - reasoning_content 由 OpenAi 格式解析为 thinking
pub fn create_deepseek_client(base_url: Option<&str>, api_key: Option<&str>) -> OpenAiClient {
    let api_key = api_key
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_API_KEY").ok())
        .unwrap_or_default();

    OpenAiClient::new(Some(base_url.unwrap_or(DEEPSEEK_BASE_URL)), Some(api_key.as_str())).with_provider("deepseek")
}

#[cfg(test)]
mod tests {
    use crate::llm::format::{BackendFormat, FinishReason};
    use serde_json::json;

    #[test]
    fn test_reasoner_response_keeps_thinking() {
        let payload = json!({
            "id": "x",
            "model": super::DEEPSEEK_REASONER,
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "The bug is on line 3.",
                    "reasoning_content": "Line 3 dereferences a nil map."
                },
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 40, "completion_tokens": 12}
        });
        let parsed = BackendFormat::OpenAi.parse_response(&payload);
        assert_eq!(parsed.message.thinking.as_deref(), Some("Line 3 dereferences a nil map."));
        assert_eq!(parsed.finish, FinishReason::Stop);
    }
}
