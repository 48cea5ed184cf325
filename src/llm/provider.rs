//! Provider 注册表：后端客户端、凭据状态与冷却
//!
//! 路由器只通过 ProviderAvailability 询问“某 provider 现在能否使用”；
//! 重试耗尽的 provider 进入冷却，冷却期内视为不可用。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::{AppConfig, ProviderSection};
use crate::llm::deepseek::{create_deepseek_client, DEEPSEEK_BASE_URL};
use crate::llm::format::BackendFormat;
use crate::llm::http::HttpLlmClient;
use crate::llm::openai::OpenAiClient;
use crate::llm::traits::LlmClient;

/// 可用性查询（路由决策的唯一外部输入）
pub trait ProviderAvailability: Send + Sync {
    fn is_available(&self, provider: &str) -> bool;
}

/// 单个已注册的 provider
pub struct ProviderEntry {
    pub id: String,
    pub client: Arc<dyn LlmClient>,
    pub has_credentials: bool,
    pub context_window: Option<usize>,
    cooldown_until: Mutex<Option<Instant>>,
}

impl ProviderEntry {
    fn in_cooldown(&self) -> bool {
        let guard = self.cooldown_until.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(*guard, Some(until) if Instant::now() < until)
    }
}

/// 未在配置中声明时内置的 provider：(id, 格式, 默认 key 环境变量)
const BUILTIN_PROVIDERS: [(&str, &str, &str); 4] = [
    ("openai", "openai", "OPENAI_API_KEY"),
    ("deepseek", "openai", "DEEPSEEK_API_KEY"),
    ("anthropic", "anthropic", "ANTHROPIC_API_KEY"),
    ("gemini", "gemini", "GEMINI_API_KEY"),
];

/// provider 注册表
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册（同 id 覆盖）
    pub fn register(
        &mut self,
        id: impl Into<String>,
        client: Arc<dyn LlmClient>,
        has_credentials: bool,
        context_window: Option<usize>,
    ) {
        let id = id.into();
        self.providers.insert(
            id.clone(),
            ProviderEntry {
                id,
                client,
                has_credentials,
                context_window,
                cooldown_until: Mutex::new(None),
            },
        );
    }

    /// 按配置构建：内置 provider 先注册，[providers.<id>] 覆盖或新增
    pub fn from_config(config: &AppConfig) -> Self {
        let mut sections: HashMap<String, ProviderSection> = BUILTIN_PROVIDERS
            .iter()
            .map(|(id, format, env)| {
                let section = ProviderSection {
                    format: format.to_string(),
                    api_key_env: Some(env.to_string()),
                    ..ProviderSection::default()
                };
                (id.to_string(), section)
            })
            .collect();
        for (id, section) in &config.providers {
            sections.insert(id.clone(), section.clone());
        }

        let mut registry = Self::new();
        for (id, section) in sections {
            let format = match section.format.parse::<BackendFormat>() {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(provider = %id, error = %e, "skipping provider with unknown format");
                    continue;
                }
            };
            let api_key = section
                .api_key_env
                .as_deref()
                .and_then(|env| std::env::var(env).ok())
                .filter(|k| !k.trim().is_empty());
            let has_credentials = api_key.is_some() || !section.requires_key;
            let base_url = section.base_url.as_deref();

            let client: Arc<dyn LlmClient> = match format {
                BackendFormat::OpenAi if id == "deepseek" => {
                    Arc::new(create_deepseek_client(base_url.or(Some(DEEPSEEK_BASE_URL)), api_key.as_deref()))
                }
                BackendFormat::OpenAi => {
                    Arc::new(OpenAiClient::new(base_url, Some(api_key.as_deref().unwrap_or_default())).with_provider(id.clone()))
                }
                BackendFormat::Anthropic | BackendFormat::Gemini => {
                    Arc::new(HttpLlmClient::new(format, base_url, api_key))
                }
            };
            tracing::debug!(provider = %id, %format, has_credentials, "provider registered");
            registry.register(id, client, has_credentials, section.context_window);
        }
        registry
    }

    pub fn get(&self, id: &str) -> Option<&ProviderEntry> {
        self.providers.get(id)
    }

    pub fn client(&self, id: &str) -> Option<Arc<dyn LlmClient>> {
        self.providers.get(id).map(|p| Arc::clone(&p.client))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 是否至少有一个 provider 具备凭据
    pub fn any_credentials(&self) -> bool {
        self.providers.values().any(|p| p.has_credentials)
    }

    /// 重试耗尽后调用：冷却期内路由会跳过该 provider
    pub fn mark_unavailable(&self, id: &str, cooldown: Duration) {
        if let Some(entry) = self.providers.get(id) {
            let mut guard = entry.cooldown_until.lock().unwrap_or_else(PoisonError::into_inner);
            *guard = Some(Instant::now() + cooldown);
            tracing::warn!(provider = %id, cooldown_secs = cooldown.as_secs(), "provider marked unavailable");
        }
    }

    pub fn clear_cooldown(&self, id: &str) {
        if let Some(entry) = self.providers.get(id) {
            *entry.cooldown_until.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }
    }

    /// provider 声明的窗口大小，未声明时用 fallback
    pub fn context_window(&self, id: &str, fallback: usize) -> usize {
        self.providers
            .get(id)
            .and_then(|p| p.context_window)
            .unwrap_or(fallback)
    }
}

impl ProviderAvailability for ProviderRegistry {
    fn is_available(&self, provider: &str) -> bool {
        self.providers
            .get(provider)
            .map(|p| p.has_credentials && !p.in_cooldown())
            .unwrap_or(false)
    }
}

/// 测试用：显式列出可用 provider
impl ProviderAvailability for std::collections::HashSet<String> {
    fn is_available(&self, provider: &str) -> bool {
        self.contains(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedLlmClient;

    #[test]
    fn test_availability_requires_credentials() {
        let mut registry = ProviderRegistry::new();
        registry.register("a", Arc::new(ScriptedLlmClient::new(BackendFormat::OpenAi)), true, None);
        registry.register("b", Arc::new(ScriptedLlmClient::new(BackendFormat::OpenAi)), false, Some(8_000));
        assert!(registry.is_available("a"));
        assert!(!registry.is_available("b"));
        assert!(!registry.is_available("missing"));
        assert_eq!(registry.context_window("b", 1), 8_000);
        assert_eq!(registry.context_window("a", 1), 1);
    }

    #[test]
    fn test_cooldown_makes_provider_unavailable() {
        let mut registry = ProviderRegistry::new();
        registry.register("a", Arc::new(ScriptedLlmClient::new(BackendFormat::OpenAi)), true, None);
        registry.mark_unavailable("a", Duration::from_secs(60));
        assert!(!registry.is_available("a"));
        registry.clear_cooldown("a");
        assert!(registry.is_available("a"));

        registry.mark_unavailable("a", Duration::ZERO);
        assert!(registry.is_available("a"));
    }

    #[test]
    fn test_from_config_registers_builtins_and_local() {
        let mut config = AppConfig::default();
        config.providers.insert(
            "ollama".into(),
            ProviderSection {
                format: "openai".into(),
                base_url: Some("http://localhost:11434/v1".into()),
                requires_key: false,
                ..ProviderSection::default()
            },
        );
        config.providers.insert(
            "bogus".into(),
            ProviderSection {
                format: "cohere".into(),
                ..ProviderSection::default()
            },
        );
        let registry = ProviderRegistry::from_config(&config);
        for id in ["openai", "deepseek", "anthropic", "gemini", "ollama"] {
            assert!(registry.get(id).is_some(), "{id} missing");
        }
        assert!(registry.get("bogus").is_none());
        assert!(registry.is_available("ollama"));
        assert_eq!(registry.get("gemini").map(|p| p.client.format()), Some(BackendFormat::Gemini));
    }
}
