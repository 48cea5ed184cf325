//! 引擎配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__ENGINE__MAX_ITERATIONS=10`）。
//! 所有字段都有默认值；运行开始时读取快照，两次运行之间可热更新。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub tools: ToolsSection,
    pub cache: CacheSection,
    pub routing: RoutingSection,
    pub context: ContextSection,
    pub recovery: RecoverySection,
    /// [providers.<id>]：各后端的格式、地址与凭据来源
    pub providers: HashMap<String, ProviderSection>,
}

/// [engine] 段：运行预算、系统提示、重试策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub system_prompt: Option<String>,
    /// 工具沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    pub max_iterations: usize,
    /// 单次运行的时间预算（秒）
    pub max_run_secs: u64,
    /// 单次运行累计 token 上限；None 表示不限
    pub max_total_tokens: Option<u64>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub retry: RetrySection,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            system_prompt: None,
            workspace_root: None,
            max_iterations: 25,
            max_run_secs: 900,
            max_total_tokens: None,
            temperature: 0.2,
            max_tokens: None,
            retry: RetrySection::default(),
        }
    }
}

/// [engine.retry] 段：瞬时错误的重试与退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// 重试耗尽后该后端进入冷却的时长（秒）
    pub provider_cooldown_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            provider_cooldown_secs: 60,
        }
    }
}

/// [tools] 段：并发、超时、确认与禁用列表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub max_concurrent_tools: usize,
    /// 总是需要用户确认的工具
    pub always_confirm: Vec<String>,
    /// 禁用的工具：调用时直接返回合成错误
    pub disabled: Vec<String>,
    /// 破坏性工具（delete 类）是否需要确认
    pub confirm_destructive: bool,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            max_concurrent_tools: 5,
            always_confirm: Vec::new(),
            disabled: Vec::new(),
            confirm_destructive: true,
        }
    }
}

/// [cache] 段：工具结果缓存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub capacity: usize,
    pub default_ttl_secs: u64,
    /// 按工具名覆盖 TTL（秒）
    pub tool_ttl_secs: HashMap<String, u64>,
    /// 后台过期清扫间隔（秒），0 表示不启动
    pub sweep_interval_secs: u64,
    /// 分片数：不同 key 落在不同锁上
    pub shards: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 512,
            default_ttl_secs: 300,
            tool_ttl_secs: HashMap::new(),
            sweep_interval_secs: 60,
            shards: 16,
        }
    }
}

/// [routing] 段：任务类型检测与模型映射
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub enabled: bool,
    pub confidence_threshold: f64,
    pub default_category: String,
    /// 是否把最近几轮对话纳入检测
    pub use_conversation_context: bool,
    pub context_turns: usize,
    /// 默认映射（general 或未配置的类别）
    pub default: MappingSection,
    /// [routing.mappings.<category>]
    pub mappings: HashMap<String, MappingSection>,
    /// 类别优先级覆盖（数值越小越优先，用于同分裁决）
    pub priorities: HashMap<String, u8>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.5,
            default_category: "general".to_string(),
            use_conversation_context: true,
            context_turns: 4,
            default: MappingSection::default(),
            mappings: HashMap::new(),
            priorities: HashMap::new(),
        }
    }
}

/// 单个类别的 provider/model 映射
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MappingSection {
    pub provider: String,
    pub model: String,
    pub enabled: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub fallback_provider: Option<String>,
    pub fallback_model: Option<String>,
}

impl Default for MappingSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            enabled: true,
            temperature: None,
            max_tokens: None,
            fallback_provider: None,
            fallback_model: None,
        }
    }
}

/// [context] 段：上下文窗口阈值与剪枝
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub warn_threshold: f64,
    pub prune_threshold: f64,
    /// 剪枝目标利用率
    pub target_utilization: f64,
    /// 最近 N 条消息永不剪枝
    pub min_recent_messages: usize,
    pub summarize: bool,
    /// 后端未声明窗口大小时使用
    pub default_context_window: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            warn_threshold: 0.75,
            prune_threshold: 0.9,
            target_utilization: 0.6,
            min_recent_messages: 6,
            summarize: true,
            default_context_window: 128_000,
        }
    }
}

/// [recovery] 段：错误窗口与提前终止阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// 每个会话保留的最近错误条数
    pub window_size: usize,
    /// 错误记录的保留时长（秒）
    pub window_secs: u64,
    /// 最近 5 分钟内的失败数达到该值时终止运行
    pub max_recent_failures: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            window_size: 50,
            window_secs: 1_800,
            max_recent_failures: 8,
        }
    }
}

/// [providers.<id>] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    /// 请求格式：openai / anthropic / gemini
    pub format: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: Option<String>,
    /// 输入窗口大小（token）
    pub context_window: Option<usize>,
    /// 本地后端（如 Ollama）无需凭据
    pub requires_key: bool,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            format: "openai".to_string(),
            base_url: None,
            api_key_env: None,
            context_window: None,
            requires_key: true,
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（热更新：调用方在两次运行之间调用并交给 RunEngine::update_settings）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
