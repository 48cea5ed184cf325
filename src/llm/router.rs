//! 任务路由器
//!
//! 根据用户消息（可选加上最近几轮对话）检测任务类别，再按类别映射选择 provider/model：
//! - 检测：加权关键词 + 正则内容信号（错误名、堆栈、文件路径），最近轮次按一半权重计入
//! - 置信度不足阈值时使用默认类别；同分按优先级裁决（数值小者胜）
//! - 映射缺失或禁用 → 默认映射；provider 不可用 → 映射声明的备用 provider
//! - 所有候选都不可用时仍立即返回（标记 no_provider_available），绝不阻塞

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::config::{MappingSection, RoutingSection};
use crate::llm::provider::ProviderAvailability;
use crate::memory::{Message, Role};

/// 任务类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    General,
    Coding,
    Debugging,
    Refactoring,
    Testing,
    Documentation,
    Analysis,
    Planning,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 8] = [
        TaskCategory::General,
        TaskCategory::Coding,
        TaskCategory::Debugging,
        TaskCategory::Refactoring,
        TaskCategory::Testing,
        TaskCategory::Documentation,
        TaskCategory::Analysis,
        TaskCategory::Planning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::General => "general",
            TaskCategory::Coding => "coding",
            TaskCategory::Debugging => "debugging",
            TaskCategory::Refactoring => "refactoring",
            TaskCategory::Testing => "testing",
            TaskCategory::Documentation => "documentation",
            TaskCategory::Analysis => "analysis",
            TaskCategory::Planning => "planning",
        }
    }

    /// 同分裁决用的默认优先级（数值越小越优先）
    pub fn default_priority(&self) -> u8 {
        match self {
            TaskCategory::Debugging => 1,
            TaskCategory::Testing => 2,
            TaskCategory::Refactoring => 3,
            TaskCategory::Coding => 4,
            TaskCategory::Documentation => 5,
            TaskCategory::Analysis => 6,
            TaskCategory::Planning => 7,
            TaskCategory::General => 10,
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        TaskCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown task category: {s}"))
    }
}

/// 路由设置（运行开始时由 RoutingSection 生成的快照）
#[derive(Debug, Clone)]
pub struct RoutingSettings {
    pub enabled: bool,
    pub confidence_threshold: f64,
    pub default_category: TaskCategory,
    pub use_conversation_context: bool,
    pub context_turns: usize,
    pub default: MappingSection,
    pub mappings: HashMap<TaskCategory, MappingSection>,
    pub priorities: HashMap<TaskCategory, u8>,
}

impl RoutingSettings {
    /// 未知类别名记录警告后跳过
    pub fn from_section(section: &RoutingSection) -> Self {
        let parse = |name: &str| match name.parse::<TaskCategory>() {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(category = %name, error = %e, "ignoring routing entry");
                None
            }
        };
        let mappings = section
            .mappings
            .iter()
            .filter_map(|(name, m)| parse(name.as_str()).map(|c| (c, m.clone())))
            .collect();
        let priorities = section
            .priorities
            .iter()
            .filter_map(|(name, p)| parse(name.as_str()).map(|c| (c, *p)))
            .collect();
        Self {
            enabled: section.enabled,
            confidence_threshold: section.confidence_threshold,
            default_category: parse(section.default_category.as_str()).unwrap_or(TaskCategory::General),
            use_conversation_context: section.use_conversation_context,
            context_turns: section.context_turns,
            default: section.default.clone(),
            mappings,
            priorities,
        }
    }

    fn priority(&self, category: TaskCategory) -> u8 {
        self.priorities
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_priority())
    }
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self::from_section(&RoutingSection::default())
    }
}

/// 决策所用的规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingRule {
    CategoryMapping { category: TaskCategory },
    Default,
}

/// 路由决策：创建后不可变，重新路由产生新的记录
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub id: String,
    pub category: TaskCategory,
    pub confidence: f64,
    pub provider: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub rule: RoutingRule,
    pub used_default: bool,
    pub used_fallback: bool,
    pub original_provider: Option<String>,
    pub no_provider_available: bool,
    pub created_at: DateTime<Utc>,
}

/// 检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub category: TaskCategory,
    pub confidence: f64,
    pub scores: HashMap<TaskCategory, f64>,
}

struct PatternSignal {
    category: TaskCategory,
    pattern: Regex,
    weight: f64,
}

const KEYWORDS: &[(TaskCategory, &[(&str, f64)])] = &[
    (
        TaskCategory::Debugging,
        &[
            ("fix", 0.3),
            ("bug", 0.35),
            ("debug", 0.4),
            ("error", 0.3),
            ("crash", 0.35),
            ("crashes", 0.35),
            ("exception", 0.3),
            ("panic", 0.3),
            ("broken", 0.25),
            ("fails", 0.25),
            ("failing", 0.25),
            ("stack trace", 0.4),
            ("traceback", 0.4),
            ("修复", 0.35),
            ("报错", 0.35),
        ],
    ),
    (
        TaskCategory::Coding,
        &[
            ("implement", 0.4),
            ("write a function", 0.4),
            ("function", 0.2),
            ("class", 0.2),
            ("code", 0.2),
            ("create", 0.2),
            ("endpoint", 0.2),
            ("api", 0.15),
            ("write", 0.15),
            ("build", 0.15),
            ("实现", 0.35),
            ("编写", 0.3),
        ],
    ),
    (
        TaskCategory::Refactoring,
        &[
            ("refactor", 0.5),
            ("restructure", 0.4),
            ("clean up", 0.3),
            ("rename", 0.3),
            ("simplify", 0.3),
            ("extract", 0.2),
            ("duplicate", 0.2),
            ("重构", 0.5),
        ],
    ),
    (
        TaskCategory::Testing,
        &[
            ("unit test", 0.5),
            ("test", 0.3),
            ("tests", 0.3),
            ("coverage", 0.3),
            ("mock", 0.2),
            ("assert", 0.2),
            ("测试", 0.4),
        ],
    ),
    (
        TaskCategory::Documentation,
        &[
            ("document", 0.4),
            ("documentation", 0.4),
            ("docs", 0.35),
            ("readme", 0.4),
            ("docstring", 0.4),
            ("comment", 0.25),
            ("comments", 0.25),
            ("文档", 0.4),
        ],
    ),
    (
        TaskCategory::Analysis,
        &[
            ("analyze", 0.4),
            ("analyse", 0.4),
            ("explain", 0.3),
            ("review", 0.3),
            ("compare", 0.3),
            ("performance", 0.25),
            ("why", 0.2),
            ("分析", 0.4),
        ],
    ),
    (
        TaskCategory::Planning,
        &[
            ("plan", 0.4),
            ("roadmap", 0.4),
            ("architecture", 0.35),
            ("design", 0.3),
            ("milestone", 0.3),
            ("steps", 0.2),
            ("规划", 0.4),
        ],
    ),
];

const PATTERNS: &[(TaskCategory, &str, f64)] = &[
    // 错误类型名，如 TypeError / NullPointerException
    (TaskCategory::Debugging, r"\b[A-Z]\w*(Error|Exception)\b", 0.4),
    // 堆栈帧
    (TaskCategory::Debugging, r#"(?m)^\s*(at\s+[\w.$<>]+\(|File "[^"]+", line \d+)"#, 0.4),
    (TaskCategory::Debugging, r"(?i)\bline \d+\b", 0.1),
    // 源文件路径
    (
        TaskCategory::Coding,
        r"\b[\w./-]+\.(rs|go|py|ts|tsx|js|jsx|java|kt|c|cc|cpp|h|rb|swift|cs)\b",
        0.2,
    ),
    (TaskCategory::Testing, r"\btest_\w+|\w+_test\.\w+|\w+\.(spec|test)\.\w+", 0.3),
    (TaskCategory::Documentation, r"(?i)\b\w+\.md\b", 0.2),
];

/// 大小写不敏感的关键词匹配；ASCII 关键词要求词边界
pub(crate) fn contains_keyword(haystack_lower: &str, keyword: &str) -> bool {
    if !keyword.is_ascii() {
        return haystack_lower.contains(keyword);
    }
    let bytes = haystack_lower.as_bytes();
    haystack_lower.match_indices(keyword).any(|(start, _)| {
        let end = start + keyword.len();
        let before_ok = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
        let after_ok = end >= bytes.len() || !bytes[end].is_ascii_alphanumeric();
        before_ok && after_ok
    })
}

/// 任务路由器
pub struct TaskRouter {
    patterns: Vec<PatternSignal>,
}

impl TaskRouter {
    pub fn new() -> Self {
        let patterns = PATTERNS
            .iter()
            .filter_map(|(category, raw, weight)| match Regex::new(raw) {
                Ok(pattern) => Some(PatternSignal {
                    category: *category,
                    pattern,
                    weight: *weight,
                }),
                Err(e) => {
                    tracing::warn!(pattern = %raw, error = %e, "invalid routing pattern skipped");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    fn score_text(&self, text: &str, scale: f64, scores: &mut HashMap<TaskCategory, f64>) {
        let lower = text.to_lowercase();
        for (category, keywords) in KEYWORDS {
            let hit: f64 = keywords
                .iter()
                .filter(|(kw, _)| contains_keyword(&lower, kw))
                .map(|(_, w)| *w)
                .sum();
            if hit > 0.0 {
                *scores.entry(*category).or_insert(0.0) += hit * scale;
            }
        }
        for signal in &self.patterns {
            if signal.pattern.is_match(text) {
                *scores.entry(signal.category).or_insert(0.0) += signal.weight * scale;
            }
        }
    }

    /// 检测任务类别
    pub fn detect(&self, user_message: &str, context: &[Message], settings: &RoutingSettings) -> Detection {
        let mut scores = HashMap::new();
        self.score_text(user_message, 1.0, &mut scores);

        if settings.use_conversation_context && settings.context_turns > 0 {
            let recent: Vec<&Message> = context
                .iter()
                .rev()
                .filter(|m| matches!(m.role, Role::User | Role::Assistant) && !m.content.is_empty())
                .take(settings.context_turns)
                .collect();
            for msg in recent {
                self.score_text(&msg.content, 0.5, &mut scores);
            }
        }

        let best = scores
            .iter()
            .filter(|(c, _)| **c != TaskCategory::General)
            .max_by(|(ca, sa), (cb, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // 同分时优先级数值小者为“更大”
                    .then_with(|| settings.priority(**cb).cmp(&settings.priority(**ca)))
            })
            .map(|(c, s)| (*c, s.min(1.0)));

        match best {
            Some((category, confidence)) if confidence >= settings.confidence_threshold => Detection {
                category,
                confidence,
                scores,
            },
            best => Detection {
                category: settings.default_category,
                confidence: best.map(|(_, c)| c).unwrap_or(0.0),
                scores,
            },
        }
    }

    /// 路由：检测类别后解析映射；从不阻塞
    pub fn route(
        &self,
        user_message: &str,
        context: &[Message],
        settings: &RoutingSettings,
        availability: &dyn ProviderAvailability,
    ) -> RoutingDecision {
        let detection = if settings.enabled {
            self.detect(user_message, context, settings)
        } else {
            Detection {
                category: settings.default_category,
                confidence: 0.0,
                scores: HashMap::new(),
            }
        };

        let decision = resolve(detection.category, detection.confidence, settings, availability, None);
        tracing::info!(
            category = %decision.category,
            confidence = decision.confidence,
            provider = %decision.provider,
            model = %decision.model,
            used_default = decision.used_default,
            used_fallback = decision.used_fallback,
            "routing decision"
        );
        decision
    }

    /// provider 失败后重新路由：排除失败的 provider，产生新的决策记录
    pub fn reroute_after_failure(
        &self,
        previous: &RoutingDecision,
        settings: &RoutingSettings,
        availability: &dyn ProviderAvailability,
    ) -> RoutingDecision {
        let decision = resolve(
            previous.category,
            previous.confidence,
            settings,
            availability,
            Some(&previous.provider),
        );
        tracing::warn!(
            failed_provider = %previous.provider,
            provider = %decision.provider,
            no_provider_available = decision.no_provider_available,
            "rerouted after provider failure"
        );
        decision
    }
}

impl Default for TaskRouter {
    fn default() -> Self {
        Self::new()
    }
}

struct Candidate<'a> {
    provider: &'a str,
    model: &'a str,
    mapping: &'a MappingSection,
    is_fallback: bool,
    is_default: bool,
}

fn candidates<'a>(mapping: &'a MappingSection, is_default: bool) -> Vec<Candidate<'a>> {
    let mut out = vec![Candidate {
        provider: &mapping.provider,
        model: &mapping.model,
        mapping,
        is_fallback: false,
        is_default,
    }];
    if let Some(fallback) = mapping.fallback_provider.as_deref() {
        out.push(Candidate {
            provider: fallback,
            model: mapping.fallback_model.as_deref().unwrap_or(&mapping.model),
            mapping,
            is_fallback: true,
            is_default,
        });
    }
    out
}

fn resolve(
    category: TaskCategory,
    confidence: f64,
    settings: &RoutingSettings,
    availability: &dyn ProviderAvailability,
    failed_provider: Option<&str>,
) -> RoutingDecision {
    let mapped = settings.mappings.get(&category).filter(|m| m.enabled);
    let primary = mapped.unwrap_or(&settings.default);
    let rule = match mapped {
        Some(_) => RoutingRule::CategoryMapping { category },
        None => RoutingRule::Default,
    };

    let mut ordered = candidates(primary, mapped.is_none());
    if mapped.is_some() {
        ordered.extend(candidates(&settings.default, true));
    }

    let chosen = ordered
        .iter()
        .find(|c| Some(c.provider) != failed_provider && availability.is_available(c.provider));

    let decision = |provider: &str, model: &str, mapping: &MappingSection, rule: RoutingRule| RoutingDecision {
        id: uuid::Uuid::new_v4().to_string(),
        category,
        confidence,
        provider: provider.to_string(),
        model: model.to_string(),
        temperature: mapping.temperature,
        max_tokens: mapping.max_tokens,
        rule,
        used_default: false,
        used_fallback: false,
        original_provider: None,
        no_provider_available: false,
        created_at: Utc::now(),
    };

    match chosen {
        Some(c) => {
            let rule = if c.is_default { RoutingRule::Default } else { rule };
            let mut d = decision(c.provider, c.model, c.mapping, rule);
            d.used_default = c.is_default;
            if c.is_fallback || c.provider != primary.provider || failed_provider.is_some() {
                d.used_fallback = true;
                d.original_provider = Some(failed_provider.unwrap_or(&primary.provider).to_string());
            }
            d
        }
        None => {
            tracing::error!(category = %category, "no provider available for any routing candidate");
            let mut d = decision(&settings.default.provider, &settings.default.model, &settings.default, RoutingRule::Default);
            d.used_default = true;
            d.no_provider_available = true;
            d.original_provider = failed_provider.map(String::from);
            d
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn available(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn settings_with_debugging() -> RoutingSettings {
        let mut section = RoutingSection::default();
        section.mappings.insert(
            "debugging".into(),
            MappingSection {
                provider: "anthropic".into(),
                model: "claude-sonnet".into(),
                fallback_provider: Some("deepseek".into()),
                fallback_model: Some("deepseek-reasoner".into()),
                ..MappingSection::default()
            },
        );
        RoutingSettings::from_section(&section)
    }

    #[test]
    fn test_detects_debugging_scenario() {
        let router = TaskRouter::new();
        let settings = settings_with_debugging();
        let detection = router.detect("fix the TypeError in parser.go", &[], &settings);
        assert_eq!(detection.category, TaskCategory::Debugging);
        assert!(detection.confidence >= settings.confidence_threshold);
    }

    #[test]
    fn test_low_confidence_uses_default_category() {
        let router = TaskRouter::new();
        let detection = router.detect("hello there", &[], &RoutingSettings::default());
        assert_eq!(detection.category, TaskCategory::General);
        assert!(detection.confidence < 0.5);
    }

    #[test]
    fn test_keyword_requires_word_boundary() {
        assert!(contains_keyword("please fix this", "fix"));
        assert!(!contains_keyword("prefix handling", "fix"));
        assert!(!contains_keyword("typeerror", "error"));
        assert!(contains_keyword("请修复这个问题", "修复"));
    }

    #[test]
    fn test_context_turns_count_half() {
        let router = TaskRouter::new();
        let settings = RoutingSettings::default();
        let context = vec![Message::user("we need to refactor the storage module")];
        let with = router.detect("continue please", &context, &settings);
        let score = with.scores.get(&TaskCategory::Refactoring).copied().unwrap_or(0.0);
        assert!((score - 0.25).abs() < 1e-9);
        assert_eq!(with.category, TaskCategory::General);
    }

    #[test]
    fn test_tie_broken_by_priority() {
        let router = TaskRouter::new();
        let mut section = RoutingSection::default();
        section.confidence_threshold = 0.2;
        // analysis 与 planning 各命中 0.4
        let mut settings = RoutingSettings::from_section(&section);
        let detection = router.detect("analyze the plan", &[], &settings);
        assert_eq!(detection.category, TaskCategory::Analysis);

        settings.priorities.insert(TaskCategory::Planning, 0);
        let detection = router.detect("analyze the plan", &[], &settings);
        assert_eq!(detection.category, TaskCategory::Planning);
    }

    #[test]
    fn test_route_primary_mapping() {
        let router = TaskRouter::new();
        let settings = settings_with_debugging();
        let decision = router.route("fix the TypeError in parser.go", &[], &settings, &available(&["anthropic", "openai"]));
        assert_eq!(decision.provider, "anthropic");
        assert_eq!(decision.model, "claude-sonnet");
        assert_eq!(decision.rule, RoutingRule::CategoryMapping { category: TaskCategory::Debugging });
        assert!(!decision.used_fallback);
        assert!(!decision.used_default);
    }

    #[test]
    fn test_route_uses_fallback_when_primary_unavailable() {
        let router = TaskRouter::new();
        let settings = settings_with_debugging();
        for _ in 0..5 {
            let decision = router.route("debug this crash", &[], &settings, &available(&["deepseek", "openai"]));
            assert_eq!(decision.provider, "deepseek");
            assert_eq!(decision.model, "deepseek-reasoner");
            assert!(decision.used_fallback);
            assert_eq!(decision.original_provider.as_deref(), Some("anthropic"));
        }
    }

    #[test]
    fn test_route_without_mapping_uses_default() {
        let router = TaskRouter::new();
        let settings = settings_with_debugging();
        let decision = router.route("write unit tests with good coverage", &[], &settings, &available(&["openai"]));
        assert_eq!(decision.category, TaskCategory::Testing);
        assert_eq!(decision.provider, "openai");
        assert_eq!(decision.model, "gpt-4o-mini");
        assert!(decision.used_default);
        assert_eq!(decision.rule, RoutingRule::Default);
    }

    #[test]
    fn test_route_nothing_available_never_blocks() {
        let router = TaskRouter::new();
        let settings = settings_with_debugging();
        let decision = router.route("fix the bug", &[], &settings, &available(&[]));
        assert!(decision.no_provider_available);
        assert_eq!(decision.provider, "openai");
        assert!(decision.used_default);
    }

    #[test]
    fn test_reroute_excludes_failed_provider() {
        let router = TaskRouter::new();
        let settings = settings_with_debugging();
        let all = available(&["anthropic", "deepseek", "openai"]);
        let first = router.route("fix the TypeError", &[], &settings, &all);
        assert_eq!(first.provider, "anthropic");

        let second = router.reroute_after_failure(&first, &settings, &all);
        assert_ne!(second.id, first.id);
        assert_eq!(second.provider, "deepseek");
        assert!(second.used_fallback);
        assert_eq!(second.original_provider.as_deref(), Some("anthropic"));
    }

    #[test]
    fn test_unknown_category_in_config_is_skipped() {
        let mut section = RoutingSection::default();
        section.mappings.insert("poetry".into(), MappingSection::default());
        let settings = RoutingSettings::from_section(&section);
        assert!(settings.mappings.is_empty());
    }
}
