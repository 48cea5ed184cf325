//! 错误恢复引擎
//!
//! - 工具失败：按固定模式表（关键词按词边界匹配，首个命中生效）归类，给出修复建议与建议开放的工具；
//!   同一会话窗口内同一模式已出现 ≥2 次时给出替代建议，置信度按 base × 0.5^(prior-1) 衰减，下限 0.1
//! - 会话统计：总错误数、最近 5 分钟错误数、高频模式与高频失败工具；据此判定是否提前终止运行
//! - 后端错误：plan_provider_recovery 决定重试（带退避）、剪枝后重试、切换 provider 或放弃
//!
//! 会话数据存放在注入的 PerSessionStore 中，不同会话互不加锁。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::RecoverySection;
use crate::core::session_store::PerSessionStore;
use crate::llm::router::contains_keyword;
use crate::llm::{LlmError, RetryConfig};

/// 统计「最近错误」的时间窗口
const RECENT_WINDOW: Duration = Duration::from_secs(5 * 60);
/// 替代建议的置信度下限
const MIN_CONFIDENCE: f64 = 0.1;
/// 未命中任何模式时的置信度
const GENERIC_CONFIDENCE: f64 = 0.2;
const TOP_N: usize = 5;

/// 模式严重程度；Fatal 命中即终止运行
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Fatal,
}

struct ErrorPattern {
    id: &'static str,
    keywords: &'static [&'static str],
    severity: Severity,
    confidence: f64,
    remediation: &'static str,
    alternative: &'static str,
    suggested_tools: &'static [&'static str],
}

/// 模式表：按顺序匹配，具体的模式排在宽泛的前面
const PATTERNS: &[ErrorPattern] = &[
    ErrorPattern {
        id: "tool_disabled",
        keywords: &["disabled by policy"],
        severity: Severity::Medium,
        confidence: 0.95,
        remediation: "This tool is disabled. Reach the goal with the remaining tools or answer without it.",
        alternative: "The disabled tool was requested again. Stop calling it and explain the limitation to the user.",
        suggested_tools: &[],
    },
    ErrorPattern {
        id: "denied_by_user",
        keywords: &["denied by user", "user denied"],
        severity: Severity::Medium,
        confidence: 0.9,
        remediation: "The user declined this action. Follow their feedback or propose a safer alternative.",
        alternative: "The user declined repeatedly. Ask the user how to proceed instead of retrying.",
        suggested_tools: &[],
    },
    ErrorPattern {
        id: "unknown_tool",
        keywords: &["unknown tool"],
        severity: Severity::Medium,
        confidence: 0.9,
        remediation: "Call only the tools listed in this request, with their exact names.",
        alternative: "A non-existent tool was requested again. List the available tools and pick one of them.",
        suggested_tools: &[],
    },
    ErrorPattern {
        id: "invalid_arguments",
        keywords: &["invalid arguments", "missing required", "missing field", "has type"],
        severity: Severity::Low,
        confidence: 0.85,
        remediation: "Re-read the tool's parameter schema and pass every required argument with the right type.",
        alternative: "Arguments are still rejected. Simplify the call to only the required arguments.",
        suggested_tools: &[],
    },
    ErrorPattern {
        id: "path_escape",
        keywords: &["escapes workspace", "path escape"],
        severity: Severity::High,
        confidence: 0.9,
        remediation: "Use paths relative to the workspace root. Absolute paths and '..' outside it are rejected.",
        alternative: "The path still leaves the workspace. List the workspace root to find the right relative path.",
        suggested_tools: &["list_dir"],
    },
    ErrorPattern {
        id: "file_not_found",
        keywords: &["not found", "no such file", "does not exist", "enoent", "cannot find"],
        severity: Severity::Low,
        confidence: 0.8,
        remediation: "Verify the path. List the parent directory or search for the file name.",
        alternative: "The path is still wrong. Search the workspace for the file name instead of guessing paths.",
        suggested_tools: &["list_dir", "search_files"],
    },
    ErrorPattern {
        id: "permission_denied",
        keywords: &["permission denied", "eacces", "operation not permitted", "access is denied"],
        severity: Severity::High,
        confidence: 0.8,
        remediation: "The file is not accessible. Choose a file inside the workspace you can read or write.",
        alternative: "Access is still denied. Ask the user to fix permissions instead of retrying.",
        suggested_tools: &["list_dir"],
    },
    ErrorPattern {
        id: "is_directory",
        keywords: &["is a directory", "eisdir"],
        severity: Severity::Low,
        confidence: 0.8,
        remediation: "The path is a directory. List it and pick a file.",
        alternative: "A directory was passed again. Use list_dir on it and read a specific file.",
        suggested_tools: &["list_dir"],
    },
    ErrorPattern {
        id: "timeout",
        keywords: &["timed out", "timeout", "deadline exceeded"],
        severity: Severity::Medium,
        confidence: 0.7,
        remediation: "Narrow the request (a smaller file, a narrower search) or retry once.",
        alternative: "The tool keeps timing out. Split the work into smaller calls.",
        suggested_tools: &[],
    },
    ErrorPattern {
        id: "type_error",
        keywords: &["typeerror", "type error", "mismatched types", "incompatible types"],
        severity: Severity::Low,
        confidence: 0.75,
        remediation: "Read the code around the reported line and check the declared types of the values involved.",
        alternative: "The type error persists. Search for the definitions of the types involved before editing again.",
        suggested_tools: &["read_file", "search_files"],
    },
    ErrorPattern {
        id: "syntax_error",
        keywords: &["syntax error", "syntaxerror", "unexpected token", "parse error", "unexpected eof"],
        severity: Severity::Low,
        confidence: 0.75,
        remediation: "Re-read the edited region and fix the syntax at the reported location.",
        alternative: "Syntax errors keep recurring. Read the whole file and rewrite the broken block.",
        suggested_tools: &["read_file"],
    },
    ErrorPattern {
        id: "network",
        keywords: &[
            "connection refused",
            "connection reset",
            "dns error",
            "dns lookup failed",
            "name resolution",
            "network error",
            "network is unreachable",
            "host unreachable",
        ],
        severity: Severity::Medium,
        confidence: 0.6,
        remediation: "The network call failed. Retry later or continue with local information.",
        alternative: "The network is still failing. Continue without this resource.",
        suggested_tools: &[],
    },
    ErrorPattern {
        id: "rate_limited",
        keywords: &["rate limit", "rate limited", "too many requests"],
        severity: Severity::Medium,
        confidence: 0.7,
        remediation: "A rate limit was hit. Wait before calling this tool again.",
        alternative: "Still rate limited. Avoid this tool for the rest of the run.",
        suggested_tools: &[],
    },
    ErrorPattern {
        id: "disk_full",
        keywords: &["no space left", "disk full", "quota exceeded"],
        severity: Severity::Fatal,
        confidence: 0.9,
        remediation: "The disk is full. The run cannot make progress until space is freed.",
        alternative: "The disk is still full.",
        suggested_tools: &[],
    },
    ErrorPattern {
        id: "authentication",
        keywords: &["invalid api key", "authentication failed", "401 unauthorized"],
        severity: Severity::Fatal,
        confidence: 0.9,
        remediation: "Credentials were rejected. Configure a valid key before retrying.",
        alternative: "Credentials are still rejected.",
        suggested_tools: &[],
    },
];

/// 恢复建议
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoverySuggestion {
    /// 命中的模式；未命中时为 "generic"
    pub pattern_id: String,
    pub confidence: f64,
    pub remediation: String,
    /// 下一轮起开放给后端的工具
    pub suggested_tools: Vec<String>,
    /// 同一模式重复出现，直接修复已失败
    pub is_alternative: bool,
    /// 含本次在内，窗口内该模式出现的次数
    pub occurrences: usize,
    pub severity: Severity,
}

/// 后端错误的处置
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderRecovery {
    Retry { delay: Duration },
    /// 上下文超长：强制剪枝后重试
    PruneAndRetry,
    /// 切换到其他 provider
    Fallback,
    Abort,
}

/// 会话统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub total_errors: usize,
    pub recent_errors: usize,
    pub top_patterns: Vec<(String, usize)>,
    pub top_tools: Vec<(String, usize)>,
}

#[derive(Debug, Clone)]
struct ErrorRecord {
    tool: String,
    pattern_id: &'static str,
    severity: Severity,
    at: Instant,
}

/// 单个会话的错误窗口与计数
#[derive(Debug, Default)]
pub struct SessionErrors {
    window: VecDeque<ErrorRecord>,
    total: usize,
    by_pattern: HashMap<&'static str, usize>,
    by_tool: HashMap<String, usize>,
}

impl SessionErrors {
    fn prune(&mut self, now: Instant, window_size: usize, window: Duration) {
        while self.window.len() > window_size {
            self.window.pop_front();
        }
        while self
            .window
            .front()
            .is_some_and(|r| now.duration_since(r.at) > window)
        {
            self.window.pop_front();
        }
    }
}

/// 语义化错误恢复：模式归类 + 会话窗口升级 + 提前终止判定
pub struct RecoveryEngine {
    sessions: Arc<PerSessionStore<SessionErrors>>,
    settings: RecoverySection,
}

impl RecoveryEngine {
    pub fn new(settings: RecoverySection) -> Self {
        Self::with_store(settings, Arc::new(PerSessionStore::new()))
    }

    /// 使用外部注入的会话存储（多个引擎实例共享统计时使用）
    pub fn with_store(settings: RecoverySection, sessions: Arc<PerSessionStore<SessionErrors>>) -> Self {
        Self { sessions, settings }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.settings.window_secs.max(1))
    }

    /// 归类一次工具失败并记录到会话窗口
    pub fn analyze_error(&self, message: &str, tool_name: &str, session_id: &str) -> RecoverySuggestion {
        let lower = message.to_lowercase();
        let pattern = PATTERNS
            .iter()
            .find(|p| p.keywords.iter().any(|k| contains_keyword(&lower, k)));
        let pattern_id = pattern.map(|p| p.id).unwrap_or("generic");
        let severity = pattern.map(|p| p.severity).unwrap_or(Severity::Low);
        let now = Instant::now();
        let window = self.window();
        let window_size = self.settings.window_size.max(1);

        let prior = self.sessions.with(session_id, |s| {
            s.prune(now, window_size, window);
            let prior = s.window.iter().filter(|r| r.pattern_id == pattern_id).count();
            s.window.push_back(ErrorRecord {
                tool: tool_name.to_string(),
                pattern_id,
                severity,
                at: now,
            });
            s.prune(now, window_size, window);
            s.total += 1;
            *s.by_pattern.entry(pattern_id).or_default() += 1;
            *s.by_tool.entry(tool_name.to_string()).or_default() += 1;
            prior
        });

        let is_alternative = prior >= 2;
        let suggestion = match pattern {
            Some(p) => RecoverySuggestion {
                pattern_id: p.id.to_string(),
                confidence: decayed_confidence(p.confidence, prior),
                remediation: if is_alternative { p.alternative } else { p.remediation }.to_string(),
                suggested_tools: p.suggested_tools.iter().map(|t| t.to_string()).collect(),
                is_alternative,
                occurrences: prior + 1,
                severity: p.severity,
            },
            None => RecoverySuggestion {
                pattern_id: "generic".to_string(),
                confidence: decayed_confidence(GENERIC_CONFIDENCE, prior),
                remediation: if is_alternative {
                    "The same failure keeps happening. Try a different approach or ask the user for guidance."
                } else {
                    "Inspect the error output and adjust the tool call."
                }
                .to_string(),
                suggested_tools: Vec::new(),
                is_alternative,
                occurrences: prior + 1,
                severity: Severity::Low,
            },
        };

        tracing::info!(
            session_id = %session_id,
            tool = %tool_name,
            pattern = %suggestion.pattern_id,
            confidence = suggestion.confidence,
            is_alternative = suggestion.is_alternative,
            "recovery suggestion"
        );
        suggestion
    }

    /// 会话统计；会话不存在时返回全零
    pub fn session_stats(&self, session_id: &str) -> SessionStats {
        let now = Instant::now();
        self.sessions
            .read(session_id, |s| SessionStats {
                total_errors: s.total,
                recent_errors: s
                    .window
                    .iter()
                    .filter(|r| now.duration_since(r.at) <= RECENT_WINDOW)
                    .count(),
                top_patterns: top_n(s.by_pattern.iter().map(|(k, v)| (k.to_string(), *v))),
                top_tools: top_n(s.by_tool.iter().map(|(k, v)| (k.clone(), *v))),
            })
            .unwrap_or_default()
    }

    /// 是否应提前终止运行：最近一次错误命中 Fatal 模式，或最近 5 分钟失败数达到阈值
    pub fn failure_verdict(&self, session_id: &str) -> Option<String> {
        let now = Instant::now();
        let threshold = self.settings.max_recent_failures;
        self.sessions
            .read(session_id, |s| {
                if let Some(last) = s.window.back().filter(|r| r.severity == Severity::Fatal) {
                    return Some(format!("fatal error pattern '{}' from tool {}", last.pattern_id, last.tool));
                }
                let recent = s
                    .window
                    .iter()
                    .filter(|r| now.duration_since(r.at) <= RECENT_WINDOW)
                    .count();
                (threshold > 0 && recent >= threshold)
                    .then(|| format!("{recent} tool failures in the last 5 minutes (limit {threshold})"))
            })
            .flatten()
    }

    /// 后端错误处置：attempt 为已失败的次数（从 1 开始）
    pub fn plan_provider_recovery(&self, err: &LlmError, attempt: u32, retry: &RetryConfig) -> ProviderRecovery {
        match err {
            LlmError::Cancelled => ProviderRecovery::Abort,
            LlmError::ContextLength(_) if attempt <= 1 => ProviderRecovery::PruneAndRetry,
            LlmError::ContextLength(_) => ProviderRecovery::Fallback,
            e if e.is_transient() && attempt <= retry.max_retries => ProviderRecovery::Retry {
                delay: retry.backoff_for(attempt, e),
            },
            e if e.is_transient() => ProviderRecovery::Fallback,
            LlmError::InvalidResponse(_) if attempt <= retry.max_retries.min(1) => ProviderRecovery::Retry {
                delay: retry.backoff_for(attempt, err),
            },
            LlmError::Auth(_) | LlmError::Unavailable(_) | LlmError::InvalidResponse(_) => ProviderRecovery::Fallback,
            LlmError::Api { status, .. } if *status == 0 || *status >= 500 => ProviderRecovery::Fallback,
            _ => ProviderRecovery::Abort,
        }
    }

    /// 清空会话统计（会话删除时调用）
    pub fn clear_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

/// base × 0.5^(prior-1)，prior < 2 时不衰减；下限 MIN_CONFIDENCE
fn decayed_confidence(base: f64, prior: usize) -> f64 {
    if prior < 2 {
        return base;
    }
    let exp = (prior - 1).min(30) as i32;
    (base * 0.5f64.powi(exp)).max(MIN_CONFIDENCE)
}

fn top_n(counts: impl Iterator<Item = (String, usize)>) -> Vec<(String, usize)> {
    let mut items: Vec<(String, usize)> = counts.collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    items.truncate(TOP_N);
    items
}
