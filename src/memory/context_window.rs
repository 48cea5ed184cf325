//! 上下文窗口管理：用量检查与剪枝
//!
//! 剪枝从最旧的消息开始，以「单元」为粒度移除：带 tool_calls 的 assistant 消息与其后的
//! tool 结果构成一个单元，不会被拆开。系统提示、固定消息与最近 N 条消息永不移除。
//! 启用摘要时，被移除的块替换为一条 summary 消息。

use std::collections::HashSet;

use serde::Serialize;

use crate::config::ContextSection;
use crate::memory::token_budget::{ContextMetrics, TokenEstimator};
use crate::memory::{Message, Role};

/// 摘要中每条消息保留的最大字符数
const SUMMARY_LINE_CHARS: usize = 160;

/// 上下文压力等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPressure {
    Normal,
    Warning,
    Critical,
}

/// 剪枝结果
#[derive(Debug, Clone)]
pub struct PruneOutcome {
    pub messages: Vec<Message>,
    pub removed: usize,
    pub removed_tokens: usize,
    pub summary_inserted: bool,
}

/// 连续且不可拆分的一段消息 [start, end)
#[derive(Debug, Clone, Copy)]
struct Unit {
    start: usize,
    end: usize,
}

/// 上下文窗口管理器
#[derive(Debug, Clone)]
pub struct ContextWindowManager {
    settings: ContextSection,
}

impl ContextWindowManager {
    pub fn new(settings: ContextSection) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ContextSection {
        &self.settings
    }

    pub fn metrics(&self, history: &[Message], provider_limit: usize) -> ContextMetrics {
        ContextMetrics::measure(history, provider_limit)
    }

    pub fn pressure(&self, history: &[Message], provider_limit: usize) -> ContextPressure {
        let utilization = ContextMetrics::measure(history, provider_limit).utilization;
        if utilization >= self.settings.prune_threshold {
            ContextPressure::Critical
        } else if utilization >= self.settings.warn_threshold {
            ContextPressure::Warning
        } else {
            ContextPressure::Normal
        }
    }

    pub fn should_prune(&self, history: &[Message], provider_limit: usize) -> bool {
        self.pressure(history, provider_limit) == ContextPressure::Critical
    }

    /// 剪枝到 provider_limit * target_utilization 以下（受保护消息不足以达标时尽力而为）
    pub fn prune(&self, history: &[Message], provider_limit: usize, target_utilization: f64) -> PruneOutcome {
        let target = (provider_limit as f64 * target_utilization) as usize;
        let mut total = TokenEstimator::estimate_history(history);
        let units = split_units(history);
        let recent_floor = history.len().saturating_sub(self.settings.min_recent_messages);

        let mut removed_units: Vec<Unit> = Vec::new();
        for unit in &units {
            if total <= target {
                break;
            }
            if self.is_protected(history, unit, recent_floor) {
                continue;
            }
            total -= history[unit.start..unit.end]
                .iter()
                .map(Message::estimated_tokens)
                .sum::<usize>();
            removed_units.push(*unit);
        }

        if removed_units.is_empty() {
            return PruneOutcome {
                messages: history.to_vec(),
                removed: 0,
                removed_tokens: 0,
                summary_inserted: false,
            };
        }

        let removed_idx: HashSet<usize> = removed_units
            .iter()
            .flat_map(|u| u.start..u.end)
            .collect();
        let removed_tokens: usize = removed_idx.iter().map(|&i| history[i].estimated_tokens()).sum();
        let first_removed = removed_units[0].start;

        let mut messages = Vec::with_capacity(history.len() - removed_idx.len() + 1);
        let mut summary_inserted = false;
        for (i, message) in history.iter().enumerate() {
            if i == first_removed && self.settings.summarize {
                let removed: Vec<&Message> = removed_units
                    .iter()
                    .flat_map(|u| history[u.start..u.end].iter())
                    .collect();
                messages.push(Message::summary(summarize(&removed)));
                summary_inserted = true;
            }
            if !removed_idx.contains(&i) {
                messages.push(message.clone());
            }
        }

        tracing::info!(
            removed = removed_idx.len(),
            removed_tokens,
            summary_inserted,
            "context pruned"
        );

        PruneOutcome {
            messages,
            removed: removed_idx.len(),
            removed_tokens,
            summary_inserted,
        }
    }

    fn is_protected(&self, history: &[Message], unit: &Unit, recent_floor: usize) -> bool {
        if unit.end > recent_floor {
            return true;
        }
        history[unit.start..unit.end]
            .iter()
            .any(|m| m.pinned || (m.role == Role::System && !m.summary))
    }
}

/// 按 tool_call / tool_result 配对切分为不可拆分单元
fn split_units(history: &[Message]) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < history.len() {
        let message = &history[i];
        let mut end = i + 1;
        if message.role == Role::Assistant && message.has_tool_calls() {
            let ids: HashSet<&str> = message.tool_calls.iter().map(|c| c.id.as_str()).collect();
            while end < history.len() {
                match &history[end].tool_result {
                    Some(link) if history[end].role == Role::Tool && ids.contains(link.call_id.as_str()) => {
                        end += 1;
                    }
                    _ => break,
                }
            }
        }
        units.push(Unit { start: i, end });
        i = end;
    }
    units
}

/// 抽取式摘要：每条被移除消息保留角色与开头片段，工具调用只保留名称
fn summarize(removed: &[&Message]) -> String {
    let mut out = format!(
        "Summary of {} earlier messages removed to fit the context window:\n",
        removed.len()
    );
    for message in removed {
        let line = if message.summary {
            format!("- earlier summary: {}", preview(&message.content))
        } else if message.has_tool_calls() {
            let names: Vec<&str> = message.tool_calls.iter().map(|c| c.name.as_str()).collect();
            format!("- assistant called tools: {}", names.join(", "))
        } else if let Some(link) = &message.tool_result {
            let status = if link.success { "ok" } else { "failed" };
            format!("- tool {} ({}): {}", link.tool_name, status, preview(&message.content))
        } else {
            format!("- {}: {}", message.role.as_str(), preview(&message.content))
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn preview(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("");
    if first_line.chars().count() > SUMMARY_LINE_CHARS {
        let cut: String = first_line.chars().take(SUMMARY_LINE_CHARS).collect();
        format!("{}...", cut)
    } else {
        first_line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ToolCallRequest, ToolCallResult};
    use serde_json::Map;

    fn settings(min_recent: usize, summarize: bool) -> ContextSection {
        ContextSection {
            min_recent_messages: min_recent,
            summarize,
            ..ContextSection::default()
        }
    }

    fn long_text(n: usize) -> String {
        "word ".repeat(n)
    }

    fn history_with_tool_pair() -> Vec<Message> {
        let call = ToolCallRequest::new("c1", "read_file", Map::new());
        vec![
            Message::system("system prompt"),
            Message::user(long_text(200)),
            Message::assistant_with_tool_calls("", vec![call]),
            Message::tool_result(&ToolCallResult::success("c1", "read_file", long_text(200))),
            Message::assistant(long_text(200)),
            Message::user("latest question"),
            Message::assistant("latest answer"),
        ]
    }

    #[test]
    fn test_pressure_levels() {
        let manager = ContextWindowManager::new(settings(2, false));
        let history = vec![Message::user(long_text(100))];
        let tokens = TokenEstimator::estimate_history(&history);
        assert_eq!(manager.pressure(&history, tokens * 10), ContextPressure::Normal);
        assert_eq!(manager.pressure(&history, tokens * 5 / 4), ContextPressure::Warning);
        assert!(manager.should_prune(&history, tokens));
    }

    #[test]
    fn test_prune_keeps_system_and_recent() {
        let manager = ContextWindowManager::new(settings(2, false));
        let history = history_with_tool_pair();
        let outcome = manager.prune(&history, 200, 0.5);
        assert!(outcome.removed > 0);
        assert_eq!(outcome.messages[0].content, "system prompt");
        let n = outcome.messages.len();
        assert_eq!(outcome.messages[n - 2].content, "latest question");
        assert_eq!(outcome.messages[n - 1].content, "latest answer");
    }

    #[test]
    fn test_prune_never_splits_tool_pair() {
        let manager = ContextWindowManager::new(settings(2, false));
        let history = history_with_tool_pair();
        for limit in [100, 300, 500, 700, 900] {
            let outcome = manager.prune(&history, limit, 0.6);
            let has_call = outcome.messages.iter().any(|m| m.has_tool_calls());
            let has_result = outcome.messages.iter().any(|m| m.is_tool_result());
            assert_eq!(has_call, has_result, "limit {limit} split a tool pair");
        }
    }

    #[test]
    fn test_prune_inserts_summary() {
        let manager = ContextWindowManager::new(settings(2, true));
        let history = history_with_tool_pair();
        let outcome = manager.prune(&history, 200, 0.5);
        assert!(outcome.summary_inserted);
        let summary = outcome.messages.iter().find(|m| m.summary).unwrap();
        assert!(summary.content.contains("read_file"));
        assert_eq!(outcome.messages[1].id, summary.id);
    }

    #[test]
    fn test_prune_noop_under_target() {
        let manager = ContextWindowManager::new(settings(2, true));
        let history = history_with_tool_pair();
        let outcome = manager.prune(&history, 1_000_000, 0.5);
        assert_eq!(outcome.removed, 0);
        assert_eq!(outcome.messages.len(), history.len());
        assert!(!outcome.summary_inserted);
    }
}
