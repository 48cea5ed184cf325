//! 工具调用策略：禁用 → 拒绝；always_confirm 或破坏性 → 需确认；其余直接放行

use std::collections::HashSet;

use serde::Serialize;

use crate::config::ToolsSection;
use crate::tools::Tool;

/// 策略判定
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Confirm { reason: String },
    Reject { reason: String },
}

/// 工具策略（运行开始时由配置生成）
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    always_confirm: HashSet<String>,
    disabled: HashSet<String>,
    confirm_destructive: bool,
}

impl ToolPolicy {
    pub fn from_section(section: &ToolsSection) -> Self {
        Self {
            always_confirm: section.always_confirm.iter().cloned().collect(),
            disabled: section.disabled.iter().cloned().collect(),
            confirm_destructive: section.confirm_destructive,
        }
    }

    pub fn is_disabled(&self, tool_name: &str) -> bool {
        self.disabled.contains(tool_name)
    }

    /// tool 为 None（未注册）时放行，由执行器返回 Unknown tool 失败
    pub fn evaluate(&self, tool_name: &str, tool: Option<&dyn Tool>) -> PolicyDecision {
        if self.disabled.contains(tool_name) {
            return PolicyDecision::Reject {
                reason: format!("Tool '{tool_name}' is disabled by policy"),
            };
        }
        if self.always_confirm.contains(tool_name) {
            return PolicyDecision::Confirm {
                reason: format!("Tool '{tool_name}' always requires confirmation"),
            };
        }
        match tool {
            Some(t) if self.confirm_destructive && t.is_destructive() => PolicyDecision::Confirm {
                reason: format!("Tool '{tool_name}' is destructive"),
            },
            _ => PolicyDecision::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ExecutionContext, ToolCategory, ToolOutput};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Remove;

    #[async_trait]
    impl Tool for Remove {
        fn name(&self) -> &str {
            "delete_file"
        }
        fn description(&self) -> &str {
            "delete"
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::Delete
        }
        async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> Result<ToolOutput, String> {
            Ok(ToolOutput::ok(""))
        }
    }

    fn section() -> ToolsSection {
        ToolsSection {
            always_confirm: vec!["write_file".into()],
            disabled: vec!["shell".into()],
            ..ToolsSection::default()
        }
    }

    #[test]
    fn test_policy_decisions() {
        let policy = ToolPolicy::from_section(&section());
        assert!(matches!(policy.evaluate("shell", None), PolicyDecision::Reject { .. }));
        assert!(matches!(policy.evaluate("write_file", None), PolicyDecision::Confirm { .. }));
        assert!(matches!(policy.evaluate("delete_file", Some(&Remove)), PolicyDecision::Confirm { .. }));
        assert_eq!(policy.evaluate("read_file", None), PolicyDecision::Allow);
    }

    #[test]
    fn test_destructive_confirmation_can_be_disabled() {
        let mut s = section();
        s.confirm_destructive = false;
        let policy = ToolPolicy::from_section(&s);
        assert_eq!(policy.evaluate("delete_file", Some(&Remove)), PolicyDecision::Allow);
    }
}
