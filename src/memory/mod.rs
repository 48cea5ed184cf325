//! 记忆层：消息模型、token 估算、上下文窗口管理、会话历史存储

pub mod context_window;
pub mod conversation;
pub mod history;
pub mod token_budget;

pub use context_window::{ContextPressure, ContextWindowManager, PruneOutcome};
pub use conversation::{
    Attachment, Message, Role, TokenUsage, ToolCallRequest, ToolCallResult, ToolResultLink,
};
pub use history::{HistoryStore, InMemoryHistoryStore};
pub use token_budget::{ContextMetrics, TokenEstimator};
