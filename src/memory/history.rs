//! 会话历史存储抽象
//!
//! Run 结束后把本次产生的消息合并回会话历史。真正的持久化（JSON / KV 存储）由外部实现，
//! 引擎只依赖 HistoryStore；InMemoryHistoryStore 供测试与演示程序使用。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::memory::Message;

/// 会话历史存储接口
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// 读取会话完整历史；会话不存在时返回空
    async fn load(&self, session_id: &str) -> Vec<Message>;

    /// 追加消息到会话历史末尾
    async fn append(&self, session_id: &str, messages: Vec<Message>);

    /// 用新历史整体替换（剪枝后回写）
    async fn replace(&self, session_id: &str, messages: Vec<Message>);
}

/// 内存历史存储
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    sessions: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn load(&self, session_id: &str) -> Vec<Message> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn append(&self, session_id: &str, messages: Vec<Message>) {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .extend(messages);
    }

    async fn replace(&self, session_id: &str, messages: Vec<Message>) {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), messages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_history_append_and_load() {
        let store = InMemoryHistoryStore::new();
        assert!(store.load("s1").await.is_empty());
        store.append("s1", vec![Message::user("a")]).await;
        store.append("s1", vec![Message::assistant("b")]).await;
        let history = store.load("s1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "b");
        assert!(store.load("s2").await.is_empty());

        store.replace("s1", vec![Message::user("only")]).await;
        assert_eq!(store.load("s1").await.len(), 1);
    }
}
