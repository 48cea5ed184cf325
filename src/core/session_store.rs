//! 按会话分片的状态存储
//!
//! 外层 RwLock 只在查找/插入会话条目时短暂持有；每个会话的数据在自己的 Mutex 里，
//! 并发运行的不同会话不会互相阻塞。由构造方显式注入到各组件（恢复引擎等）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// 会话 id → 会话私有状态
#[derive(Debug)]
pub struct PerSessionStore<T> {
    sessions: RwLock<HashMap<String, Arc<Mutex<T>>>>,
}

impl<T: Default> PerSessionStore<T> {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// 取会话条目，不存在则创建
    pub fn entry(&self, session_id: &str) -> Arc<Mutex<T>> {
        if let Some(slot) = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
        {
            return Arc::clone(slot);
        }
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(sessions.entry(session_id.to_string()).or_default())
    }

    /// 在会话锁内修改
    pub fn with<R>(&self, session_id: &str, f: impl FnOnce(&mut T) -> R) -> R {
        let slot = self.entry(session_id);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// 只读访问已存在的会话；不存在返回 None 且不创建
    pub fn read<R>(&self, session_id: &str, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slot = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()?;
        let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&guard))
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Default> Default for PerSessionStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
