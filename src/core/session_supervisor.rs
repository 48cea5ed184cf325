//! 会话监管：运行生命周期、中断、暂停与工具确认
//!
//! 每个运行持有一个 RunControl：CancellationToken 负责取消（中止后端流与工具任务），
//! watch 通道承载暂停/恢复，待确认的工具调用以 oneshot 排队（按请求顺序逐个确认）。
//! SessionSupervisor 维护「会话 → 当前活跃运行」的映射，同一会话同时只允许一个运行。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{oneshot, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::error::EngineError;

/// 外部对一次工具确认的答复
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationResponse {
    pub approved: bool,
    pub feedback: Option<String>,
}

/// 等待确认的工具调用（对外展示）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingToolConfirmation {
    pub call_id: String,
    pub tool_name: String,
    pub reason: String,
}

struct PendingSlot {
    info: PendingToolConfirmation,
    responder: oneshot::Sender<ConfirmationResponse>,
}

/// 单个运行的控制句柄
pub struct RunControl {
    run_id: String,
    session_id: String,
    cancel_token: CancellationToken,
    paused: watch::Sender<bool>,
    confirmations: Mutex<VecDeque<PendingSlot>>,
}

impl RunControl {
    pub fn new(run_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            cancel_token: CancellationToken::new(),
            paused,
            confirmations: Mutex::new(VecDeque::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 创建子 token（用于单个工具任务）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 触发取消；挂起的确认全部按拒绝处理
    pub fn cancel(&self) {
        self.cancel_token.cancel();
        let pending: Vec<PendingSlot> = self
            .confirmations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for slot in pending {
            let _ = slot.responder.send(ConfirmationResponse {
                approved: false,
                feedback: Some("run cancelled".to_string()),
            });
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// 暂停期间挂起（无忙等）；返回 false 表示等待期间被取消
    pub async fn wait_if_paused(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel_token.is_cancelled() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel_token.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }

    /// 登记一次待确认调用，返回答复接收端
    pub fn request_confirmation(
        &self,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> oneshot::Receiver<ConfirmationResponse> {
        let (tx, rx) = oneshot::channel();
        self.confirmations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(PendingSlot {
                info: PendingToolConfirmation {
                    call_id: call_id.into(),
                    tool_name: tool_name.into(),
                    reason: reason.into(),
                },
                responder: tx,
            });
        rx
    }

    /// 当前最早的待确认调用
    pub fn pending_confirmation(&self) -> Option<PendingToolConfirmation> {
        self.confirmations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .map(|slot| slot.info.clone())
    }

    /// 答复最早的待确认调用，返回其 call_id
    pub fn resolve_confirmation(&self, approved: bool, feedback: Option<String>) -> Result<String, EngineError> {
        let slot = self
            .confirmations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| EngineError::NoPendingConfirmation(self.run_id.clone()))?;
        let call_id = slot.info.call_id.clone();
        if slot.responder.send(ConfirmationResponse { approved, feedback }).is_err() {
            tracing::warn!(run_id = %self.run_id, call_id = %call_id, "confirmation receiver dropped");
        }
        Ok(call_id)
    }
}

/// 会话级监管：会话 → 活跃运行
#[derive(Default)]
pub struct SessionSupervisor {
    active: RwLock<HashMap<String, Arc<RunControl>>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新运行；会话已有活跃运行时拒绝
    pub async fn register(&self, control: Arc<RunControl>) -> Result<(), EngineError> {
        let mut active = self.active.write().await;
        let session_id = control.session_id().to_string();
        if active.contains_key(&session_id) {
            return Err(EngineError::RunInProgress(session_id));
        }
        active.insert(session_id, control);
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<RunControl>, EngineError> {
        self.active
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::NoActiveRun(session_id.to_string()))
    }

    /// 运行结束时注销（run_id 不匹配时不动，避免误删后来的运行）
    pub async fn release(&self, session_id: &str, run_id: &str) {
        let mut active = self.active.write().await;
        if active.get(session_id).is_some_and(|c| c.run_id() == run_id) {
            active.remove(session_id);
        }
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.active.read().await.contains_key(session_id)
    }

    /// 取消所有运行（进程退出时）
    pub async fn cancel_all(&self) {
        for control in self.active.read().await.values() {
            control.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_confirmations_resolve_in_order() {
        let control = RunControl::new("r1", "s1");
        let first = control.request_confirmation("c1", "write_file", "always confirm");
        let second = control.request_confirmation("c2", "delete_file", "destructive");
        assert_eq!(control.pending_confirmation().unwrap().call_id, "c1");

        assert_eq!(control.resolve_confirmation(true, None).unwrap(), "c1");
        assert_eq!(control.resolve_confirmation(false, Some("no".into())).unwrap(), "c2");
        assert!(first.await.unwrap().approved);
        let denied = second.await.unwrap();
        assert!(!denied.approved);
        assert_eq!(denied.feedback.as_deref(), Some("no"));
        assert!(matches!(
            control.resolve_confirmation(true, None),
            Err(EngineError::NoPendingConfirmation(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_resume_and_cancel() {
        let control = Arc::new(RunControl::new("r1", "s1"));
        assert!(control.wait_if_paused().await);

        control.pause();
        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        control.resume();
        assert!(waiter.await.unwrap());

        control.pause();
        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.wait_if_paused().await })
        };
        control.cancel();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_denies_pending_confirmations() {
        let control = RunControl::new("r1", "s1");
        let rx = control.request_confirmation("c1", "delete_file", "destructive");
        control.cancel();
        assert!(!rx.await.unwrap().approved);
        assert!(control.is_cancelled());
    }

    #[tokio::test]
    async fn test_supervisor_one_run_per_session() {
        let supervisor = SessionSupervisor::new();
        supervisor.register(Arc::new(RunControl::new("r1", "s1"))).await.unwrap();
        assert!(matches!(
            supervisor.register(Arc::new(RunControl::new("r2", "s1"))).await,
            Err(EngineError::RunInProgress(_))
        ));
        supervisor.register(Arc::new(RunControl::new("r3", "s2"))).await.unwrap();

        supervisor.release("s1", "other").await;
        assert!(supervisor.is_active("s1").await);
        supervisor.release("s1", "r1").await;
        assert!(!supervisor.is_active("s1").await);
        assert!(matches!(supervisor.get("s1").await, Err(EngineError::NoActiveRun(_))));
    }
}
