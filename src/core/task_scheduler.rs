//! 任务调度：工具执行池
//!
//! 同一批工具调用并行执行，用 Semaphore 限制同时运行的数量；信号量在所有运行之间共享，
//! 因此 max_concurrent_tools 是整个引擎的上限。

use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// 任务调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    /// 工具并发限制（默认 5）
    tool_semaphore: Arc<Semaphore>,
    max_concurrent_tools: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        let max = max_concurrent_tools.max(1);
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max)),
            max_concurrent_tools: max,
        }
    }

    /// 获取工具执行许可；许可随返回值 drop 归还
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.tool_semaphore).acquire_owned().await
    }

    pub fn available_permits(&self) -> usize {
        self.tool_semaphore.available_permits()
    }

    pub fn max_concurrent_tools(&self) -> usize {
        self.max_concurrent_tools
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(5)
    }
}
