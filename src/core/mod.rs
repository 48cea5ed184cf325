//! 核心编排层：错误与失败原因、恢复引擎、运行状态、会话监管、工具并发调度、运行引擎

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_store;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;

pub use error::{BudgetKind, EngineError, FailureReason, RunFailure};
pub use orchestrator::{EngineSettings, RunEngine, RunHandle};
pub use recovery::{ProviderRecovery, RecoveryEngine, RecoverySuggestion, SessionStats, Severity};
pub use session_store::PerSessionStore;
pub use session_supervisor::{ConfirmationResponse, PendingToolConfirmation, RunControl, SessionSupervisor};
pub use state::{RunConfig, RunSnapshot, RunStatus};
pub use task_scheduler::TaskScheduler;
