//! 运行层：主循环、工具批处理流水线、运行事件

pub mod events;
pub mod loop_;
pub mod pipeline;

pub use events::{RunEvent, RunReporter};
pub use loop_::{run_loop, RunDeps, RunInput, RunOutcome, RunSession};
pub use pipeline::ToolPipeline;
