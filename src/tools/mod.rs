//! 工具层：Tool trait 与注册表、参数校验、调用策略、结果缓存、执行器、沙箱文件系统工具

pub mod cache;
pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod policy;
pub mod registry;
pub mod schema;

pub use cache::{CacheStats, Fingerprint, ToolResultCache};
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use filesystem::{DeleteFileTool, ListDirTool, ReadFileTool, SafeFs, SearchFilesTool, WriteFileTool};
pub use policy::{PolicyDecision, ToolPolicy};
pub use registry::{
    normalize_path, ExecutionContext, Tool, ToolCategory, ToolDefinition, ToolError, ToolOutput, ToolRegistry,
};
pub use schema::{schema_of, validate_arguments};
