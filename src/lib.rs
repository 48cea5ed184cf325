//! Bee Engine - 多后端、工具调用型智能体运行引擎
//!
//! 模块划分：
//! - **config**: 引擎配置加载（TOML + 环境变量，支持热更新）
//! - **core**: 运行引擎、状态与失败原因、错误恢复、会话监管、工具并发调度
//! - **llm**: 后端格式（OpenAI / Anthropic / Gemini）、客户端、provider 注册表、任务路由
//! - **memory**: 消息模型、token 估算、上下文窗口管理、会话历史
//! - **observability**: 日志初始化
//! - **run**: 运行主循环、工具批处理流水线、运行事件
//! - **tools**: 工具注册表、参数校验、策略、结果缓存、执行器与文件系统工具

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod run;
pub mod tools;
