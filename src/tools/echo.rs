//! Echo 工具（测试用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::schema_of;
use crate::tools::{ExecutionContext, Tool, ToolError, ToolOutput};

#[derive(Deserialize, JsonSchema)]
struct EchoArgs {
    /// 要回显的文本
    text: String,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text (for testing). Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<EchoArgs>()
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> Result<ToolOutput, String> {
        let args: EchoArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()).to_string())?;
        Ok(ToolOutput::ok(args.text))
    }
}
