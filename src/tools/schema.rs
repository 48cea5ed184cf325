//! 工具参数 Schema：schemars 自动生成 + 调用前的轻量校验
//!
//! 内置工具的参数结构体派生 JsonSchema，由 schema_of 生成发给后端的 parameters；
//! validate_arguments 只检查 required 字段、基础类型与 enum，足以拒绝后端给出的空参数或错误类型。

use schemars::{schema_for, JsonSchema};
use serde_json::{json, Map, Value};

/// 由参数结构体生成 JSON Schema（去掉后端不需要的 $schema / title）
pub fn schema_of<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| json!({ "type": "object" }));
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    schema
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 按 schema 校验参数；错误信息可直接作为工具失败输出
pub fn validate_arguments(schema: &Value, args: &Map<String, Value>) -> Result<(), String> {
    let missing: Vec<&str> = schema["required"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .filter(|field| !args.contains_key(*field))
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required argument(s): {}", missing.join(", ")));
    }

    let Some(properties) = schema["properties"].as_object() else {
        return Ok(());
    };
    for (key, value) in args {
        let Some(prop) = properties.get(key) else {
            continue;
        };
        let ok = match &prop["type"] {
            Value::String(t) => type_matches(t, value),
            Value::Array(types) => types.iter().filter_map(Value::as_str).any(|t| type_matches(t, value)),
            _ => true,
        };
        if !ok {
            return Err(format!(
                "argument '{}' has type {}, expected {}",
                key,
                type_name(value),
                prop["type"]
            ));
        }
        if let Some(allowed) = prop["enum"].as_array() {
            if !allowed.contains(value) {
                return Err(format!("argument '{key}' must be one of {}", Value::Array(allowed.clone())));
            }
        }
    }
    Ok(())
}
