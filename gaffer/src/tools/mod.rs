//! Tool tier: declared capabilities an agent can call.
//!
//! Tools are opaque to the graph — they have a name, a description, a JSON
//! parameter schema, and an async `call`. The invoker executes them inside
//! its tool-call loop; the engine itself never calls a tool.
//!
//! Error policy: a failing tool is retried once inside
//! [`call_with_retry`]; a second failure is surfaced into the conversation
//! as a structured error message. Tool errors are never swallowed.

pub mod fs;
pub mod retrieval;
pub mod subagents;

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Errors raised by tool implementations.
#[derive(Debug, Error, Diagnostic)]
pub enum ToolError {
    #[error("invalid arguments for {tool}: {message}")]
    #[diagnostic(code(gaffer::tools::invalid_args))]
    InvalidArgs { tool: String, message: String },

    #[error("{tool}: path not found: {path}")]
    #[diagnostic(code(gaffer::tools::not_found))]
    NotFound { tool: String, path: String },

    #[error("{tool}: path escapes the repository root: {path}")]
    #[diagnostic(
        code(gaffer::tools::outside_repo),
        help("File tools only accept repo-relative paths without `..` escapes.")
    )]
    OutsideRepo { tool: String, path: String },

    #[error("{tool}: io error: {source}")]
    #[diagnostic(code(gaffer::tools::io))]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} is not available: {reason}")]
    #[diagnostic(code(gaffer::tools::unavailable))]
    Unavailable { tool: String, reason: String },

    #[error("{tool} failed: {message}")]
    #[diagnostic(code(gaffer::tools::failed))]
    Failed { tool: String, message: String },
}

impl ToolError {
    /// Only transient failures are worth the single in-adapter retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Io { .. } | ToolError::Failed { .. })
    }
}

/// A declared capability with a JSON input/output shape.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema describing the `call` arguments.
    fn parameters(&self) -> Value;
    async fn call(&self, args: Value) -> Result<Value, ToolError>;
}

/// Execute a tool with the tier's one-retry policy.
///
/// The first transient failure is retried once; the retry outcome (or a
/// non-transient first failure) is returned as-is.
pub async fn call_with_retry(tool: &dyn Tool, args: Value) -> Result<Value, ToolError> {
    match tool.call(args.clone()).await {
        Ok(value) => Ok(value),
        Err(first) if first.is_transient() => {
            warn!(tool = tool.name(), error = %first, "tool failed, retrying once");
            tool.call(args).await
        }
        Err(first) => Err(first),
    }
}

/// Helpers for pulling typed fields out of tool argument objects.
pub(crate) fn required_str<'a>(
    args: &'a Value,
    field: &str,
    tool: &str,
) -> Result<&'a str, ToolError> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArgs {
            tool: tool.to_string(),
            message: format!("missing string field `{field}`"),
        })
}

pub(crate) fn optional_u64(args: &Value, field: &str) -> Option<u64> {
    args.get(field).and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    struct FlakyTool {
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails a configured number of times"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        async fn call(&self, _args: Value) -> Result<Value, ToolError> {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(ToolError::Failed {
                    tool: "flaky".into(),
                    message: "transient".into(),
                });
            }
            Ok(json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let tool = FlakyTool {
            failures_left: Mutex::new(1),
        };
        let value = call_with_retry(&tool, json!({})).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn second_failure_surfaces() {
        let tool = FlakyTool {
            failures_left: Mutex::new(2),
        };
        assert!(call_with_retry(&tool, json!({})).await.is_err());
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        struct Strict;
        #[async_trait]
        impl Tool for Strict {
            fn name(&self) -> &str {
                "strict"
            }
            fn description(&self) -> &str {
                ""
            }
            fn parameters(&self) -> Value {
                json!({"type": "object"})
            }
            async fn call(&self, _args: Value) -> Result<Value, ToolError> {
                Err(ToolError::InvalidArgs {
                    tool: "strict".into(),
                    message: "bad".into(),
                })
            }
        }
        let err = call_with_retry(&Strict, json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs { .. }));
    }
}
