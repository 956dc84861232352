//! Tool interface for model-originated function calls.
//!
//! The bridge only defines the tool *interface*: specs advertised to the
//! conversational backend, and an executor that maps an invocation to a
//! result string. Executors may be I/O-bound, so every invocation runs
//! under a deadline; failures become `Error: ...` result strings and never
//! kill the call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::warn;

use crate::errors::ToolError;

/// Default per-invocation executor deadline.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// One advertised tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's input object.
    pub input_schema: serde_json::Value,
}

/// Executes tool invocations on behalf of the model.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, input: serde_json::Value) -> Result<String, ToolError>;
}

/// The outcome fed back to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub output: String,
    pub is_error: bool,
}

/// Process-lifetime registry of tool specs and their executor.
pub struct ToolRegistry {
    specs: Vec<ToolSpec>,
    executor: Arc<dyn ToolExecutor>,
    deadline: Duration,
}

impl ToolRegistry {
    pub fn new(specs: Vec<ToolSpec>, executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            specs,
            executor,
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// A registry with no tools; invocations always fail.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Arc::new(NoExecutor))
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Run one invocation under the deadline. Errors and timeouts map to a
    /// result string starting with `Error: ` and `is_error = true`.
    pub async fn run(&self, name: &str, input: serde_json::Value) -> ToolOutcome {
        let result = match timeout(self.deadline, self.executor.execute(name, input)).await {
            Ok(inner) => inner,
            Err(_) => Err(ToolError {
                name: name.to_string(),
                cause: format!("deadline of {:?} exceeded", self.deadline),
            }),
        };

        match result {
            Ok(output) => ToolOutcome {
                output,
                is_error: false,
            },
            Err(err) => {
                warn!(tool = name, "tool execution failed: {err}");
                ToolOutcome {
                    output: format!("Error: {err}"),
                    is_error: true,
                }
            }
        }
    }
}

struct NoExecutor;

#[async_trait]
impl ToolExecutor for NoExecutor {
    async fn execute(&self, name: &str, _input: serde_json::Value) -> Result<String, ToolError> {
        Err(ToolError {
            name: name.to_string(),
            cause: "no executor is registered".into(),
        })
    }
}
