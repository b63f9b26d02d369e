//! Workflow definition types.
//!
//! A workflow is an ordered list of typed steps. YAML submissions parse into
//! `WorkflowDefinition`, which is the single source of truth for a
//! workflow's shape. Step execution itself is behind the `StepExecutor`
//! capability in conductor-core; these types only describe the work.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition parsed from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Logical workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared inputs (name -> declaration).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, InputDecl>,
    /// Ordered list of steps.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Declared outputs (name -> template resolved at completion).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
}

/// Declaration of a workflow input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputDecl {
    /// Whether submission must supply a value when no default exists.
    #[serde(default)]
    pub required: bool,
    /// Default value used when the submission omits the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single step in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step id, unique within a workflow.
    pub id: String,
    /// Human-readable name. Falls back to the id for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Step-type specific configuration, tagged by `type` in YAML.
    #[serde(flatten)]
    pub config: StepConfig,
    /// What to do when the step fails.
    #[serde(default)]
    pub on_error: ErrorStrategy,
    /// Step-level timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    /// Display name: explicit name or the step id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Step-type specific configuration.
///
/// Internally tagged by `type` to match YAML structure:
/// ```yaml
/// steps:
///   - id: summarize
///     type: llm
///     prompt: "Summarize {{ steps.gather.output }}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Invoke a remote LLM provider with a prompt.
    Llm {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// Run a shell command.
    Shell {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workdir: Option<String>,
    },
    /// File operation.
    File {
        operation: FileOperation,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    /// Does nothing; produces an empty output.
    Noop,
    /// Sleep for the given number of seconds (observes cancellation).
    Wait { seconds: f64 },
}

impl StepConfig {
    /// The step-type tag as it appears in YAML.
    pub fn type_str(&self) -> &'static str {
        match self {
            StepConfig::Llm { .. } => "llm",
            StepConfig::Shell { .. } => "shell",
            StepConfig::File { .. } => "file",
            StepConfig::Noop => "noop",
            StepConfig::Wait { .. } => "wait",
        }
    }
}

/// Operation for File steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Read,
    Write,
    Append,
    Delete,
}

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Fail the run (default).
    #[default]
    Fail,
    /// Log the failure and advance to the next step.
    Ignore,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
