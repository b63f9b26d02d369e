//! Workflow parsing and submission-time validation.
//!
//! Parsing is a capability consumed by the runner; the default
//! `YamlWorkflowParser` covers the service's own YAML format. Validation
//! failures are surfaced at submission and never become run records.

use std::collections::HashMap;
use std::collections::HashSet;

use conductor_types::error::{CoreError, CoreResult};
use conductor_types::workflow::{InputDecl, StepConfig, WorkflowDefinition};
use serde_json::Value;

/// Parses workflow definition bytes.
pub trait WorkflowParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> CoreResult<WorkflowDefinition>;
}

/// Default YAML parser with structural validation.
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlWorkflowParser;

impl WorkflowParser for YamlWorkflowParser {
    fn parse(&self, bytes: &[u8]) -> CoreResult<WorkflowDefinition> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CoreError::validation(format!("workflow is not UTF-8: {e}")))?;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(text)
            .map_err(|e| CoreError::validation(format!("invalid workflow YAML: {e}")))?;
        validate(&def)?;
        Ok(def)
    }
}

/// Structural validation of a parsed definition.
pub fn validate(def: &WorkflowDefinition) -> CoreResult<()> {
    if def.name.trim().is_empty() {
        return Err(CoreError::validation("workflow name must not be empty"));
    }

    let mut seen = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(CoreError::validation("step id must not be empty"));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(CoreError::validation(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        if let StepConfig::Wait { seconds } = &step.config {
            if *seconds < 0.0 || !seconds.is_finite() {
                return Err(CoreError::validation(format!(
                    "step '{}': wait seconds must be a non-negative number",
                    step.id
                )));
            }
        }
    }
    Ok(())
}

/// Check that every required input without a default was supplied.
pub fn check_required_inputs(
    def: &WorkflowDefinition,
    supplied: &HashMap<String, Value>,
) -> CoreResult<()> {
    for (name, decl) in &def.inputs {
        if decl.required && decl.default.is_none() && !supplied.contains_key(name) {
            return Err(CoreError::validation(format!(
                "required input '{name}' missing"
            )));
        }
    }
    Ok(())
}

/// Merge supplied inputs over declared defaults.
pub fn merge_input_defaults(
    inputs: &HashMap<String, InputDecl>,
    supplied: HashMap<String, Value>,
) -> HashMap<String, Value> {
    let mut merged: HashMap<String, Value> = inputs
        .iter()
        .filter_map(|(name, decl)| decl.default.clone().map(|v| (name.clone(), v)))
        .collect();
    merged.extend(supplied);
    merged
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
