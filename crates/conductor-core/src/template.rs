//! Template resolution over the run context.
//!
//! Steps and declared outputs reference prior results with
//! `{{ steps.<id>.output }}`, `{{ inputs.<name> }}`, and
//! `{{ trigger.<field> }}` placeholders. The context is a JSON object of
//! the shape `{"steps": {...}, "inputs": {...}, "trigger": ...}`.

use conductor_types::error::CoreResult;
use serde_json::Value;

/// Resolves templates against a run context.
pub trait TemplateEngine: Send + Sync {
    /// Interpolate placeholders into a string. Unknown references are left
    /// as-is (not an error).
    fn render(&self, template: &str, ctx: &Value) -> CoreResult<String>;

    /// Resolve a declared output. A template that is exactly one
    /// placeholder yields the referenced JSON value (null when the path is
    /// unresolved, e.g. because the step was skipped); anything else is
    /// string interpolation.
    fn resolve_value(&self, template: &str, ctx: &Value) -> CoreResult<Value>;
}

/// Default placeholder-substitution engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleTemplateEngine;

impl TemplateEngine for SimpleTemplateEngine {
    fn render(&self, template: &str, ctx: &Value) -> CoreResult<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let expr = after[..end].trim();
                    match lookup_path(ctx, expr) {
                        Some(value) => out.push_str(&value_to_string(value)),
                        // Leave the placeholder untouched.
                        None => {
                            out.push_str("{{");
                            out.push_str(&after[..end]);
                            out.push_str("}}");
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str("{{");
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    fn resolve_value(&self, template: &str, ctx: &Value) -> CoreResult<Value> {
        let trimmed = template.trim();
        if let Some(inner) = trimmed
            .strip_prefix("{{")
            .and_then(|s| s.strip_suffix("}}"))
        {
            let expr = inner.trim();
            // Whole-placeholder template: return the JSON value itself.
            if !expr.contains("{{") {
                return Ok(lookup_path(ctx, expr).cloned().unwrap_or(Value::Null));
            }
        }
        self.render(template, ctx).map(Value::String)
    }
}

/// Walk a dot path (`steps.gather.output`) through a JSON value. Numeric
/// segments index into arrays.
fn lookup_path<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = ctx;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "steps": {
                "gather": {"output": "headline list"},
                "count": {"output": 5}
            },
            "inputs": {"topic": "rust"},
            "trigger": {"ref": "refs/heads/main"}
        })
    }

    #[test]
    fn test_render_step_output() {
        let engine = SimpleTemplateEngine;
        let out = engine
            .render("Summarize {{ steps.gather.output }} about {{ inputs.topic }}", &ctx())
            .unwrap();
        assert_eq!(out, "Summarize headline list about rust");
    }

    #[test]
    fn test_render_non_string_values_are_json() {
        let engine = SimpleTemplateEngine;
        let out = engine.render("count={{ steps.count.output }}", &ctx()).unwrap();
        assert_eq!(out, "count=5");
    }

    #[test]
    fn test_render_unknown_reference_left_as_is() {
        let engine = SimpleTemplateEngine;
        let out = engine.render("x={{ steps.missing.output }}", &ctx()).unwrap();
        assert_eq!(out, "x={{ steps.missing.output }}");
    }

    #[test]
    fn test_render_unterminated_placeholder() {
        let engine = SimpleTemplateEngine;
        let out = engine.render("broken {{ steps.gather", &ctx()).unwrap();
        assert_eq!(out, "broken {{ steps.gather");
    }

    #[test]
    fn test_resolve_value_whole_placeholder_returns_json() {
        let engine = SimpleTemplateEngine;
        let value = engine
            .resolve_value("{{ steps.count.output }}", &ctx())
            .unwrap();
        assert_eq!(value, json!(5));
    }

    #[test]
    fn test_resolve_value_missing_path_is_null() {
        let engine = SimpleTemplateEngine;
        let value = engine
            .resolve_value("{{ steps.skipped.output }}", &ctx())
            .unwrap();
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn test_resolve_value_interpolation_yields_string() {
        let engine = SimpleTemplateEngine;
        let value = engine
            .resolve_value("topic: {{ inputs.topic }}", &ctx())
            .unwrap();
        assert_eq!(value, json!("topic: rust"));
    }

    #[test]
    fn test_lookup_array_index() {
        let ctx = json!({"trigger": {"commits": [{"id": "abc"}, {"id": "def"}]}});
        let engine = SimpleTemplateEngine;
        let value = engine
            .resolve_value("{{ trigger.commits.1.id }}", &ctx)
            .unwrap();
        assert_eq!(value, json!("def"));
    }
}
