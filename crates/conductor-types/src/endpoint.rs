//! Named endpoint binding types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named HTTP route binding a workflow with default inputs, scopes, and
/// a rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Unique endpoint name (the URL segment under `/v1/endpoints/`).
    pub name: String,
    /// Workflow path or remote reference to invoke.
    pub workflow: String,
    /// Default inputs; caller-supplied inputs are merged over these.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, Value>,
    /// Scope patterns permitted to invoke this endpoint. Patterns may end
    /// with `*` for prefix matching. An empty list means admin-only access
    /// (only keys with empty scopes, which match everything).
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Rate limit string, e.g. `"100/hour"`. None means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<String>,
    /// Timeout for synchronous invocation, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Whether unauthenticated callers may invoke this endpoint.
    #[serde(default)]
    pub public: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_toml_parse() {
        let toml_str = r#"
name = "deploy-prod"
workflow = "workflows/deploy.yaml"
scopes = ["deploy-*"]
rate_limit = "10/hour"

[inputs]
environment = "production"
"#;
        let ep: Endpoint = toml::from_str(toml_str).unwrap();
        assert_eq!(ep.name, "deploy-prod");
        assert_eq!(ep.scopes, vec!["deploy-*"]);
        assert_eq!(ep.rate_limit.as_deref(), Some("10/hour"));
        assert_eq!(ep.inputs["environment"], json!("production"));
        assert!(!ep.public);
    }

    #[test]
    fn test_endpoint_json_roundtrip() {
        let ep = Endpoint {
            name: "review-pr".to_string(),
            workflow: "workflows/review.yaml".to_string(),
            inputs: HashMap::new(),
            scopes: vec!["review".to_string()],
            rate_limit: None,
            timeout_secs: Some(120),
            public: false,
        };
        let json_str = serde_json::to_string(&ep).unwrap();
        let parsed: Endpoint = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.name, "review-pr");
        assert_eq!(parsed.timeout_secs, Some(120));
    }
}
