//! Webhook ingress: signature verification, event filtering, input
//! mapping.
//!
//! Each configured route accepts HTTP POSTs, verifies source-specific
//! authenticity (always via constant-time comparison), optionally filters
//! by event, and maps payload fields to workflow inputs.
//!
//! | Source  | Header(s)                                         | Canonical string        |
//! |---------|---------------------------------------------------|-------------------------|
//! | generic | `X-Webhook-Signature` / `X-Signature` / `Bearer`  | raw body                |
//! | github  | `X-Hub-Signature-256: sha256=hex`                 | raw body                |
//! | slack   | `X-Slack-Request-Timestamp` + `X-Slack-Signature` | `"v0:" + ts + ":" + body` |

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use conductor_types::config::{WebhookRouteConfig, WebhookSource};
use conductor_types::error::{CoreError, CoreResult};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum Slack timestamp skew before a request is rejected.
pub const SLACK_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

// ---------------------------------------------------------------------------
// Verification primitives
// ---------------------------------------------------------------------------

/// Verify an HMAC-SHA256 hex signature over `body`.
pub fn verify_hmac_sha256(secret: &[u8], body: &[u8], signature_hex: &str) -> CoreResult<()> {
    let expected = hex_decode(signature_hex)
        .ok_or_else(|| CoreError::unauthorized("malformed signature"))?;
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| CoreError::fatal(format!("invalid HMAC key: {e}")))?;
    mac.update(body);
    // Constant-time verification via the hmac crate.
    mac.verify_slice(&expected)
        .map_err(|_| CoreError::unauthorized("signature mismatch"))
}

/// Compute an HMAC-SHA256 hex signature (test vectors, client tooling).
pub fn compute_hmac_sha256_hex(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    hex_encode(&mac.finalize().into_bytes())
}

/// Constant-time byte comparison. Time taken is independent of how many
/// bytes match.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || hex.is_empty() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Outcome of handling a verified webhook request.
#[derive(Debug)]
pub enum WebhookDecision {
    /// Signature verified and event accepted: submit the workflow.
    Accepted {
        workflow: String,
        event: String,
        inputs: HashMap<String, Value>,
    },
    /// Signature verified but the event is not in the route's allow-list.
    Ignored { event: String },
}

struct WebhookRoute {
    config: WebhookRouteConfig,
    secret: SecretString,
}

/// Path-keyed webhook route table.
pub struct WebhookRouter {
    routes: DashMap<String, WebhookRoute>,
}

impl WebhookRouter {
    pub fn new(configs: Vec<WebhookRouteConfig>) -> Self {
        let routes = DashMap::new();
        for config in configs {
            let secret = SecretString::from(config.secret.clone());
            routes.insert(normalize_path(&config.path), WebhookRoute { config, secret });
        }
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.key().clone()).collect()
    }

    /// Verify and route a webhook request. `headers` carries lowercase
    /// header names.
    pub fn handle(
        &self,
        path: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> CoreResult<WebhookDecision> {
        self.handle_at(path, headers, body, Utc::now())
    }

    /// As `handle`, with an injected clock for timestamp-window checks.
    pub fn handle_at(
        &self,
        path: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> CoreResult<WebhookDecision> {
        let normalized = normalize_path(path);
        let route = self
            .routes
            .get(&normalized)
            .ok_or_else(|| CoreError::not_found(format!("no webhook at '{normalized}'")))?;

        let secret = route.secret.expose_secret().as_bytes();
        match route.config.source {
            WebhookSource::Generic => verify_generic(secret, headers, body)?,
            WebhookSource::Github => verify_github(secret, headers, body)?,
            WebhookSource::Slack => verify_slack(secret, headers, body, now)?,
        }

        let event = extract_event(route.config.source, headers, body);
        if !route.config.events.is_empty() && !route.config.events.contains(&event) {
            return Ok(WebhookDecision::Ignored { event });
        }

        let payload: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        let inputs = map_inputs(&route.config.input_mapping, &event, &payload);
        Ok(WebhookDecision::Accepted {
            workflow: route.config.workflow.clone(),
            event,
            inputs,
        })
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    trimmed.to_string()
}

// ---------------------------------------------------------------------------
// Source-specific verification
// ---------------------------------------------------------------------------

fn verify_generic(
    secret: &[u8],
    headers: &HashMap<String, String>,
    body: &[u8],
) -> CoreResult<()> {
    let signature = headers
        .get("x-webhook-signature")
        .or_else(|| headers.get("x-signature"))
        .map(|s| s.strip_prefix("sha256=").unwrap_or(s).to_string())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|a| a.strip_prefix("Bearer "))
                .map(str::to_string)
        })
        .ok_or_else(|| CoreError::unauthorized("missing webhook signature"))?;
    verify_hmac_sha256(secret, body, &signature)
}

fn verify_github(
    secret: &[u8],
    headers: &HashMap<String, String>,
    body: &[u8],
) -> CoreResult<()> {
    let header = headers
        .get("x-hub-signature-256")
        .ok_or_else(|| CoreError::unauthorized("missing X-Hub-Signature-256"))?;
    let hex = header
        .strip_prefix("sha256=")
        .ok_or_else(|| CoreError::unauthorized("malformed X-Hub-Signature-256"))?;
    verify_hmac_sha256(secret, body, hex)
}

fn verify_slack(
    secret: &[u8],
    headers: &HashMap<String, String>,
    body: &[u8],
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let timestamp = headers
        .get("x-slack-request-timestamp")
        .ok_or_else(|| CoreError::unauthorized("missing X-Slack-Request-Timestamp"))?;
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| CoreError::unauthorized("malformed Slack timestamp"))?;
    if (now.timestamp() - ts).abs() > SLACK_TIMESTAMP_TOLERANCE_SECS {
        return Err(CoreError::unauthorized("Slack timestamp outside tolerance"));
    }

    let header = headers
        .get("x-slack-signature")
        .ok_or_else(|| CoreError::unauthorized("missing X-Slack-Signature"))?;
    let hex = header
        .strip_prefix("v0=")
        .ok_or_else(|| CoreError::unauthorized("malformed X-Slack-Signature"))?;

    // Canonical string: "v0:" + ts + ":" + body, byte-exact.
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| CoreError::fatal(format!("invalid HMAC key: {e}")))?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    let expected =
        hex_decode(hex).ok_or_else(|| CoreError::unauthorized("malformed signature"))?;
    mac.verify_slice(&expected)
        .map_err(|_| CoreError::unauthorized("signature mismatch"))
}

// ---------------------------------------------------------------------------
// Event extraction and input mapping
// ---------------------------------------------------------------------------

fn extract_event(
    source: WebhookSource,
    headers: &HashMap<String, String>,
    body: &[u8],
) -> String {
    let event = match source {
        WebhookSource::Generic => headers
            .get("x-event-type")
            .or_else(|| headers.get("x-webhook-event"))
            .or_else(|| headers.get("x-event"))
            .cloned(),
        WebhookSource::Github => headers.get("x-github-event").cloned(),
        WebhookSource::Slack => {
            let payload: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
            payload["event"]["type"]
                .as_str()
                .or_else(|| payload["type"].as_str())
                .map(str::to_string)
        }
    };
    event.unwrap_or_else(|| "webhook".to_string())
}

/// Apply an input mapping. Entries starting with `$.` are JSONPath-like
/// expressions over the parsed body; anything else is a literal.
/// Unresolved paths yield null inputs. An empty mapping forwards
/// `{event, payload}`.
fn map_inputs(
    mapping: &HashMap<String, String>,
    event: &str,
    payload: &Value,
) -> HashMap<String, Value> {
    if mapping.is_empty() {
        return HashMap::from([
            ("event".to_string(), json!(event)),
            ("payload".to_string(), payload.clone()),
        ]);
    }

    mapping
        .iter()
        .map(|(name, expr)| {
            let value = match expr.strip_prefix("$.") {
                Some(path) => json_path(payload, path).cloned().unwrap_or(Value::Null),
                None => json!(expr),
            };
            (name.clone(), value)
        })
        .collect()
}

fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
