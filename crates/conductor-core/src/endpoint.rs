//! Named endpoint registry and scope matching.
//!
//! Endpoints are scope-guarded: a caller whose scopes do not match an
//! endpoint's name is shown nothing (404 at the HTTP layer, never 403).

use conductor_types::endpoint::Endpoint;
use conductor_types::error::{CoreError, CoreResult};
use dashmap::DashMap;

/// Match a user's scope list against an endpoint name.
///
/// - Empty user scopes grant access to everything (admin key).
/// - Exact equality matches.
/// - A pattern with a trailing `*` matches any name with that prefix
///   (`*` alone matches everything).
/// - Matching is case-sensitive.
pub fn scope_matches(user_scopes: &[String], endpoint_name: &str) -> bool {
    if user_scopes.is_empty() {
        return true;
    }
    user_scopes.iter().any(|pattern| {
        match pattern.strip_suffix('*') {
            Some(prefix) => endpoint_name.starts_with(prefix),
            None => pattern == endpoint_name,
        }
    })
}

/// Thread-safe endpoint registry.
pub struct EndpointRegistry {
    endpoints: DashMap<String, Endpoint>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
        }
    }

    /// Seed from configuration; duplicate names keep the first entry.
    pub fn from_config(endpoints: Vec<Endpoint>) -> Self {
        let registry = Self::new();
        for endpoint in endpoints {
            if let Err(e) = registry.add(endpoint) {
                tracing::warn!(error = %e, "skipping configured endpoint");
            }
        }
        registry
    }

    /// Register an endpoint. Rejects empty names and duplicates.
    pub fn add(&self, endpoint: Endpoint) -> CoreResult<()> {
        if endpoint.name.trim().is_empty() {
            return Err(CoreError::invalid_input("endpoint name must not be empty"));
        }
        match self.endpoints.entry(endpoint.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CoreError::already_exists(
                format!("endpoint '{}' already exists", endpoint.name),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(endpoint);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Endpoint> {
        self.endpoints.get(name).map(|e| e.value().clone())
    }

    /// Replace an existing endpoint.
    pub fn update(&self, endpoint: Endpoint) -> CoreResult<()> {
        match self.endpoints.get_mut(&endpoint.name) {
            Some(mut slot) => {
                *slot = endpoint;
                Ok(())
            }
            None => Err(CoreError::not_found(format!(
                "endpoint '{}' not found",
                endpoint.name
            ))),
        }
    }

    pub fn remove(&self, name: &str) -> CoreResult<()> {
        self.endpoints
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CoreError::not_found(format!("endpoint '{name}' not found")))
    }

    /// All endpoints, sorted by name.
    pub fn list(&self) -> Vec<Endpoint> {
        let mut out: Vec<Endpoint> = self.endpoints.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Endpoints visible to the given scopes, sorted by name.
    pub fn visible(&self, user_scopes: &[String]) -> Vec<Endpoint> {
        self.list()
            .into_iter()
            .filter(|e| scope_matches(user_scopes, &e.name))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.endpoints.len()
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
