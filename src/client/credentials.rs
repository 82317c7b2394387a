//! Credential lookup.
//!
//! K_i: Each descriptor names exactly one secret.
//! B_i: The secret is present in the store (might not be → per-query error text).

use std::collections::HashMap;

/// Externally owned secret store, consulted by name.
pub trait CredentialStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads secrets from the process environment. Empty values count as absent.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialStore for EnvCredentials {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

/// Fixed in-memory secrets.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    secrets: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn get(&self, name: &str) -> Option<String> {
        self.secrets.get(name).filter(|v| !v.trim().is_empty()).cloned()
    }
}

/// Header name carrying a per-request credential override for `model_id`.
pub fn override_header_name(model_id: &str) -> String {
    format!("X-{model_id}-Key")
}

/// Look up a per-request override in caller-supplied headers.
pub fn header_override(headers: &reqwest::header::HeaderMap, model_id: &str) -> Option<String> {
    headers
        .get(override_header_name(model_id).as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
