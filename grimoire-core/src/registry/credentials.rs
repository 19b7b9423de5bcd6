//! Credential lookup for remote providers.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;

/// Answers whether a provider has a usable API key.
pub trait CredentialStore: Send + Sync + Debug + 'static {
    /// The API key for `provider`, if one is configured.
    fn api_key(&self, provider: &str) -> Option<String>;

    /// Whether `provider` works without a key (local HTTP servers).
    fn is_keyless(&self, _provider: &str) -> bool {
        false
    }

    fn has_credential(&self, provider: &str) -> bool {
        self.is_keyless(provider)
            || self
                .api_key(provider)
                .is_some_and(|key| !key.trim().is_empty())
    }
}

/// Reads keys from environment variables at lookup time.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials {
    vars: HashMap<String, String>,
    keyless: HashSet<String>,
}

impl EnvCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `provider`'s key from `var`.
    pub fn with_var(mut self, provider: impl Into<String>, var: impl Into<String>) -> Self {
        self.vars.insert(provider.into(), var.into());
        self
    }

    pub fn with_keyless(mut self, provider: impl Into<String>) -> Self {
        self.keyless.insert(provider.into());
        self
    }

    /// Conventional variable for a provider: `OPENAI` → `OPENAI_API_KEY`.
    pub fn default_var(provider: &str) -> String {
        format!("{}_API_KEY", provider.to_ascii_uppercase().replace('-', "_"))
    }
}

impl CredentialStore for EnvCredentials {
    fn api_key(&self, provider: &str) -> Option<String> {
        let var = self
            .vars
            .get(provider)
            .cloned()
            .unwrap_or_else(|| Self::default_var(provider));
        std::env::var(var).ok()
    }

    fn is_keyless(&self, provider: &str) -> bool {
        self.keyless.contains(provider)
    }
}

/// Fixed keys, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    keys: HashMap<String, String>,
    keyless: HashSet<String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, provider: impl Into<String>, key: impl Into<String>) -> Self {
        self.keys.insert(provider.into(), key.into());
        self
    }

    pub fn with_keyless(mut self, provider: impl Into<String>) -> Self {
        self.keyless.insert(provider.into());
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn api_key(&self, provider: &str) -> Option<String> {
        self.keys.get(provider).cloned()
    }

    fn is_keyless(&self, provider: &str) -> bool {
        self.keyless.contains(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_keys_do_not_count() {
        let creds = StaticCredentials::new()
            .with_key("openai", "sk-test")
            .with_key("deepseek", "   ")
            .with_keyless("ollama");

        assert!(creds.has_credential("openai"));
        assert!(!creds.has_credential("deepseek"));
        assert!(creds.has_credential("ollama"));
        assert!(!creds.has_credential("anthropic"));
    }

    #[test]
    fn default_env_var_name() {
        assert_eq!(EnvCredentials::default_var("deepseek"), "DEEPSEEK_API_KEY");
        assert_eq!(EnvCredentials::default_var("open-router"), "OPEN_ROUTER_API_KEY");
    }
}
