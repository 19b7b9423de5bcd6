//! Configuration artifacts.
//!
//! A [`ModelCatalog`] is loaded once at startup from TOML or JSON (picked by
//! file extension). It lists the providers, the models and the dispatcher
//! settings; everything has a default except the models themselves.

use crate::concurrency::RetryPolicy;
use crate::error::GrimoireError;
use crate::rate_limit::{RateLimitConfig, CODE_EXECUTION, GENERATION};
use crate::registry::{
    Backend, BackendKind, EnvCredentials, LocalProcessSpec, ModelDescriptor, Readiness,
    DEFAULT_REPLY_DELIMITER,
};
use crate::types::ModelParameters;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Wire protocol of a remote provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI or any OpenAI-compatible endpoint
    OpenAi,
    DeepSeek,
    Ollama,
}

/// `[providers.<id>]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub kind: Option<ProviderKind>,
    #[serde(default)]
    pub api_base: Option<String>,
    /// Environment variable holding the key; defaults to `<ID>_API_KEY`
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// The provider needs no key
    #[serde(default)]
    pub keyless: bool,
}

impl ProviderSettings {
    /// Explicit kind, or a guess from the provider id.
    pub fn kind_for(&self, provider_id: &str) -> ProviderKind {
        self.kind.unwrap_or(match provider_id {
            "deepseek" => ProviderKind::DeepSeek,
            "ollama" => ProviderKind::Ollama,
            _ => ProviderKind::OpenAi,
        })
    }
}

fn enabled_default() -> bool {
    true
}

/// `[models.<id>]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub backend: BackendKind,
    /// Remote: provider id from `[providers]`
    #[serde(default)]
    pub provider: Option<String>,
    /// Remote: model name sent to the provider; defaults to the model id
    #[serde(default)]
    pub remote_model: Option<String>,
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub args_template: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub reply_delimiter: Option<String>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub parameters: ModelParameters,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

impl ModelConfig {
    /// Validate and turn into a descriptor. Readiness starts unchecked.
    pub fn to_descriptor(&self, id: &str) -> Result<ModelDescriptor, GrimoireError> {
        let backend = match self.backend {
            BackendKind::Remote => {
                let provider = self.provider.clone().ok_or_else(|| {
                    GrimoireError::configuration(format!("model '{id}': remote backend needs a provider"))
                })?;
                Backend::Remote {
                    provider,
                    model: self.remote_model.clone().unwrap_or_else(|| id.to_string()),
                }
            }
            BackendKind::LocalProcess => {
                let binary_path = self.binary_path.clone().ok_or_else(|| {
                    GrimoireError::configuration(format!(
                        "model '{id}': local_process backend needs a binary_path"
                    ))
                })?;
                Backend::LocalProcess(LocalProcessSpec {
                    binary_path,
                    model_path: self.model_path.clone(),
                    args_template: self.args_template.clone(),
                    working_dir: self.working_dir.clone(),
                    reply_delimiter: self
                        .reply_delimiter
                        .clone()
                        .unwrap_or_else(|| DEFAULT_REPLY_DELIMITER.to_string()),
                    max_concurrent: self.max_concurrent.unwrap_or(1).max(1),
                    timeout: self.timeout_secs.map(Duration::from_secs),
                })
            }
        };

        Ok(ModelDescriptor {
            id: id.to_string(),
            name: self.name.clone().unwrap_or_else(|| id.to_string()),
            backend,
            parameters: self.parameters.clone(),
            readiness: Readiness::NotInstalled("not checked".to_string()),
        })
    }
}

/// `[dispatcher]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on one generation, backend call and retries included
    pub request_timeout_secs: u64,
    /// Conversations idle longer than this are swept
    pub conversation_max_age_hours: u64,
    pub cleanup_interval_secs: u64,
    /// Backoff for remote provider calls
    pub retry: RetryPolicy,
    /// Attempts for local processes; 1 means failures surface as-is
    pub local_max_attempts: u32,
    /// Time a cancelled process gets between SIGTERM and SIGKILL
    pub process_grace_period_secs: u64,
    /// Rate limit key for callers that did not identify themselves
    pub anonymous_caller: String,
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

impl DispatcherConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn conversation_max_age(&self) -> Duration {
        Duration::from_secs(self.conversation_max_age_hours * 3600)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn process_grace_period(&self) -> Duration {
        Duration::from_secs(self.process_grace_period_secs)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_local_max_attempts(mut self, attempts: u32) -> Self {
        self.local_max_attempts = attempts.max(1);
        self
    }

    pub fn with_rate_limit(mut self, category: impl Into<String>, config: RateLimitConfig) -> Self {
        self.rate_limits.insert(category.into(), config);
        self
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let mut rate_limits = HashMap::new();
        rate_limits.insert(
            GENERATION.to_string(),
            RateLimitConfig::new(30, 60).with_block_seconds(60),
        );
        rate_limits.insert(
            CODE_EXECUTION.to_string(),
            RateLimitConfig::new(10, 60).with_block_seconds(300),
        );

        Self {
            request_timeout_secs: 120,
            conversation_max_age_hours: 24,
            cleanup_interval_secs: 30 * 60,
            retry: RetryPolicy::default(),
            local_max_attempts: 1,
            process_grace_period_secs: 5,
            anonymous_caller: "anonymous".to_string(),
            rate_limits,
        }
    }
}

fn default_model_id() -> String {
    "default".to_string()
}

/// The startup configuration artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalog {
    #[serde(default = "default_model_id")]
    pub default_model: String,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

impl ModelCatalog {
    /// Load from a `.json` or `.toml` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GrimoireError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let catalog = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&raw)?,
            _ => Self::from_toml_str(&raw)?,
        };
        tracing::info!(
            path = %path.display(),
            models = catalog.models.len(),
            providers = catalog.providers.len(),
            "model catalog loaded"
        );
        Ok(catalog)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, GrimoireError> {
        let catalog: Self =
            toml::from_str(raw).map_err(|e| GrimoireError::configuration(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, GrimoireError> {
        let catalog: Self = serde_json::from_str(raw)?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), GrimoireError> {
        for (category, limit) in &self.dispatcher.rate_limits {
            limit.validate().map_err(|err| {
                GrimoireError::configuration(format!("rate limit '{category}': {err}"))
            })?;
        }
        Ok(())
    }

    /// Descriptors of every enabled model.
    pub fn descriptors(&self) -> Result<Vec<ModelDescriptor>, GrimoireError> {
        self.models
            .iter()
            .filter(|(_, model)| model.enabled)
            .map(|(id, model)| model.to_descriptor(id))
            .collect()
    }

    /// Environment-backed credentials matching `[providers]`.
    pub fn credentials(&self) -> EnvCredentials {
        self.providers
            .iter()
            .fold(EnvCredentials::new(), |creds, (id, settings)| {
                let creds = match &settings.api_key_env {
                    Some(var) => creds.with_var(id.clone(), var.clone()),
                    None => creds,
                };
                if settings.keyless || settings.kind_for(id) == ProviderKind::Ollama {
                    creds.with_keyless(id.clone())
                } else {
                    creds
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
default_model = "llama"

[providers.openai]
api_key_env = "GRIMOIRE_TEST_OPENAI_KEY"

[providers.ollama]
api_base = "http://localhost:11434"

[models.llama]
name = "Local Llama"
backend = "local_process"
binary_path = "/opt/llama/llama-cli"
model_path = "/opt/llama/model.gguf"
args_template = ["-m", "{model_path}", "-p", "{prompt}"]
[models.llama.parameters]
temperature = 0.7
max_tokens = 512
repeat_penalty = 1.1

[models.gpt]
backend = "remote"
provider = "openai"
remote_model = "gpt-4o-mini"

[models.retired]
backend = "remote"
provider = "openai"
enabled = false

[dispatcher]
request_timeout_secs = 30
[dispatcher.rate_limits.generation]
points = 2
window_seconds = 60
block_seconds = 60
"#;

    #[test]
    fn parses_toml_catalog() {
        let catalog = ModelCatalog::from_toml_str(CATALOG).unwrap();
        assert_eq!(catalog.default_model, "llama");
        assert_eq!(catalog.dispatcher.request_timeout(), Duration::from_secs(30));
        assert_eq!(catalog.dispatcher.rate_limits[GENERATION].points, 2);
        // untouched sections keep their defaults
        assert_eq!(catalog.dispatcher.conversation_max_age_hours, 24);

        let descriptors = catalog.descriptors().unwrap();
        assert_eq!(descriptors.len(), 2);

        let llama = descriptors.iter().find(|d| d.id == "llama").unwrap();
        assert_eq!(llama.name, "Local Llama");
        assert_eq!(llama.parameters.max_tokens, Some(512));
        assert_eq!(llama.parameters.extra["repeat_penalty"], serde_json::json!(1.1));
        match &llama.backend {
            Backend::LocalProcess(spec) => {
                assert_eq!(spec.reply_delimiter, DEFAULT_REPLY_DELIMITER);
                assert_eq!(spec.max_concurrent, 1);
            }
            other => panic!("unexpected backend {other:?}"),
        }

        let gpt = descriptors.iter().find(|d| d.id == "gpt").unwrap();
        assert_eq!(
            gpt.backend,
            Backend::Remote {
                provider: "openai".to_string(),
                model: "gpt-4o-mini".to_string()
            }
        );
    }

    #[test]
    fn parses_json_catalog() {
        let raw = r#"{
            "models": {
                "default": { "backend": "remote", "provider": "deepseek" }
            }
        }"#;
        let catalog = ModelCatalog::from_json_str(raw).unwrap();
        assert_eq!(catalog.default_model, "default");
        assert_eq!(
            catalog.providers.get("deepseek").cloned().unwrap_or_default().kind_for("deepseek"),
            ProviderKind::DeepSeek
        );
    }

    #[test]
    fn remote_without_provider_is_rejected() {
        let raw = r#"
[models.broken]
backend = "remote"
"#;
        let err = ModelCatalog::from_toml_str(raw).unwrap().descriptors().unwrap_err();
        assert!(matches!(err, GrimoireError::Configuration(_)));
    }

    #[test]
    fn oversized_rate_limit_window_is_rejected() {
        let raw = r#"
[dispatcher.rate_limits.generation]
points = 2
window_seconds = 9223372036854775807
"#;
        let err = ModelCatalog::from_toml_str(raw).unwrap_err();
        assert!(matches!(&err, GrimoireError::Configuration(msg) if msg.contains("generation")));

        let raw = r#"{
            "dispatcher": {
                "rate_limits": {
                    "generation": { "points": 2, "window_seconds": 60, "block_seconds": 9223372036854775808 }
                }
            }
        }"#;
        assert!(matches!(
            ModelCatalog::from_json_str(raw),
            Err(GrimoireError::Configuration(_))
        ));
    }

    #[test]
    fn ollama_is_keyless() {
        let catalog = ModelCatalog::from_toml_str(CATALOG).unwrap();
        let creds = catalog.credentials();
        use crate::registry::CredentialStore;
        assert!(creds.has_credential("ollama"));
    }
}
