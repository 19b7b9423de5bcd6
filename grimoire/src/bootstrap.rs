//! Building a ready-to-serve [`Dispatcher`] from a model catalog.

use grimoire_core::config::{ModelCatalog, ProviderKind, ProviderSettings};
use grimoire_core::error::GrimoireError;
use grimoire_core::provider::Provider;
use grimoire_core::registry::{Backend, CredentialStore, ModelRegistry};
use grimoire_core::runtime::{Dispatcher, DispatcherBuilder};
use grimoire_provider::{OllamaProvider, OpenAiProvider, DEEPSEEK_API_BASE, DEFAULT_OLLAMA_BASE};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// Load the catalog at `path` and build a dispatcher from it.
pub fn bootstrap_from_path(path: impl AsRef<Path>) -> Result<Dispatcher, GrimoireError> {
    let catalog = ModelCatalog::from_path(path)?;
    bootstrap(&catalog)
}

/// Build a dispatcher with one client per provider that has credentials.
///
/// Registry initialization is the only step that can fail here. A provider
/// without a key gets no client; its models stay `NotInstalled`.
pub fn bootstrap(catalog: &ModelCatalog) -> Result<Dispatcher, GrimoireError> {
    let credentials = Arc::new(catalog.credentials());
    let registry = ModelRegistry::from_catalog(catalog, credentials.clone())?;

    let mut provider_ids: BTreeSet<String> = catalog.providers.keys().cloned().collect();
    for descriptor in registry.list_models() {
        if let Backend::Remote { provider, .. } = &descriptor.backend {
            provider_ids.insert(provider.clone());
        }
    }

    let mut builder = Dispatcher::builder(registry).config(catalog.dispatcher.clone());
    for id in provider_ids {
        let settings = catalog.providers.get(&id).cloned().unwrap_or_default();
        match build_provider(&id, &settings, credentials.as_ref())? {
            Some(provider) => {
                tracing::info!(provider = %id, kind = ?settings.kind_for(&id), "provider client ready");
                builder = register(builder, id, provider);
            }
            None => {
                tracing::warn!(provider = %id, "no API key configured; provider disabled");
            }
        }
    }

    Ok(builder.finish())
}

fn build_provider(
    id: &str,
    settings: &ProviderSettings,
    credentials: &dyn CredentialStore,
) -> Result<Option<Arc<dyn Provider>>, GrimoireError> {
    let key = credentials.api_key(id).filter(|key| !key.trim().is_empty());

    let provider: Arc<dyn Provider> = match settings.kind_for(id) {
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(
            settings.api_base.as_deref().unwrap_or(DEFAULT_OLLAMA_BASE),
        )),
        kind => {
            let key = match key {
                Some(key) => key,
                None if credentials.is_keyless(id) => String::new(),
                None => return Ok(None),
            };
            let api_base = settings.api_base.clone().or_else(|| {
                (kind == ProviderKind::DeepSeek).then(|| DEEPSEEK_API_BASE.to_string())
            });

            let mut builder = OpenAiProvider::builder(id)
                .name(display_name(id, kind))
                .api_key(key);
            if let Some(api_base) = api_base {
                builder = builder.api_base(api_base);
            }
            Arc::new(builder.build()?)
        }
    };
    Ok(Some(provider))
}

fn display_name(id: &str, kind: ProviderKind) -> String {
    match kind {
        ProviderKind::OpenAi if id == "openai" => "OpenAI".to_string(),
        ProviderKind::DeepSeek => "DeepSeek".to_string(),
        ProviderKind::Ollama => "Ollama".to_string(),
        ProviderKind::OpenAi => id.to_string(),
    }
}

#[cfg(feature = "grimoire-layer")]
fn register(builder: DispatcherBuilder, id: String, provider: Arc<dyn Provider>) -> DispatcherBuilder {
    use grimoire_core::layer::ProviderExt;
    use grimoire_layer::LoggingLayer;

    builder.provider(id, provider.with(LoggingLayer::new()))
}

#[cfg(not(feature = "grimoire-layer"))]
fn register(builder: DispatcherBuilder, id: String, provider: Arc<dyn Provider>) -> DispatcherBuilder {
    builder.shared_provider(id, provider)
}
