//! Model registry.
//!
//! Holds the descriptors established at startup. The table itself never
//! changes, so lookups take no lock; readiness transitions swap in a new
//! descriptor atomically.

mod credentials;
mod descriptor;

pub use credentials::{CredentialStore, EnvCredentials, StaticCredentials};
pub use descriptor::{
    Backend, BackendKind, LocalProcessSpec, ModelDescriptor, Readiness, DEFAULT_REPLY_DELIMITER,
};

use crate::config::ModelCatalog;
use crate::error::GrimoireError;
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Registry of available models.
#[derive(Debug)]
pub struct ModelRegistry {
    models: BTreeMap<String, ArcSwap<ModelDescriptor>>,
    default_model: String,
    credentials: Arc<dyn CredentialStore>,
}

impl ModelRegistry {
    /// Build a registry and run the initial readiness check.
    ///
    /// Fails if there are no models, ids repeat, or `default_model` is not
    /// among them.
    pub fn new(
        descriptors: Vec<ModelDescriptor>,
        default_model: impl Into<String>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, GrimoireError> {
        let default_model = default_model.into();
        if descriptors.is_empty() {
            return Err(GrimoireError::configuration("no models configured"));
        }

        let mut models = BTreeMap::new();
        for mut descriptor in descriptors {
            descriptor.readiness = assess_readiness(&descriptor, credentials.as_ref());
            tracing::info!(
                model = %descriptor.id,
                backend = %descriptor.kind(),
                readiness = %descriptor.readiness,
                "model registered"
            );
            let id = descriptor.id.clone();
            if models
                .insert(id.clone(), ArcSwap::from_pointee(descriptor))
                .is_some()
            {
                return Err(GrimoireError::configuration(format!(
                    "duplicate model id '{id}'"
                )));
            }
        }

        if !models.contains_key(&default_model) {
            return Err(GrimoireError::configuration(format!(
                "default model '{default_model}' is not configured"
            )));
        }

        Ok(Self {
            models,
            default_model,
            credentials,
        })
    }

    /// Build from a loaded catalog; disabled models are left out.
    pub fn from_catalog(
        catalog: &ModelCatalog,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, GrimoireError> {
        Self::new(catalog.descriptors()?, catalog.default_model.clone(), credentials)
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Snapshots of every model, ordered by id, with cached readiness.
    pub fn list_models(&self) -> Vec<Arc<ModelDescriptor>> {
        self.models.values().map(|entry| entry.load_full()).collect()
    }

    /// Snapshot of one model regardless of readiness.
    pub fn get(&self, model_id: &str) -> Result<Arc<ModelDescriptor>, GrimoireError> {
        self.models
            .get(model_id)
            .map(|entry| entry.load_full())
            .ok_or_else(|| GrimoireError::ModelNotFound(model_id.to_string()))
    }

    /// Snapshot of a model that is ready to serve.
    pub fn resolve(&self, model_id: &str) -> Result<Arc<ModelDescriptor>, GrimoireError> {
        let descriptor = self.get(model_id)?;
        if !descriptor.is_ready() {
            return Err(GrimoireError::ModelNotReady {
                model: model_id.to_string(),
                readiness: descriptor.readiness.clone(),
            });
        }
        Ok(descriptor)
    }

    /// Re-run the prerequisite check without recording the result.
    pub fn check_readiness(&self, model_id: &str) -> Result<bool, GrimoireError> {
        let descriptor = self.get(model_id)?;
        Ok(assess_readiness(&descriptor, self.credentials.as_ref()).is_ready())
    }

    /// Re-run the prerequisite check and record the result.
    pub fn refresh_readiness(&self, model_id: &str) -> Result<Readiness, GrimoireError> {
        let descriptor = self.get(model_id)?;
        let readiness = assess_readiness(&descriptor, self.credentials.as_ref());
        self.set_readiness(model_id, readiness.clone())?;
        Ok(readiness)
    }

    /// Refresh every model; returns how many are ready.
    pub fn refresh_all(&self) -> usize {
        self.models
            .keys()
            .filter_map(|id| self.refresh_readiness(id).ok())
            .filter(Readiness::is_ready)
            .count()
    }

    /// Record a failed health check.
    pub fn mark_error(&self, model_id: &str, reason: impl Into<String>) -> Result<(), GrimoireError> {
        self.set_readiness(model_id, Readiness::Error(reason.into()))
    }

    fn set_readiness(&self, model_id: &str, readiness: Readiness) -> Result<(), GrimoireError> {
        let entry = self
            .models
            .get(model_id)
            .ok_or_else(|| GrimoireError::ModelNotFound(model_id.to_string()))?;

        let previous = entry.rcu(|current| {
            let mut next = ModelDescriptor::clone(current);
            next.readiness = readiness.clone();
            next
        });
        if previous.readiness != readiness {
            tracing::info!(
                model = %model_id,
                from = %previous.readiness,
                to = %readiness,
                "model readiness changed"
            );
        }
        Ok(())
    }
}

/// Prerequisite check for one descriptor. Reads only.
fn assess_readiness(descriptor: &ModelDescriptor, credentials: &dyn CredentialStore) -> Readiness {
    match &descriptor.backend {
        Backend::Remote { provider, .. } => {
            if credentials.has_credential(provider) {
                Readiness::Ready
            } else {
                Readiness::NotInstalled(format!("no API key configured for provider '{provider}'"))
            }
        }
        Backend::LocalProcess(spec) => {
            if let Err(readiness) = check_executable(&spec.binary_path) {
                return readiness;
            }
            if let Some(model_path) = &spec.model_path {
                if let Err(readiness) = check_readable(model_path) {
                    return readiness;
                }
            }
            Readiness::Ready
        }
    }
}

fn check_executable(path: &Path) -> Result<(), Readiness> {
    let metadata = std::fs::metadata(path).map_err(|_| {
        Readiness::NotInstalled(format!("inference binary not found: {}", path.display()))
    })?;
    if !metadata.is_file() {
        return Err(Readiness::Error(format!(
            "inference binary is not a file: {}",
            path.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(Readiness::Error(format!(
                "inference binary is not executable: {}",
                path.display()
            )));
        }
    }

    Ok(())
}

fn check_readable(path: &Path) -> Result<(), Readiness> {
    if !path.exists() {
        return Err(Readiness::NotInstalled(format!(
            "model artifact not found: {}",
            path.display()
        )));
    }
    let readable = if path.is_dir() {
        std::fs::read_dir(path).is_ok()
    } else {
        std::fs::File::open(path).is_ok()
    };
    if readable {
        Ok(())
    } else {
        Err(Readiness::Error(format!(
            "model artifact is not readable: {}",
            path.display()
        )))
    }
}
