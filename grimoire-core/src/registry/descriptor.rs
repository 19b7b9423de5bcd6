//! Model descriptors.

use crate::types::ModelParameters;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default marker preceding the reply in local process output.
pub const DEFAULT_REPLY_DELIMITER: &str = "assistant:";

/// Whether a model's prerequisites are present and usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    NotInstalled(String),
    Error(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => f.write_str("ready"),
            Readiness::NotInstalled(reason) => write!(f, "not installed: {reason}"),
            Readiness::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Backend family, without its settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Remote,
    LocalProcess,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Remote => "remote",
            BackendKind::LocalProcess => "local_process",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a locally installed inference binary is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalProcessSpec {
    pub binary_path: PathBuf,
    /// Weights or other artifact the binary loads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    /// Arguments with `{placeholder}` substitution
    #[serde(default)]
    pub args_template: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// The reply is whatever follows the last occurrence of this marker
    pub reply_delimiter: String,
    /// Processes of this model allowed to run at once
    pub max_concurrent: usize,
    /// Per-request limit overriding the dispatcher default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl LocalProcessSpec {
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            model_path: None,
            args_template: Vec::new(),
            working_dir: None,
            reply_delimiter: DEFAULT_REPLY_DELIMITER.to_string(),
            max_concurrent: 1,
            timeout: None,
        }
    }

    pub fn with_model_path(mut self, model_path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(model_path.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args_template = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_reply_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.reply_delimiter = delimiter.into();
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Where a model's generations come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backend {
    /// Hosted API; `provider` names a registered provider client
    Remote { provider: String, model: String },
    /// Inference binary spawned per request
    LocalProcess(LocalProcessSpec),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Remote { .. } => BackendKind::Remote,
            Backend::LocalProcess(_) => BackendKind::LocalProcess,
        }
    }
}

/// Immutable description of an available model.
///
/// Only `readiness` changes after startup, and only by swapping in a new
/// descriptor inside the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub backend: Backend,
    #[serde(default)]
    pub parameters: ModelParameters,
    pub readiness: Readiness,
}

impl ModelDescriptor {
    /// A hosted model served by `provider`.
    pub fn remote(
        id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            backend: Backend::Remote {
                provider: provider.into(),
                model: model.into(),
            },
            parameters: ModelParameters::default(),
            readiness: Readiness::NotInstalled("not checked".to_string()),
        }
    }

    /// A model run through a local binary.
    pub fn local(id: impl Into<String>, spec: LocalProcessSpec) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            backend: Backend::LocalProcess(spec),
            parameters: ModelParameters::default(),
            readiness: Readiness::NotInstalled("not checked".to_string()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_parameters(mut self, parameters: ModelParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }
}
