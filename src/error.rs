//! Error types for vpnctl

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VpnctlError {
    /// No key-generation strategy produced a usable key pair
    #[error("Key generation failed: {0}")]
    Generation(String),

    /// Panel login failed with both the configured and the default credentials
    #[error("Panel authentication failed: {0}")]
    Auth(String),

    /// Non-success panel response, carries the raw body for diagnostics
    #[error("Panel API call {endpoint} failed: {body}")]
    Api { endpoint: String, body: String },

    /// Malformed operator input, rejected before any mutation
    #[error("Invalid parameter: {0}")]
    Validation(String),

    /// Delegated command exited non-zero or could not be spawned
    #[error("Command '{cmd}' failed{}: {stderr}", exit_suffix(.code))]
    ExternalProcess {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Malformed or incomplete backup archive
    #[error("Archive error: {0}")]
    Archive(String),

    /// Template could not be resolved or the fallback directive was not found
    #[error("Template error: {0}")]
    Template(String),

    /// Tool configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A value the operation depends on is absent from the secret store
    #[error("Secret '{0}' is not set in the secret store")]
    MissingSecret(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A multi-step operation stopped part way through
    #[error(
        "{operation} failed at step '{step}' (last completed: {}; already mutated: {}): {source}",
        .last_completed.as_deref().unwrap_or("none"),
        mutated_list(.mutated)
    )]
    StepFailed {
        operation: &'static str,
        step: String,
        last_completed: Option<String>,
        mutated: Vec<String>,
        #[source]
        source: Box<VpnctlError>,
    },

    /// Restore aborted; the scratch directory is left behind for inspection
    #[error("Restore failed, extracted files kept at {}: {source}", .scratch_dir.display())]
    RestoreAborted {
        scratch_dir: PathBuf,
        #[source]
        source: Box<VpnctlError>,
    },
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {}", code),
        None => String::new(),
    }
}

fn mutated_list(mutated: &[String]) -> String {
    if mutated.is_empty() {
        "nothing".to_string()
    } else {
        mutated.join(", ")
    }
}

impl VpnctlError {
    pub fn validation(msg: impl Into<String>) -> Self {
        VpnctlError::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        VpnctlError::Config(msg.into())
    }

    pub fn template(msg: impl Into<String>) -> Self {
        VpnctlError::Template(msg.into())
    }

    pub fn archive(msg: impl Into<String>) -> Self {
        VpnctlError::Archive(msg.into())
    }

    pub fn api(endpoint: impl Into<String>, body: impl Into<String>) -> Self {
        VpnctlError::Api {
            endpoint: endpoint.into(),
            body: body.into(),
        }
    }

    /// The innermost error, looking through step and restore wrappers
    pub fn root_cause(&self) -> &VpnctlError {
        match self {
            VpnctlError::StepFailed { source, .. } => source.root_cause(),
            VpnctlError::RestoreAborted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type VpnctlResult<T> = Result<T, VpnctlError>;
