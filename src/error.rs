use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppvisorError {
    #[error("invalid app name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },
    #[error("provisioning failed for {name}: {message}")]
    ProvisionFailure { name: String, message: String },
    #[error("launch failed for {name}: {message}")]
    LaunchFailure { name: String, message: String },
    #[error("failed to terminate {name} (pid {pid}): {message}")]
    TerminationFailure {
        name: String,
        pid: u32,
        message: String,
    },
    #[error("app directory does not exist: {}", .0.display())]
    MissingAppDir(PathBuf),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = AppvisorError> = std::result::Result<T, E>;
