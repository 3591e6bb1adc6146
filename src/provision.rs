use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ProvisionError(pub String);

pub trait Provisioner: Send + Sync {
    /// Creates `target_dir` if needed and installs the dependencies listed in
    /// `manifest` into it. Runs to completion before returning.
    fn ensure_environment(&self, manifest: &Path, target_dir: &Path)
        -> Result<(), ProvisionError>;

    fn resolve_executable(&self, target_dir: &Path) -> PathBuf;
}

#[derive(Debug, Clone)]
pub struct VenvProvisioner {
    interpreter: String,
}

impl VenvProvisioner {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    fn host_interpreter(&self) -> PathBuf {
        which::which(&self.interpreter).unwrap_or_else(|_| PathBuf::from(&self.interpreter))
    }
}

impl Provisioner for VenvProvisioner {
    fn ensure_environment(
        &self,
        manifest: &Path,
        target_dir: &Path,
    ) -> Result<(), ProvisionError> {
        if venv_python(target_dir).is_none() {
            info!(env = %target_dir.display(), "creating virtual environment");
            let mut cmd = Command::new(self.host_interpreter());
            cmd.arg("-m").arg("venv").arg(target_dir);
            run_to_completion(cmd, "create virtual environment")?;
        }
        let pip = venv_bin_dir(target_dir).join(if cfg!(windows) { "pip.exe" } else { "pip" });
        info!(manifest = %manifest.display(), "installing dependencies");
        let mut cmd = Command::new(pip);
        cmd.arg("install").arg("-r").arg(manifest);
        run_to_completion(cmd, "install dependencies")
    }

    fn resolve_executable(&self, target_dir: &Path) -> PathBuf {
        match venv_python(target_dir) {
            Some(python) => python,
            None => self.host_interpreter(),
        }
    }
}

fn venv_bin_dir(target_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        target_dir.join("Scripts")
    } else {
        target_dir.join("bin")
    }
}

fn venv_python(target_dir: &Path) -> Option<PathBuf> {
    let python = venv_bin_dir(target_dir).join(if cfg!(windows) {
        "python.exe"
    } else {
        "python"
    });
    python.is_file().then_some(python)
}

fn run_to_completion(mut cmd: Command, action: &str) -> Result<(), ProvisionError> {
    debug!(command = ?cmd, "running provisioning step");
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|err| ProvisionError(format!("failed to {action}: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let mut message = format!("failed to {action}: command exited with {}", output.status);
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        return Err(ProvisionError(message));
    }
    Ok(())
}
