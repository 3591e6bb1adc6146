use crate::error::{AppvisorError, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub paths: Paths,
    pub runtime: Runtime,
    pub supervisor: Supervisor,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub app_dir: String,
    pub pid_dir: String,
    pub log_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Runtime {
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub entry_point: String,
    pub manifest: String,
    pub env_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Supervisor {
    pub stop_timeout_ms: u64,
    pub cpu_sample_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            paths: Paths::default(),
            runtime: Runtime::default(),
            supervisor: Supervisor::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            app_dir: "~/.local/share/appvisor/apps".to_string(),
            pid_dir: "~/.local/share/appvisor/pid".to_string(),
            log_dir: "~/.local/share/appvisor/logs".to_string(),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            interpreter_args: vec!["-u".to_string()],
            entry_point: "app.py".to_string(),
            manifest: "requirements.txt".to_string(),
            env_dir: "venv".to_string(),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 5000,
            cpu_sample_ms: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub app_dir: PathBuf,
    pub pid_dir: PathBuf,
    pub log_dir: PathBuf,
    pub runtime: Runtime,
    pub stop_timeout: Duration,
    pub cpu_sample: Duration,
}

impl SupervisorConfig {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        validate_config(cfg)?;
        Ok(Self {
            app_dir: PathBuf::from(expand_path(&cfg.paths.app_dir)),
            pid_dir: PathBuf::from(expand_path(&cfg.paths.pid_dir)),
            log_dir: PathBuf::from(expand_path(&cfg.paths.log_dir)),
            runtime: cfg.runtime.clone(),
            stop_timeout: Duration::from_millis(cfg.supervisor.stop_timeout_ms),
            cpu_sample: Duration::from_millis(cfg.supervisor.cpu_sample_ms),
        })
    }

    pub fn rooted_at(root: &Path) -> Self {
        let defaults = Config::default();
        Self {
            app_dir: root.join("apps"),
            pid_dir: root.join("pid"),
            log_dir: root.join("logs"),
            runtime: defaults.runtime,
            stop_timeout: Duration::from_millis(defaults.supervisor.stop_timeout_ms),
            cpu_sample: Duration::from_millis(defaults.supervisor.cpu_sample_ms),
        }
    }
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("APPVISOR_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("APPVISOR_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("appvisor");
    base
}

pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn read_config_from_str(content: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        read_config(path)
    } else {
        Ok(Config::default())
    }
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.version != CONFIG_VERSION {
        return Err(AppvisorError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    if cfg.runtime.interpreter.trim().is_empty() {
        return Err(AppvisorError::Config(
            "runtime.interpreter must not be empty".to_string(),
        ));
    }
    for (field, value) in [
        ("runtime.entry_point", &cfg.runtime.entry_point),
        ("runtime.manifest", &cfg.runtime.manifest),
        ("runtime.env_dir", &cfg.runtime.env_dir),
    ] {
        if !is_contained_relative(value) {
            return Err(AppvisorError::Config(format!(
                "{field} must be a relative path inside the app directory, got {value:?}"
            )));
        }
    }
    if cfg.supervisor.stop_timeout_ms == 0 {
        return Err(AppvisorError::Config(
            "supervisor.stop_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if cfg.supervisor.cpu_sample_ms == 0 {
        return Err(AppvisorError::Config(
            "supervisor.cpu_sample_ms must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn is_contained_relative(value: &str) -> bool {
    let path = Path::new(value);
    !value.trim().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}
