use crate::config::SupervisorConfig;
use crate::error::{AppvisorError, Result};
use crate::launcher::{self, LaunchSpec, Launched};
use crate::name::AppName;
use crate::pid_store::PidStore;
use crate::probe::{self, Prober, SystemUsage, Usage};
use crate::provision::{Provisioner, VenvProvisioner};
use crate::terminate::{StopOutcome, Terminator};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppStatus {
    pub app_name: AppName,
    pub running: bool,
    pub usage: Option<Usage>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    store: PidStore,
    prober: Prober,
    terminator: Terminator,
    provisioner: Arc<dyn Provisioner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let provisioner = VenvProvisioner::new(config.runtime.interpreter.clone());
        Self::with_provisioner(config, Arc::new(provisioner))
    }

    pub fn with_provisioner(config: SupervisorConfig, provisioner: Arc<dyn Provisioner>) -> Self {
        let store = PidStore::new(config.pid_dir.clone());
        let prober = Prober::new(store.clone(), config.cpu_sample);
        let terminator = Terminator::new(store.clone(), config.stop_timeout);
        Self {
            config,
            store,
            prober,
            terminator,
            provisioner,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn log_path(&self, name: &AppName) -> PathBuf {
        self.config.log_dir.join(format!("{name}.log"))
    }

    pub fn app_path(&self, name: &AppName) -> PathBuf {
        self.config.app_dir.join(name.as_str())
    }

    pub fn start(&self, name: &str) -> Result<StartOutcome> {
        let name = AppName::parse(name)?;
        let lock = self.store.lock(&name)?;
        if let Some(pid) = self.prober.running_pid_locked(&name, &lock)? {
            info!(app = %name, pid, "app already running");
            return Ok(StartOutcome::AlreadyRunning { pid });
        }
        fs::create_dir_all(&self.config.log_dir)?;

        let runtime = &self.config.runtime;
        let app_path = self.app_path(&name);
        let entry_point = app_path.join(&runtime.entry_point);
        if !entry_point.is_file() {
            return Err(launch_failure(
                &name,
                format!("entry point {} not found", entry_point.display()),
            ));
        }

        let env_dir = app_path.join(&runtime.env_dir);
        let manifest = app_path.join(&runtime.manifest);
        if manifest.is_file() {
            self.provisioner
                .ensure_environment(&manifest, &env_dir)
                .map_err(|err| AppvisorError::ProvisionFailure {
                    name: name.to_string(),
                    message: err.to_string(),
                })?;
        }

        let spec = LaunchSpec {
            program: self.provisioner.resolve_executable(&env_dir),
            args: runtime.interpreter_args.clone(),
            entry_point,
            working_dir: app_path,
            log_file: self.log_path(&name),
        };
        launcher::write_banner(&spec.log_file, &format!("starting {name}"))?;
        let launched = launcher::spawn(&spec).map_err(|err| {
            launch_failure(
                &name,
                format!("failed to spawn {}: {err}", spec.program.display()),
            )
        })?;
        let pid = record_launch(&self.store, &name, launched)?;
        info!(app = %name, pid, log = %spec.log_file.display(), "app started");
        drop(lock);
        Ok(StartOutcome::Started { pid })
    }

    pub fn stop(&self, name: &str) -> Result<StopOutcome> {
        let name = AppName::parse(name)?;
        if !self.store.contains(&name) {
            return Ok(StopOutcome::NotRunning);
        }
        let lock = self.store.lock(&name)?;
        let outcome = self.terminator.stop_locked(&name, &lock);
        drop(lock);
        if let Ok(StopOutcome::Stopped { pid, .. }) = &outcome {
            let log_file = self.log_path(&name);
            if log_file.is_file() {
                if let Err(err) = launcher::write_banner(&log_file, &format!("stopped {name} (pid {pid})")) {
                    warn!(app = %name, error = %err, "failed to write stop marker");
                }
            }
        }
        outcome
    }

    pub fn is_running(&self, name: &str) -> Result<bool> {
        let name = AppName::parse(name)?;
        self.prober.is_running(&name)
    }

    pub fn usage(&self, name: &str) -> Result<Option<Usage>> {
        let name = AppName::parse(name)?;
        self.prober.usage(&name)
    }

    /// Liveness and usage from a single probe, so both fields describe the
    /// same observation.
    pub fn status(&self, name: &str) -> Result<AppStatus> {
        let name = AppName::parse(name)?;
        let usage = self.prober.usage(&name)?;
        Ok(AppStatus {
            app_name: name,
            running: usage.is_some(),
            usage,
        })
    }

    pub fn list_known(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.config.app_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(AppvisorError::MissingAppDir(self.config.app_dir.clone()));
            }
            Err(err) => return Err(err.into()),
        };
        let mut apps = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            if AppName::parse(&file_name).is_ok() {
                apps.push(file_name);
            }
        }
        apps.sort();
        Ok(apps)
    }

    pub fn system_usage(&self) -> SystemUsage {
        probe::system_usage(self.config.cpu_sample)
    }

    pub fn log_tail(&self, name: &str, lines: usize) -> Result<Vec<String>> {
        let name = AppName::parse(name)?;
        let content = match fs::read(self.log_path(&name)) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].iter().map(|line| line.to_string()).collect())
    }
}

// A child whose pid cannot be recorded would be unreachable by `stop`, so it
// is killed before the error is returned.
fn record_launch(store: &PidStore, name: &AppName, launched: Launched) -> Result<u32> {
    let pid = launched.pid();
    if let Err(err) = store.write(name, pid) {
        launched.abort();
        return Err(launch_failure(name, format!("failed to record pid {pid}: {err}")));
    }
    launched.release();
    Ok(pid)
}

fn launch_failure(name: &AppName, message: String) -> AppvisorError {
    AppvisorError::LaunchFailure {
        name: name.to_string(),
        message,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::probe::pid_alive;
    use crate::provision::ProvisionError;
    use std::path::Path;
    use std::sync::{Barrier, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::{tempdir, TempDir};

    const SLEEPER: &str = "echo ready\nexec sleep 300\n";

    #[derive(Default)]
    struct FakeProvisioner {
        fail: bool,
        calls: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    impl Provisioner for FakeProvisioner {
        fn ensure_environment(
            &self,
            manifest: &Path,
            target_dir: &Path,
        ) -> std::result::Result<(), ProvisionError> {
            self.calls
                .lock()
                .unwrap()
                .push((manifest.to_path_buf(), target_dir.to_path_buf()));
            if self.fail {
                return Err(ProvisionError("pip exploded".to_string()));
            }
            Ok(())
        }

        fn resolve_executable(&self, _target_dir: &Path) -> PathBuf {
            PathBuf::from("sh")
        }
    }

    fn test_config(root: &Path) -> SupervisorConfig {
        let mut config = SupervisorConfig::rooted_at(root);
        config.runtime.interpreter = "sh".to_string();
        config.runtime.interpreter_args = Vec::new();
        config.runtime.entry_point = "app.sh".to_string();
        config.cpu_sample = Duration::from_millis(200);
        config
    }

    fn fixture_with(provisioner: Arc<FakeProvisioner>) -> (TempDir, Supervisor) {
        let dir = tempdir().unwrap();
        let supervisor = Supervisor::with_provisioner(test_config(dir.path()), provisioner);
        (dir, supervisor)
    }

    fn fixture() -> (TempDir, Supervisor) {
        fixture_with(Arc::new(FakeProvisioner::default()))
    }

    fn write_app(supervisor: &Supervisor, name: &str, script: &str) -> PathBuf {
        let dir = supervisor.config().app_dir.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("app.sh"), script).unwrap();
        dir
    }

    fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn record_exists(supervisor: &Supervisor, name: &str) -> bool {
        supervisor
            .config()
            .pid_dir
            .join(format!("{name}.pid"))
            .exists()
    }

    #[test]
    fn start_status_stop_scenario() {
        let (_dir, supervisor) = fixture();
        write_app(&supervisor, "demo", SLEEPER);

        let pid = match supervisor.start("demo").unwrap() {
            StartOutcome::Started { pid } => pid,
            other => panic!("unexpected {other:?}"),
        };
        let status = supervisor.status("demo").unwrap();
        assert!(status.running);
        let usage = status.usage.expect("usage while running");
        assert!(usage.cpu_percent >= 0.0);
        assert!(usage.memory_mb >= 0.0);
        assert!(record_exists(&supervisor, "demo"));

        assert_eq!(
            supervisor.stop("demo").unwrap(),
            StopOutcome::Stopped {
                pid,
                confirmed: true
            }
        );
        let status = supervisor.status("demo").unwrap();
        assert!(!status.running);
        assert_eq!(status.usage, None);
        assert!(!record_exists(&supervisor, "demo"));
        assert!(!supervisor.is_running("demo").unwrap());
        assert!(!pid_alive(pid));
    }

    #[test]
    fn start_is_idempotent() {
        let (_dir, supervisor) = fixture();
        write_app(&supervisor, "demo", SLEEPER);

        let StartOutcome::Started { pid } = supervisor.start("demo").unwrap() else {
            panic!("first start should launch");
        };
        assert_eq!(
            supervisor.start("demo").unwrap(),
            StartOutcome::AlreadyRunning { pid }
        );
        supervisor.stop("demo").unwrap();
    }

    #[test]
    fn concurrent_starts_launch_once() {
        let (_dir, supervisor) = fixture();
        write_app(&supervisor, "demo", SLEEPER);
        let supervisor = Arc::new(supervisor);
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let supervisor = Arc::clone(&supervisor);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    supervisor.start("demo").unwrap()
                })
            })
            .collect();
        let outcomes: Vec<StartOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let started: Vec<u32> = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                StartOutcome::Started { pid } => Some(*pid),
                StartOutcome::AlreadyRunning { .. } => None,
            })
            .collect();
        assert_eq!(started.len(), 1);
        for outcome in &outcomes {
            if let StartOutcome::AlreadyRunning { pid } = outcome {
                assert_eq!(*pid, started[0]);
            }
        }
        supervisor.stop("demo").unwrap();
    }

    #[test]
    fn stop_without_record_touches_nothing() {
        let (_dir, supervisor) = fixture();
        assert_eq!(supervisor.stop("demo").unwrap(), StopOutcome::NotRunning);
        assert!(!supervisor.config().pid_dir.exists());
        assert!(!supervisor.config().log_dir.exists());
    }

    #[test]
    fn invalid_name_is_rejected_before_any_io() {
        let (_dir, supervisor) = fixture();
        for result in [
            supervisor.start("bad name!").map(|_| ()),
            supervisor.stop("bad name!").map(|_| ()),
            supervisor.status("../etc").map(|_| ()),
        ] {
            assert!(matches!(result, Err(AppvisorError::InvalidName { .. })));
        }
        assert!(!supervisor.config().pid_dir.exists());
        assert!(!supervisor.config().log_dir.exists());
    }

    #[test]
    fn externally_killed_app_is_reconciled() {
        let (_dir, supervisor) = fixture();
        write_app(&supervisor, "demo", SLEEPER);
        let StartOutcome::Started { pid } = supervisor.start("demo").unwrap() else {
            panic!("first start should launch");
        };

        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();
        wait_for("process exit", || !pid_alive(pid));

        assert!(record_exists(&supervisor, "demo"));
        assert!(!supervisor.is_running("demo").unwrap());
        assert!(!record_exists(&supervisor, "demo"));
        assert_eq!(supervisor.usage("demo").unwrap(), None);
    }

    #[test]
    fn stop_kills_whole_process_tree() {
        let (_dir, supervisor) = fixture();
        let app_dir = write_app(
            &supervisor,
            "tree",
            "sleep 300 &\necho $! > child1.pid\nsh -c 'sleep 300 & echo $! > child2.pid; wait' &\nwait\n",
        );
        let StartOutcome::Started { pid } = supervisor.start("tree").unwrap() else {
            panic!("first start should launch");
        };
        let read_pid = |file: &str| -> Option<u32> {
            fs::read_to_string(app_dir.join(file))
                .ok()
                .and_then(|text| text.trim().parse().ok())
        };
        wait_for("child pid files", || {
            read_pid("child1.pid").is_some() && read_pid("child2.pid").is_some()
        });
        let children = [read_pid("child1.pid").unwrap(), read_pid("child2.pid").unwrap()];
        assert!(children.iter().all(|child| pid_alive(*child)));

        assert!(matches!(
            supervisor.stop("tree").unwrap(),
            StopOutcome::Stopped { .. }
        ));
        assert!(!pid_alive(pid));
        for child in children {
            assert!(!pid_alive(child), "descendant {child} survived stop");
        }
    }

    #[test]
    fn provisioning_runs_when_manifest_present() {
        let provisioner = Arc::new(FakeProvisioner::default());
        let (_dir, supervisor) = fixture_with(Arc::clone(&provisioner));
        let app_dir = write_app(&supervisor, "deps", SLEEPER);
        fs::write(app_dir.join("requirements.txt"), "requests\n").unwrap();

        supervisor.start("deps").unwrap();
        supervisor.stop("deps").unwrap();

        let calls = provisioner.calls.lock().unwrap();
        assert_eq!(
            calls.as_slice(),
            &[(app_dir.join("requirements.txt"), app_dir.join("venv"))]
        );
    }

    #[test]
    fn provisioning_is_skipped_without_manifest() {
        let provisioner = Arc::new(FakeProvisioner::default());
        let (_dir, supervisor) = fixture_with(Arc::clone(&provisioner));
        write_app(&supervisor, "plain", SLEEPER);

        supervisor.start("plain").unwrap();
        supervisor.stop("plain").unwrap();
        assert!(provisioner.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn provisioning_failure_leaves_no_record() {
        let provisioner = Arc::new(FakeProvisioner {
            fail: true,
            ..FakeProvisioner::default()
        });
        let (_dir, supervisor) = fixture_with(provisioner);
        let app_dir = write_app(&supervisor, "deps", SLEEPER);
        fs::write(app_dir.join("requirements.txt"), "requests\n").unwrap();

        let err = supervisor.start("deps").unwrap_err();
        assert!(matches!(err, AppvisorError::ProvisionFailure { .. }));
        assert!(err.to_string().contains("pip exploded"));
        assert!(!record_exists(&supervisor, "deps"));
        assert!(!supervisor.is_running("deps").unwrap());
    }

    #[test]
    fn missing_entry_point_is_a_launch_failure() {
        let (_dir, supervisor) = fixture();
        fs::create_dir_all(supervisor.config().app_dir.join("empty")).unwrap();

        let err = supervisor.start("empty").unwrap_err();
        assert!(matches!(err, AppvisorError::LaunchFailure { .. }));
        assert!(!record_exists(&supervisor, "empty"));
    }

    #[test]
    fn unrecordable_launch_is_killed() {
        let dir = tempdir().unwrap();
        let blocked = dir.path().join("pid");
        fs::write(&blocked, "a file where the pid dir should be").unwrap();
        let store = PidStore::new(blocked.clone());
        let name = AppName::parse("demo").unwrap();
        let entry_point = dir.path().join("app.sh");
        fs::write(&entry_point, SLEEPER).unwrap();
        let spec = LaunchSpec {
            program: PathBuf::from("sh"),
            args: Vec::new(),
            entry_point,
            working_dir: dir.path().to_path_buf(),
            log_file: dir.path().join("demo.log"),
        };
        let launched = launcher::spawn(&spec).unwrap();
        let pid = launched.pid();
        assert!(pid_alive(pid));

        let err = record_launch(&store, &name, launched).unwrap_err();
        assert!(matches!(err, AppvisorError::LaunchFailure { .. }));
        assert!(err.to_string().contains(&format!("failed to record pid {pid}")));
        assert!(!pid_alive(pid));
        assert!(!store.contains(&name));
        assert!(blocked.is_file());
    }

    #[test]
    fn output_goes_to_app_log() {
        let (_dir, supervisor) = fixture();
        write_app(&supervisor, "chatty", "echo hello\necho oops >&2\nexec sleep 300\n");
        supervisor.start("chatty").unwrap();
        wait_for("log output", || {
            let lines = supervisor.log_tail("chatty", 10).unwrap();
            lines.iter().any(|l| l == "hello") && lines.iter().any(|l| l == "oops")
        });
        supervisor.stop("chatty").unwrap();

        let lines = supervisor.log_tail("chatty", 100).unwrap();
        assert!(lines[0].ends_with("appvisor: starting chatty"));
        assert!(lines.last().unwrap().contains("appvisor: stopped chatty"));
        assert_eq!(supervisor.log_tail("chatty", 1).unwrap().len(), 1);
        assert!(supervisor.log_tail("silent", 10).unwrap().is_empty());
    }

    #[test]
    fn list_known_is_sorted_and_filtered() {
        let (_dir, supervisor) = fixture();
        assert!(matches!(
            supervisor.list_known(),
            Err(AppvisorError::MissingAppDir(_))
        ));
        let app_dir = &supervisor.config().app_dir;
        for name in ["zeta", "alpha", "mid_app", "bad.name"] {
            fs::create_dir_all(app_dir.join(name)).unwrap();
        }
        fs::write(app_dir.join("README"), "not an app").unwrap();

        assert_eq!(
            supervisor.list_known().unwrap(),
            vec!["alpha".to_string(), "mid_app".to_string(), "zeta".to_string()]
        );
    }
}
