use crate::error::Result;
use crate::name::AppName;
use crate::pid_store::{NameLock, PidStore};
use serde::Serialize;
use std::thread;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tracing::{debug, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Usage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemUsage {
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub total_memory_gb: f64,
    pub used_memory_gb: f64,
    pub available_memory_gb: f64,
}

#[derive(Debug, Clone)]
pub struct Prober {
    store: PidStore,
    cpu_sample: Duration,
}

impl Prober {
    pub fn new(store: PidStore, cpu_sample: Duration) -> Self {
        Self { store, cpu_sample }
    }

    pub fn is_running(&self, name: &AppName) -> Result<bool> {
        Ok(self.running_pid(name)?.is_some())
    }

    pub fn running_pid(&self, name: &AppName) -> Result<Option<u32>> {
        if !self.store.contains(name) {
            return Ok(None);
        }
        let lock = self.store.lock(name)?;
        self.running_pid_locked(name, &lock)
    }

    pub fn running_pid_locked(&self, name: &AppName, _lock: &NameLock) -> Result<Option<u32>> {
        let Some(pid) = self.store.read_or_discard(name)? else {
            return Ok(None);
        };
        if pid_alive(pid) {
            debug!(app = %name, pid, "process alive");
            return Ok(Some(pid));
        }
        warn!(app = %name, pid, "removing stale pid record");
        self.store.delete(name)?;
        Ok(None)
    }

    pub fn usage(&self, name: &AppName) -> Result<Option<Usage>> {
        match self.running_pid(name)? {
            Some(pid) => Ok(sample_process(pid, self.cpu_sample)),
            None => Ok(None),
        }
    }
}

/// True when `pid` is in the process table and not a zombie.
pub fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    if !sys.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
        return false;
    }
    match sys.process(pid) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Samples a single process (not its children). `None` if it vanished
/// before or during the sample.
pub fn sample_process(pid: u32, interval: Duration) -> Option<Usage> {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    let kind = ProcessRefreshKind::new().with_cpu().with_memory();
    if !sys.refresh_process_specifics(pid, kind) {
        return None;
    }
    thread::sleep(interval.max(MINIMUM_CPU_UPDATE_INTERVAL));
    if !sys.refresh_process_specifics(pid, kind) {
        return None;
    }
    let process = sys.process(pid)?;
    if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
        return None;
    }
    let cpu = f64::from(process.cpu_usage());
    Some(Usage {
        cpu_percent: if cpu.is_finite() { cpu.max(0.0) } else { 0.0 },
        memory_mb: process.memory() as f64 / BYTES_PER_MB,
    })
}

pub fn system_usage(interval: Duration) -> SystemUsage {
    let mut sys = System::new();
    sys.refresh_cpu();
    thread::sleep(interval.max(MINIMUM_CPU_UPDATE_INTERVAL));
    sys.refresh_cpu();
    sys.refresh_memory();

    let total = sys.total_memory() as f64;
    let used = sys.used_memory() as f64;
    let available = sys.available_memory() as f64;
    let memory_percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };
    SystemUsage {
        cpu_usage_percent: f64::from(sys.global_cpu_info().cpu_usage()),
        memory_usage_percent: round2(memory_percent),
        total_memory_gb: round2(total / BYTES_PER_GB),
        used_memory_gb: round2(used / BYTES_PER_GB),
        available_memory_gb: round2(available / BYTES_PER_GB),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn current_process_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn absent_record_is_not_running() {
        let dir = tempdir().unwrap();
        let prober = Prober::new(PidStore::new(dir.path()), Duration::from_millis(200));
        let demo = AppName::parse("demo").unwrap();
        assert!(!prober.is_running(&demo).unwrap());
        assert_eq!(prober.usage(&demo).unwrap(), None);
        assert!(!dir.path().join("demo.lock").exists());
    }

    #[cfg(unix)]
    #[test]
    fn stale_record_is_removed_on_check() {
        let dir = tempdir().unwrap();
        let store = PidStore::new(dir.path());
        let prober = Prober::new(store.clone(), Duration::from_millis(200));
        let demo = AppName::parse("demo").unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        store.write(&demo, pid).unwrap();

        assert!(!prober.is_running(&demo).unwrap());
        assert!(!store.contains(&demo));
    }

    #[test]
    fn live_record_reports_usage() {
        let dir = tempdir().unwrap();
        let store = PidStore::new(dir.path());
        let prober = Prober::new(store.clone(), Duration::from_millis(200));
        let demo = AppName::parse("demo").unwrap();
        store.write(&demo, std::process::id()).unwrap();

        assert!(prober.is_running(&demo).unwrap());
        let usage = prober.usage(&demo).unwrap().expect("usage");
        assert!(usage.cpu_percent >= 0.0);
        assert!(usage.memory_mb > 0.0);
        assert!(store.contains(&demo));
    }

    #[test]
    fn system_usage_is_sane() {
        let usage = system_usage(Duration::from_millis(200));
        assert!(usage.total_memory_gb > 0.0);
        assert!(usage.memory_usage_percent >= 0.0 && usage.memory_usage_percent <= 100.0);
        assert!(usage.cpu_usage_percent >= 0.0);
    }
}
