use crate::error::{AppvisorError, Result};
use crate::name::AppName;
use crate::pid_store::{NameLock, PidStore};
use crate::probe::pid_alive;
use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, System};
use tracing::{info, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The record was cleared. `confirmed` is false when the process was
    /// still present once the wait timed out.
    Stopped { pid: u32, confirmed: bool },
    NotRunning,
}

pub trait ProcessKiller: Send + Sync {
    fn kill_pid(&self, pid: u32) -> std::result::Result<(), String>;
    fn kill_group(&self, pgid: u32) -> std::result::Result<(), String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsKiller;

impl ProcessKiller for OsKiller {
    fn kill_pid(&self, pid: u32) -> std::result::Result<(), String> {
        kill_pid(pid)
    }

    fn kill_group(&self, pgid: u32) -> std::result::Result<(), String> {
        kill_group(pgid)
    }
}

#[derive(Debug, Clone)]
pub struct Terminator<K = OsKiller> {
    store: PidStore,
    timeout: Duration,
    killer: K,
}

impl Terminator {
    pub fn new(store: PidStore, timeout: Duration) -> Self {
        Self::with_killer(store, timeout, OsKiller)
    }
}

impl<K: ProcessKiller> Terminator<K> {
    pub fn with_killer(store: PidStore, timeout: Duration, killer: K) -> Self {
        Self {
            store,
            timeout,
            killer,
        }
    }

    /// The record is removed even when signalling fails. The failure is
    /// still returned as [`AppvisorError::TerminationFailure`].
    pub fn stop_locked(&self, name: &AppName, _lock: &NameLock) -> Result<StopOutcome> {
        let Some(pid) = self.store.read_or_discard(name)? else {
            return Ok(StopOutcome::NotRunning);
        };
        let result = terminate_tree(pid, self.timeout, &self.killer);
        let cleared = self.store.delete(name);
        let confirmed = match result {
            Ok(confirmed) => confirmed,
            Err(mut message) => {
                if let Err(err) = cleared {
                    warn!(app = %name, pid, error = %err, "failed to clear pid record");
                    message = format!("{message}; pid record not cleared: {err}");
                }
                return Err(AppvisorError::TerminationFailure {
                    name: name.to_string(),
                    pid,
                    message,
                });
            }
        };
        cleared?;
        if confirmed {
            info!(app = %name, pid, "app stopped");
        } else {
            warn!(app = %name, pid, timeout = ?self.timeout, "app did not exit before timeout");
        }
        Ok(StopOutcome::Stopped { pid, confirmed })
    }
}

pub fn terminate_tree(
    root: u32,
    timeout: Duration,
    killer: &impl ProcessKiller,
) -> std::result::Result<bool, String> {
    if !pid_alive(root) {
        // Members of the dead leader's group keep its pgid reserved.
        return killer
            .kill_group(root)
            .map(|()| true)
            .map_err(|err| format!("process group {root}: {err}"));
    }
    let tree = descendants(root);
    let leads_group = leads_process_group(root);
    let mut failures = Vec::new();
    for pid in tree.iter().rev() {
        if let Err(err) = killer.kill_pid(*pid) {
            failures.push(format!("pid {pid}: {err}"));
        }
    }
    if let Err(err) = killer.kill_pid(root) {
        failures.push(format!("pid {root}: {err}"));
    }
    if leads_group {
        // Catches anything forked between the snapshot and the kills.
        if let Err(err) = killer.kill_group(root) {
            failures.push(format!("process group {root}: {err}"));
        }
    }

    let mut pending = tree;
    pending.push(root);
    let confirmed = wait_for_exit(&pending, timeout);
    if failures.is_empty() {
        Ok(confirmed)
    } else {
        Err(failures.join("; "))
    }
}

pub fn descendants(root: u32) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessRefreshKind::new());

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in sys.processes() {
        let Some(parent) = process.parent() else {
            continue;
        };
        if parent.as_u32() != pid.as_u32() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(pid.as_u32());
        }
    }

    let mut out = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(child_pids) = children.get(&pid) {
            for child in child_pids {
                if *child != root && !out.contains(child) {
                    out.push(*child);
                    queue.push_back(*child);
                }
            }
        }
    }
    out
}

fn wait_for_exit(pids: &[u32], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pids.iter().all(|pid| !pid_alive(*pid)) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> std::result::Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err.to_string()),
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) -> std::result::Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err.to_string()),
    }
}

#[cfg(unix)]
fn leads_process_group(pid: u32) -> bool {
    use nix::unistd::{getpgid, Pid};

    let pid = Pid::from_raw(pid as i32);
    getpgid(Some(pid)).map(|pgid| pgid == pid).unwrap_or(false)
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> std::result::Result<(), String> {
    use sysinfo::Pid;

    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    if !sys.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
        return Ok(());
    }
    match sys.process(pid) {
        Some(process) if !process.kill() => Err("kill request was rejected".to_string()),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) -> std::result::Result<(), String> {
    Ok(())
}

#[cfg(not(unix))]
fn leads_process_group(_pid: u32) -> bool {
    false
}
