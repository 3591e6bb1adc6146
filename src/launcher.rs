use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub entry_point: PathBuf,
    pub working_dir: PathBuf,
    pub log_file: PathBuf,
}

impl LaunchSpec {
    pub fn command(&self) -> io::Result<Command> {
        let log = open_log(&self.log_file)?;
        let log_err = log.try_clone()?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&self.entry_point)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        detach(&mut cmd);
        Ok(cmd)
    }
}

#[derive(Debug)]
pub struct Launched {
    child: Child,
}

impl Launched {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn release(self) {
        let mut child = self.child;
        let pid = child.id();
        let spawned = thread::Builder::new()
            .name(format!("reap-{pid}"))
            .spawn(move || match child.wait() {
                Ok(status) => debug!(pid, %status, "app process exited"),
                Err(err) => warn!(pid, error = %err, "failed to wait for app process"),
            });
        if let Err(err) = spawned {
            warn!(pid, error = %err, "failed to start reaper thread");
        }
    }

    pub fn abort(mut self) {
        let pid = self.child.id();
        if let Err(err) = self.child.kill() {
            warn!(pid, error = %err, "failed to kill aborted launch");
        }
        let _ = self.child.wait();
    }
}

pub fn spawn(spec: &LaunchSpec) -> io::Result<Launched> {
    let mut cmd = spec.command()?;
    debug!(command = ?cmd, "spawning app process");
    let child = cmd.spawn()?;
    Ok(Launched { child })
}

pub fn write_banner(log_file: &Path, message: &str) -> io::Result<()> {
    let mut log = open_log(log_file)?;
    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    writeln!(log, "[{ts}] appvisor: {message}")
}

fn open_log(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(unix)]
pub(crate) fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // New session: no controlling terminal, own process group, unaffected by
    // signals aimed at the supervisor's group.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(io::Error::from)?;
            Ok(())
        });
    }
}

#[cfg(windows)]
pub(crate) fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
pub(crate) fn detach(_cmd: &mut Command) {}
