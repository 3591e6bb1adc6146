use crate::error::Result;
use crate::name::AppName;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PidStore {
    dir: PathBuf,
}

/// Exclusive per-name critical section. Released when dropped.
#[derive(Debug)]
pub struct NameLock {
    file: File,
    path: PathBuf,
}

impl NameLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NameLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %err, "failed to release app lock");
        }
    }
}

impl PidStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, name: &AppName) -> PathBuf {
        self.dir.join(format!("{name}.pid"))
    }

    fn lock_path(&self, name: &AppName) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Blocks until the exclusive lock for `name` is held. The advisory
    /// `flock` also serializes separate supervisor processes.
    pub fn lock(&self, name: &AppName) -> Result<NameLock> {
        self.ensure_dir()?;
        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.lock_exclusive()?;
        Ok(NameLock { file, path })
    }

    pub fn write(&self, name: &AppName, pid: u32) -> Result<()> {
        self.ensure_dir()?;
        let path = self.record_path(name);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let tmp_path = self.dir.join(format!(
            ".{name}.pid.tmp.{}.{ts}",
            std::process::id()
        ));
        fs::write(&tmp_path, format!("{pid}\n"))?;
        if let Err(err) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        debug!(app = %name, pid, "pid record written");
        Ok(())
    }

    pub fn read(&self, name: &AppName) -> Result<Option<u32>> {
        let path = self.record_path(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        parse_pid(&text).map(Some).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("corrupt pid record {}: {:?}", path.display(), text.trim()),
            )
            .into()
        })
    }

    /// Like [`PidStore::read`], but a corrupt record is deleted and treated
    /// as absent. Callers must hold the name lock.
    pub fn read_or_discard(&self, name: &AppName) -> Result<Option<u32>> {
        match self.read(name) {
            Err(crate::AppvisorError::Io(err)) if err.kind() == io::ErrorKind::InvalidData => {
                warn!(app = %name, error = %err, "discarding corrupt pid record");
                self.delete(name)?;
                Ok(None)
            }
            other => other,
        }
    }

    pub fn delete(&self, name: &AppName) -> Result<()> {
        match fs::remove_file(self.record_path(name)) {
            Ok(()) => {
                debug!(app = %name, "pid record deleted");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn contains(&self, name: &AppName) -> bool {
        self.record_path(name).is_file()
    }
}

fn parse_pid(text: &str) -> Option<u32> {
    let pid = text.trim().parse::<u32>().ok()?;
    // 0 and values outside pid_t would address process groups, not a process.
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(pid)
}
