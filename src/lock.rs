//! Host-wide advisory lock serializing firewall changes.
//!
//! Every agent on a host that edits iptables through weftnet takes the same
//! `flock` before touching the tables, so bulk restores never interleave.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[cfg(test)]
use mockall::automock;

/// Default location of the iptables lock file.
pub const IPTABLES_LOCK_FILE: &str = "/var/run/weftnet/iptables.lock";

/// A lock that can be taken and released explicitly.
#[cfg_attr(test, automock)]
pub trait Locker: Send + Sync {
    /// Block until the lock is held.
    fn lock(&self) -> Result<()>;

    fn unlock(&self) -> Result<()>;
}

/// `flock`-based [`Locker`] on a file path.
///
/// Each `lock` opens its own descriptor, so threads in one process contend
/// with each other exactly like separate processes do.
pub struct FileLocker {
    path: PathBuf,
    held: Mutex<Option<File>>,
}

impl FileLocker {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory: {:?}", parent))?;
        }

        // create+read+write without truncate, so an existing holder's file is untouched
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("Failed to open lock file: {:?}", self.path))?;

        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
            .context("Failed to set lock file permissions")?;

        Ok(file)
    }
}

impl Default for FileLocker {
    fn default() -> Self {
        Self::new(IPTABLES_LOCK_FILE)
    }
}

impl Locker for FileLocker {
    fn lock(&self) -> Result<()> {
        let file = self.open()?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {:?}", self.path))?;

        let mut held = self
            .held
            .lock()
            .map_err(|_| anyhow::anyhow!("lock state poisoned"))?;
        *held = Some(file);
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        let file = self
            .held
            .lock()
            .map_err(|_| anyhow::anyhow!("lock state poisoned"))?
            .take();

        match file {
            Some(file) => file
                .unlock()
                .with_context(|| format!("Failed to unlock {:?}", self.path)),
            None => anyhow::bail!("unlock called without holding {:?}", self.path),
        }
    }
}
