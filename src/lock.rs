//! Host-wide run lock: one migration at a time.
//!
//! fs2 advisory exclusive lock on `<dir>/bootclone.lock` (dir is normally the system temp
//! directory). A second process fails fast instead of queueing behind a multi-hour clone.
//! The lock is released on Drop; the file itself stays.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::consts::LOCK_FILE;

pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub fn lock_file_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE)
}

/// Take the run lock or fail immediately if another migration holds it.
pub fn try_acquire_run_lock(dir: &Path) -> Result<RunLock> {
    let path = lock_file_path(dir);
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))?;

    file.try_lock_exclusive().with_context(|| {
        format!(
            "another migration is running (lock held on {})",
            path.display()
        )
    })?;

    // holder pid, informational only
    file.set_len(0)
        .and_then(|_| writeln!(file, "{}", std::process::id()))
        .with_context(|| format!("write lock file {}", path.display()))?;

    Ok(RunLock { file, path })
}
