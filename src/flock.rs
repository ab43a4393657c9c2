use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

/// Exclusive process lock over the engine data directory.
///
/// The lock file records the owning process ID for debugging. The lock is
/// released when the handle drops; the file itself is left behind to avoid
/// unlink races with a competing process.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "data directory already locked");
            Error::Busy
        })?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> std::io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> std::io::Result<()> {
        // No advisory locking available; single-process use is assumed.
        Ok(())
    }

    pub fn unlock(self) -> Result<()> {
        // Dropping the handle releases the lock; the file stays behind.
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS releases the lock when the descriptor closes.
    }
}
