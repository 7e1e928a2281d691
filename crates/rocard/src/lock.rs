use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{ChannelError, Result};

/// Cross-process exclusivity for one (card, channel) pair.
///
/// The lock is a file created with `O_EXCL` containing the holder's PID.
/// Acquired on engine construction, released on drop. If the file exists
/// but its recorded holder is no longer alive, the stale file is removed
/// and acquisition retried exactly once.
#[derive(Debug)]
pub struct ChannelLock {
    path: PathBuf,
}

impl ChannelLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        match Self::try_create(path) {
            Ok(lock) => return Ok(lock),
            Err(ChannelError::LockBusy { pid }) if !process_alive(pid) => {
                warn!(pid, path = %path.display(), "removing stale channel lock");
                // The holder is gone; nobody else can legitimately hold this
                // channel, so removing the file is safe. Retry once only.
                fs::remove_file(path).ok();
            }
            Err(err) => return Err(err),
        }

        Self::try_create(path).map_err(|err| match err {
            ChannelError::LockBusy { .. } => ChannelError::LockStale,
            other => other,
        })
    }

    fn try_create(path: &Path) -> Result<Self> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => {
                use std::io::Write;
                let mut file = file;
                write!(file, "{}", std::process::id())?;
                Ok(ChannelLock {
                    path: path.to_path_buf(),
                })
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let pid = fs::read_to_string(path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok())
                    .unwrap_or(0);
                Err(ChannelError::LockBusy { pid })
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for ChannelLock {
    fn drop(&mut self) {
        fs::remove_file(&self.path).ok();
    }
}

fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ch0.lock");
        let lock = ChannelLock::acquire(&path).unwrap();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_by_live_holder_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ch0.lock");
        let _lock = ChannelLock::acquire(&path).unwrap();
        match ChannelLock::acquire(&path) {
            Err(ChannelError::LockBusy { pid }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected LockBusy, got {other:?}"),
        }
    }

    #[test]
    fn stale_lock_is_reclaimed_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ch0.lock");
        // A PID that cannot be alive: the maximum pid namespace value plus
        // a margin is not portable, so use 0 which we always treat as dead.
        fs::write(&path, "0").unwrap();
        let lock = ChannelLock::acquire(&path).unwrap();
        drop(lock);
        assert!(!path.exists());
    }
}
