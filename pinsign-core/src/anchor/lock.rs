//! Advisory lock serializing trust anchor creation
//!
//! `flock(LOCK_EX)` on a per-customer lock file. The lock is tied to the open
//! file description, so it is released when the guard drops or the process
//! exits, and it excludes other processes as well as other handles in this one.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Held while a customer's anchor is checked or generated
#[derive(Debug)]
pub struct AnchorLock {
    _file: File,
    path: PathBuf,
}

impl AnchorLock {
    /// Block until the exclusive lock on `path` is acquired
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.create(true).read(true).write(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(path)?;

        flock_exclusive(&file)?;
        trace!("Acquired anchor lock {}", path.display());

        Ok(AnchorLock {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn flock_exclusive(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        loop {
            // SAFETY: fd is a valid descriptor owned by `file` for the whole call.
            let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}
