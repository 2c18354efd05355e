//! Advisory cross-process file locks.
//!
//! Locks are `flock(2)` based and tied to the open descriptor: dropping the
//! guard closes the file and releases the lock, whether the owner exits
//! cleanly, fails or is cancelled.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::fcntl::{flock, FlockArg};

pub struct LockGuard {
    _file: File,
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
}

/// Acquire `path` exclusively, blocking until the lock is free.
pub fn lock_file_blocking<P: AsRef<Path>>(path: P) -> io::Result<LockGuard> {
    let file = open_lock_file(path.as_ref())?;
    flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(io::Error::from)?;
    Ok(LockGuard { _file: file })
}

/// Try to acquire `path` without blocking. Returns `Ok(None)` when the lock
/// is held by someone else.
pub fn try_lock_file<P: AsRef<Path>>(path: P, exclusive: bool) -> io::Result<Option<LockGuard>> {
    let file = open_lock_file(path.as_ref())?;
    let arg = if exclusive {
        FlockArg::LockExclusiveNonblock
    } else {
        FlockArg::LockSharedNonblock
    };
    match flock(file.as_raw_fd(), arg) {
        Ok(()) => Ok(Some(LockGuard { _file: file })),
        Err(nix::errno::Errno::EAGAIN) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Like [`try_lock_file`], retrying until `timeout` elapsed.
pub fn lock_file_timeout<P: AsRef<Path>>(path: P, timeout: Duration) -> io::Result<LockGuard> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(guard) = try_lock_file(path.as_ref(), true)? {
            return Ok(guard);
        }
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("timed out waiting for lock {:?}", path.as_ref()),
            ));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Exclusive non-blocking lock that records the owning PID in the lock
/// file, so an operator can tell who holds a stale looking lock.
pub fn try_lock_file_pid<P: AsRef<Path>>(path: P) -> io::Result<Option<LockGuard>> {
    let mut file = open_lock_file(path.as_ref())?;
    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => {
            file.set_len(0)?;
            writeln!(file, "{}", std::process::id())?;
            Ok(Some(LockGuard { _file: file }))
        }
        Err(nix::errno::Errno::EAGAIN) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exclusive_lock() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.lock");

        let guard = try_lock_file(&path, true)?;
        assert!(guard.is_some());

        // a second descriptor cannot take the lock while the first is held
        assert!(try_lock_file(&path, true)?.is_none());

        drop(guard);
        assert!(try_lock_file(&path, true)?.is_some());

        Ok(())
    }

    #[test]
    fn test_pid_lock() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("host.lock");

        let guard = try_lock_file_pid(&path)?.expect("lock should be free");
        let content = std::fs::read_to_string(&path)?;
        assert_eq!(content.trim(), std::process::id().to_string());

        assert!(try_lock_file_pid(&path)?.is_none());
        drop(guard);

        Ok(())
    }
}
