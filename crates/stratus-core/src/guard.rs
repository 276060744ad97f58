//! Process guard: at most one live instance per lock file.
//!
//! The lock file holds the owner's PID. On unix the file is additionally held
//! with an exclusive `flock`, which the kernel drops when the owner exits for
//! any reason, so a crashed owner never blocks the next start. The recorded
//! PID is checked for liveness to report who holds the lock and to log
//! reclaimed stale files.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::GuardError;

/// Live exclusivity handle. Released on drop.
pub struct ProcessGuard {
    path: PathBuf,
    pid: u32,
    #[cfg(unix)]
    lock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    file: File,
}

impl std::fmt::Debug for ProcessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGuard")
            .field("path", &self.path)
            .field("pid", &self.pid)
            .finish()
    }
}

impl ProcessGuard {
    /// Acquire the lock at `path`, creating the file (and parent directories) if needed.
    ///
    /// Fails with `GuardError::AlreadyRunning` while another live process holds it.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, GuardError> {
        let path = path.into();
        let io_err = |source| GuardError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        Self::acquire_at(path.clone()).inspect(|guard| {
            info!(lock = %guard.path.display(), pid = guard.pid, "process guard acquired");
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[cfg(unix)]
    fn acquire_at(path: PathBuf) -> Result<Self, GuardError> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let pid = std::process::id();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| GuardError::Io {
                path: path.clone(),
                source,
            })?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                note_previous_owner(&path, read_pid(&lock), pid);
                write_pid(&lock, pid).map_err(|source| GuardError::Io {
                    path: path.clone(),
                    source,
                })?;
                Ok(Self { path, pid, lock })
            }
            Err((file, errno)) if errno == Errno::EWOULDBLOCK => {
                let owner = read_pid(&file).filter(|p| process_is_alive(*p));
                Err(GuardError::AlreadyRunning { path, pid: owner })
            }
            Err((_, errno)) => Err(GuardError::Io {
                path,
                source: std::io::Error::from(errno),
            }),
        }
    }

    #[cfg(not(unix))]
    fn acquire_at(path: PathBuf) -> Result<Self, GuardError> {
        let pid = std::process::id();
        // create_new で作れた側が owner。残っていた file は PID で生死を確認する
        for _ in 0..2 {
            match OpenOptions::new().read(true).write(true).create_new(true).open(&path) {
                Ok(file) => {
                    write_pid(&file, pid).map_err(|source| GuardError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    return Ok(Self { path, pid, file });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let owner = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match owner {
                        Some(p) if process_is_alive(p) => {
                            return Err(GuardError::AlreadyRunning { path, pid: Some(p) });
                        }
                        _ => {
                            note_previous_owner(&path, owner, pid);
                            let _ = std::fs::remove_file(&path);
                        }
                    }
                }
                Err(source) => return Err(GuardError::Io { path, source }),
            }
        }
        Err(GuardError::AlreadyRunning { path, pid: None })
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        // file は残す（unlink すると別プロセスが古い inode を lock する競合が起きる）
        #[cfg(unix)]
        let _ = self.lock.set_len(0);
        #[cfg(not(unix))]
        {
            let _ = self.file.set_len(0);
            let _ = std::fs::remove_file(&self.path);
        }
        info!(lock = %self.path.display(), "process guard released");
    }
}

fn note_previous_owner(path: &Path, previous: Option<u32>, pid: u32) {
    match previous {
        Some(prev) if prev != pid && process_is_alive(prev) => {
            warn!(lock = %path.display(), previous = prev, "lock file named a live process that no longer held it");
        }
        Some(prev) if prev != pid => {
            info!(lock = %path.display(), previous = prev, "reclaimed stale lock file");
        }
        _ => {}
    }
}

fn read_pid(mut file: &File) -> Option<u32> {
    file.seek(SeekFrom::Start(0)).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid(mut file: &File, pid: u32) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{pid}")?;
    file.sync_all()
}

/// Liveness check for a recorded owner PID.
#[cfg(unix)]
pub fn process_is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // signal 0: 存在確認のみ。EPERM は「存在するが別ユーザー」
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Without a portable liveness check, only our own PID is known to be alive.
#[cfg(not(unix))]
pub fn process_is_alive(pid: u32) -> bool {
    pid == std::process::id()
}
