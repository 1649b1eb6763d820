//! Single-instance guard backed by a PID lock file.
//!
//! The lock record is the decimal PID of the owning process. A record whose
//! owner is no longer alive, or whose content cannot be parsed, is stale and
//! gets reclaimed. The lock is released when [`ProcessLock`] is dropped, so
//! every exit path of the scope holding it (normal return, propagated error,
//! cancellation after a termination signal) removes the record exactly once.
//!
//! Acquisition runs under an exclusive non-blocking `flock` on a sibling
//! `<lock>.guard` file. Two instances can therefore never interleave the
//! read, probe, remove and create steps of a stale reclaim; the one that
//! finds the guard busy backs off.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{SweeperError, SweeperResult};

/// Creation attempts before giving up to a concurrent instance.
const MAX_CREATE_ATTEMPTS: usize = 3;

/// Capability to ask whether a process is alive without disturbing it.
pub trait LivenessProbe: Send + Sync {
    /// `true` if a process with this id exists.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Liveness probe that sends signal 0 to the process.
///
/// `EPERM` means the process exists but belongs to someone else, which still
/// counts as alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

impl LivenessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // 0 and negative ids address process groups, never a single owner
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// Content of the lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    pub owner_pid: u32,
}

impl LockRecord {
    /// Parse lock file content. Torn or foreign content yields `None`.
    #[must_use]
    pub fn parse(content: &str) -> Option<Self> {
        content
            .trim()
            .parse::<u32>()
            .ok()
            .map(|owner_pid| Self { owner_pid })
    }

    fn render(self) -> String {
        self.owner_pid.to_string()
    }
}

/// PID-file lock ensuring only one sweeper runs at a time.
pub struct ProcessLock<P: LivenessProbe = SignalProbe> {
    path: PathBuf,
    pid: u32,
    probe: P,
    held: bool,
}

impl ProcessLock<SignalProbe> {
    /// Lock at `path` owned by the current process.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_probe(path, std::process::id(), SignalProbe)
    }
}

impl<P: LivenessProbe> ProcessLock<P> {
    /// Lock with an explicit owner id and liveness probe.
    #[must_use]
    pub fn with_probe(path: impl Into<PathBuf>, pid: u32, probe: P) -> Self {
        Self {
            path: path.into(),
            pid,
            probe,
            held: false,
        }
    }

    /// Location of the lock record.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this instance currently owns the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// PID currently recorded in the lock file, if any.
    #[must_use]
    pub fn current_owner(&self) -> Option<u32> {
        self.read_record().map(|r| r.owner_pid)
    }

    /// Try to become the single running instance.
    ///
    /// Returns `Ok(false)` when another live process owns the lock; that is a
    /// normal outcome, not an error.
    pub fn acquire(&mut self) -> SweeperResult<bool> {
        if self.held {
            return Ok(true);
        }

        let lock_err = |source| SweeperError::Lock {
            path: self.path.clone(),
            source,
        };
        let Some(_guard) = self.lock_guard().map_err(lock_err)? else {
            info!(path = %self.path.display(), "Another instance is acquiring the lock");
            return Ok(false);
        };

        for _ in 0..MAX_CREATE_ATTEMPTS {
            match self.try_create() {
                Ok(()) => {
                    self.held = true;
                    info!(path = %self.path.display(), pid = self.pid, "Lock acquired");
                    return Ok(true);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(source) => {
                    return Err(SweeperError::Lock {
                        path: self.path.clone(),
                        source,
                    })
                }
            }

            match self.read_record() {
                Some(record) if record.owner_pid == self.pid => {
                    // Left behind by an earlier process that had our PID
                    self.held = true;
                    info!(path = %self.path.display(), pid = self.pid, "Lock acquired (record already ours)");
                    return Ok(true);
                }
                Some(record) if self.probe.is_alive(record.owner_pid) => {
                    info!(
                        path = %self.path.display(),
                        owner = record.owner_pid,
                        "Another instance holds the lock"
                    );
                    return Ok(false);
                }
                Some(record) => {
                    warn!(
                        path = %self.path.display(),
                        owner = record.owner_pid,
                        "Reclaiming stale lock (owner not running)"
                    );
                }
                None => {
                    warn!(path = %self.path.display(), "Reclaiming unreadable lock record");
                }
            }
            self.remove_record()?;
        }

        info!(path = %self.path.display(), "Lost lock race to another instance");
        Ok(false)
    }

    /// Release the lock if this process still owns the record.
    ///
    /// Idempotent. A record naming a different owner is left untouched.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;

        match self.read_record() {
            Some(record) if record.owner_pid == self.pid => match fs::remove_file(&self.path) {
                Ok(()) => info!(path = %self.path.display(), "Lock released"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove lock file"),
            },
            Some(record) => warn!(
                path = %self.path.display(),
                owner = record.owner_pid,
                "Lock now owned by another process, leaving it in place"
            ),
            None => debug!(path = %self.path.display(), "Lock record already gone"),
        }
    }

    /// Sibling file whose `flock` serializes acquisition.
    fn guard_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".guard");
        PathBuf::from(name)
    }

    fn ensure_parent(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Exclusive guard lock, or `None` while another instance holds it.
    /// The guard is released when the returned value is dropped.
    fn lock_guard(&self) -> std::io::Result<Option<Flock<File>>> {
        self.ensure_parent()?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.guard_path())?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => Ok(Some(guard)),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(errno.into()),
        }
    }

    fn try_create(&self) -> std::io::Result<()> {
        self.ensure_parent()?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        file.write_all(LockRecord { owner_pid: self.pid }.render().as_bytes())?;
        file.sync_all()
    }

    fn read_record(&self) -> Option<LockRecord> {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| LockRecord::parse(&content))
    }

    fn remove_record(&self) -> SweeperResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SweeperError::Lock {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl<P: LivenessProbe> Drop for ProcessLock<P> {
    fn drop(&mut self) {
        self.release();
    }
}
