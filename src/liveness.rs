//! Is a VM's hypervisor already running?
//!
//! The launcher holds an exclusive `flock` on `<vm_dir>/<name>.lock` for as
//! long as the hypervisor runs; the kernel drops it when the holder exits.
//! Hypervisors started some other way are caught by scanning the process
//! table for the hypervisor binary plus the VM's image path. The scan is a
//! heuristic: an unrelated command line containing both strings is a false
//! positive, and an image moved since launch is a false negative.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use sysinfo::{ProcessRefreshKind, System, UpdateKind};

use crate::config::ConfigStore;
use crate::error::VmError;
use crate::paths;

/// How long `VmLock::acquire` keeps retrying before treating the lock as held.
const LOCK_ATTEMPTS: u32 = 5;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(40);

/// Exclusive lock held for the lifetime of a launched VM.
///
/// The lock is released when the guard is dropped.
pub struct VmLock {
    file: Flock<File>,
    path: PathBuf,
}

impl VmLock {
    /// Take the lock without blocking. `Ok(None)` means another process holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, VmError> {
        let file = File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| VmError::Io {
                context: format!("opening lock file {}", path.display()),
                source: e,
            })?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err((_, e)) if e == Errno::EWOULDBLOCK => Ok(None),
            Err((_, e)) => Err(VmError::Io {
                context: format!("locking {}", path.display()),
                source: e.into(),
            }),
        }
    }

    /// Take the lock, retrying briefly.
    ///
    /// `is_locked` holds the lock for an instant while probing; a few retries
    /// outlast that, while a launcher holds it for the VM's whole lifetime.
    pub async fn acquire(path: &Path) -> Result<Option<Self>, VmError> {
        for attempt in 1..=LOCK_ATTEMPTS {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(Some(lock));
            }
            if attempt < LOCK_ATTEMPTS {
                tokio::time::sleep(LOCK_RETRY_DELAY).await;
            }
        }
        Ok(None)
    }

    /// Record the hypervisor's pid in the lock file for operators.
    pub fn record_pid(&self, pid: u32) -> Result<(), VmError> {
        let write = || -> std::io::Result<()> {
            let mut f: &File = &self.file;
            f.set_len(0)?;
            f.seek(SeekFrom::Start(0))?;
            writeln!(f, "{pid}")
        };
        write().map_err(|e| VmError::Io {
            context: format!("writing pid to {}", self.path.display()),
            source: e,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether some process currently holds the lock at `path`.
///
/// The check takes the lock itself for an instant, so a concurrent
/// `try_acquire` can fail spuriously; launchers use `VmLock::acquire`.
pub fn is_locked(path: &Path) -> bool {
    let Ok(file) = File::options().read(true).write(true).open(path) else {
        return false;
    };
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(_held) => false,
        Err((_, e)) => e == Errno::EWOULDBLOCK,
    }
}

/// Whether `name`'s hypervisor is running. Unloadable records count as not running.
pub fn is_running(store: &ConfigStore, name: &str, hypervisor: &str) -> bool {
    let record = match store.load(name) {
        Ok(record) => record,
        Err(e) => {
            tracing::debug!(name, error = %e, "cannot load record, treating VM as stopped");
            return false;
        }
    };

    if is_locked(&paths::lock_path(store.dir(), name)) {
        tracing::debug!(name, "VM lock is held");
        return true;
    }

    let found = scan_process_table(hypervisor, &record.img_file);
    if found {
        tracing::debug!(name, hypervisor, "found hypervisor process using the VM image");
    }
    found
}

/// Scan the process table for a `hypervisor` process whose arguments mention `img`.
pub fn scan_process_table(hypervisor: &str, img: &Path) -> bool {
    let img = img.to_string_lossy();
    let me = sysinfo::get_current_pid().ok();

    // Command lines are not loaded by a plain refresh.
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));
    sys.processes()
        .iter()
        .filter(|(pid, _)| Some(**pid) != me)
        .any(|(_, process)| cmdline_matches(process.cmd(), hypervisor, &img))
}

/// Command-line test behind `scan_process_table`.
pub fn cmdline_matches(cmd: &[String], hypervisor: &str, img: &str) -> bool {
    cmd.iter().any(|arg| arg.contains(hypervisor)) && cmd.iter().any(|arg| arg.contains(img))
}
