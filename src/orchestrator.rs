//! Single-VM launch pipeline: select the sole configuration, skip it if it is
//! already up, otherwise provision its images and run the hypervisor until the
//! guest shuts down.

use facet::Facet;

use crate::config::{ConfigStore, VmRecord};
use crate::deps::Toolchain;
use crate::error::VmError;
use crate::image;
use crate::invocation;
use crate::launch::HypervisorProcess;
use crate::liveness::{self, VmLock};
use crate::logging::DeferredFileHandle;
use crate::paths;
use crate::util::shutdown_signal;

/// How a launch attempt ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The VM's hypervisor was already up; nothing was launched.
    AlreadyRunning { name: String },
    /// The hypervisor ran and exited cleanly.
    Completed { name: String },
}

/// Liveness summary printed by `solovm status`.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct VmStatus {
    pub name: String,
    pub running: bool,
    pub ssh_port: u16,
    pub img_file: String,
    pub seed_file: String,
}

pub struct Orchestrator {
    store: ConfigStore,
    tools: Toolchain,
    log: Option<DeferredFileHandle>,
}

impl Orchestrator {
    pub fn new(store: ConfigStore, tools: Toolchain) -> Self {
        Self {
            store,
            tools,
            log: None,
        }
    }

    /// Route file logging to `<vm_dir>/logs/<name>.log` once a VM is selected.
    pub fn with_log(mut self, handle: DeferredFileHandle) -> Self {
        self.log = Some(handle);
        self
    }

    /// Name of the only stored configuration.
    pub fn select(&self) -> Result<String, VmError> {
        let mut names = self.store.list()?;
        if names.len() != 1 {
            return Err(VmError::ConfigCount {
                count: names.len(),
                dir: self.store.dir().display().to_string(),
            });
        }
        Ok(names.remove(0))
    }

    /// Launch the sole VM and block until its hypervisor exits.
    ///
    /// SIGINT/SIGTERM during provisioning abandons it with `Interrupted`.
    pub async fn run(&self) -> Result<RunOutcome, VmError> {
        self.run_until(shutdown_signal()).await
    }

    async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<RunOutcome, VmError> {
        let name = self.select()?;
        let record = self.store.load(&name)?;
        self.activate_log(&name);
        tracing::info!(name, conf = %record.conf_path.display(), "selected VM");

        // Holding the lock is the liveness check for launchers; the process
        // scan catches hypervisors started outside solovm.
        let lock_path = paths::lock_path(self.store.dir(), &name);
        let Some(lock) = VmLock::acquire(&lock_path).await? else {
            tracing::info!(name, "VM lock is held, VM is already running");
            return Ok(RunOutcome::AlreadyRunning { name });
        };
        if liveness::scan_process_table(self.tools.hypervisor_name(), &record.img_file) {
            tracing::info!(name, "found a hypervisor using the VM image");
            return Ok(RunOutcome::AlreadyRunning { name });
        }

        tokio::select! {
            ready = image::ensure_ready(&record, &self.tools) => { ready?; }
            _ = shutdown => {
                tracing::warn!(name, "interrupted while provisioning");
                return Err(VmError::Interrupted);
            }
        }

        let args = invocation::build_args(&record);
        tracing::debug!(
            qemu = %self.tools.qemu,
            args = %args.join(" "),
            "hypervisor command line"
        );

        let hypervisor = HypervisorProcess::spawn(&self.tools.qemu, &args)?;
        if let Some(pid) = hypervisor.id() {
            tracing::info!(name, pid, ssh_port = record.ssh_port, "hypervisor started");
            if let Err(e) = lock.record_pid(pid) {
                tracing::warn!(error = %e, "could not record hypervisor pid");
            }
        }

        let status = hypervisor.wait().await?;
        drop(lock);

        if !status.success() {
            return Err(VmError::Hypervisor {
                status: status.to_string(),
            });
        }
        tracing::info!(name, "hypervisor exited");
        Ok(RunOutcome::Completed { name })
    }

    /// Liveness of `name`, or of the sole VM when no name is given.
    pub fn status(&self, name: Option<&str>) -> Result<VmStatus, VmError> {
        let record = self.resolve(name)?;
        let running = liveness::is_running(&self.store, &record.name, self.tools.hypervisor_name());
        Ok(VmStatus {
            running,
            ssh_port: record.ssh_port,
            img_file: record.img_file.display().to_string(),
            seed_file: record.seed_file.display().to_string(),
            name: record.name,
        })
    }

    /// Full hypervisor command line for `name`, or for the sole VM.
    pub fn command_line(&self, name: Option<&str>) -> Result<Vec<String>, VmError> {
        let record = self.resolve(name)?;
        let mut argv = vec![self.tools.qemu.clone()];
        argv.extend(invocation::build_args(&record));
        Ok(argv)
    }

    fn resolve(&self, name: Option<&str>) -> Result<VmRecord, VmError> {
        match name {
            Some(name) => self.store.load(name),
            None => self.store.load(&self.select()?),
        }
    }

    fn activate_log(&self, name: &str) {
        let Some(handle) = &self.log else { return };
        let path = paths::log_path(self.store.dir(), name);
        if let Err(e) = handle.set_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "file logging disabled");
        }
    }
}
