use std::path::{Path, PathBuf};

/// Extension of VM configuration files in the VM directory.
pub const CONF_EXT: &str = "conf";

/// Default VM directory: `~/vms/`
pub fn default_vm_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vms")
}

/// Path to the configuration record for a VM: `<vm_dir>/<name>.conf`
pub fn conf_path(vm_dir: &Path, name: &str) -> PathBuf {
    vm_dir.join(format!("{name}.{CONF_EXT}"))
}

/// Lock file held for the lifetime of a launched VM.
pub fn lock_path(vm_dir: &Path, name: &str) -> PathBuf {
    vm_dir.join(format!("{name}.lock"))
}

/// Per-VM manager log: `<vm_dir>/logs/<name>.log`
pub fn log_path(vm_dir: &Path, name: &str) -> PathBuf {
    vm_dir.join("logs").join(format!("{name}.log"))
}

/// Staging path for a download or packaging step, renamed into place on success.
pub fn staging_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}
