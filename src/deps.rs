//! External executables the launcher shells out to.

use crate::error::VmError;

pub const DEFAULT_QEMU: &str = "qemu-system-x86_64";
pub const DEFAULT_QEMU_IMG: &str = "qemu-img";
pub const DEFAULT_CLOUD_LOCALDS: &str = "cloud-localds";

/// Names or paths of the hypervisor and the image tools.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub qemu: String,
    pub qemu_img: String,
    pub cloud_localds: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            qemu: DEFAULT_QEMU.into(),
            qemu_img: DEFAULT_QEMU_IMG.into(),
            cloud_localds: DEFAULT_CLOUD_LOCALDS.into(),
        }
    }
}

impl Toolchain {
    /// Verify every tool resolves to an executable.
    ///
    /// Collects all missing tools into a single `DependencyMissing` error.
    pub fn check(&self) -> Result<(), VmError> {
        let missing: Vec<String> = [&self.qemu, &self.qemu_img, &self.cloud_localds]
            .into_iter()
            .filter(|tool| which::which(tool.as_str()).is_err())
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(VmError::DependencyMissing { tools: missing })
        }
    }

    /// File name of the hypervisor binary, used to recognise it in the process table.
    pub fn hypervisor_name(&self) -> &str {
        std::path::Path::new(&self.qemu)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.qemu)
    }
}
