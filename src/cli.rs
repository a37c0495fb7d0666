use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::deps::{DEFAULT_CLOUD_LOCALDS, DEFAULT_QEMU, DEFAULT_QEMU_IMG, Toolchain};

#[derive(Parser, Debug)]
#[command(
    name = "solovm",
    about = "Launch a single VM from its saved definition"
)]
pub struct Cli {
    /// Directory holding `<name>.conf` VM definitions [default: ~/vms]
    #[arg(long, env = "VM_DIR")]
    pub vm_dir: Option<PathBuf>,

    /// Hypervisor binary
    #[arg(long, env = "SOLOVM_QEMU", default_value = DEFAULT_QEMU)]
    pub qemu: String,

    /// qemu-img binary used to resize disk images
    #[arg(long, env = "SOLOVM_QEMU_IMG", default_value = DEFAULT_QEMU_IMG)]
    pub qemu_img: String,

    /// cloud-localds binary used to package seed images
    #[arg(
        long,
        env = "SOLOVM_CLOUD_LOCALDS",
        default_value = DEFAULT_CLOUD_LOCALDS
    )]
    pub cloud_localds: String,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn vm_dir(&self) -> PathBuf {
        self.vm_dir.clone().unwrap_or_else(crate::paths::default_vm_dir)
    }

    pub fn toolchain(&self) -> Toolchain {
        Toolchain {
            qemu: self.qemu.clone(),
            qemu_img: self.qemu_img.clone(),
            cloud_localds: self.cloud_localds.clone(),
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Provision and boot the VM, blocking until the guest shuts down (default)
    Up,

    /// Show whether the VM is running
    Status {
        /// VM name (defaults to the only configured VM)
        name: Option<String>,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the hypervisor command line without launching
    Args {
        /// VM name (defaults to the only configured VM)
        name: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_is_the_default() {
        let cli = Cli::try_parse_from(["solovm", "--vm-dir", "/srv/vms"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.vm_dir(), PathBuf::from("/srv/vms"));
    }

    #[test]
    fn tool_overrides() {
        let cli = Cli::try_parse_from([
            "solovm",
            "--qemu",
            "/opt/qemu/bin/qemu-system-x86_64",
            "--cloud-localds",
            "/usr/local/bin/cloud-localds",
            "args",
            "web01",
        ])
        .unwrap();
        let tools = cli.toolchain();
        assert_eq!(tools.qemu, "/opt/qemu/bin/qemu-system-x86_64");
        assert_eq!(tools.cloud_localds, "/usr/local/bin/cloud-localds");
        assert_eq!(
            cli.command,
            Some(Command::Args {
                name: Some("web01".into())
            })
        );
    }

    #[test]
    fn status_json_flag() {
        let cli = Cli::try_parse_from(["solovm", "status", "--json"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Status {
                name: None,
                json: true
            })
        );
    }
}
