//! QEMU argument vector for a VM record.

use crate::config::{PortForward, VmRecord};

/// Guest port the base network backend forwards `ssh_port` to.
pub const GUEST_SSH_PORT: u16 = 22;

/// Id of the user-mode backend carrying the SSH forward.
pub const BASE_NETDEV_ID: &str = "n0";

/// Build the hypervisor flags for `record`. Pure and deterministic.
///
/// Extra port forwards each get their own user-mode backend, numbered from
/// `n1` upward in list order.
pub fn build_args(record: &VmRecord) -> Vec<String> {
    let mut args = Args::default();

    args.flag("-enable-kvm");
    args.pair("-m", &record.config.memory);
    args.pair("-smp", record.config.cpus.to_string());
    args.pair("-cpu", "host");

    args.pair(
        "-drive",
        format!("file={},if=virtio,index=0", record.img_file.display()),
    );
    args.pair(
        "-drive",
        format!(
            "file={},if=virtio,index=1,format=raw",
            record.seed_file.display()
        ),
    );
    args.pair("-boot", "order=c");

    let ssh = PortForward {
        host: record.ssh_port,
        guest: GUEST_SSH_PORT,
    };
    args.user_netdev(BASE_NETDEV_ID, ssh);

    for (i, fwd) in record.port_forwards.iter().enumerate() {
        args.user_netdev(&format!("n{}", i + 1), *fwd);
    }

    if record.config.gui_mode {
        args.pair("-vga", "virtio");
        args.pair("-display", "gtk,gl=on");
    } else {
        args.flag("-nographic");
        args.pair("-serial", "mon:stdio");
    }

    args.pair("-device", "virtio-balloon-pci");
    args.pair("-object", "rng-random,id=rng0,filename=/dev/urandom");
    args.pair("-device", "virtio-rng-pci,rng=rng0");

    args.0
}

/// `hostfwd` rule for a TCP forward.
pub fn hostfwd(fwd: PortForward) -> String {
    format!("hostfwd=tcp::{}-:{}", fwd.host, fwd.guest)
}

#[derive(Default)]
struct Args(Vec<String>);

impl Args {
    fn flag(&mut self, flag: &str) {
        self.0.push(flag.to_string());
    }

    fn pair(&mut self, flag: &str, value: impl Into<String>) {
        self.0.push(flag.to_string());
        self.0.push(value.into());
    }

    fn user_netdev(&mut self, id: &str, fwd: PortForward) {
        self.pair("-netdev", format!("user,id={id},{}", hostfwd(fwd)));
        self.pair("-device", format!("virtio-net-pci,netdev={id}"));
    }
}
