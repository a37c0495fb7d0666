use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::error::VmError;
use crate::util::shutdown_signal;

/// A running hypervisor attached to this terminal.
pub struct HypervisorProcess {
    child: Child,
    program: String,
}

impl HypervisorProcess {
    /// Start `program` with `args`, sharing stdin/stdout/stderr so a headless
    /// guest's serial console lands on the controlling terminal.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, VmError> {
        tracing::debug!(program, ?args, "starting hypervisor");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| VmError::Io {
                context: format!("starting {program}"),
                source: e,
            })?;
        Ok(Self {
            child,
            program: program.to_string(),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Block until the guest shuts down.
    ///
    /// SIGINT/SIGTERM received meanwhile is passed on to the hypervisor as
    /// SIGTERM, and the hypervisor is then waited for.
    pub async fn wait(mut self) -> Result<ExitStatus, VmError> {
        let status = tokio::select! {
            status = self.child.wait() => status,
            _ = shutdown_signal() => {
                tracing::info!(program = %self.program, "signal received, stopping hypervisor");
                terminate(&self.child);
                self.child.wait().await
            }
        };
        status.map_err(|e| VmError::Io {
            context: format!("waiting for {}", self.program),
            source: e,
        })
    }
}

impl Drop for HypervisorProcess {
    fn drop(&mut self) {
        terminate(&self.child);
    }
}

/// Send SIGTERM to `child`. No-op once it has been reaped.
fn terminate(child: &Child) {
    if let Some(pid) = child.id()
        && let Ok(pid) = i32::try_from(pid)
        && let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
    {
        tracing::warn!(pid, error = %e, "failed to signal hypervisor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[tokio::test]
    async fn wait_returns_hypervisor_exit_status() {
        let proc = HypervisorProcess::spawn("sh", &["-c".into(), "exit 3".into()]).unwrap();
        assert!(proc.id().is_some());
        let status = proc.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let err = HypervisorProcess::spawn("solovm-no-such-hypervisor", &[]).err().unwrap();
        assert!(matches!(err, VmError::Io { .. }));
    }

    #[tokio::test]
    async fn terminate_sends_sigterm() {
        let mut proc = HypervisorProcess::spawn("sleep", &["30".into()]).unwrap();
        terminate(&proc.child);
        let status = proc.child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    }
}
