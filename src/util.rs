use std::ffi::OsStr;

use tokio::process::Command;

use crate::error::VmError;

/// Parse a human-readable size string into bytes.
///
/// Accepts formats like `"20G"`, `"512M"`, `"100K"`, `"1073741824"`.
/// Uses binary units (1G = 1024³ = 1,073,741,824 bytes).
pub fn parse_size(s: &str) -> Result<u64, VmError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(VmError::Validation {
            message: "size cannot be empty".into(),
        });
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.parse().map_err(|_| VmError::Validation {
        message: format!("invalid size number: '{num_str}'"),
    })?;

    let multiplier: u64 = match suffix.as_str() {
        "" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(VmError::Validation {
                message: format!("unknown size suffix: '{suffix}' (use G, M, K, or T)"),
            });
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| VmError::Validation {
            message: format!("size overflows: '{s}'"),
        })
}

/// Parse a guest memory size the way `qemu -m` reads it, returning MiB.
///
/// A bare number is MiB; otherwise a single `K`, `M`, `G` or `T` suffix.
pub fn parse_memory_mib(s: &str) -> Result<u64, VmError> {
    let s = s.trim();
    let (num_str, suffix) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&s[..i], Some(c.to_ascii_uppercase())),
        _ => (s, None),
    };

    let num: u64 = num_str.parse().map_err(|_| VmError::Validation {
        message: format!("invalid memory size: '{s}' (use e.g. 2048, 512M or 2G)"),
    })?;

    let bytes = match suffix {
        None | Some('M') => num.checked_mul(1024 * 1024),
        Some('K') => num.checked_mul(1024),
        Some('G') => num.checked_mul(1024 * 1024 * 1024),
        Some('T') => num.checked_mul(1024 * 1024 * 1024 * 1024),
        Some(c) => {
            return Err(VmError::Validation {
                message: format!("unknown memory suffix: '{c}' (use K, M, G or T)"),
            });
        }
    };

    match bytes.map(|b| b / (1024 * 1024)) {
        Some(mib) if mib > 0 => Ok(mib),
        Some(_) => Err(VmError::Validation {
            message: format!("memory must be at least 1M (got '{s}')"),
        }),
        None => Err(VmError::Validation {
            message: format!("memory size overflows: '{s}'"),
        }),
    }
}

/// Run an external tool to completion and return its trimmed stdout.
///
/// A non-zero exit becomes `ExternalCommand` carrying the tool's stderr.
pub async fn run_tool<I, S>(program: &str, args: I) -> Result<String, VmError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let shown = std::iter::once(program.to_string())
        .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
        .collect::<Vec<_>>()
        .join(" ");
    tracing::debug!(command = %shown, "exec");

    let output = Command::new(program)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| VmError::ExternalCommand {
            command: shown.clone(),
            message: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(VmError::ExternalCommand {
            command: shown,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGTERM handler, listening for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
