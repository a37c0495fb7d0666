use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VmError {
    #[error("required executables not found: {}", tools.join(", "))]
    #[diagnostic(help(
        "install them or point solovm at them with --qemu, --qemu-img, --cloud-localds"
    ))]
    DependencyMissing { tools: Vec<String> },

    #[error("no VM configuration named '{name}' in {dir}")]
    ConfigNotFound { name: String, dir: String },

    #[error("expected exactly one VM configuration in {dir}, found {count}")]
    #[diagnostic(help(
        "solovm manages a single VM; keep exactly one <name>.conf in the VM directory"
    ))]
    ConfigCount { count: usize, dir: String },

    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("image download failed: {message}")]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("resizing {path} to {size} failed: {message}")]
    ImageResize {
        path: String,
        size: String,
        message: String,
    },

    #[error("building seed image failed: {message}")]
    SeedBuild { message: String },

    #[error("image file missing: {path}")]
    #[diagnostic(help(
        "this VM has no image_url, so the disk image must be provisioned out-of-band"
    ))]
    ImageFileMissing { path: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("hypervisor exited with {status}")]
    Hypervisor { status: String },

    #[error("interrupted by signal")]
    Interrupted,
}
