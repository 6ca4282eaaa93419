//! Error taxonomy shared across every subsystem.
//!
//! Public functions return `anyhow::Result`, but the leaf error raised at
//! the point of failure is always one of these variants so callers can
//! `downcast_ref::<RelkitError>()` to branch on kind (e.g. the configurator
//! turns `BundleNotFound` into `ToolchainNotFoundError`/`SDKNotFoundError`
//! with remediation text, and the `wait` subcommand treats 404 specially).

use thiserror::Error;

/// A single, distinguishable failure mode crossing component boundaries.
#[derive(Debug, Error)]
pub enum RelkitError {
    /// The requested bundle archive does not exist at the computed URL (HTTP 404).
    #[error("bundle not found at {url}")]
    BundleNotFound {
        /// The URL that was requested.
        url: String,
    },

    /// Any non-404 HTTP failure while fetching or polling a bundle.
    #[error("network error fetching {url}: {source}")]
    NetworkError {
        /// The URL that was requested.
        url: String,
        /// The underlying transport error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An external process (build driver, git, tar) exited nonzero.
    #[error("command failed with status {status}: {argv}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}")]
    ChildProcessFailed {
        /// The argument vector that was executed, joined for display.
        argv: String,
        /// The process exit status, or -1 if it was terminated by a signal.
        status: i32,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// A declared dependency refers to an unknown package id, or a required
    /// environment tool is absent (qemu, vswhere, an MSVC installation).
    #[error("missing dependency: {0}")]
    MissingDependencyError(String),

    /// Topological sort found a cycle.
    #[error("dependency cycle: {}", .participants.join(" -> "))]
    DependencyCycleError {
        /// Identifiers of the packages participating in the cycle, in order.
        participants: Vec<String>,
    },

    /// The dependency-description document is malformed.
    #[error("malformed dependency description: {0}")]
    ConfigError(String),

    /// `git describe`-style version output did not match the expected shape.
    #[error("could not parse version output: {0}")]
    VersionParseError(String),

    /// `FRIDA_QEMU_SYSROOT` is set but no `qemu-<arch>` binary is on `PATH`.
    #[error("FRIDA_QEMU_SYSROOT is set but qemu-{arch} was not found on PATH")]
    QEMUNotFoundError {
        /// The architecture suffix that was searched for.
        arch: String,
    },

    /// Configurator-level wrapper around `BundleNotFound` for the toolchain bundle.
    #[error("toolchain bundle not available: {reason}\n{remediation}")]
    ToolchainNotFoundError {
        /// Human-readable reason (usually forwarded from `BundleNotFound`).
        reason: String,
        /// Actionable remediation text (e.g. `--without-prebuilds=toolchain`).
        remediation: String,
    },

    /// Configurator-level wrapper around `BundleNotFound` for the SDK bundle.
    #[error("SDK bundle not available: {reason}\n{remediation}")]
    SDKNotFoundError {
        /// Human-readable reason (usually forwarded from `BundleNotFound`).
        reason: String,
        /// Actionable remediation text.
        remediation: String,
    },

}

impl RelkitError {
    /// Build a [`RelkitError::ChildProcessFailed`] from a finished [`std::process::Output`].
    pub fn from_process_output(argv: &[String], output: &std::process::Output) -> Self {
        RelkitError::ChildProcessFailed {
            argv: argv.join(" "),
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}
