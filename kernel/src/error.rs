//! The module containing the crate's one fallible, `Result`-propagating error
//! type: everything that can go wrong before the guest ever runs.
//!
//! Once the guest is running, handlers never return [`StartupError`] or any
//! other `Result` — they return a raw negative errno that crosses the
//! syscall ABI boundary into guest registers (see `syscall::Handler`).

use std::path::PathBuf;

/// A condition that prevents the emulator from starting the guest at all.
#[derive(Debug, thiserror::Error)]
pub(crate) enum StartupError {
    #[error("failed to read executable {0:?}: {1}")]
    ReadExecutable(PathBuf, #[source] std::io::Error),

    #[error("failed to parse ELF executable: {0}")]
    ParseElf(#[source] goblin::error::Error),

    #[error("unsupported executable: {0}")]
    UnsupportedExecutable(String),

    #[error("failed to resolve mount root {0:?}")]
    ResolveMountRoot(PathBuf),

    #[error("hypervisor refused to create a VM: {0}")]
    HypervisorInit(String),

    #[error("failed to open log sink {0:?}: {1}")]
    OpenLogSink(PathBuf, #[source] std::io::Error),

    #[error("failed to drop privileges: {0}")]
    DropPrivilege(#[source] nix::Error),
}
