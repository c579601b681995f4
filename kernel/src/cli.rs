//! The command-line surface: `uservm [options] <elf> [args...]`.
//!
//! Generalized from the teacher's `xtask` build-tool [`clap::Parser`]/
//! [`clap::Subcommand`] pattern into the emulator's actual runtime CLI, with
//! the option set taken from the original implementation's `getopt_long`
//! table (`-o/-w/-s/-m`).

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, about = "A user-space Linux ABI emulator", long_about = None)]
pub(crate) struct Cli {
    /// Redirect the kernel's informational log output to this file (default: stdout).
    #[arg(short = 'o', long = "output")]
    pub(crate) output: Option<PathBuf>,

    /// Redirect warnings and errors to this file (default: stderr).
    #[arg(short = 'w')]
    pub(crate) warn: Option<PathBuf>,

    /// Trace every syscall the guest makes to this file.
    #[arg(short = 's', long = "strace")]
    pub(crate) strace: Option<PathBuf>,

    /// Root directory the guest's filesystem syscalls are resolved under.
    /// Defaults to `<exe-dir>/../mnt`.
    #[arg(short = 'm', long = "mnt")]
    pub(crate) mnt: Option<PathBuf>,

    /// The guest ELF executable to run.
    pub(crate) elf: PathBuf,

    /// Arguments passed to the guest as `argv[1..]`.
    pub(crate) args: Vec<String>,
}

/// Resolves the effective mount root: the `--mnt` override, or
/// `<exe-dir>/../mnt` otherwise, mirroring `default_mnt` in the original
/// implementation (which derives it from `_NSGetExecutablePath`).
pub(crate) fn resolve_mnt_root(cli: &Cli) -> std::io::Result<PathBuf> {
    if let Some(mnt) = &cli.mnt {
        return std::fs::canonicalize(mnt);
    }
    let exe = std::env::current_exe()?;
    let exe_dir = exe
        .parent()
        .map_or_else(|| PathBuf::from("."), PathBuf::from);
    std::fs::canonicalize(exe_dir.join(crate::config::DEFAULT_MNT_SUFFIX))
}
