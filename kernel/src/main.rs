//! `uservm`: a user-space Linux-ABI emulator for macOS, built on Apple's
//! Hypervisor.framework. Loads an unmodified Linux x86-64 executable, runs
//! it inside a hardware VM, and services every trap — syscalls, CPUID,
//! page faults, signals — so the guest believes it is talking to a Linux
//! kernel.
//!
//! Grounded on the original implementation's `main.c` (`main`,
//! `drop_privilege`, `default_mnt`) for the startup sequence this binary
//! runs through before handing off to [`task::run_loop`].

mod address_space;
mod cli;
mod config;
mod cpuid;
mod elf;
mod errno;
mod error;
mod exit;
mod kernel;
mod logger;
mod page_table;
mod signal;
mod strace;
mod syscall;
mod task;
mod uaccess;
mod vmm;

use clap::Parser;
use log::error;

use cli::Cli;
use error::StartupError;
use kernel::Kernel;
use strace::Strace;

fn main() {
    if let Err(e) = drop_privilege() {
        eprintln!("uservm: failed to drop privileges: {e}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if let Err(e) = logger::init_file_logger(cli.output.as_deref(), cli.warn.as_deref()) {
        eprintln!("uservm: failed to open log sink: {e}");
        std::process::exit(1);
    }

    match run(&cli) {
        Ok((_process, task)) => task::run_loop(task),
        Err(e) => {
            error!("startup failed: {e}");
            std::process::exit(1);
        }
    }
}

/// Builds the strace sink (if requested), the `Kernel`, loads the guest ELF,
/// and returns its first task ready to enter [`task::run_loop`].
fn run(cli: &Cli) -> Result<(std::sync::Arc<task::Process>, task::Task), StartupError> {
    let strace = cli.strace.as_deref().map(Strace::open).transpose()?;
    let kernel = Kernel::new(cli)?;
    kernel.bootstrap(cli, strace)
}

/// Drops from the setuid-root euid this binary may have been installed
/// with back to the real uid, elevating only ever required around a
/// chroot-style mount-root resolution. Mirrors `drop_privilege` in the
/// original implementation.
fn drop_privilege() -> nix::Result<()> {
    nix::unistd::seteuid(nix::unistd::getuid())
}
