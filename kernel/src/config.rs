//! The module containing various constants that may be modified by developers.

/// The default logging level, overridden by `-v`/`-q` on the CLI.
pub(crate) const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Info;

/// The highest guest-virtual address this emulator will ever map. Guest
/// pointers with bit 47 set are rejected before they ever reach a page walk.
pub(crate) const GUEST_ADDR_LIMIT: u64 = 1 << 47;

/// Page size assumed everywhere; the guest is always a flat long-mode address
/// space with 4KB pages.
pub(crate) const PAGE_SIZE: u64 = 0x1000;

/// Where the initial `mmap`-managed region starts growing from, mirroring
/// `current_mmap_top` in the original implementation.
pub(crate) const INITIAL_MMAP_TOP: u64 = 0xc000_0000;

/// Size of the stack mapped for the initial task, in bytes.
pub(crate) const INITIAL_STACK_SIZE: u64 = 8 * 1024 * 1024;

/// Highest usable guest stack address; the stack grows down from here.
pub(crate) const INITIAL_STACK_TOP: u64 = 0x7fff_ffff_f000;

/// Number of signal numbers the signal subsystem tracks, one-indexed, same
/// as Linux's `_NSIG`.
pub(crate) const NSIG: usize = 64;

/// Reported kernel release string for `uname`, matching the ABI level this
/// emulator targets.
pub(crate) const LINUX_RELEASE: &str = "4.6.4";

/// Reported kernel version string for `uname`.
pub(crate) const LINUX_VERSION: &str = "#1 SMP PREEMPT";

/// Default mount root suffix appended to the executable's directory when
/// `--mnt` is not given on the CLI.
pub(crate) const DEFAULT_MNT_SUFFIX: &str = "../mnt";
