//! The fixed-arity syscall dispatch table: one slot per Linux x86-64
//! syscall number this crate recognizes, each either a real handler or the
//! shared `-ENOSYS` stub.
//!
//! Grounded on the original implementation's `sc_handler_table` (a plain C
//! array of function pointers indexed by syscall number, built by the
//! `DEFINE_SYSCALL` macro across `src/syscall/*.c`) and on `NR_SYSCALLS`
//! bounding the table the same way [`TABLE_LEN`] does here.

pub(crate) mod fs;
pub(crate) mod mm;
pub(crate) mod process;
pub(crate) mod signal;

use lazy_static::lazy_static;

use crate::task::Task;

/// A registered syscall handler: six raw guest-ABI argument words in,
/// a signed Linux-errno-or-success value out.
pub(crate) type Handler = fn(&Task, [u64; 6]) -> i64;

const ENOSYS: i64 = -38;

/// `rt_sigreturn`'s syscall number. The exit dispatcher needs this one
/// outside the otherwise-private [`nr`] table: unlike every other syscall,
/// `rt_sigreturn` leaves the VCPU's RIP pointing at the handler's
/// restored-from-sigframe value, which the dispatcher must not then advance
/// by the trapping `SYSCALL` instruction's own length.
pub(crate) const NR_RT_SIGRETURN: usize = nr::RT_SIGRETURN;

/// Linux x86-64 syscall numbers this crate's table has an opinion about.
/// Anything outside the named handlers falls through to
/// [`stub_unimplemented`].
mod nr {
    pub(crate) const READ: usize = 0;
    pub(crate) const WRITE: usize = 1;
    pub(crate) const OPEN: usize = 2;
    pub(crate) const CLOSE: usize = 3;
    pub(crate) const FSTAT: usize = 5;
    pub(crate) const MMAP: usize = 9;
    pub(crate) const MPROTECT: usize = 10;
    pub(crate) const BRK: usize = 12;
    pub(crate) const RT_SIGACTION: usize = 13;
    pub(crate) const RT_SIGPROCMASK: usize = 14;
    pub(crate) const RT_SIGRETURN: usize = 15;
    pub(crate) const IOCTL: usize = 16;
    pub(crate) const SCHED_YIELD: usize = 24;
    pub(crate) const ALARM: usize = 37;
    pub(crate) const GETPID: usize = 39;
    pub(crate) const CLONE: usize = 56;
    pub(crate) const FORK: usize = 57;
    pub(crate) const EXIT: usize = 60;
    pub(crate) const WAIT4: usize = 61;
    pub(crate) const KILL: usize = 62;
    pub(crate) const UNAME: usize = 63;
    pub(crate) const RT_SIGPENDING: usize = 127;
    pub(crate) const SIGALTSTACK: usize = 131;
    pub(crate) const ARCH_PRCTL: usize = 158;
    pub(crate) const GETUID: usize = 102;
    pub(crate) const GETGID: usize = 104;
    pub(crate) const GETEUID: usize = 107;
    pub(crate) const GETEGID: usize = 108;
    pub(crate) const GETPPID: usize = 110;
    pub(crate) const SET_TID_ADDRESS: usize = 218;
    pub(crate) const EXIT_GROUP: usize = 231;
}

/// One slot of the dispatch table: the handler itself plus the name the
/// tracer prints, kept together so the two can never drift out of sync.
struct Entry {
    name: &'static str,
    handler: Handler,
}

const HIGHEST_KNOWN_NR: usize = nr::EXIT_GROUP;

lazy_static! {
    static ref TABLE: Vec<Entry> = {
        let mut table: Vec<Entry> = (0..=HIGHEST_KNOWN_NR)
            .map(|_| Entry { name: "unimplemented", handler: stub_unimplemented })
            .collect();
        let mut set = |n: usize, name: &'static str, handler: Handler| {
            table[n] = Entry { name, handler };
        };
        set(nr::READ, "read", fs::read);
        set(nr::WRITE, "write", fs::write);
        set(nr::OPEN, "open", fs::open);
        set(nr::CLOSE, "close", fs::close);
        set(nr::FSTAT, "fstat", fs::fstat);
        set(nr::MMAP, "mmap", mm::mmap);
        set(nr::MPROTECT, "mprotect", mm::mprotect);
        set(nr::BRK, "brk", mm::brk);
        set(nr::RT_SIGACTION, "rt_sigaction", signal::rt_sigaction);
        set(nr::RT_SIGPROCMASK, "rt_sigprocmask", signal::rt_sigprocmask);
        set(nr::RT_SIGRETURN, "rt_sigreturn", signal::rt_sigreturn);
        set(nr::IOCTL, "ioctl", fs::ioctl);
        set(nr::SCHED_YIELD, "sched_yield", process::sched_yield);
        set(nr::ALARM, "alarm", signal::alarm);
        set(nr::GETPID, "getpid", process::getpid);
        set(nr::CLONE, "clone", process::clone);
        set(nr::FORK, "fork", process::fork);
        set(nr::EXIT, "exit", process::exit);
        set(nr::WAIT4, "wait4", process::wait4);
        set(nr::KILL, "kill", signal::kill);
        set(nr::UNAME, "uname", process::uname);
        set(nr::RT_SIGPENDING, "rt_sigpending", signal::rt_sigpending);
        set(nr::SIGALTSTACK, "sigaltstack", signal::sigaltstack);
        set(nr::ARCH_PRCTL, "arch_prctl", process::arch_prctl);
        set(nr::GETUID, "getuid", process::getuid);
        set(nr::GETGID, "getgid", process::getgid);
        set(nr::GETEUID, "geteuid", process::geteuid);
        set(nr::GETEGID, "getegid", process::getegid);
        set(nr::GETPPID, "getppid", process::getppid);
        set(nr::SET_TID_ADDRESS, "set_tid_address", process::set_tid_address);
        set(nr::EXIT_GROUP, "exit_group", process::exit_group);
        table
    };
}

/// One past the highest syscall number the table has a slot for; the
/// dispatcher raises `SIGSYS` for anything at or beyond this, matching
/// `NR_SYSCALLS`. Kept as a plain constant so callers (the exit dispatcher)
/// can compare against it without forcing `lazy_static`'s first-touch
/// initialization.
pub(crate) const TABLE_LEN: usize = HIGHEST_KNOWN_NR + 1;

/// Dispatches syscall number `nr` with the six raw argument words already
/// pulled from the guest's RDI/RSI/RDX/R10/R8/R9, as `sc_handler_table[rax]`
/// did.
pub(crate) fn dispatch(task: &Task, nr: usize, args: [u64; 6]) -> i64 {
    TABLE.get(nr).map_or(ENOSYS, |entry| (entry.handler)(task, args))
}

/// The name the tracer prints for `nr`, or `"unimplemented"` past the end
/// of the table.
pub(crate) fn name_of(nr: usize) -> &'static str {
    TABLE.get(nr).map_or("unimplemented", |entry| entry.name)
}

fn stub_unimplemented(_task: &Task, _args: [u64; 6]) -> i64 {
    log::warn!("unimplemented syscall");
    ENOSYS
}
