//! Host <-> Linux errno translation.
//!
//! macOS and Linux agree on the small, common errno values but diverge
//! past roughly 35; this table translates the host's `errno` (as returned
//! by `nix`/`libc` calls) into the Linux numbering a guest expects to see
//! in `-RAX`, mirroring the implicit translation every `syswrap`-style
//! passthrough in the original implementation performs.

/// Translates a host `errno` value (positive) into the negative Linux
/// errno value a syscall handler returns.
pub(crate) fn host_errno_to_linux(host_errno: i32) -> i64 {
    let linux = match host_errno {
        libc::EPERM => 1,
        libc::ENOENT => 2,
        libc::ESRCH => 3,
        libc::EINTR => 4,
        libc::EIO => 5,
        libc::ENXIO => 6,
        libc::E2BIG => 7,
        libc::ENOEXEC => 8,
        libc::EBADF => 9,
        libc::ECHILD => 10,
        libc::EAGAIN => 11,
        libc::ENOMEM => 12,
        libc::EACCES => 13,
        libc::EFAULT => 14,
        libc::ENOTBLK => 15,
        libc::EBUSY => 16,
        libc::EEXIST => 17,
        libc::EXDEV => 18,
        libc::ENODEV => 19,
        libc::ENOTDIR => 20,
        libc::EISDIR => 21,
        libc::EINVAL => 22,
        libc::ENFILE => 23,
        libc::EMFILE => 24,
        libc::ENOTTY => 25,
        libc::ETXTBSY => 26,
        libc::EFBIG => 27,
        libc::ENOSPC => 28,
        libc::ESPIPE => 29,
        libc::EROFS => 30,
        libc::EMLINK => 31,
        libc::EPIPE => 32,
        libc::EDOM => 33,
        libc::ERANGE => 34,
        libc::EDEADLK => 35,
        libc::ENAMETOOLONG => 36,
        libc::ENOLCK => 37,
        libc::ENOSYS => 38,
        libc::ENOTEMPTY => 39,
        libc::ELOOP => 40,
        // No direct Linux analogue for some macOS-specific codes; fall
        // back to EINVAL rather than leak a host-specific number.
        _ => 22,
    };
    -linux
}

/// Translates the process's current `errno` (as set by the last failing
/// libc call) into a Linux errno return value.
pub(crate) fn last_host_errno_to_linux() -> i64 {
    host_errno_to_linux(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
}

/// Translates a host (BSD/Darwin) signal number into its Linux numbering,
/// for the asynchronous host-signal reception path. Returns 0 for host
/// signals with no Linux counterpart this crate forwards.
pub(crate) fn host_signal_to_linux(host_signum: std::ffi::c_int) -> u32 {
    match host_signum {
        libc::SIGHUP => linux_signal::SIGHUP,
        libc::SIGINT => linux_signal::SIGINT,
        libc::SIGQUIT => linux_signal::SIGQUIT,
        libc::SIGILL => linux_signal::SIGILL,
        libc::SIGTRAP => linux_signal::SIGTRAP,
        libc::SIGABRT => linux_signal::SIGABRT,
        libc::SIGBUS => linux_signal::SIGBUS,
        libc::SIGFPE => linux_signal::SIGFPE,
        libc::SIGKILL => linux_signal::SIGKILL,
        libc::SIGUSR1 => linux_signal::SIGUSR1,
        libc::SIGSEGV => linux_signal::SIGSEGV,
        libc::SIGUSR2 => linux_signal::SIGUSR2,
        libc::SIGPIPE => linux_signal::SIGPIPE,
        libc::SIGALRM => linux_signal::SIGALRM,
        libc::SIGTERM => linux_signal::SIGTERM,
        libc::SIGCHLD => linux_signal::SIGCHLD,
        libc::SIGCONT => linux_signal::SIGCONT,
        libc::SIGSTOP => linux_signal::SIGSTOP,
        _ => 0,
    }
}

/// Translates a Linux signal number into its host (BSD/Darwin) counterpart,
/// the inverse of [`host_signal_to_linux`], needed wherever a guest-issued
/// `kill` targets another real host process (a separate `fork`ed guest).
/// Returns `None` for Linux signals with no host equivalent this crate
/// forwards.
pub(crate) fn linux_signal_to_host(linux_signum: u32) -> Option<std::ffi::c_int> {
    use linux_signal as l;
    Some(match linux_signum {
        s if s == l::SIGHUP => libc::SIGHUP,
        s if s == l::SIGINT => libc::SIGINT,
        s if s == l::SIGQUIT => libc::SIGQUIT,
        s if s == l::SIGILL => libc::SIGILL,
        s if s == l::SIGTRAP => libc::SIGTRAP,
        s if s == l::SIGABRT => libc::SIGABRT,
        s if s == l::SIGBUS => libc::SIGBUS,
        s if s == l::SIGFPE => libc::SIGFPE,
        s if s == l::SIGKILL => libc::SIGKILL,
        s if s == l::SIGUSR1 => libc::SIGUSR1,
        s if s == l::SIGSEGV => libc::SIGSEGV,
        s if s == l::SIGUSR2 => libc::SIGUSR2,
        s if s == l::SIGPIPE => libc::SIGPIPE,
        s if s == l::SIGALRM => libc::SIGALRM,
        s if s == l::SIGTERM => libc::SIGTERM,
        s if s == l::SIGCHLD => libc::SIGCHLD,
        s if s == l::SIGCONT => libc::SIGCONT,
        s if s == l::SIGSTOP => libc::SIGSTOP,
        _ => return None,
    })
}

/// Translates a Linux signal bitmask (as stored in [`crate::task::Task`]'s
/// `sigmask`) into the host `SigSet` it corresponds to, for the host-mask
/// sync `setup_sigframe`/`sc_rt_sigreturn` perform via `sigprocmask` in the
/// original implementation. Bits with no host equivalent are dropped.
pub(crate) fn linux_sigset_to_host(mask: u64) -> nix::sys::signal::SigSet {
    let mut set = nix::sys::signal::SigSet::empty();
    for signum in 1..crate::config::NSIG as u32 {
        if mask & (1u64 << signum) != 0 {
            if let Some(host_signum) = linux_signal_to_host(signum) {
                if let Ok(sig) = nix::sys::signal::Signal::try_from(host_signum) {
                    set.add(sig);
                }
            }
        }
    }
    set
}

/// Linux signal numbers used by the signal subsystem and by syscall
/// handlers that raise a signal on the caller (`SIGSEGV`, `SIGILL`,
/// `SIGSYS`), kept here since they are, in effect, part of the same
/// "translate host concept to Linux numbering" table.
pub(crate) mod linux_signal {
    pub(crate) const SIGHUP: u32 = 1;
    pub(crate) const SIGINT: u32 = 2;
    pub(crate) const SIGQUIT: u32 = 3;
    pub(crate) const SIGILL: u32 = 4;
    pub(crate) const SIGTRAP: u32 = 5;
    pub(crate) const SIGABRT: u32 = 6;
    pub(crate) const SIGBUS: u32 = 7;
    pub(crate) const SIGFPE: u32 = 8;
    pub(crate) const SIGKILL: u32 = 9;
    pub(crate) const SIGUSR1: u32 = 10;
    pub(crate) const SIGSEGV: u32 = 11;
    pub(crate) const SIGUSR2: u32 = 12;
    pub(crate) const SIGPIPE: u32 = 13;
    pub(crate) const SIGALRM: u32 = 14;
    pub(crate) const SIGTERM: u32 = 15;
    pub(crate) const SIGCHLD: u32 = 17;
    pub(crate) const SIGCONT: u32 = 18;
    pub(crate) const SIGSTOP: u32 = 19;
    pub(crate) const SIGSYS: u32 = 31;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_common_codes() {
        assert_eq!(host_errno_to_linux(libc::ENOENT), -2);
        assert_eq!(host_errno_to_linux(libc::EACCES), -13);
        assert_eq!(host_errno_to_linux(libc::ENOSYS), -38);
    }

    #[test]
    fn translates_forwarded_signals() {
        assert_eq!(host_signal_to_linux(libc::SIGINT), linux_signal::SIGINT);
        assert_eq!(host_signal_to_linux(libc::SIGCHLD), linux_signal::SIGCHLD);
        assert_eq!(host_signal_to_linux(libc::SIGWINCH), 0);
    }

    #[test]
    fn linux_to_host_roundtrips_through_host_to_linux() {
        assert_eq!(linux_signal_to_host(linux_signal::SIGTERM), Some(libc::SIGTERM));
        assert_eq!(
            host_signal_to_linux(linux_signal_to_host(linux_signal::SIGUSR1).unwrap()),
            linux_signal::SIGUSR1
        );
        assert_eq!(linux_signal_to_host(linux_signal::SIGSYS), None);
    }
}
