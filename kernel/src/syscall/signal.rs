//! Signal-related syscalls: `rt_sigaction`, `rt_sigprocmask`,
//! `rt_sigreturn`, `rt_sigpending`, `sigaltstack`, `kill`, `alarm`.
//!
//! Grounded on the original implementation's `src/ipc/signal.c`
//! (`sc_rt_sigaction`, `sc_rt_sigprocmask`, `sc_kill`) and `src/syscall/sys.c`
//! (`sc_alarm`).

use crate::errno::linux_signal_to_host;
use crate::signal::SigAction;
use crate::task::Task;

const EINVAL: i64 = -22;
const ESRCH: i64 = -3;

const SA_STRUCT_LEN: usize = 32; // handler, flags, restorer, mask: four u64s

const SIG_BLOCK: u64 = 0;
const SIG_UNBLOCK: u64 = 1;
const SIG_SETMASK: u64 = 2;

pub(crate) fn rt_sigaction(task: &Task, args: [u64; 6]) -> i64 {
    let (signum, new_addr, old_addr, sigsetsize) = (args[0] as u32, args[1], args[2], args[3]);
    if sigsetsize != 8 || signum == 0 || signum as usize >= crate::config::NSIG {
        return EINVAL;
    }

    let sighand = task.process().sighand();

    if old_addr != 0 {
        let old = sighand.get(signum);
        let bytes = encode_sigaction(&old);
        if task.vm().copy_to_user(old_addr, &bytes, bytes.len()) < 0 {
            return -14; // EFAULT
        }
    }

    if new_addr != 0 {
        let mut bytes = [0u8; SA_STRUCT_LEN];
        if task.vm().copy_from_user(&mut bytes, new_addr, bytes.len()) < 0 {
            return -14;
        }
        sighand.set(signum, decode_sigaction(&bytes));
    }

    0
}

fn encode_sigaction(action: &SigAction) -> [u8; SA_STRUCT_LEN] {
    let mut out = [0u8; SA_STRUCT_LEN];
    out[0..8].copy_from_slice(&action.handler.to_le_bytes());
    out[8..16].copy_from_slice(&action.flags.to_le_bytes());
    out[16..24].copy_from_slice(&action.restorer.to_le_bytes());
    out[24..32].copy_from_slice(&action.mask.to_le_bytes());
    out
}

fn decode_sigaction(bytes: &[u8; SA_STRUCT_LEN]) -> SigAction {
    SigAction {
        handler: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
        flags: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        restorer: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        mask: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
    }
}

pub(crate) fn rt_sigprocmask(task: &Task, args: [u64; 6]) -> i64 {
    let (how, set_addr, old_addr, sigsetsize) = (args[0], args[1], args[2], args[3]);
    if sigsetsize != 8 {
        return EINVAL;
    }

    let old_mask = task.sigmask();
    if old_addr != 0 && task.vm().copy_to_user(old_addr, &old_mask.to_le_bytes(), 8) < 0 {
        return -14;
    }

    if set_addr != 0 {
        let mut bytes = [0u8; 8];
        if task.vm().copy_from_user(&mut bytes, set_addr, 8) < 0 {
            return -14;
        }
        let set = u64::from_le_bytes(bytes);
        let new_mask = match how {
            SIG_BLOCK => old_mask | set,
            SIG_UNBLOCK => old_mask & !set,
            SIG_SETMASK => set,
            _ => return EINVAL,
        };
        task.set_sigmask(new_mask);
    }

    0
}

pub(crate) fn rt_sigreturn(task: &Task, _args: [u64; 6]) -> i64 {
    task.sigreturn()
}

pub(crate) fn rt_sigpending(task: &Task, args: [u64; 6]) -> i64 {
    let (set_addr, sigsetsize) = (args[0], args[1]);
    if sigsetsize != 8 {
        return EINVAL;
    }
    let pending = task.pending_signals();
    if task.vm().copy_to_user(set_addr, &pending.to_le_bytes(), 8) < 0 {
        return -14;
    }
    0
}

/// The original implementation never wired up an alternate signal stack
/// (`sigaltstack` is a documented no-op there too); this crate reports an
/// empty `SS_DISABLE` stack so guests that merely probe for one don't trip
/// over an uninitialized buffer.
pub(crate) fn sigaltstack(task: &Task, args: [u64; 6]) -> i64 {
    const SS_DISABLE: u32 = 2;
    let old_addr = args[1];
    if old_addr != 0 {
        let mut buf = [0u8; 24]; // ss_sp(8), ss_flags(4, padded to 8), ss_size(8)
        buf[8..12].copy_from_slice(&SS_DISABLE.to_le_bytes());
        if task.vm().copy_to_user(old_addr, &buf, buf.len()) < 0 {
            return -14;
        }
    }
    0
}

pub(crate) fn kill(task: &Task, args: [u64; 6]) -> i64 {
    let (pid, signum) = (args[0] as i32, args[1] as u32);
    if signum == 0 {
        return 0;
    }
    if signum as usize >= crate::config::NSIG {
        return EINVAL;
    }

    if pid == task.process().pid() || pid == 0 {
        crate::task::raise_on_process(task.process(), signum);
        return 0;
    }

    let Some(host_signum) = linux_signal_to_host(signum) else {
        log::warn!("kill: no host equivalent for signal {signum}, dropping");
        return 0;
    };
    match nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::try_from(host_signum).ok(),
    ) {
        Ok(()) => 0,
        Err(nix::errno::Errno::ESRCH) => ESRCH,
        Err(e) => crate::errno::host_errno_to_linux(e as i32),
    }
}

/// `alarm`: schedules `SIGALRM` to be raised on the calling task after
/// `seconds`, or cancels a pending one if `seconds == 0`. The original
/// implementation sets up a real `setitimer`-backed host timer that
/// eventually delivers a host `SIGALRM`, which the signal trampoline
/// translates back into the guest's pending bitmap the same way any other
/// forwarded host signal is, so this only needs to arm (or disarm) that
/// timer rather than simulate the wait itself.
pub(crate) fn alarm(_task: &Task, args: [u64; 6]) -> i64 {
    let seconds = args[0];
    let new = libc::itimerval {
        it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
        it_value: libc::timeval { tv_sec: seconds as libc::time_t, tv_usec: 0 },
    };
    let mut old = libc::itimerval {
        it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
        it_value: libc::timeval { tv_sec: 0, tv_usec: 0 },
    };
    // Safety: both pointers reference valid, fully initialized `itimerval`
    // values owned by this stack frame.
    unsafe {
        libc::setitimer(libc::ITIMER_REAL, &new, &mut old);
    }
    old.it_value.tv_sec as i64
}
