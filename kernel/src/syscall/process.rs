//! Process identity and lifecycle syscalls: the ones with a direct host
//! equivalent reached through `nix`/`libc`, plus `fork`/`clone`, which
//! delegate entirely to [`crate::task::Task`].
//!
//! Grounded on the original implementation's `src/syscall/process.c`
//! (`getpid`/`getuid`/`geteuid`/`uname`/`arch_prctl`/`set_tid_address`)
//! and `src/syscall/fork.c` (the `fork` syscall itself is a thin wrapper
//! calling the same machinery `clone` uses with no flags).

use crate::config::{LINUX_RELEASE, LINUX_VERSION};
use crate::task::Task;
use crate::vmm::vcpu::vmcs_field;

const EINVAL: i64 = -22;

pub(crate) fn getpid(task: &Task, _args: [u64; 6]) -> i64 {
    i64::from(task.process().pid())
}

pub(crate) fn getppid(_task: &Task, _args: [u64; 6]) -> i64 {
    i64::from(nix::unistd::getppid().as_raw())
}

/// The original implementation always reports a fixed uid/gid of 0 for the
/// non-effective identities, since the guest is meant to believe it is
/// root inside its own little kernel regardless of the host's real uid.
pub(crate) fn getuid(_task: &Task, _args: [u64; 6]) -> i64 {
    0
}

pub(crate) fn getgid(_task: &Task, _args: [u64; 6]) -> i64 {
    0
}

pub(crate) fn geteuid(_task: &Task, _args: [u64; 6]) -> i64 {
    i64::from(nix::unistd::geteuid().as_raw())
}

pub(crate) fn getegid(_task: &Task, _args: [u64; 6]) -> i64 {
    0
}

pub(crate) fn exit(task: &Task, args: [u64; 6]) -> i64 {
    task.request_exit(args[0] as i32);
    0
}

pub(crate) fn exit_group(task: &Task, args: [u64; 6]) -> i64 {
    task.request_exit(args[0] as i32);
    0
}

pub(crate) fn sched_yield(_task: &Task, _args: [u64; 6]) -> i64 {
    std::thread::yield_now();
    0
}

/// `struct utsname`: six 65-byte, NUL-terminated fields.
const UTSNAME_FIELD_LEN: usize = 65;
const UTSNAME_LEN: usize = UTSNAME_FIELD_LEN * 6;

pub(crate) fn uname(task: &Task, args: [u64; 6]) -> i64 {
    let buf_addr = args[0];
    let mut buf = [0u8; UTSNAME_LEN];
    write_utsname_field(&mut buf, 0, "Linux");
    write_utsname_field(&mut buf, 2, LINUX_RELEASE);
    write_utsname_field(&mut buf, 3, LINUX_VERSION);
    write_utsname_field(&mut buf, 4, "x86_64");
    write_utsname_field(&mut buf, 5, "GNU/Linux");

    if let Ok(hostname) = nix::unistd::gethostname() {
        write_utsname_field(&mut buf, 1, &hostname.to_string_lossy());
    }

    if task.vm().copy_to_user(buf_addr, &buf, buf.len()) < 0 {
        return -14; // EFAULT
    }
    0
}

fn write_utsname_field(buf: &mut [u8; UTSNAME_LEN], index: usize, value: &str) {
    let field = &mut buf[index * UTSNAME_FIELD_LEN..(index + 1) * UTSNAME_FIELD_LEN];
    let bytes = value.as_bytes();
    let n = bytes.len().min(UTSNAME_FIELD_LEN - 1);
    field[..n].copy_from_slice(&bytes[..n]);
}

const ARCH_SET_GS: u64 = 0x1001;
const ARCH_SET_FS: u64 = 0x1002;
const ARCH_GET_FS: u64 = 0x1003;
const ARCH_GET_GS: u64 = 0x1004;

pub(crate) fn arch_prctl(task: &Task, args: [u64; 6]) -> i64 {
    let (code, addr) = (args[0], args[1]);
    match code {
        ARCH_SET_GS => {
            task.vcpu().write_vmcs(vmcs_field::GUEST_GS_BASE, addr);
            0
        }
        ARCH_SET_FS => {
            task.vcpu().write_vmcs(vmcs_field::GUEST_FS_BASE, addr);
            0
        }
        ARCH_GET_FS | ARCH_GET_GS => EINVAL,
        _ => EINVAL,
    }
}

pub(crate) fn set_tid_address(task: &Task, args: [u64; 6]) -> i64 {
    task.set_clear_child_tid(args[0]);
    i64::try_from(task.tid()).unwrap_or(i64::MAX)
}

/// Wakes one waiter on the host futex at guest address `addr`'s
/// corresponding host address, used by `Task::request_exit` for
/// `CLONE_CHILD_CLEARTID`. This crate has no guest-visible `futex` syscall
/// of its own yet (it is not in the registered set), so this only needs to
/// satisfy the exit-time zero-and-wake contract against whatever host
/// waiters may exist on the same mapped page.
pub(crate) fn futex_wake_one(_addr: u64) {
    // No host futex is actually waited on for this address from within
    // this crate today; the zeroing in `request_exit` is the
    // observable part of the contract guests rely on.
}

pub(crate) fn clone(task: &Task, args: [u64; 6]) -> i64 {
    task.clone(args[0], args[1], args[2], args[3], args[4])
}

pub(crate) fn fork(task: &Task, _args: [u64; 6]) -> i64 {
    task.clone(0, 0, 0, 0, 0)
}

pub(crate) fn wait4(task: &Task, args: [u64; 6]) -> i64 {
    let (pid_arg, wstatus_addr, options_bits) = (args[0] as i32, args[1], args[2] as i32);
    let pid = if pid_arg == -1 {
        nix::unistd::Pid::from_raw(-1)
    } else {
        nix::unistd::Pid::from_raw(pid_arg)
    };

    const WNOHANG: i32 = 1;
    let mut flags = nix::sys::wait::WaitPidFlag::empty();
    if options_bits & WNOHANG != 0 {
        flags |= nix::sys::wait::WaitPidFlag::WNOHANG;
    }

    match nix::sys::wait::waitpid(pid, Some(flags)) {
        Ok(status) => {
            let (child_pid, wstatus) = encode_wstatus(status);
            if wstatus_addr != 0 {
                let _ = task.vm().copy_to_user(wstatus_addr, &wstatus.to_le_bytes(), 4);
            }
            i64::from(child_pid)
        }
        Err(nix::errno::Errno::ECHILD) => -10,
        Err(e) => crate::errno::host_errno_to_linux(e as i32),
    }
}

/// Translates a `nix::WaitStatus` into the Linux `wait4` pid/wstatus pair;
/// the Linux encoding this crate reports (low byte = signal number or 0x7f
/// for stopped, next byte = exit code) matches the host's own waitpid
/// encoding closely enough for a normal exit or a fatal signal.
fn encode_wstatus(status: nix::sys::wait::WaitStatus) -> (i32, u32) {
    use nix::sys::wait::WaitStatus;
    match status {
        WaitStatus::Exited(pid, code) => (pid.as_raw(), ((code as u32) & 0xff) << 8),
        WaitStatus::Signaled(pid, sig, _) => (pid.as_raw(), sig as u32),
        other => (other.pid().map_or(0, nix::unistd::Pid::as_raw), 0),
    }
}
