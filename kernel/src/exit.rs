//! The VM-exit dispatcher: runs the VCPU, classifies why it stopped, and
//! either resumes it directly or routes the event to the syscall shim or
//! the signal subsystem.
//!
//! Grounded on the original implementation's `main_loop`/`handle_syscall`/
//! `is_syscall` in `src/main.c`. The teacher's `start_vm` loop supplied the
//! "run, then inspect the exit record, then act" shape; everything the loop
//! acts on here is this crate's own Linux-ABI semantics, not the teacher's
//! fuzzing abort reasons.

use xhypervisor::Register;

use crate::cpuid::native_cpuid;
use crate::errno::linux_signal::{SIGILL, SIGSEGV, SIGSYS};
use crate::syscall;
use crate::task::Task;
use crate::vmm::vcpu::vmcs_field;

/// Basic VM-exit reasons this dispatcher understands, numbered per the
/// Intel SDM's VMCS `EXIT_REASON` field.
mod exit_reason {
    pub(crate) const EXCEPTION_OR_NMI: u64 = 0;
    pub(crate) const EXTERNAL_INTERRUPT: u64 = 1;
    pub(crate) const IRQ_WINDOW: u64 = 7;
    pub(crate) const CPUID: u64 = 10;
    pub(crate) const VMCALL: u64 = 18;
    pub(crate) const EPT_VIOLATION: u64 = 48;
}

/// Interruption types carried in bits 10:8 of `VMCS_RO_VMEXIT_IRQ_INFO`,
/// per Intel SDM Table 24-15.
mod interruption_type {
    pub(crate) const EXTERNAL_INTERRUPT: u64 = 0;
    pub(crate) const NON_MASKABLE_INTERRUPT: u64 = 2;
    pub(crate) const HARDWARE_EXCEPTION: u64 = 3;
    pub(crate) const SOFTWARE_EXCEPTION: u64 = 6;
}

const VEC_PF: u64 = 14;
const VEC_UD: u64 = 6;

/// SYSCALL's two-byte opcode, `0f 05`, read little-endian as it sits at
/// `rip`.
const OP_SYSCALL: u16 = 0x050f;

/// What the caller (the task's run loop) should do once a single dispatch
/// round has finished.
pub(crate) enum ExitAction {
    /// Resume the VCPU immediately.
    Continue,
    /// A Linux signal should be raised against this task.
    RaiseSignal(u32),
}

/// Runs the VCPU once and dispatches on why it exited, as one iteration of
/// `main_loop`'s `while (task_run() == 0)` body would.
pub(crate) fn dispatch_one(task: &Task) -> ExitAction {
    task.vcpu().run();

    let reason = task.vcpu().read_vmcs(vmcs_field::RO_EXIT_REASON);
    match reason {
        exit_reason::EXCEPTION_OR_NMI => dispatch_exception(task),
        exit_reason::EXTERNAL_INTERRUPT | exit_reason::IRQ_WINDOW => ExitAction::Continue,
        exit_reason::EPT_VIOLATION => ExitAction::Continue,
        exit_reason::CPUID => {
            dispatch_cpuid(task);
            ExitAction::Continue
        }
        exit_reason::VMCALL => {
            panic!("guest executed VMCALL, which this kernel never emits and never expects");
        }
        other => {
            log::warn!("unhandled VM-exit reason: {other}");
            ExitAction::Continue
        }
    }
}

fn dispatch_exception(task: &Task) -> ExitAction {
    let info = task.vcpu().read_vmcs(vmcs_field::RO_VMEXIT_IRQ_INFO);
    let int_type = (info >> 8) & 0x7;
    match int_type {
        interruption_type::EXTERNAL_INTERRUPT | interruption_type::NON_MASKABLE_INTERRUPT => {
            ExitAction::Continue
        }
        interruption_type::HARDWARE_EXCEPTION | interruption_type::SOFTWARE_EXCEPTION => {
            let vector = info & 0xff;
            dispatch_vector(task, vector)
        }
        _ => {
            log::warn!("unexpected VM-exit interruption type: {int_type}");
            ExitAction::Continue
        }
    }
}

fn dispatch_vector(task: &Task, vector: u64) -> ExitAction {
    match vector {
        VEC_PF => {
            log::warn!("page fault at rip {:#x}", task.vcpu().read_reg(Register::RIP));
            ExitAction::RaiseSignal(SIGSEGV)
        }
        VEC_UD => dispatch_invalid_opcode(task),
        _ => {
            log::warn!("unhandled CPU exception, vector {vector}");
            ExitAction::RaiseSignal(SIGILL)
        }
    }
}

fn dispatch_invalid_opcode(task: &Task) -> ExitAction {
    let instlen = task.vcpu().read_vmcs(vmcs_field::RO_VMEXIT_INSTR_LEN);
    let rip = task.vcpu().read_reg(Register::RIP);

    if instlen == 2 && is_syscall(task, rip) {
        if dispatch_syscall(task) {
            let rip = task.vcpu().read_reg(Register::RIP);
            task.vcpu().write_reg(Register::RIP, rip + 2);
        }
        return ExitAction::Continue;
    }

    log::warn!("invalid opcode at rip {rip:#x}");
    ExitAction::RaiseSignal(SIGILL)
}

fn is_syscall(task: &Task, rip: u64) -> bool {
    let mut op = [0u8; 2];
    if task.vm().copy_from_user(&mut op, rip, 2) < 0 {
        return false;
    }
    u16::from_le_bytes(op) == OP_SYSCALL
}

/// Reads the syscall number and the five Linux-ABI argument registers,
/// dispatches through [`syscall::dispatch`], and writes the result back to
/// RAX, exactly as `handle_syscall` reads `sc_handler_table[rax]`'s
/// arguments from RDI/RSI/RDX/R10/R8/R9. Returns whether the caller should
/// advance RIP past the trapping `SYSCALL` instruction: every handler wants
/// that except `rt_sigreturn`, which has already pointed RIP at the
/// instruction the signal interrupted.
fn dispatch_syscall(task: &Task) -> bool {
    let nr = task.vcpu().read_reg(Register::RAX);
    if nr >= syscall::TABLE_LEN as u64 {
        log::warn!("unknown system call: {nr}");
        task.raise_signal(SIGSYS);
        return true;
    }

    let args = [
        task.vcpu().read_reg(Register::RDI),
        task.vcpu().read_reg(Register::RSI),
        task.vcpu().read_reg(Register::RDX),
        task.vcpu().read_reg(Register::R10),
        task.vcpu().read_reg(Register::R8),
        task.vcpu().read_reg(Register::R9),
    ];

    let retval = syscall::dispatch(task, nr as usize, args);
    task.strace(nr as usize, &args, retval);
    task.vcpu().write_reg(Register::RAX, retval as u64);
    nr as usize != syscall::NR_RT_SIGRETURN
}

fn dispatch_cpuid(task: &Task) {
    let leaf = task.vcpu().read_reg(Register::RAX) as u32;
    let subleaf = task.vcpu().read_reg(Register::RCX) as u32;
    let result = native_cpuid(leaf, subleaf);

    task.vcpu().write_reg(Register::RAX, u64::from(result.eax));
    task.vcpu().write_reg(Register::RBX, u64::from(result.ebx));
    task.vcpu().write_reg(Register::RCX, u64::from(result.ecx));
    task.vcpu().write_reg(Register::RDX, u64::from(result.edx));

    let rip = task.vcpu().read_reg(Register::RIP);
    task.vcpu().write_reg(Register::RIP, rip + 2);
}
