//! Construction and teardown of the Linux-shaped signal frame placed on the
//! guest stack before a signal handler runs.
//!
//! Grounded on the original implementation's `setup_sigframe` and its
//! `retcode_bin`/`sigcontext`/`ucontext`/`sigframe` structs in
//! `src/ipc/signal.c`. Per SPEC_FULL.md §9(b), `pop_and_restore` here is a
//! real implementation of `rt_sigreturn`, replacing the source's stub
//! (which only printed a message and returned 0).

use xhypervisor::Register;

use crate::errno::linux_signal::SIGSEGV;
use crate::signal::SigAction;
use crate::vmm::vcpu::Vcpu;
use crate::vmm::Vm;

/// Registers saved into `sigcontext`, in a fixed order. A prefix of the
/// full snapshot register list (general-purpose registers, RIP, RFLAGS,
/// and segment selectors) -- enough for a handler to inspect and for
/// `rt_sigreturn` to restore the interrupted context exactly.
const SIGCONTEXT_REGISTER_LIST: &[Register] = &[
    Register::RAX,
    Register::RBX,
    Register::RCX,
    Register::RDX,
    Register::RSI,
    Register::RDI,
    Register::RBP,
    Register::RSP,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
    Register::RIP,
    Register::RFLAGS,
    Register::CS,
    Register::SS,
    Register::DS,
    Register::ES,
    Register::FS,
    Register::GS,
];

const TRAMPOLINE_SLOT_LEN: usize = 8;
const NR_RT_SIGRETURN: u32 = 15;

/// `pretcode` field, then the 8-byte trampoline slot (7 code bytes: `mov
/// eax, NR_rt_sigreturn; syscall`, padded with one byte), then the saved
/// registers, then `signum` and `oldmask`.
const HEADER_LEN: usize = 8 + TRAMPOLINE_SLOT_LEN;
const SIGCONTEXT_LEN: usize = SIGCONTEXT_REGISTER_LIST.len() * 8 + 4 + 4 + 8;
const FRAME_LEN: usize = HEADER_LEN + SIGCONTEXT_LEN;

/// Builds a sigframe for `signum` on the guest stack and redirects the
/// VCPU to the guest handler, as `setup_sigframe` does. Returns `false` if
/// the frame could not be written (unmapped stack), in which case the
/// caller must re-set the pending bit and leave the mask untouched, per
/// `deliver_signal`'s rollback.
pub(crate) fn build(vm: &Vm, vcpu: &Vcpu, action: SigAction, signum: u32, old_mask: u64) -> bool {
    let rsp = vcpu.read_reg(Register::RSP);
    let new_rsp = (rsp - FRAME_LEN as u64) & !0xf;

    const SA_RESTORER: u64 = 0x0400_0000;
    let pretcode = if action.flags & SA_RESTORER != 0 {
        action.restorer
    } else {
        new_rsp + 8
    };

    let mut buf = vec![0u8; FRAME_LEN];
    buf[0..8].copy_from_slice(&pretcode.to_le_bytes());

    let trampoline = &mut buf[8..8 + TRAMPOLINE_SLOT_LEN];
    trampoline[0] = 0x58; // pop %eax (dead value; overwritten below)
    trampoline[1] = 0xb8; // movl $NR_rt_sigreturn, %eax
    trampoline[2..6].copy_from_slice(&NR_RT_SIGRETURN.to_le_bytes());
    trampoline[6] = 0x0f; // syscall
    trampoline[7] = 0x05;

    let mut offset = HEADER_LEN;
    for &reg in SIGCONTEXT_REGISTER_LIST {
        let value = vcpu.read_reg(reg);
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        offset += 8;
    }
    buf[offset..offset + 4].copy_from_slice(&signum.to_le_bytes());
    offset += 8; // skip signum + 4 bytes padding
    buf[offset..offset + 8].copy_from_slice(&old_mask.to_le_bytes());

    if vm.copy_to_user(new_rsp, &buf, buf.len()) < 0 {
        return false;
    }

    vcpu.write_reg(Register::RDI, u64::from(signum));
    vcpu.write_reg(Register::RSI, 0);
    vcpu.write_reg(Register::RDX, 0);
    vcpu.write_reg(Register::RAX, 0);
    vcpu.write_reg(Register::RSP, new_rsp);
    vcpu.write_reg(Register::RIP, action.handler);
    true
}

/// Implements `rt_sigreturn`: locates the sigframe relative to the current
/// RSP. The handler's `ret` lands on the trampoline's `pop %eax`, which
/// leaves RSP pointing exactly at the sigcontext `build` placed right after
/// the 8-byte trampoline slot (`new_rsp + HEADER_LEN`), so no further offset
/// is needed here. Restores every saved register and returns the guest's
/// mask from before the signal was delivered.
pub(crate) fn pop_and_restore(vm: &Vm, vcpu: &Vcpu) -> Option<u64> {
    let sigcontext_addr = vcpu.read_reg(Register::RSP);

    let mut buf = vec![0u8; SIGCONTEXT_LEN];
    if vm.copy_from_user(&mut buf, sigcontext_addr, buf.len()) < 0 {
        return None;
    }

    let mut offset = 0;
    for &reg in SIGCONTEXT_REGISTER_LIST {
        let value = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
        vcpu.write_reg(reg, value);
        offset += 8;
    }
    offset += 8; // skip signum + padding
    let old_mask = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
    Some(old_mask)
}

/// The signal number a handler should observe once delivered, translated
/// from the internal numbering (identity in this crate, kept as a function
/// so callers never assume the mapping is trivial in perpetuity).
pub(crate) fn default_fault_signal() -> u32 {
    SIGSEGV
}
