//! [`VcpuSnapshot`]: a point-in-time capture of one VCPU's architectural
//! state, used both across a `fork` (snapshot -> destroy VM -> host fork ->
//! recreate VM -> restore) and across a thread `clone` (snapshot -> spawn
//! host thread -> create fresh VCPU -> restore).
//!
//! Grounded on the teacher's `SnapshotRegisters` (an exhaustive, ordered
//! `#[repr(C)]` register list) and the original implementation's
//! `vmm_snapshot_vcpu`/`vmm_restore_vcpu`, including its `restore_mask[]`
//! of VMCS fields that describe host rather than guest state and must not
//! be copied back on restore.

use std::collections::HashMap;

use xhypervisor::Register;

use crate::vmm::vcpu::{
    Vcpu, HOST_STATE_RESTORE_MASK, SNAPSHOT_REGISTER_LIST, SNAPSHOT_VMCS_FIELD_LIST,
};

/// The 512-byte legacy FXSAVE area is enough to round-trip the FPU/SSE
/// state this crate cares about.
const FPU_STATE_LEN: usize = 512;

/// A captured VCPU state: every register in [`SNAPSHOT_REGISTER_LIST`],
/// every VMCS field in [`SNAPSHOT_VMCS_FIELD_LIST`], and the FPU blob.
#[derive(Clone)]
pub(crate) struct VcpuSnapshot {
    registers: HashMap<&'static str, u64>,
    vmcs: HashMap<u32, u64>,
    fpu_state: [u8; FPU_STATE_LEN],
}

impl VcpuSnapshot {
    /// Captures the current state of `vcpu`.
    pub(crate) fn capture(vcpu: &Vcpu) -> Self {
        let mut registers = HashMap::with_capacity(SNAPSHOT_REGISTER_LIST.len());
        for &reg in SNAPSHOT_REGISTER_LIST {
            registers.insert(register_key(reg), vcpu.read_reg(reg));
        }
        let mut vmcs = HashMap::with_capacity(SNAPSHOT_VMCS_FIELD_LIST.len());
        for &field in SNAPSHOT_VMCS_FIELD_LIST {
            vmcs.insert(field, vcpu.read_vmcs(field));
        }
        let mut fpu_state = [0u8; FPU_STATE_LEN];
        vcpu.read_fpstate(&mut fpu_state);
        Self { registers, vmcs, fpu_state }
    }

    /// Restores this snapshot's state onto `vcpu`, skipping VMCS fields in
    /// [`HOST_STATE_RESTORE_MASK`] — those are reinitialized by whatever
    /// set up `vcpu` in the first place (see `Vm::create_vcpu`).
    pub(crate) fn restore(&self, vcpu: &Vcpu) {
        for &reg in SNAPSHOT_REGISTER_LIST {
            vcpu.write_reg(reg, self.registers[register_key(reg)]);
        }
        for &field in SNAPSHOT_VMCS_FIELD_LIST {
            if HOST_STATE_RESTORE_MASK.contains(&field) {
                continue;
            }
            vcpu.write_vmcs(field, self.vmcs[&field]);
        }
        vcpu.write_fpstate(&self.fpu_state);
    }

    pub(crate) fn rip(&self) -> u64 {
        self.registers[register_key(Register::RIP)]
    }

    pub(crate) fn set_rip(&mut self, value: u64) {
        self.registers.insert(register_key(Register::RIP), value);
    }

    pub(crate) fn rsp(&self) -> u64 {
        self.registers[register_key(Register::RSP)]
    }

    pub(crate) fn set_rsp(&mut self, value: u64) {
        self.registers.insert(register_key(Register::RSP), value);
    }

    pub(crate) fn rax(&self) -> u64 {
        self.registers[register_key(Register::RAX)]
    }

    pub(crate) fn set_rax(&mut self, value: u64) {
        self.registers.insert(register_key(Register::RAX), value);
    }
}

/// A stable string key for a [`Register`] variant, since the crate doesn't
/// derive `Hash`/`Eq` for us. Only the registers in [`SNAPSHOT_REGISTER_LIST`]
/// are ever looked up this way.
fn register_key(reg: Register) -> &'static str {
    match reg {
        Register::RAX => "rax",
        Register::RBX => "rbx",
        Register::RCX => "rcx",
        Register::RDX => "rdx",
        Register::RSI => "rsi",
        Register::RDI => "rdi",
        Register::RBP => "rbp",
        Register::RSP => "rsp",
        Register::R8 => "r8",
        Register::R9 => "r9",
        Register::R10 => "r10",
        Register::R11 => "r11",
        Register::R12 => "r12",
        Register::R13 => "r13",
        Register::R14 => "r14",
        Register::R15 => "r15",
        Register::RIP => "rip",
        Register::RFLAGS => "rflags",
        Register::CS => "cs",
        Register::SS => "ss",
        Register::DS => "ds",
        Register::ES => "es",
        Register::FS => "fs",
        Register::GS => "gs",
        Register::GDT_BASE => "gdt_base",
        Register::GDT_LIMIT => "gdt_limit",
        Register::IDT_BASE => "idt_base",
        Register::IDT_LIMIT => "idt_limit",
        Register::LDTR => "ldtr",
        Register::LDT_BASE => "ldt_base",
        Register::LDT_LIMIT => "ldt_limit",
        Register::TR => "tr",
        Register::TSS_BASE => "tss_base",
        Register::TSS_LIMIT => "tss_limit",
        Register::CR0 => "cr0",
        Register::CR2 => "cr2",
        Register::CR3 => "cr3",
        Register::CR4 => "cr4",
        _ => unreachable!("register not part of SNAPSHOT_REGISTER_LIST"),
    }
}
