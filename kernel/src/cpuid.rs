//! Native CPUID execution, used to service the guest's CPUID VM-exit.
//!
//! Grounded on the original implementation's `__get_cpuid` call in
//! `src/main.c`'s `main_loop`, which executes CPUID natively on the host
//! and copies the result into the guest's registers.

/// The result of executing `CPUID` with a given leaf/subleaf.
pub(crate) struct CpuidResult {
    pub(crate) eax: u32,
    pub(crate) ebx: u32,
    pub(crate) ecx: u32,
    pub(crate) edx: u32,
}

/// Executes `CPUID` natively on the host for `(leaf, subleaf)`.
#[cfg(target_arch = "x86_64")]
pub(crate) fn native_cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    // Safety: CPUID is always available on any x86-64 processor and has no
    // side effects beyond returning values in registers.
    let result = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
    CpuidResult {
        eax: result.eax,
        ebx: result.ebx,
        ecx: result.ecx,
        edx: result.edx,
    }
}
