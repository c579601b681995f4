//! The VM-level VMM: owns the hypervisor VM, the VCPU registry, the shadow
//! page tables and the address-space manager, and rebuilds the EPT after a
//! fork.
//!
//! Grounded on the original implementation's `lib/vmm.c` (`vmm_create`,
//! `vmm_destroy`, `vmm_create_vcpu`, `vmm_reentry`, the `alloc_lock`
//! rwlock and `nr_vcpus` counter that makes multi-threaded fork abort).

pub(crate) mod snapshot;
pub(crate) mod vcpu;

use std::sync::RwLock;

use xhypervisor::MemPerm;

use crate::address_space::{AddressSpace, Region};
use crate::page_table::{PageFlags, ShadowTables};
use snapshot::VcpuSnapshot;
use vcpu::Vcpu;

/// The VM-wide state: one hypervisor VM, its address space, and the set of
/// VCPUs currently attached to it (normally one, more only transiently
/// during a thread-clone handoff).
pub(crate) struct Vm {
    tables: RwLock<ShadowTables>,
    address_space: RwLock<AddressSpace>,
    /// Matches the source's `alloc_lock`: serializes VCPU create/destroy
    /// against `vmm_snapshot`'s `nr_vcpus` check.
    vcpu_count: RwLock<usize>,
}

impl Vm {
    /// Creates the hypervisor VM. There is at most one of these per host
    /// process, since Apple's Hypervisor.framework does not allow multiple
    /// concurrent VMs in one process — this is exactly why `fork` has to
    /// tear the VM down and rebuild it (see `task::clone_process`).
    pub(crate) fn create() -> Self {
        xhypervisor::create_vm().expect("hypervisor refused to create a VM");
        Self {
            tables: RwLock::new(ShadowTables::new()),
            address_space: RwLock::new(AddressSpace::new()),
            vcpu_count: RwLock::new(0),
        }
    }

    pub(crate) fn destroy(&self) {
        xhypervisor::destroy_vm().expect("hypervisor refused to destroy the VM");
    }

    /// Maps `len` bytes of host memory at `host_ptr` into the guest at
    /// `guest_addr`, updating the hypervisor EPT, the shadow page tables,
    /// and the address-space region set together, the way `vmm_mmap`
    /// updates `hv_vm_map` and both shadow trees in one call.
    pub(crate) fn map(&self, guest_addr: u64, host_ptr: u64, len: u64, prot: PageFlags) {
        let mem_perm = to_mem_perm(prot);
        let host_slice =
            unsafe { std::slice::from_raw_parts(host_ptr as *const u8, len as usize) };
        xhypervisor::map_mem(host_slice, guest_addr, &mem_perm)
            .expect("hypervisor refused to map guest memory");
        self.tables.write().unwrap().map(guest_addr, host_ptr, len, prot);
        self.address_space.write().unwrap().insert(Region {
            guest_addr,
            host_ptr,
            length: len,
            prot,
        });
    }

    pub(crate) fn unmap(&self, guest_addr: u64, len: u64) {
        xhypervisor::unmap_mem(guest_addr, len as usize)
            .expect("hypervisor refused to unmap guest memory");
        self.tables.write().unwrap().unmap(guest_addr, len);
        self.address_space.write().unwrap().remove(guest_addr, len);
    }

    /// Changes the permissions of every mapped byte in `[guest_addr,
    /// guest_addr + len)` to `prot`, performed as unmap-then-map per
    /// SPEC_FULL.md §4.1 (there is no in-place EPT permission-change
    /// operation). Returns `false` if no part of the range is currently
    /// mapped, matching `mprotect(2)`'s `-ENOMEM` on an unmapped address.
    pub(crate) fn mprotect(&self, guest_addr: u64, len: u64, prot: PageFlags) -> bool {
        let overlapping = self.address_space.read().unwrap().overlapping(guest_addr, len);
        if overlapping.is_empty() {
            return false;
        }
        let range_end = guest_addr + len;
        for region in overlapping {
            let start = region.guest_addr.max(guest_addr);
            let end = region.end().min(range_end);
            let sub_len = end - start;
            let sub_host_ptr = region.host_ptr + (start - region.guest_addr);
            self.unmap(start, sub_len);
            self.map(start, sub_host_ptr, sub_len, prot);
        }
        true
    }

    pub(crate) fn create_vcpu(&self) -> Vcpu {
        let vcpu = Vcpu::create();
        *self.vcpu_count.write().unwrap() += 1;
        vcpu
    }

    pub(crate) fn destroy_vcpu(&self, vcpu: Vcpu) {
        vcpu.destroy();
        *self.vcpu_count.write().unwrap() -= 1;
    }

    pub(crate) fn vcpu_count(&self) -> usize {
        *self.vcpu_count.read().unwrap()
    }

    /// Reads `len` bytes of guest memory at `guest_addr`.
    pub(crate) fn copy_from_user(&self, dst: &mut [u8], guest_addr: u64, len: usize) -> i64 {
        crate::uaccess::copy_from_user(&self.tables.read().unwrap(), dst, guest_addr, len)
    }

    pub(crate) fn copy_to_user(&self, guest_addr: u64, src: &[u8], len: usize) -> i64 {
        crate::uaccess::copy_to_user(&self.tables.read().unwrap(), guest_addr, src, len)
    }

    pub(crate) fn strncpy_from_user(&self, dst: &mut [u8], guest_addr: u64, max_len: usize) -> i64 {
        crate::uaccess::strncpy_from_user(&self.tables.read().unwrap(), dst, guest_addr, max_len)
    }

    /// Snapshots the single VCPU attached to this VM. Aborts (returns
    /// `None`) if more than one VCPU is attached, matching the source's
    /// `vmm_snapshot`, which refuses multi-threaded fork outright
    /// (SPEC_FULL.md §9(c)).
    pub(crate) fn snapshot_single_vcpu(&self, vcpu: &Vcpu) -> Option<VcpuSnapshot> {
        if self.vcpu_count() > 1 {
            return None;
        }
        Some(VcpuSnapshot::capture(vcpu))
    }

    /// Replays every tracked region into a freshly created VM, as
    /// `restore_ept` does after `vmm_reentry` recreates the VM following a
    /// host fork.
    pub(crate) fn reentry(&self, snapshot: &VcpuSnapshot) -> Vcpu {
        xhypervisor::create_vm().expect("hypervisor refused to recreate the VM after fork");
        let regions: Vec<Region> = self.address_space.read().unwrap().regions().to_vec();
        for region in regions {
            let mem_perm = to_mem_perm(region.prot);
            let host_slice = unsafe {
                std::slice::from_raw_parts(region.host_ptr as *const u8, region.length as usize)
            };
            xhypervisor::map_mem(host_slice, region.guest_addr, &mem_perm)
                .expect("hypervisor refused to remap a region on reentry");
        }
        let vcpu = self.create_vcpu();
        snapshot.restore(&vcpu);
        vcpu
    }
}

fn to_mem_perm(prot: PageFlags) -> MemPerm {
    let read = prot.contains(PageFlags::P);
    let write = prot.contains(PageFlags::W);
    let exec = !prot.contains(PageFlags::NX);
    match (read, write, exec) {
        (true, true, true) => MemPerm::ExecAndWrite,
        (true, true, false) => MemPerm::Write,
        (true, false, true) => MemPerm::ExecAndRead,
        _ => MemPerm::Read,
    }
}
