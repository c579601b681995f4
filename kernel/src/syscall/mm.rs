//! Memory-management syscalls: `mmap`, `mprotect`, `brk`. Each delegates to
//! the address-space manager and the shadow page tables through
//! [`crate::vmm::Vm`].
//!
//! Grounded on the original implementation's `src/syscall/mm.c`
//! (`do_mmap`, `current_mmap_top`, `brk`/`current_brk`/`brk_min`).

use crate::config::PAGE_SIZE;
use crate::page_table::PageFlags;
use crate::task::Task;

const EINVAL: i64 = -22;
const ENOMEM: i64 = -12;

const PROT_WRITE: u64 = 0x2;
const PROT_EXEC: u64 = 0x4;

const MAP_SHARED: u64 = 0x01;
const MAP_PRIVATE: u64 = 0x02;
const MAP_FIXED: u64 = 0x10;
const MAP_ANON: u64 = 0x20;
const MAP_DENYWRITE: u64 = 0x0800;
const MAP_EXECUTABLE: u64 = 0x1000;
const MAP_STACK: u64 = 0x20000;

pub(crate) fn mmap(task: &Task, args: [u64; 6]) -> i64 {
    let [addr, len, prot, flags, _fd, _offset] = args;
    let flags = flags & !(MAP_DENYWRITE | MAP_EXECUTABLE | MAP_STACK);
    if flags & !(MAP_SHARED | MAP_PRIVATE | MAP_FIXED | MAP_ANON) != 0 {
        log::warn!("unsupported mmap flags: {flags:#x}");
        return EINVAL;
    }
    if len == 0 {
        return EINVAL;
    }

    let rounded_len = round_up(len, PAGE_SIZE);
    let guest_addr = if flags & MAP_FIXED != 0 { addr } else { task.process().bump_mmap_top(rounded_len) };

    // Safety: the mapping is anonymous, privately owned, and sized exactly
    // to what `vm.map` is told about below.
    let host_ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            rounded_len as usize,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if host_ptr == libc::MAP_FAILED {
        return ENOMEM;
    }

    let mut page_flags = PageFlags::U;
    if prot & PROT_WRITE != 0 {
        page_flags |= PageFlags::W;
    }
    if prot & PROT_EXEC == 0 {
        page_flags |= PageFlags::NX;
    }

    task.vm().map(guest_addr, host_ptr as u64, rounded_len, page_flags);
    i64::try_from(guest_addr).unwrap_or(ENOMEM)
}

/// `mprotect`: re-maps `[addr, addr + len)` with the new permission bits via
/// unmap-then-map, per SPEC_FULL.md §4.1. The original implementation's
/// handler is a documented no-op that never actually changed permissions;
/// this crate implements the real semantics so a subsequent guest write to a
/// page remapped read-only actually faults.
pub(crate) fn mprotect(task: &Task, args: [u64; 6]) -> i64 {
    let [addr, len, prot, ..] = args;
    if len == 0 {
        return EINVAL;
    }
    let rounded_len = round_up(len, PAGE_SIZE);

    let mut page_flags = PageFlags::U;
    if prot & PROT_WRITE != 0 {
        page_flags |= PageFlags::W;
    }
    if prot & PROT_EXEC == 0 {
        page_flags |= PageFlags::NX;
    }

    if task.vm().mprotect(addr, rounded_len, page_flags) {
        0
    } else {
        ENOMEM
    }
}

pub(crate) fn brk(task: &Task, args: [u64; 6]) -> i64 {
    let requested = args[0];
    let process = task.process();

    if process.brk() == 0 {
        process.set_brk(requested);
        return i64::try_from(requested).unwrap_or(ENOMEM);
    }

    let new_brk = round_up(requested, PAGE_SIZE);
    let current = process.brk();
    if new_brk < current {
        process.set_brk(new_brk);
        return i64::try_from(new_brk).unwrap_or(ENOMEM);
    }
    if new_brk == current {
        return i64::try_from(current).unwrap_or(ENOMEM);
    }

    let grow_len = new_brk - current;
    // Safety: same anonymous private mapping contract as `mmap` above.
    let host_ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            grow_len as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if host_ptr == libc::MAP_FAILED {
        return ENOMEM;
    }
    task.vm().map(current, host_ptr as u64, grow_len, PageFlags::W | PageFlags::U);
    process.set_brk(new_brk);
    i64::try_from(new_brk).unwrap_or(ENOMEM)
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
