//! The ELF loader: parses a Linux x86-64 executable, maps its `PT_LOAD`
//! segments through the address-space manager, and builds the initial
//! guest stack (`argv`/`envp`/auxv).
//!
//! Grounded on dragonball-style goblin usage
//! (`other_examples/4c2c3bd1_fexolm-hostel__src-vm-mod.rs.rs`'s
//! `load_elf`), generalized from a from-scratch paging guest to one that
//! maps through [`crate::vmm::Vm::map`] and the shadow page tables.
//! `original_source` ships no standalone loader file (its `main.c` only
//! shows the post-load VM-exit loop); the initial-stack layout below
//! follows the System V x86-64 ABI `_start` contract every libc assumes.

use std::path::Path;

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;

use crate::config::{INITIAL_STACK_SIZE, INITIAL_STACK_TOP, PAGE_SIZE};
use crate::error::StartupError;
use crate::page_table::PageFlags;
use crate::vmm::Vm;

const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_ENTRY: u64 = 9;

/// What the loader hands back to seed the first task's VCPU.
pub(crate) struct Loaded {
    pub(crate) entry: u64,
    pub(crate) stack_top: u64,
}

/// Loads `path` into `vm` and returns the entry point and initial stack
/// pointer. `args` becomes `argv[1..]`; `argv[0]` is `path` itself.
pub(crate) fn load(vm: &Vm, path: &Path, args: &[String]) -> Result<Loaded, StartupError> {
    let data =
        std::fs::read(path).map_err(|e| StartupError::ReadExecutable(path.to_path_buf(), e))?;
    let elf = Elf::parse(&data).map_err(StartupError::ParseElf)?;

    if !elf.is_64 || elf.header.e_machine != goblin::elf::header::EM_X86_64 {
        return Err(StartupError::UnsupportedExecutable(
            "only x86-64 ELF64 executables are supported".to_string(),
        ));
    }
    if elf.header.e_type != goblin::elf::header::ET_EXEC {
        return Err(StartupError::UnsupportedExecutable(
            "only statically linked ET_EXEC executables are supported (no interpreter)"
                .to_string(),
        ));
    }

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD {
            continue;
        }
        map_segment(vm, &data, ph);
    }

    let stack_top = build_initial_stack(vm, &elf, path, args);

    Ok(Loaded { entry: elf.header.e_entry, stack_top })
}

fn map_segment(vm: &Vm, data: &[u8], ph: &goblin::elf::ProgramHeader) {
    let page_offset = ph.p_vaddr & (PAGE_SIZE - 1);
    let guest_start = ph.p_vaddr - page_offset;
    let mapped_len = round_up(page_offset + ph.p_memsz, PAGE_SIZE);

    // Safety: `mapped_len` is a nonzero page multiple; the mapping is
    // anonymous and owned solely by this region's lifetime in `AddressSpace`.
    let host_ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            mapped_len as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    assert_ne!(host_ptr, libc::MAP_FAILED, "failed to reserve host memory for a PT_LOAD segment");

    let file_range = ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize;
    // Safety: `host_ptr` was just mmap'd with `mapped_len` writable bytes,
    // and `page_offset + p_filesz <= mapped_len` by construction.
    unsafe {
        let dst = (host_ptr as *mut u8).add(page_offset as usize);
        std::ptr::copy_nonoverlapping(data[file_range].as_ptr(), dst, ph.p_filesz as usize);
    }

    let mut prot = PageFlags::U;
    if ph.p_flags & goblin::elf::program_header::PF_W != 0 {
        prot |= PageFlags::W;
    }
    if ph.p_flags & goblin::elf::program_header::PF_X == 0 {
        prot |= PageFlags::NX;
    }

    vm.map(guest_start, host_ptr as u64, mapped_len, prot);
}

/// Builds the `argc`/`argv`/`envp`/auxv stack image below
/// [`INITIAL_STACK_TOP`], mapping a fresh stack region and writing the
/// layout the System V ABI's `_start` expects.
fn build_initial_stack(vm: &Vm, elf: &Elf<'_>, path: &Path, args: &[String]) -> u64 {
    let stack_len = round_up(INITIAL_STACK_SIZE, PAGE_SIZE);
    let guest_base = INITIAL_STACK_TOP - stack_len;

    // Safety: see `map_segment`; same anonymous, privately owned mapping.
    let host_ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            stack_len as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    assert_ne!(host_ptr, libc::MAP_FAILED, "failed to reserve host memory for the initial stack");
    vm.map(guest_base, host_ptr as u64, stack_len, PageFlags::W | PageFlags::U | PageFlags::NX);

    let argv0 = path.to_string_lossy().into_owned();
    let mut strings: Vec<String> = Vec::with_capacity(1 + args.len());
    strings.push(argv0);
    strings.extend(args.iter().cloned());

    // Lay strings out from the top of the stack downward, guest-address
    // ordered so they can be written directly into the host buffer at the
    // matching offset from `guest_base`.
    let mut cursor = INITIAL_STACK_TOP;
    let mut string_addrs = Vec::with_capacity(strings.len());
    for s in &strings {
        let bytes = s.as_bytes();
        cursor -= bytes.len() as u64 + 1;
        let offset = (cursor - guest_base) as usize;
        // Safety: `offset + bytes.len() + 1 <= stack_len` by construction
        // (strings are small relative to `INITIAL_STACK_SIZE`).
        unsafe {
            let dst = (host_ptr as *mut u8).add(offset);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            *dst.add(bytes.len()) = 0;
        }
        string_addrs.push(cursor);
    }

    // auxv, envp (empty), argv, argc, in that order from high to low so the
    // final layout reads ascending from the computed `sp`.
    let auxv: &[(u64, u64)] = &[
        (AT_PHDR, elf.header.e_phoff + guest_phdr_base(elf)),
        (AT_PHENT, u64::from(elf.header.e_phentsize)),
        (AT_PHNUM, u64::from(elf.header.e_phnum)),
        (AT_ENTRY, elf.header.e_entry),
        (AT_PAGESZ, PAGE_SIZE),
        (AT_NULL, 0),
    ];

    let mut words: Vec<u64> = Vec::new();
    words.push(strings.len() as u64); // argc
    for &addr in &string_addrs {
        words.push(addr);
    }
    words.push(0); // argv terminator
    words.push(0); // envp terminator (no environment forwarded)
    for &(key, value) in auxv {
        words.push(key);
        words.push(value);
    }

    cursor -= (words.len() as u64) * 8;
    cursor &= !0xf; // 16-byte align the final stack pointer
    let offset = (cursor - guest_base) as usize;
    for (i, word) in words.iter().enumerate() {
        // Safety: `offset + words.len() * 8 <= stack_len` by construction.
        unsafe {
            let dst = (host_ptr as *mut u8).add(offset + i * 8);
            std::ptr::copy_nonoverlapping(word.to_le_bytes().as_ptr(), dst, 8);
        }
    }

    cursor
}

/// The program headers of a statically linked `ET_EXEC` binary are mapped
/// as part of the first `PT_LOAD` segment at its file offset; `AT_PHDR`
/// must point at their in-memory guest address, i.e. the segment's guest
/// base plus `e_phoff`.
fn guest_phdr_base(elf: &Elf<'_>) -> u64 {
    elf.program_headers
        .iter()
        .find(|ph| ph.p_type == PT_LOAD && ph.p_offset == 0)
        .map_or(0, |ph| ph.p_vaddr)
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
