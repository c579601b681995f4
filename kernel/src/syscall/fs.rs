//! File-descriptor syscalls: `read`, `write`, `open`, `close`, `fstat`,
//! `ioctl`. Thin pass-throughs to the host's own open file table scoped
//! under the resolved mount root; there is no virtual filesystem and no
//! descriptor virtualization beyond translating guest buffer pointers
//! through the user-memory accessors. A guest file descriptor *is* the
//! host file descriptor `open` returned.
//!
//! Grounded on the original implementation's `src/fs/fs.c`
//! (`sc_read`/`sc_write`/`sc_close`/`sc_fstat`/`darwinfs_ioctl`,
//! `do_openat`).

use std::ffi::CString;

use crate::task::Task;

const EFAULT: i64 = -14;
const ENOTTY: i64 = -25;
const EPERM: i64 = -1;

const PATH_MAX: usize = 4096;

const L_O_WRONLY: i32 = 0o1;
const L_O_RDWR: i32 = 0o2;
const L_O_CREAT: i32 = 0o100;
const L_O_EXCL: i32 = 0o200;
const L_O_TRUNC: i32 = 0o1000;
const L_O_APPEND: i32 = 0o2000;

pub(crate) fn read(task: &Task, args: [u64; 6]) -> i64 {
    let (fd, buf_addr, size) = (args[0] as i32, args[1], args[2] as usize);
    let mut buf = vec![0u8; size];
    // Safety: `fd` is a guest-visible descriptor that is, by this crate's
    // design, literally the host descriptor `open` handed back, and `buf`
    // is exactly `size` bytes long.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), size) };
    if n < 0 {
        return crate::errno::last_host_errno_to_linux();
    }
    if n > 0 && task.vm().copy_to_user(buf_addr, &buf[..n as usize], n as usize) < 0 {
        return EFAULT;
    }
    n as i64
}

pub(crate) fn write(task: &Task, args: [u64; 6]) -> i64 {
    let (fd, buf_addr, size) = (args[0] as i32, args[1], args[2] as usize);
    let mut buf = vec![0u8; size];
    if task.vm().copy_from_user(&mut buf, buf_addr, size) < 0 {
        return EFAULT;
    }
    // Safety: `buf` holds exactly `size` initialized bytes copied in above.
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), size) };
    if n < 0 {
        return crate::errno::last_host_errno_to_linux();
    }
    n as i64
}

pub(crate) fn close(_task: &Task, args: [u64; 6]) -> i64 {
    let fd = args[0] as i32;
    // Safety: `fd` is a plain descriptor number; `close` is safe to call
    // even if it turns out invalid, which just yields `-EBADF`.
    let r = unsafe { libc::close(fd) };
    if r < 0 {
        return crate::errno::last_host_errno_to_linux();
    }
    0
}

pub(crate) fn open(task: &Task, args: [u64; 6]) -> i64 {
    let (path_addr, flags, mode) = (args[0], args[1] as i32, args[2] as u32);
    let mut path_buf = vec![0u8; PATH_MAX];
    if task.vm().strncpy_from_user(&mut path_buf, path_addr, PATH_MAX) < 0 {
        return EFAULT;
    }
    let guest_path = match path_buf.iter().position(|&b| b == 0) {
        Some(nul) => String::from_utf8_lossy(&path_buf[..nul]).into_owned(),
        None => return EFAULT,
    };

    let host_path = resolve_under_root(task.process().root(), &guest_path);
    let Ok(c_path) = CString::new(host_path.as_os_str().as_encoded_bytes()) else {
        return EFAULT;
    };

    let host_flags = translate_open_flags(flags);
    // Safety: `c_path` is a valid, NUL-terminated string for the duration
    // of this call.
    let fd = unsafe { libc::open(c_path.as_ptr(), host_flags, mode) };
    if fd < 0 {
        return crate::errno::last_host_errno_to_linux();
    }
    i64::from(fd)
}

fn resolve_under_root(root: &std::path::Path, guest_path: &str) -> std::path::PathBuf {
    let relative = guest_path.trim_start_matches('/');
    root.join(relative)
}

fn translate_open_flags(flags: i32) -> i32 {
    let mut out = 0;
    out |= match flags & (L_O_WRONLY | L_O_RDWR) {
        L_O_WRONLY => libc::O_WRONLY,
        L_O_RDWR => libc::O_RDWR,
        _ => libc::O_RDONLY,
    };
    if flags & L_O_CREAT != 0 {
        out |= libc::O_CREAT;
    }
    if flags & L_O_EXCL != 0 {
        out |= libc::O_EXCL;
    }
    if flags & L_O_TRUNC != 0 {
        out |= libc::O_TRUNC;
    }
    if flags & L_O_APPEND != 0 {
        out |= libc::O_APPEND;
    }
    out
}

/// Linux `struct stat` (x86-64, the `l_newstat` layout): 144 bytes. Only
/// the fields guests actually consult (mode, size, the three timestamps)
/// carry real values; the rest mirror a sane regular-file default, as the
/// original implementation's `stat_darwin_to_linux` does for fields macOS's
/// own `struct stat` has no equivalent of.
const STAT_LEN: usize = 144;

pub(crate) fn fstat(task: &Task, args: [u64; 6]) -> i64 {
    let (fd, st_addr) = (args[0] as i32, args[1]);
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // Safety: `st` is a valid, zeroed `stat` buffer the call fills in place.
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return crate::errno::last_host_errno_to_linux();
    }

    let mut buf = [0u8; STAT_LEN];
    buf[0..8].copy_from_slice(&(st.st_dev as u64).to_le_bytes());
    buf[8..16].copy_from_slice(&(st.st_ino as u64).to_le_bytes());
    buf[16..24].copy_from_slice(&(st.st_nlink as u64).to_le_bytes());
    buf[24..28].copy_from_slice(&(st.st_mode as u32).to_le_bytes());
    buf[28..32].copy_from_slice(&(st.st_uid).to_le_bytes());
    buf[32..36].copy_from_slice(&(st.st_gid).to_le_bytes());
    buf[48..56].copy_from_slice(&(st.st_size as u64).to_le_bytes());
    buf[56..60].copy_from_slice(&(st.st_blksize as u32).to_le_bytes());
    buf[64..72].copy_from_slice(&(st.st_blocks as u64).to_le_bytes());
    buf[72..80].copy_from_slice(&(st.st_atime as u64).to_le_bytes());
    buf[88..96].copy_from_slice(&(st.st_mtime as u64).to_le_bytes());
    buf[104..112].copy_from_slice(&(st.st_ctime as u64).to_le_bytes());

    if task.vm().copy_to_user(st_addr, &buf, buf.len()) < 0 {
        return EFAULT;
    }
    0
}

const TCGETS: u64 = 0x5401;
const TIOCGWINSZ: u64 = 0x5413;

/// `darwinfs_ioctl` only recognizes two terminal-control requests on fd 1
/// (stdout); everything else, on any descriptor, is `-EPERM` there too.
pub(crate) fn ioctl(task: &Task, args: [u64; 6]) -> i64 {
    let (fd, cmd, arg) = (args[0] as i32, args[1], args[2]);
    if fd != 1 {
        return EPERM;
    }
    match cmd {
        TIOCGWINSZ => {
            let mut ws = libc::winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };
            // Safety: `ws` is a valid, fully initialized `winsize` the
            // ioctl fills in place.
            let r = unsafe { libc::ioctl(1, libc::TIOCGWINSZ, &mut ws) };
            if r < 0 {
                return crate::errno::last_host_errno_to_linux();
            }
            let bytes = [
                ws.ws_row.to_le_bytes(),
                ws.ws_col.to_le_bytes(),
                ws.ws_xpixel.to_le_bytes(),
                ws.ws_ypixel.to_le_bytes(),
            ]
            .concat();
            if task.vm().copy_to_user(arg, &bytes, bytes.len()) < 0 {
                return EFAULT;
            }
            0
        }
        TCGETS => ENOTTY,
        _ => EPERM,
    }
}
