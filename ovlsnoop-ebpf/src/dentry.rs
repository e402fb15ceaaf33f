//! Helpers reading names out of kernel `struct dentry` objects.

use core::ptr::addr_of;

use aya_ebpf::{
    cty::c_long,
    helpers::{bpf_probe_read_kernel, bpf_probe_read_kernel_str_bytes},
};
use ovlsnoop_common::{DENTRY_READ_LEN, MAX_PATH_LEN};

use crate::vmlinux::dentry;

/// Copies the name of `dentry` into `buf` as a NUL-terminated string and
/// returns its length without the NUL. A dentry without a name yields 0.
#[inline(always)]
pub unsafe fn read_dentry_name(dentry: *const dentry, buf: &mut [u8]) -> Result<usize, c_long> {
    let name = bpf_probe_read_kernel(addr_of!((*dentry).d_name.name))?;
    if name.is_null() {
        buf[0] = 0;
        return Ok(0);
    }
    let s = bpf_probe_read_kernel_str_bytes(name as *const u8, buf)?;
    Ok(s.len())
}

/// Returns the parent of `dentry`, or `None` at the root of its tree.
#[inline(always)]
pub unsafe fn dentry_parent(dentry: *const dentry) -> Result<Option<*const dentry>, c_long> {
    let parent = bpf_probe_read_kernel(addr_of!((*dentry).d_parent))? as *const dentry;
    if parent.is_null() || parent == dentry {
        return Ok(None);
    }
    Ok(Some(parent))
}

/// Synthesizes a short path for `dentry` as `<parent>/<name>`, or just
/// `<name>` when the parent is the root, has no name or cannot be read. Each
/// component is bounded by `DENTRY_READ_LEN`.
#[inline(always)]
pub unsafe fn read_dentry_path(
    dentry: *const dentry,
    out: &mut [u8; MAX_PATH_LEN],
) -> Result<(), c_long> {
    out[0] = 0;

    let mut off = 0;
    if let Ok(Some(parent)) = dentry_parent(dentry) {
        match read_dentry_name(parent, &mut out[..DENTRY_READ_LEN]) {
            Ok(len) if len > 0 && len < DENTRY_READ_LEN && out[0] != b'/' => {
                out[len] = b'/';
                off = len + 1;
            }
            _ => out[0] = 0,
        }
    }
    if off > DENTRY_READ_LEN {
        return Err(-1);
    }

    read_dentry_name(dentry, &mut out[off..off + DENTRY_READ_LEN])?;
    Ok(())
}
