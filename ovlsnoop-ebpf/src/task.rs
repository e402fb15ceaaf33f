use core::ptr::addr_of;

use aya_ebpf::{
    cty::c_long,
    helpers::{bpf_get_current_task, bpf_probe_read_kernel},
};

use crate::vmlinux::task_struct;

/// Returns the inode number of the current task's mount namespace.
#[inline(always)]
pub fn current_mntns() -> Result<u32, c_long> {
    unsafe {
        let task = bpf_get_current_task() as *const task_struct;
        let nsproxy = bpf_probe_read_kernel(addr_of!((*task).nsproxy))?;
        if nsproxy.is_null() {
            return Ok(0);
        }
        let mnt_ns = bpf_probe_read_kernel(addr_of!((*nsproxy).mnt_ns))?;
        if mnt_ns.is_null() {
            return Ok(0);
        }
        bpf_probe_read_kernel(addr_of!((*mnt_ns).ns.inum))
    }
}
