#![no_std]
#![no_main]

use aya_ebpf::{
    cty::c_long,
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns,
        bpf_probe_read_user_str_bytes,
    },
    macros::{kprobe, kretprobe, tracepoint},
    maps::LruHashMap,
    programs::{ProbeContext, RetProbeContext, TracePointContext},
};
use aya_log_ebpf::warn;

use ovlsnoop_common::{
    OvlInuseEvent, DENTRY_NAME_LEN, MOUNT_DATA_LEN, MOUNT_PATH_LEN, TASK_COMM_LEN,
};
use ovlsnoop_ebpf::{
    dentry::{dentry_parent, read_dentry_name},
    syscalls::syscall_arg,
    task::current_mntns,
    vmlinux::dentry,
};

mod maps;

use maps::{CONFIG, EVENTS, IS_INUSE_CTX, MOUNT_ARGS, MOUNT_SCRATCH, TRYLOCK_CTX};

/// Copies a user string argument of `mount(2)` into `buf`, leaving it empty
/// when the pointer is NULL or unreadable. The slot is per-CPU, so it is
/// cleared first.
#[inline(always)]
fn read_mount_arg<const N: usize>(
    ctx: &TracePointContext,
    n: usize,
    buf: &mut [u8; N],
) -> Result<(), c_long> {
    *buf = [0; N];
    let ptr = syscall_arg(ctx, n)? as *const u8;
    if !ptr.is_null() {
        let _ = unsafe { bpf_probe_read_user_str_bytes(ptr, buf) };
    }
    Ok(())
}

fn try_sys_enter_mount(ctx: &TracePointContext) -> Result<u32, c_long> {
    let pid_tgid = bpf_get_current_pid_tgid();
    let args = MOUNT_SCRATCH.get_ptr_mut(0).ok_or(0)?;
    let args = unsafe { &mut *args };

    // mount(source, target, fstype, flags, data)
    read_mount_arg(ctx, 0, &mut args.src)?;
    read_mount_arg(ctx, 1, &mut args.dst)?;
    read_mount_arg(ctx, 4, &mut args.data)?;
    args.mntns = current_mntns().unwrap_or(0);

    if let Err(e) = MOUNT_ARGS.insert(&pid_tgid, args, 0) {
        warn!(ctx, "ovlinuse: failed to save mount arguments: {}", e);
        return Err(e);
    }
    Ok(0)
}

/// Saves the arguments of every `mount(2)` call so that in-use records can
/// be annotated with them.
#[tracepoint]
pub fn sys_enter_mount(ctx: TracePointContext) -> u32 {
    try_sys_enter_mount(&ctx).unwrap_or(0)
}

#[tracepoint]
pub fn sys_exit_mount(_ctx: TracePointContext) -> u32 {
    let _ = MOUNT_ARGS.remove(&bpf_get_current_pid_tgid());
    0
}

/// Fills the names of `dentry`, its parent and its grandparent, stopping
/// early at the root.
#[inline(always)]
unsafe fn read_ancestors(dentry: *const dentry, e: *mut OvlInuseEvent) -> Result<(), c_long> {
    read_dentry_name(dentry, &mut (*e).d0)?;
    let parent = match dentry_parent(dentry)? {
        Some(parent) => parent,
        None => return Ok(()),
    };
    read_dentry_name(parent, &mut (*e).d1)?;
    let grandparent = match dentry_parent(parent)? {
        Some(grandparent) => grandparent,
        None => return Ok(()),
    };
    read_dentry_name(grandparent, &mut (*e).d2)?;
    Ok(())
}

/// Publishes an in-use record for `dentry`, annotated with the arguments of
/// the caller's `mount(2)` call when one is in flight.
#[inline(always)]
fn emit_inuse_event(dentry: *const dentry) {
    let pid_tgid = bpf_get_current_pid_tgid();
    let Some(mut entry) = EVENTS.reserve::<OvlInuseEvent>(0) else {
        return;
    };
    let e = entry.as_mut_ptr();
    unsafe {
        (*e).timestamp_ns = bpf_ktime_get_ns();
        (*e).tgid = (pid_tgid >> 32) as u32;
        (*e).comm = bpf_get_current_comm().unwrap_or([0; TASK_COMM_LEN]);
        (*e).d0 = [0; DENTRY_NAME_LEN];
        (*e).d1 = [0; DENTRY_NAME_LEN];
        (*e).d2 = [0; DENTRY_NAME_LEN];
        if !dentry.is_null() {
            let _ = read_ancestors(dentry, e);
        }
        match MOUNT_ARGS.get(&pid_tgid) {
            Some(args) => {
                (*e).mntns = args.mntns;
                (*e).mount_src = args.src;
                (*e).mount_dst = args.dst;
                (*e).mount_data = args.data;
            }
            None => {
                (*e).mntns = current_mntns().unwrap_or(0);
                (*e).mount_src = [0; MOUNT_PATH_LEN];
                (*e).mount_dst = [0; MOUNT_PATH_LEN];
                (*e).mount_data = [0; MOUNT_DATA_LEN];
            }
        }
    }
    entry.submit(0);
}

#[inline(always)]
fn save_dentry(map: &LruHashMap<u64, u64>, ctx: &ProbeContext) -> Result<u32, c_long> {
    let dentry: u64 = ctx.arg(0).ok_or(0)?;
    map.insert(&bpf_get_current_pid_tgid(), &dentry, 0)?;
    Ok(0)
}

#[inline(always)]
fn take_dentry(map: &LruHashMap<u64, u64>) -> Option<*const dentry> {
    let pid_tgid = bpf_get_current_pid_tgid();
    let dentry = unsafe { map.get(&pid_tgid) }.copied();
    let _ = map.remove(&pid_tgid);
    dentry.map(|d| d as *const dentry)
}

/// `bool ovl_inuse_trylock(struct dentry *dentry)`
#[kprobe]
pub fn kp_ovl_inuse_trylock(ctx: ProbeContext) -> u32 {
    save_dentry(&TRYLOCK_CTX, &ctx).unwrap_or(0)
}

/// Reports the dentry when the lock could not be taken.
#[kretprobe]
pub fn kretp_ovl_inuse_trylock(ctx: RetProbeContext) -> u32 {
    let dentry = match take_dentry(&TRYLOCK_CTX) {
        Some(dentry) => dentry,
        None => return 0,
    };
    let acquired: u64 = ctx.ret().unwrap_or(1);
    if acquired & 0xff == 0 {
        emit_inuse_event(dentry);
    }
    0
}

/// `bool ovl_is_inuse(struct dentry *dentry)`
#[kprobe]
pub fn kp_ovl_is_inuse(ctx: ProbeContext) -> u32 {
    save_dentry(&IS_INUSE_CTX, &ctx).unwrap_or(0)
}

/// Reports the dentry when it is already in use, unless disabled through
/// `CONFIG`.
#[kretprobe]
pub fn kretp_ovl_is_inuse(ctx: RetProbeContext) -> u32 {
    let dentry = match take_dentry(&IS_INUSE_CTX) {
        Some(dentry) => dentry,
        None => return 0,
    };
    let enabled = match CONFIG.get(0) {
        Some(config) => config.trace_is_inuse != 0,
        None => false,
    };
    let inuse: u64 = ctx.ret().unwrap_or(0);
    if enabled && inuse & 0xff != 0 {
        emit_inuse_event(dentry);
    }
    0
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
