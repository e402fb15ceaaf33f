#![no_std]
#![no_main]

use core::{ffi::c_void, mem};

use aya_ebpf::{
    cty::c_long,
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_stack, bpf_ktime_get_ns,
        bpf_probe_read_user_str_bytes,
    },
    macros::{kprobe, kretprobe, tracepoint},
    programs::{ProbeContext, RetProbeContext, TracePointContext},
    EbpfContext,
};
use aya_log_ebpf::warn;

use ovlsnoop_common::{
    ret_error, FileEvent, FileOp, KprobeCtx, MAX_PATH_LEN, MAX_STACK_DEPTH, TASK_COMM_LEN,
    VFS_ENTRY_FLAG,
};
use ovlsnoop_ebpf::{
    dentry::read_dentry_path,
    syscalls::{syscall_arg, syscall_ret},
    vmlinux::dentry,
};

mod maps;

use maps::{EVENTS, KPROBE_CTX, SYSCALL_CTX, SYSCALL_SCRATCH, TARGET_COMM};

/// Whether the current task's command name matches the configured target.
#[inline(always)]
fn should_trace() -> bool {
    let target = match TARGET_COMM.get(0) {
        Some(target) => target,
        None => return false,
    };
    match bpf_get_current_comm() {
        Ok(comm) => target.matches(&comm),
        Err(_) => false,
    }
}

#[inline(always)]
fn current_comm() -> [u8; TASK_COMM_LEN] {
    bpf_get_current_comm().unwrap_or([0; TASK_COMM_LEN])
}

#[inline(always)]
fn kprobe_key(pid_tgid: u64, op: FileOp) -> u64 {
    (pid_tgid << 8) | op as u64
}

/// Positions of the syscall arguments captured for an operation.
struct SyscallArgs {
    path: usize,
    path2: Option<usize>,
    flags: usize,
}

/// Records the entry state of a traced syscall.
fn enter_syscall(ctx: &TracePointContext, op: FileOp, args: SyscallArgs) -> Result<u32, c_long> {
    if !should_trace() {
        return Ok(0);
    }

    let pid_tgid = bpf_get_current_pid_tgid();
    let sctx = SYSCALL_SCRATCH.get_ptr_mut(0).ok_or(0)?;
    let sctx = unsafe { &mut *sctx };

    sctx.start_ns = unsafe { bpf_ktime_get_ns() };
    sctx.op = op as u32;
    sctx.flags = syscall_arg(ctx, args.flags)? as u32;
    sctx.path = [0; MAX_PATH_LEN];
    sctx.path2 = [0; MAX_PATH_LEN];

    let path = syscall_arg(ctx, args.path)? as *const u8;
    if !path.is_null() {
        let _ = unsafe { bpf_probe_read_user_str_bytes(path, &mut sctx.path) };
    }
    if let Some(path2) = args.path2 {
        let path2 = syscall_arg(ctx, path2)? as *const u8;
        if !path2.is_null() {
            let _ = unsafe { bpf_probe_read_user_str_bytes(path2, &mut sctx.path2) };
        }
    }

    if let Err(e) = SYSCALL_CTX.insert(&pid_tgid, sctx, 0) {
        warn!(ctx, "fileops: failed to save syscall state: {}", e);
        return Err(e);
    }
    Ok(0)
}

/// Publishes the record of a completed syscall and drops its entry state.
fn exit_syscall(ctx: &TracePointContext) -> Result<u32, c_long> {
    let pid_tgid = bpf_get_current_pid_tgid();
    let sctx = match unsafe { SYSCALL_CTX.get(&pid_tgid) } {
        Some(sctx) => sctx,
        None => return Ok(0),
    };
    let ret = syscall_ret(ctx).unwrap_or(0);
    let now = unsafe { bpf_ktime_get_ns() };

    if let Some(mut entry) = EVENTS.reserve::<FileEvent>(0) {
        let e = entry.as_mut_ptr();
        unsafe {
            (*e).timestamp_ns = now;
            (*e).duration_ns = now.saturating_sub(sctx.start_ns);
            (*e).stack = [0; MAX_STACK_DEPTH];
            (*e).error = ret_error(ret);
            (*e).tgid = (pid_tgid >> 32) as u32;
            (*e).op = sctx.op;
            (*e).flags = sctx.flags;
            (*e).stack_size = 0;
            (*e).comm = current_comm();
            (*e).path = sctx.path;
            (*e).path2 = sctx.path2;
        }
        entry.submit(0);
    }

    let _ = SYSCALL_CTX.remove(&pid_tgid);
    Ok(0)
}

/// Records the entry timestamp of a traced kernel function.
fn save_kprobe_ctx(op: FileOp) -> Result<u64, c_long> {
    let pid_tgid = bpf_get_current_pid_tgid();
    let now = unsafe { bpf_ktime_get_ns() };
    let kctx = KprobeCtx {
        start_ns: now,
        op: op as u32,
        _pad: 0,
    };
    KPROBE_CTX.insert(&kprobe_key(pid_tgid, op), &kctx, 0)?;
    Ok(now)
}

fn enter_kprobe(op: FileOp) -> Result<u32, c_long> {
    if !should_trace() {
        return Ok(0);
    }
    save_kprobe_ctx(op)?;
    Ok(0)
}

/// Publishes the record of a returning kernel function. Paths are empty;
/// the error is taken from the return value, which is either an int or an
/// error-encoded pointer.
fn exit_kprobe(ctx: &RetProbeContext, op: FileOp) -> Result<u32, c_long> {
    let pid_tgid = bpf_get_current_pid_tgid();
    let key = kprobe_key(pid_tgid, op);
    let kctx = match unsafe { KPROBE_CTX.get(&key) } {
        Some(kctx) => kctx,
        None => return Ok(0),
    };
    let ret: i64 = ctx.ret().unwrap_or(0);
    let now = unsafe { bpf_ktime_get_ns() };

    if let Some(mut entry) = EVENTS.reserve::<FileEvent>(0) {
        let e = entry.as_mut_ptr();
        unsafe {
            (*e).timestamp_ns = now;
            (*e).duration_ns = now.saturating_sub(kctx.start_ns);
            (*e).stack = [0; MAX_STACK_DEPTH];
            (*e).error = ret_error(ret);
            (*e).tgid = (pid_tgid >> 32) as u32;
            (*e).op = kctx.op;
            (*e).flags = 0;
            (*e).stack_size = 0;
            (*e).comm = current_comm();
            (*e).path = [0; MAX_PATH_LEN];
            (*e).path2 = [0; MAX_PATH_LEN];
        }
        entry.submit(0);
    }

    let _ = KPROBE_CTX.remove(&key);
    Ok(0)
}

/// Saves the entry state of `vfs_mkdir` / `vfs_rmdir` and publishes an
/// entry snapshot carrying the target dentry path and the kernel stack.
fn enter_vfs(ctx: &ProbeContext, op: FileOp) -> Result<u32, c_long> {
    if !should_trace() {
        return Ok(0);
    }
    let now = save_kprobe_ctx(op)?;
    let pid_tgid = bpf_get_current_pid_tgid();
    // vfs_mkdir(idmap, dir, dentry, mode) / vfs_rmdir(idmap, dir, dentry)
    let target: *const dentry = ctx.arg(2).ok_or(0)?;

    if let Some(mut entry) = EVENTS.reserve::<FileEvent>(0) {
        let e = entry.as_mut_ptr();
        unsafe {
            (*e).timestamp_ns = now;
            (*e).duration_ns = 0;
            (*e).error = 0;
            (*e).tgid = (pid_tgid >> 32) as u32;
            (*e).op = op as u32;
            (*e).flags = VFS_ENTRY_FLAG;
            (*e).comm = current_comm();
            (*e).path = [0; MAX_PATH_LEN];
            (*e).path2 = [0; MAX_PATH_LEN];
            if !target.is_null() && read_dentry_path(target, &mut (*e).path).is_err() {
                (*e).path[0] = 0;
            }

            (*e).stack = [0; MAX_STACK_DEPTH];
            let n = bpf_get_stack(
                ctx.as_ptr(),
                (*e).stack.as_mut_ptr() as *mut c_void,
                mem::size_of::<[u64; MAX_STACK_DEPTH]>() as u32,
                0,
            );
            (*e).stack_size = if n > 0 { (n as u32) / 8 } else { 0 };
        }
        entry.submit(0);
    }
    Ok(0)
}

#[tracepoint]
pub fn sys_enter_mount(ctx: TracePointContext) -> u32 {
    // mount(source, target, fstype, flags, data)
    let args = SyscallArgs {
        path: 1,
        path2: Some(4),
        flags: 3,
    };
    enter_syscall(&ctx, FileOp::Mount, args).unwrap_or(0)
}

#[tracepoint]
pub fn sys_exit_mount(ctx: TracePointContext) -> u32 {
    exit_syscall(&ctx).unwrap_or(0)
}

#[tracepoint]
pub fn sys_enter_umount(ctx: TracePointContext) -> u32 {
    // umount2(target, flags)
    let args = SyscallArgs {
        path: 0,
        path2: None,
        flags: 1,
    };
    enter_syscall(&ctx, FileOp::Umount, args).unwrap_or(0)
}

#[tracepoint]
pub fn sys_exit_umount(ctx: TracePointContext) -> u32 {
    exit_syscall(&ctx).unwrap_or(0)
}

#[tracepoint]
pub fn sys_enter_unlinkat(ctx: TracePointContext) -> u32 {
    // unlinkat(dfd, pathname, flag)
    let args = SyscallArgs {
        path: 1,
        path2: None,
        flags: 2,
    };
    enter_syscall(&ctx, FileOp::Unlinkat, args).unwrap_or(0)
}

#[tracepoint]
pub fn sys_exit_unlinkat(ctx: TracePointContext) -> u32 {
    exit_syscall(&ctx).unwrap_or(0)
}

#[tracepoint]
pub fn sys_enter_mkdirat(ctx: TracePointContext) -> u32 {
    // mkdirat(dfd, pathname, mode)
    let args = SyscallArgs {
        path: 1,
        path2: None,
        flags: 2,
    };
    enter_syscall(&ctx, FileOp::Mkdirat, args).unwrap_or(0)
}

#[tracepoint]
pub fn sys_exit_mkdirat(ctx: TracePointContext) -> u32 {
    exit_syscall(&ctx).unwrap_or(0)
}

#[tracepoint]
pub fn sys_enter_newfstatat(ctx: TracePointContext) -> u32 {
    // newfstatat(dfd, filename, statbuf, flag)
    let args = SyscallArgs {
        path: 1,
        path2: None,
        flags: 3,
    };
    enter_syscall(&ctx, FileOp::Stat, args).unwrap_or(0)
}

#[tracepoint]
pub fn sys_exit_newfstatat(ctx: TracePointContext) -> u32 {
    exit_syscall(&ctx).unwrap_or(0)
}

#[kprobe]
pub fn kp_ovl_workdir_create(_ctx: ProbeContext) -> u32 {
    enter_kprobe(FileOp::OvlWorkdirCreate).unwrap_or(0)
}

#[kretprobe]
pub fn kretp_ovl_workdir_create(ctx: RetProbeContext) -> u32 {
    exit_kprobe(&ctx, FileOp::OvlWorkdirCreate).unwrap_or(0)
}

#[kprobe]
pub fn kp_ovl_workdir_cleanup(_ctx: ProbeContext) -> u32 {
    enter_kprobe(FileOp::OvlWorkdirCleanup).unwrap_or(0)
}

#[kretprobe]
pub fn kretp_ovl_workdir_cleanup(ctx: RetProbeContext) -> u32 {
    exit_kprobe(&ctx, FileOp::OvlWorkdirCleanup).unwrap_or(0)
}

#[kprobe]
pub fn kp_vfs_mkdir(ctx: ProbeContext) -> u32 {
    enter_vfs(&ctx, FileOp::VfsMkdir).unwrap_or(0)
}

#[kretprobe]
pub fn kretp_vfs_mkdir(ctx: RetProbeContext) -> u32 {
    exit_kprobe(&ctx, FileOp::VfsMkdir).unwrap_or(0)
}

#[kprobe]
pub fn kp_vfs_rmdir(ctx: ProbeContext) -> u32 {
    enter_vfs(&ctx, FileOp::VfsRmdir).unwrap_or(0)
}

#[kretprobe]
pub fn kretp_vfs_rmdir(ctx: RetProbeContext) -> u32 {
    exit_kprobe(&ctx, FileOp::VfsRmdir).unwrap_or(0)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
