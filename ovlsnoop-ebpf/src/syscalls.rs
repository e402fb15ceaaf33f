//! Accessors for the raw `syscalls:sys_enter_*` / `syscalls:sys_exit_*`
//! tracepoint records.

use aya_ebpf::{cty::c_long, programs::TracePointContext};

/// Offset of `args[0]` in a `sys_enter_*` record, after the common header
/// and the syscall number.
const ENTER_ARGS_OFFSET: usize = 16;

/// Offset of `ret` in a `sys_exit_*` record.
const EXIT_RET_OFFSET: usize = 16;

/// Reads the `n`-th raw argument of the syscall being entered.
#[inline(always)]
pub fn syscall_arg(ctx: &TracePointContext, n: usize) -> Result<u64, c_long> {
    unsafe { ctx.read_at::<u64>(ENTER_ARGS_OFFSET + n * 8) }
}

/// Reads the return value of the syscall being exited.
#[inline(always)]
pub fn syscall_ret(ctx: &TracePointContext) -> Result<i64, c_long> {
    unsafe { ctx.read_at::<i64>(EXIT_RET_OFFSET) }
}
