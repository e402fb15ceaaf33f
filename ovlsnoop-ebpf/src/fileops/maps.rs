use aya_ebpf::{
    macros::map,
    maps::{Array, LruHashMap, PerCpuArray, RingBuf},
};

use ovlsnoop_common::{KprobeCtx, SyscallCtx, TargetComm, CTX_MAX_ENTRIES, RING_BUF_SIZE};

/// Completed file operation records, consumed by userspace.
#[map]
pub(crate) static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUF_SIZE, 0);

/// Process name filter, written once by userspace before attaching.
#[map]
pub(crate) static TARGET_COMM: Array<TargetComm> = Array::with_max_entries(1, 0);

/// Syscall entry state keyed by `pid_tgid`.
#[map]
pub(crate) static SYSCALL_CTX: LruHashMap<u64, SyscallCtx> =
    LruHashMap::with_max_entries(CTX_MAX_ENTRIES, 0);

/// Kprobe entry state keyed by `(pid_tgid << 8) | op`.
#[map]
pub(crate) static KPROBE_CTX: LruHashMap<u64, KprobeCtx> =
    LruHashMap::with_max_entries(CTX_MAX_ENTRIES, 0);

/// Per-CPU staging area for `SyscallCtx`, which does not fit on the BPF
/// stack.
#[map]
pub(crate) static SYSCALL_SCRATCH: PerCpuArray<SyscallCtx> = PerCpuArray::with_max_entries(1, 0);
