use aya_ebpf::{
    macros::map,
    maps::{Array, LruHashMap, PerCpuArray, RingBuf},
};

use ovlsnoop_common::{MountArgs, OvlConfig, CTX_MAX_ENTRIES, RING_BUF_SIZE};

/// Overlay in-use records, consumed by userspace.
#[map]
pub(crate) static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUF_SIZE, 0);

/// Arguments of `mount(2)` calls in flight, keyed by `pid_tgid`.
#[map]
pub(crate) static MOUNT_ARGS: LruHashMap<u64, MountArgs> =
    LruHashMap::with_max_entries(CTX_MAX_ENTRIES, 0);

/// Per-CPU staging area for `MountArgs`.
#[map]
pub(crate) static MOUNT_SCRATCH: PerCpuArray<MountArgs> = PerCpuArray::with_max_entries(1, 0);

/// Dentry passed to `ovl_inuse_trylock`, keyed by `pid_tgid`.
#[map]
pub(crate) static TRYLOCK_CTX: LruHashMap<u64, u64> =
    LruHashMap::with_max_entries(CTX_MAX_ENTRIES, 0);

/// Dentry passed to `ovl_is_inuse`, keyed by `pid_tgid`.
#[map]
pub(crate) static IS_INUSE_CTX: LruHashMap<u64, u64> =
    LruHashMap::with_max_entries(CTX_MAX_ENTRIES, 0);

/// Runtime switches, written by userspace before attaching.
#[map]
pub(crate) static CONFIG: Array<OvlConfig> = Array::with_max_entries(1, 0);
