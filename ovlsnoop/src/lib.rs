//! Userspace side of ovlsnoop: loading the `fileops` and `ovlinuse` eBPF
//! programs, draining their ring buffers and reporting the records, plus the
//! mount injection procedure used by `ovlsnoop-mount-inject`.

pub mod events;
pub mod ksyms;
pub mod load;
pub mod maps;
pub mod mountinject;
pub mod pairing;
pub mod report;
pub mod settings;
pub mod sysutils;
