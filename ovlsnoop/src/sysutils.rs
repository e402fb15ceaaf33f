use std::path::{Path, PathBuf};

use nix::{
    errno::Errno,
    sys::resource::{setrlimit, Resource},
    unistd::geteuid,
};

/// Kernel type information needed by the kprobes reading `struct dentry`.
pub const SYS_BTF_PATH: &str = "/sys/kernel/btf/vmlinux";

#[derive(thiserror::Error, Debug)]
pub enum SysutilsError {
    #[error("ovlsnoop has to be run as root")]
    NotRoot,

    #[error("kernel BTF not found at {0}, CONFIG_DEBUG_INFO_BTF is required")]
    BtfMissing(PathBuf),

    #[error("could not raise RLIMIT_MEMLOCK: {0}")]
    Memlock(#[from] Errno),
}

/// Checks whether the current process has an effective UID of 0.
pub fn check_root() -> Result<(), SysutilsError> {
    if !geteuid().is_root() {
        return Err(SysutilsError::NotRoot);
    }
    Ok(())
}

/// Checks whether the kernel exposes its BTF at the given path.
pub fn check_btf<P: AsRef<Path>>(btf_path: P) -> Result<(), SysutilsError> {
    let btf_path = btf_path.as_ref();
    if !btf_path.exists() {
        return Err(SysutilsError::BtfMissing(btf_path.to_path_buf()));
    }
    Ok(())
}

/// Lifts the locked memory limit, which older kernels charge eBPF maps to.
pub fn bump_memlock_rlimit() -> Result<(), SysutilsError> {
    setrlimit(
        Resource::RLIMIT_MEMLOCK,
        libc::RLIM_INFINITY,
        libc::RLIM_INFINITY,
    )?;
    Ok(())
}
