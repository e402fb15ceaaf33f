use aya::{
    include_bytes_aligned,
    programs::{KProbe, ProgramError, TracePoint},
    Ebpf, EbpfError, EbpfLoader,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ksyms::Ksyms;

/// Syscall tracepoints of the `fileops` program, all required.
const FILEOPS_TRACEPOINTS: &[&str] = &[
    "sys_enter_mount",
    "sys_exit_mount",
    "sys_enter_umount",
    "sys_exit_umount",
    "sys_enter_unlinkat",
    "sys_exit_unlinkat",
    "sys_enter_mkdirat",
    "sys_exit_mkdirat",
    "sys_enter_newfstatat",
    "sys_exit_newfstatat",
];

/// Kernel functions probed by the `fileops` program. Their absence (e.g.
/// overlayfs not loaded yet) only narrows what gets reported.
const FILEOPS_KPROBES: &[&str] = &[
    "ovl_workdir_create",
    "ovl_workdir_cleanup",
    "vfs_mkdir",
    "vfs_rmdir",
];

/// Overlay mount admission predicates probed by the `ovlinuse` program.
const OVL_PREDICATES: &[&str] = &["ovl_inuse_trylock", "ovl_is_inuse"];

#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Ebpf(#[from] EbpfError),
}

/// Loads the file operations tracer.
pub fn load_fileops() -> Result<Ebpf, LoadError> {
    #[cfg(debug_assertions)]
    let ebpf = EbpfLoader::new().load(include_bytes_aligned!(
        "../../target/bpfel-unknown-none/debug/fileops"
    ))?;
    #[cfg(not(debug_assertions))]
    let ebpf = EbpfLoader::new().load(include_bytes_aligned!(
        "../../target/bpfel-unknown-none/release/fileops"
    ))?;

    Ok(ebpf)
}

/// Loads the overlay in-use tracer.
pub fn load_ovlinuse() -> Result<Ebpf, LoadError> {
    #[cfg(debug_assertions)]
    let ebpf = EbpfLoader::new().load(include_bytes_aligned!(
        "../../target/bpfel-unknown-none/debug/ovlinuse"
    ))?;
    #[cfg(not(debug_assertions))]
    let ebpf = EbpfLoader::new().load(include_bytes_aligned!(
        "../../target/bpfel-unknown-none/release/ovlinuse"
    ))?;

    Ok(ebpf)
}

#[derive(Error, Debug)]
pub enum AttachError {
    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error("program {0} not found in the eBPF object")]
    ProgramNotFound(String),

    #[error(
        "none of the overlay predicates ({}) could be probed, is overlayfs available?",
        OVL_PREDICATES.join(", ")
    )]
    NoOverlayProbes,
}

fn attach_tracepoint(ebpf: &mut Ebpf, name: &str) -> Result<(), AttachError> {
    let program: &mut TracePoint = ebpf
        .program_mut(name)
        .ok_or_else(|| AttachError::ProgramNotFound(name.to_owned()))?
        .try_into()?;
    program.load()?;
    program.attach("syscalls", name)?;
    debug!(program = name, "attached tracepoint");
    Ok(())
}

fn kprobe_mut<'a>(ebpf: &'a mut Ebpf, name: &str) -> Result<&'a mut KProbe, AttachError> {
    let program: &mut KProbe = ebpf
        .program_mut(name)
        .ok_or_else(|| AttachError::ProgramNotFound(name.to_owned()))?
        .try_into()?;
    Ok(program)
}

/// Attaches the `entry` kprobe and the `exit` kretprobe to `symbol`. When
/// the kretprobe cannot be attached the kprobe is detached again, so that no
/// correlation state is saved without ever being released.
fn attach_probe_pair(
    ebpf: &mut Ebpf,
    entry: &str,
    exit: &str,
    symbol: &str,
) -> Result<(), AttachError> {
    let program = kprobe_mut(ebpf, entry)?;
    program.load()?;
    let entry_link = program.attach(symbol, 0)?;

    let res = kprobe_mut(ebpf, exit).and_then(|program| {
        program.load()?;
        program.attach(symbol, 0)?;
        Ok(())
    });
    if let Err(e) = res {
        if let Err(detach_err) = kprobe_mut(ebpf, entry).and_then(|program| {
            program.detach(entry_link)?;
            Ok(())
        }) {
            warn!(
                program = entry,
                error = detach_err.to_string().as_str(),
                "could not detach kprobe"
            );
        }
        return Err(e);
    }

    debug!(entry, exit, symbol, "attached kprobe and kretprobe");
    Ok(())
}

/// Attaches the `kp_<name>` / `kretp_<name>` pair of programs to `symbol`.
fn attach_kprobe_pair(ebpf: &mut Ebpf, name: &str, symbol: &str) -> Result<(), AttachError> {
    attach_probe_pair(ebpf, &format!("kp_{name}"), &format!("kretp_{name}"), symbol)
}

/// Attaches all programs of the file operations tracer. Syscall tracepoints
/// are required; each kprobe pair is attached when its function exists.
pub fn attach_fileops(ebpf: &mut Ebpf) -> Result<(), AttachError> {
    for name in FILEOPS_TRACEPOINTS {
        attach_tracepoint(ebpf, name)?;
    }

    for name in FILEOPS_KPROBES {
        if let Err(e) = attach_kprobe_pair(ebpf, name, name) {
            debug!(
                function = name,
                error = e.to_string().as_str(),
                "could not probe kernel function, skipping"
            );
        }
    }

    Ok(())
}

/// Attaches all programs of the overlay in-use tracer, resolving the
/// predicate names through `ksyms`. Returns the predicates actually probed.
pub fn attach_ovlinuse(ebpf: &mut Ebpf, ksyms: &Ksyms) -> Result<Vec<String>, AttachError> {
    attach_tracepoint(ebpf, "sys_enter_mount")?;
    attach_tracepoint(ebpf, "sys_exit_mount")?;

    let mut attached = Vec::new();
    for name in OVL_PREDICATES {
        let symbol = match ksyms.find_symbol(name) {
            Some(symbol) => symbol,
            None => {
                warn!(function = name, "kernel symbol not found, skipping");
                continue;
            }
        };
        match attach_kprobe_pair(ebpf, name, symbol) {
            Ok(()) => attached.push(symbol.to_owned()),
            Err(e) => warn!(
                function = name,
                symbol,
                error = e.to_string().as_str(),
                "could not probe overlay predicate, skipping"
            ),
        }
    }

    if attached.is_empty() {
        return Err(AttachError::NoOverlayProbes);
    }
    info!(predicates = attached.join(",").as_str(), "overlay predicates probed");
    Ok(attached)
}
