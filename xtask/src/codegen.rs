use std::{fs::File, io::Write, path::PathBuf};

use aya_tool::generate::InputFile;

/// Kernel types read by the eBPF programs.
const TYPES: &[&str] = &["dentry", "qstr", "task_struct", "nsproxy", "mnt_namespace"];

pub fn generate() -> Result<(), anyhow::Error> {
    let dir = PathBuf::from("ovlsnoop-ebpf/src");
    let bindings = aya_tool::generate(
        InputFile::Btf(PathBuf::from("/sys/kernel/btf/vmlinux")),
        TYPES,
        &[],
    )?;
    let mut out = File::create(dir.join("vmlinux.rs"))?;
    write!(out, "{}", bindings)?;
    println!("Generated {}", dir.join("vmlinux.rs").display());
    Ok(())
}
