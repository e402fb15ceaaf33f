use std::{fmt, path::PathBuf, process::Command, str::FromStr};

use anyhow::bail;
use structopt::StructOpt;

#[derive(Debug, Copy, Clone)]
pub enum Architecture {
    BpfEl,
    BpfEb,
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bpfel-unknown-none" => Architecture::BpfEl,
            "bpfeb-unknown-none" => Architecture::BpfEb,
            _ => return Err(format!("invalid target {s}")),
        })
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Architecture::BpfEl => "bpfel-unknown-none",
            Architecture::BpfEb => "bpfeb-unknown-none",
        })
    }
}

#[derive(StructOpt)]
pub struct Options {
    /// Target of the eBPF objects (endianness).
    #[structopt(default_value = "bpfel-unknown-none", long)]
    target: Architecture,
    /// Build with the release profile.
    #[structopt(long)]
    release: bool,
}

/// Builds both eBPF binaries of `ovlsnoop-ebpf` into `target/<arch>/<profile>`.
pub fn build_ebpf(opts: Options) -> Result<(), anyhow::Error> {
    let dir = PathBuf::from("ovlsnoop-ebpf");
    if !dir.join("src").join("vmlinux.rs").exists() {
        bail!("kernel type bindings are missing, run `cargo xtask codegen` first");
    }

    let target = format!("--target={}", opts.target);
    let mut args = vec!["build", target.as_str(), "-Z", "build-std=core"];
    if opts.release {
        args.push("--release");
    }
    let status = Command::new("cargo")
        .current_dir(dir)
        .env_remove("RUSTUP_TOOLCHAIN")
        .args(&args)
        .status()?;
    if !status.success() {
        bail!("failed to build the eBPF programs: {status}");
    }
    Ok(())
}
