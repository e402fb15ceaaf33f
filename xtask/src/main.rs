use anyhow::Result;
use structopt::StructOpt;

mod bintar;
mod build_ebpf;
mod codegen;
mod install;

#[derive(StructOpt)]
pub struct Options {
    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Build the eBPF programs.
    BuildEbpf(build_ebpf::Options),
    /// Generate kernel type bindings for the eBPF programs.
    Codegen,
    /// Install binaries, configuration and systemd units.
    Install(install::Options),
    /// Pack an installation into a tarball.
    Bintar(bintar::Options),
}

fn main() -> Result<()> {
    let opts = Options::from_args();

    use Command::*;
    match opts.command {
        BuildEbpf(opts) => build_ebpf::build_ebpf(opts)?,
        Codegen => codegen::generate()?,
        Install(opts) => install::Installer::new(opts).do_install()?,
        Bintar(opts) => bintar::BinTar::new(opts).do_bin_tar()?,
    };

    Ok(())
}
