use std::{
    fs,
    io::{self, prelude::*},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use serde::Serialize;
use structopt::StructOpt;
use tera::{Context, Tera};
use thiserror::Error;

/// Binaries shipped by the workspace.
const BINARIES: &[&str] = &["ovlsnoop", "ovlsnoop-mount-inject"];

#[derive(Error, Debug)]
pub enum InstallError {
    #[error(transparent)]
    IO(#[from] io::Error),

    #[error(transparent)]
    FS(#[from] fs_extra::error::Error),

    #[error(transparent)]
    Tera(#[from] tera::Error),

    #[error("could not escalate privileges (sudo)")]
    Sudo,

    #[error("{0} is not built (with the requested profile)")]
    NotBuilt(PathBuf),

    #[error("invalid template file name {0}")]
    TemplatedFileName(PathBuf),
}

/// Re-runs xtask through sudo when installing into a root-owned directory.
fn escalate_if_root_owned(p: &Path) -> Result<(), InstallError> {
    if p.metadata()?.uid() == 0 {
        // The sudo crate only returns a boxed error, which tells users
        // nothing.
        sudo::escalate_if_needed().map_err(|_| InstallError::Sudo)?;
    }
    Ok(())
}

fn prepare_dir(p: &Path) -> Result<(), InstallError> {
    fs::create_dir_all(p)?;
    escalate_if_root_owned(p)
}

/// Installation layout, shared with `bintar`.
#[derive(StructOpt, Clone)]
pub struct Layout {
    #[structopt(default_value = "debug", long)]
    pub profile: String,

    #[structopt(default_value = "usr/local", long)]
    pub prefix: String,

    // Directories which belong under prefix.
    #[structopt(default_value = "bin", long)]
    pub bindir: String,
    #[structopt(default_value = "etc", long)]
    pub sysconfdir: String,
    #[structopt(default_value = "lib/systemd/system", long)]
    pub unitdir: String,
}

#[derive(StructOpt)]
pub struct Options {
    #[structopt(default_value = "/", long)]
    pub destdir: String,

    #[structopt(flatten)]
    pub layout: Layout,
}

/// Directories exposed to the unit templates. The plain ones are paths on
/// the target system, the `_full` ones are where files get written
/// (prefixed with destdir).
#[derive(Serialize)]
struct InstallDirs {
    destdir: PathBuf,
    prefix: PathBuf,
    prefix_full: PathBuf,
    bindir: PathBuf,
    bindir_full: PathBuf,
    sysconfdir: PathBuf,
    sysconfdir_full: PathBuf,
    unitdir: PathBuf,
    unitdir_full: PathBuf,
}

impl InstallDirs {
    fn new(opts: &Options) -> Self {
        let layout = &opts.layout;
        let destdir = PathBuf::from(&opts.destdir);
        let prefix = Path::new("/").join(&layout.prefix);
        let bindir = prefix.join(&layout.bindir);
        let sysconfdir = Path::new("/").join(&layout.sysconfdir);
        let unitdir = prefix.join(&layout.unitdir);
        // `Path::join` would discard destdir for absolute paths.
        let full = |p: &Path| destdir.join(p.strip_prefix("/").unwrap_or(p));

        InstallDirs {
            prefix_full: full(&prefix),
            bindir_full: full(&bindir),
            sysconfdir_full: full(&sysconfdir),
            unitdir_full: full(&unitdir),
            destdir: destdir.clone(),
            prefix,
            bindir,
            sysconfdir,
            unitdir,
        }
    }
}

pub struct Installer {
    profile: String,
    install_dirs: InstallDirs,
}

impl Installer {
    pub fn new(opts: Options) -> Installer {
        Installer {
            install_dirs: InstallDirs::new(&opts),
            profile: opts.layout.profile,
        }
    }

    fn install_binaries(&self) -> Result<(), InstallError> {
        let bindir_full = &self.install_dirs.bindir_full;
        prepare_dir(bindir_full)?;

        let target_path = Path::new("target").join(&self.profile);
        for binary in BINARIES {
            let path_src = target_path.join(binary);
            if !path_src.exists() {
                return Err(InstallError::NotBuilt(path_src));
            }
            let path_dest = bindir_full.join(binary);
            println!("Installing {} to {}", binary, path_dest.display());
            fs::copy(path_src, path_dest)?;
        }
        Ok(())
    }

    fn install_config(&self) -> Result<(), InstallError> {
        let config_path = Path::new("contrib").join("etc");
        if !config_path.exists() {
            return Ok(());
        }
        let sysconfdir_full = &self.install_dirs.sysconfdir_full;
        prepare_dir(sysconfdir_full)?;

        let paths = fs::read_dir(config_path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?;

        println!("Installing config files to {}", sysconfdir_full.display());
        let mut options = fs_extra::dir::CopyOptions::new();
        options.overwrite = true;
        fs_extra::copy_items(&paths, sysconfdir_full, &options)?;

        Ok(())
    }

    /// Renders a `*.in` unit with the install directories and writes it
    /// without the suffix.
    fn install_templated_unit(&self, tera: &Tera, path: &Path) -> Result<(), InstallError> {
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| InstallError::TemplatedFileName(path.to_path_buf()))?;
        let unit_name = file_name
            .strip_suffix(".in")
            .ok_or_else(|| InstallError::TemplatedFileName(path.to_path_buf()))?;
        let path_dest = self.install_dirs.unitdir_full.join(unit_name);

        let content = tera.render(file_name, &Context::from_serialize(&self.install_dirs)?)?;
        println!(
            "Templating and installing systemd unit {} to {}",
            file_name,
            path_dest.display()
        );
        fs::File::create(&path_dest)?.write_all(content.as_bytes())?;

        Ok(())
    }

    fn install_units(&self) -> Result<(), InstallError> {
        let unit_path = Path::new("contrib").join("systemd");
        if !unit_path.exists() {
            return Ok(());
        }
        let unitdir_full = &self.install_dirs.unitdir_full;
        prepare_dir(unitdir_full)?;

        let tera = Tera::new(&unit_path.join("*.in").to_string_lossy())?;
        for entry in fs::read_dir(&unit_path)? {
            let path_cur = entry?.path();
            // No nested directories in systemd units.
            if path_cur.is_dir() {
                continue;
            }

            if path_cur.extension().map_or(false, |ext| ext == "in") {
                self.install_templated_unit(&tera, &path_cur)?;
            } else if let Some(file_name) = path_cur.file_name() {
                let path_dest = unitdir_full.join(file_name);
                println!(
                    "Installing systemd unit {} to {}",
                    file_name.to_string_lossy(),
                    path_dest.display()
                );
                fs::copy(&path_cur, path_dest)?;
            }
        }

        Ok(())
    }

    pub fn do_install(&self) -> anyhow::Result<()> {
        self.install_binaries()?;
        self.install_config()?;
        self.install_units()?;
        Ok(())
    }
}
