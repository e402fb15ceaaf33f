use std::{fs::File, path::Path};

use anyhow::Result;
use flate2::{write::GzEncoder, Compression};
use scopeguard::guard;
use structopt::StructOpt;
use tempfile::tempdir;

use crate::install;

#[derive(StructOpt)]
pub struct Options {
    #[structopt(flatten)]
    layout: install::Layout,
}

pub struct BinTar {
    opts: Options,
}

impl BinTar {
    pub fn new(opts: Options) -> BinTar {
        BinTar { opts }
    }

    /// Installs into a temporary destdir and packs it as
    /// `target/<profile>/ovlsnoop.tar.gz`.
    pub fn do_bin_tar(&self) -> Result<()> {
        let dir = guard(tempdir()?, |d| {
            if let Err(e) = d.close() {
                eprintln!("could not remove the temporary directory: {e}");
            }
        });
        install::Installer::new(install::Options {
            destdir: dir.path().to_string_lossy().to_string(),
            layout: self.opts.layout.clone(),
        })
        .do_install()?;

        let tar_gz_path = Path::new("target")
            .join(&self.opts.layout.profile)
            .join("ovlsnoop.tar.gz");
        let tar_gz = File::create(&tar_gz_path)?;
        let enc = GzEncoder::new(tar_gz, Compression::default());
        let mut tar = tar::Builder::new(enc);
        tar.append_dir_all("", dir.path())?;
        tar.into_inner()?.finish()?;

        println!("Tarball created: {}", tar_gz_path.display());
        Ok(())
    }
}
