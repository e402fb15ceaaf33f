use std::{path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ovlsnoop/ovlsnoop.toml";
pub const ENV_PREFIX: &str = "OVLSNOOP";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// Process name traced by the file operations tracer; empty disables it.
    pub target_comm: String,
    /// Load the file operations tracer.
    pub fileops: bool,
    /// Load the overlay in-use tracer.
    pub ovlinuse: bool,
    /// Report `ovl_is_inuse` conflicts, not only failed `ovl_inuse_trylock`.
    pub trace_is_inuse: bool,
    /// How long a VFS entry snapshot waits for its exit record.
    pub pair_window_ms: u64,
    /// Depth of the channel between the ring buffer readers and the
    /// consumer.
    pub channel_capacity: usize,
}

impl Settings {
    /// Reads the settings from `/etc/ovlsnoop/ovlsnoop.toml` (if present) and
    /// `OVLSNOOP_*` environment variables on top of the defaults.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(DEFAULT_CONFIG_PATH, ENV_PREFIX)
    }

    pub fn load<P: AsRef<Path>>(config_path: P, env_prefix: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("target_comm", "")?
            .set_default("fileops", true)?
            .set_default("ovlinuse", true)?
            .set_default("trace_is_inuse", true)?
            .set_default("pair_window_ms", 1000)?
            .set_default("channel_capacity", 1024)?
            .add_source(File::from(config_path.as_ref()).required(false))
            .add_source(Environment::with_prefix(env_prefix).try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn pair_window(&self) -> Duration {
        Duration::from_millis(self.pair_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{env, fs};

    use tempfile::tempdir;

    #[test]
    fn defaults_without_config_file() {
        let dir = tempdir().unwrap();
        let settings =
            Settings::load(dir.path().join("missing.toml"), "OVLSNOOP_TEST_DEFAULTS").unwrap();
        assert_eq!(
            settings,
            Settings {
                target_comm: String::new(),
                fileops: true,
                ovlinuse: true,
                trace_is_inuse: true,
                pair_window_ms: 1000,
                channel_capacity: 1024,
            }
        );
        assert_eq!(settings.pair_window(), Duration::from_secs(1));
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ovlsnoop.toml");
        fs::write(
            &path,
            "target_comm = \"containerd\"\ntrace_is_inuse = false\npair_window_ms = 250\n",
        )
        .unwrap();

        let settings = Settings::load(&path, "OVLSNOOP_TEST_FILE").unwrap();
        assert_eq!(settings.target_comm, "containerd");
        assert!(!settings.trace_is_inuse);
        assert_eq!(settings.pair_window(), Duration::from_millis(250));
        assert!(settings.fileops);
    }

    #[test]
    fn environment_overrides_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ovlsnoop.toml");
        fs::write(&path, "target_comm = \"containerd\"\n").unwrap();

        env::set_var("OVLSNOOP_TEST_ENV_TARGET_COMM", "mkdir");
        env::set_var("OVLSNOOP_TEST_ENV_OVLINUSE", "false");
        let settings = Settings::load(&path, "OVLSNOOP_TEST_ENV").unwrap();
        env::remove_var("OVLSNOOP_TEST_ENV_TARGET_COMM");
        env::remove_var("OVLSNOOP_TEST_ENV_OVLINUSE");

        assert_eq!(settings.target_comm, "mkdir");
        assert!(!settings.ovlinuse);
    }

    #[test]
    fn invalid_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ovlsnoop.toml");
        fs::write(&path, "pair_window_ms = \"soon\"\n").unwrap();
        assert!(Settings::load(&path, "OVLSNOOP_TEST_INVALID").is_err());
    }
}
