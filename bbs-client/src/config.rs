//! Persisted client configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use prost::Message;

use bbs_api_types::ClientConfiguration;

const CONFIG_FILE_NAME: &str = "config";
const SYSTEM_CONFIG_DIR: &str = "/var/lib/burrow-backup";

/// The client daemon's state directory and its small persisted state.
///
/// The machine id is a UUIDv4 generated on first run and never changed
/// afterwards; `last_backup_number` tracks the newest backup this client
/// completed. A missing or unreadable config file is treated as a first
/// run and regenerated.
pub struct ClientConfig {
    dir: PathBuf,
    machine_id: String,
    last_backup_number: i32,
}

impl ClientConfig {
    /// State directory: a system path when running privileged,
    /// `$HOME/.burrow-backup` otherwise.
    pub fn default_dir() -> PathBuf {
        if nix::unistd::Uid::effective().is_root() {
            PathBuf::from(SYSTEM_CONFIG_DIR)
        } else {
            let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
            PathBuf::from(home).join(".burrow-backup")
        }
    }

    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("unable to create state directory {:?}", dir))?;

        let mut stored = match Self::load(&dir) {
            Ok(stored) => stored,
            Err(err) => {
                log::info!("no usable client configuration ({err}), starting fresh");
                ClientConfiguration {
                    machine_id: String::new(),
                    last_backup_number: -1,
                }
            }
        };

        let fresh_id = stored.machine_id.is_empty();
        if fresh_id {
            stored.machine_id = uuid::Uuid::new_v4().to_string();
        }

        let config = Self {
            dir,
            machine_id: stored.machine_id,
            last_backup_number: stored.last_backup_number,
        };
        if fresh_id {
            config.save()?;
        }

        log::info!("machine id {}", config.machine_id);
        Ok(config)
    }

    fn load(dir: &Path) -> Result<ClientConfiguration, Error> {
        let data = std::fs::read(dir.join(CONFIG_FILE_NAME))?;
        Ok(ClientConfiguration::decode(&data[..])?)
    }

    fn save(&self) -> Result<(), Error> {
        let stored = ClientConfiguration {
            machine_id: self.machine_id.clone(),
            last_backup_number: self.last_backup_number,
        };
        bbs_tools::fs::replace_file(
            self.dir.join(CONFIG_FILE_NAME),
            &stored.encode_to_vec(),
            true,
        )?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn last_backup_number(&self) -> i32 {
        self.last_backup_number
    }

    pub fn set_last_backup_number(&mut self, number: i32) -> Result<(), Error> {
        self.last_backup_number = number;
        self.save()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_first_run_and_reload() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;

        let mut config = ClientConfig::open(dir.path())?;
        assert_eq!(config.last_backup_number(), -1);
        let machine_id = config.machine_id().to_string();
        assert!(!machine_id.is_empty());

        config.set_last_backup_number(3)?;
        drop(config);

        let config = ClientConfig::open(dir.path())?;
        assert_eq!(config.machine_id(), machine_id);
        assert_eq!(config.last_backup_number(), 3);

        Ok(())
    }

    #[test]
    fn test_corrupt_config_is_first_run() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), b"\xff\xff not a config")?;

        let config = ClientConfig::open(dir.path())?;
        assert_eq!(config.last_backup_number(), -1);
        assert!(!config.machine_id().is_empty());

        Ok(())
    }
}
