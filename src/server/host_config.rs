//! Server side host configuration.
//!
//! One JSON document per host, lowered into the `BackupConfiguration` the
//! client receives: the pre command and the shares form the task list, the
//! post command becomes a finalised (always-run) task.

use std::path::Path;

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use bbs_api_types::{BackupConfiguration, BackupOperations, BackupShare, BackupTask};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Absolute path of the share root on the client.
    pub path: String,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostConfig {
    pub host: String,
    /// Address of the client daemon, `host:port`.
    pub address: String,
    pub shares: Vec<ShareConfig>,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub pre_command: Option<String>,
    #[serde(default)]
    pub post_command: Option<String>,
}

impl HostConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let data = std::fs::read(path.as_ref())
            .with_context(|| format!("unable to read host config {:?}", path.as_ref()))?;
        let config: Self = serde_json::from_slice(&data)
            .with_context(|| format!("unable to parse host config {:?}", path.as_ref()))?;
        Ok(config)
    }

    pub fn to_backup_configuration(&self) -> BackupConfiguration {
        let shares = self
            .shares
            .iter()
            .map(|share| BackupShare {
                name: share.path.clone(),
                includes: share.includes.clone(),
                excludes: share.excludes.clone(),
            })
            .collect();

        let tasks = vec![BackupTask {
            command: self.pre_command.clone().unwrap_or_default(),
            includes: self.includes.clone(),
            excludes: self.excludes.clone(),
            shares,
        }];

        let mut finalised_tasks = Vec::new();
        if let Some(command) = &self.post_command {
            finalised_tasks.push(BackupTask {
                command: command.clone(),
                ..Default::default()
            });
        }

        BackupConfiguration {
            operations: Some(BackupOperations {
                tasks,
                finalised_tasks,
            }),
        }
    }
}
