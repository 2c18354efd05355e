mod backup_driver;
mod host_config;

pub use backup_driver::{BackupDriver, BackupReport};
pub use host_config::{HostConfig, ShareConfig};
