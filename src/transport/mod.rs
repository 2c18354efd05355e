//! The request surface between server and client.
//!
//! Four logical calls, transport-agnostic: which wire carries them is a
//! policy chosen at startup. The in-process [`LocalTransport`] serves
//! tests and single-box setups, [`TcpTransport`] talks to a remote client
//! daemon.

use anyhow::Error;
use async_trait::async_trait;

use bbs_api_types::BackupConfiguration;
use bbs_client::{ChunkDataStream, FileManifestStream, JournalEntryStream, PrepareResult};

mod local;
mod tcp;

pub use local::LocalTransport;
pub use tcp::{serve, TcpTransport};

#[async_trait]
pub trait BackupTransport: Send + Sync {
    async fn prepare_backup(
        &self,
        configuration: BackupConfiguration,
        last_backup_id: i32,
        new_backup_id: i32,
    ) -> Result<PrepareResult, Error>;

    /// Replay the previous backup's manifests so the client can rebuild
    /// its local cache.
    async fn refresh_cache(&self, manifests: FileManifestStream) -> Result<(), Error>;

    /// Start the backup walk on the client. The returned stream carries
    /// journal entries and is terminated by a CLOSE entry.
    async fn launch_backup(&self, backup_number: i32) -> Result<JournalEntryStream, Error>;

    /// Fetch `size` bytes of `filename` starting at `position`; `sha256`
    /// is the expected content digest of the range.
    async fn get_chunk(
        &self,
        filename: &str,
        position: u64,
        size: u64,
        sha256: &[u8],
    ) -> Result<ChunkDataStream, Error>;
}
