//! In-process transport.

use std::sync::Arc;

use anyhow::Error;
use async_trait::async_trait;

use bbs_api_types::BackupConfiguration;
use bbs_client::{
    BackupClient, ChunkDataStream, FileManifestStream, JournalEntryStream, PrepareResult,
};

use super::BackupTransport;

/// Server and client share one address space; the four calls go straight
/// into the agent.
pub struct LocalTransport {
    client: Arc<BackupClient>,
}

impl LocalTransport {
    pub fn new(client: Arc<BackupClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BackupTransport for LocalTransport {
    async fn prepare_backup(
        &self,
        configuration: BackupConfiguration,
        last_backup_id: i32,
        new_backup_id: i32,
    ) -> Result<PrepareResult, Error> {
        self.client
            .prepare_backup(configuration, last_backup_id, new_backup_id)
            .await
    }

    async fn refresh_cache(&self, manifests: FileManifestStream) -> Result<(), Error> {
        self.client.refresh_cache(manifests).await
    }

    async fn launch_backup(&self, backup_number: i32) -> Result<JournalEntryStream, Error> {
        Arc::clone(&self.client).launch_backup(backup_number).await
    }

    async fn get_chunk(
        &self,
        filename: &str,
        position: u64,
        size: u64,
        _sha256: &[u8],
    ) -> Result<ChunkDataStream, Error> {
        self.client
            .get_chunk(filename.to_string(), position, size)
            .await
    }
}
