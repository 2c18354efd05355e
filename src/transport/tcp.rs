//! Plain TCP transport.
//!
//! One connection per call: the caller opens a socket, sends a
//! [`ClientRequest`] envelope and then the call's frames flow in whichever
//! direction the operation needs. Frames are little endian
//! length-delimited prost messages, matching the on-disk record framing.

use std::sync::Arc;

use anyhow::{bail, format_err, Context, Error};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use bbs_api_types::{
    client_request, ClientRequest, FileChunk, FileManifestJournalEntry, GetChunkRequest,
    JournalEntry, LaunchBackupRequest, PrepareBackupReply, PrepareBackupRequest,
    RefreshCacheReply, RefreshCacheRequest, StatusCode,
};
use bbs_api_types::BackupConfiguration;
use bbs_client::{
    BackupClient, ChunkDataStream, FileManifestStream, JournalEntryStream, PrepareResult,
};

use super::BackupTransport;

const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

fn framed(socket: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .little_endian()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_framed(socket)
}

fn encode<M: Message>(message: &M) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

async fn read_frame<M: Message + Default>(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
) -> Result<Option<M>, Error> {
    match framed.next().await {
        Some(frame) => {
            let frame = frame?;
            Ok(Some(M::decode(&frame[..])?))
        }
        None => Ok(None),
    }
}

/// Client daemon as seen from the server.
pub struct TcpTransport {
    address: String,
}

impl TcpTransport {
    pub fn new<A: Into<String>>(address: A) -> Self {
        Self {
            address: address.into(),
        }
    }

    async fn connect(
        &self,
        request: client_request::Request,
    ) -> Result<Framed<TcpStream, LengthDelimitedCodec>, Error> {
        let socket = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("unable to connect to {}", self.address))?;
        let mut framed = framed(socket);
        framed
            .send(encode(&ClientRequest {
                request: Some(request),
            }))
            .await?;
        Ok(framed)
    }
}

#[async_trait]
impl BackupTransport for TcpTransport {
    async fn prepare_backup(
        &self,
        configuration: BackupConfiguration,
        last_backup_id: i32,
        new_backup_id: i32,
    ) -> Result<PrepareResult, Error> {
        let mut framed = self
            .connect(client_request::Request::Prepare(PrepareBackupRequest {
                configuration: Some(configuration),
                last_backup_id,
                new_backup_id,
            }))
            .await?;

        let reply: PrepareBackupReply = read_frame(&mut framed)
            .await?
            .ok_or_else(|| format_err!("connection closed before the prepare reply"))?;
        if reply.code != StatusCode::Ok as i32 {
            bail!("client failed to prepare the backup");
        }
        Ok(PrepareResult {
            need_refresh_cache: reply.need_refresh_cache,
        })
    }

    async fn refresh_cache(&self, mut manifests: FileManifestStream) -> Result<(), Error> {
        let mut framed = self
            .connect(client_request::Request::RefreshCache(RefreshCacheRequest {}))
            .await?;

        while let Some(manifest) = manifests.next().await {
            framed
                .send(encode(&FileManifestJournalEntry::add(manifest?)))
                .await?;
        }
        framed.send(encode(&FileManifestJournalEntry::close())).await?;

        let reply: RefreshCacheReply = read_frame(&mut framed)
            .await?
            .ok_or_else(|| format_err!("connection closed before the refresh reply"))?;
        if reply.code != StatusCode::Ok as i32 {
            bail!("client failed to refresh its cache");
        }
        Ok(())
    }

    async fn launch_backup(&self, backup_number: i32) -> Result<JournalEntryStream, Error> {
        let framed = self
            .connect(client_request::Request::LaunchBackup(LaunchBackupRequest {
                backup_number,
            }))
            .await?;

        let entries = framed.map(|frame| -> Result<FileManifestJournalEntry, Error> {
            let frame = frame?;
            Ok(FileManifestJournalEntry::decode(&frame[..])?)
        });
        Ok(entries.boxed())
    }

    async fn get_chunk(
        &self,
        filename: &str,
        position: u64,
        size: u64,
        sha256: &[u8],
    ) -> Result<ChunkDataStream, Error> {
        let framed = self
            .connect(client_request::Request::GetChunk(GetChunkRequest {
                filename: filename.to_string(),
                position,
                size,
                sha256: sha256.to_vec(),
            }))
            .await?;

        let chunks = framed.map(|frame| -> Result<Bytes, Error> {
            let frame = frame?;
            let chunk = FileChunk::decode(&frame[..])?;
            Ok(Bytes::from(chunk.data))
        });
        Ok(chunks.boxed())
    }
}

/// Accept loop of the client daemon. Every connection carries exactly one
/// remote call; backups and chunk reads run concurrently on separate
/// connections.
pub async fn serve(listener: TcpListener, client: Arc<BackupClient>) -> Result<(), Error> {
    loop {
        let (socket, peer) = listener.accept().await?;
        log::debug!("connection from {}", peer);
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(socket, client).await {
                log::error!("request from {} failed: {}", peer, err);
            }
        });
    }
}

async fn handle_connection(socket: TcpStream, client: Arc<BackupClient>) -> Result<(), Error> {
    let mut framed = framed(socket);

    let envelope: ClientRequest = read_frame(&mut framed)
        .await?
        .ok_or_else(|| format_err!("connection closed before a request"))?;

    match envelope.request {
        Some(client_request::Request::Prepare(prepare)) => {
            let reply = match client
                .prepare_backup(
                    prepare.configuration.unwrap_or_default(),
                    prepare.last_backup_id,
                    prepare.new_backup_id,
                )
                .await
            {
                Ok(result) => PrepareBackupReply {
                    code: StatusCode::Ok as i32,
                    need_refresh_cache: result.need_refresh_cache,
                },
                Err(err) => {
                    log::error!("prepare failed: {}", err);
                    PrepareBackupReply {
                        code: StatusCode::Failed as i32,
                        need_refresh_cache: false,
                    }
                }
            };
            framed.send(encode(&reply)).await?;
        }
        Some(client_request::Request::RefreshCache(_)) => {
            let (sender, receiver) = tokio::sync::mpsc::channel(64);
            let agent = {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    client
                        .refresh_cache(ReceiverStream::new(receiver).boxed())
                        .await
                })
            };

            loop {
                let entry: FileManifestJournalEntry = match read_frame(&mut framed).await? {
                    Some(entry) => entry,
                    None => break,
                };
                if entry.is_close() {
                    break;
                }
                match entry.entry {
                    Some(JournalEntry::Add(manifest)) | Some(JournalEntry::Modify(manifest)) => {
                        if sender.send(Ok(manifest)).await.is_err() {
                            break;
                        }
                    }
                    _ => (),
                }
            }
            drop(sender);

            let code = match agent.await? {
                Ok(()) => StatusCode::Ok,
                Err(err) => {
                    log::error!("refresh cache failed: {}", err);
                    StatusCode::Failed
                }
            };
            framed
                .send(encode(&RefreshCacheReply { code: code as i32 }))
                .await?;
        }
        Some(client_request::Request::LaunchBackup(launch)) => {
            let mut entries = Arc::clone(&client).launch_backup(launch.backup_number).await?;
            while let Some(entry) = entries.next().await {
                framed.send(encode(&entry?)).await?;
            }
        }
        Some(client_request::Request::GetChunk(request)) => {
            let mut chunks = client
                .get_chunk(request.filename, request.position, request.size)
                .await?;
            while let Some(chunk) = chunks.next().await {
                framed
                    .send(encode(&FileChunk {
                        data: chunk?.to_vec(),
                    }))
                    .await?;
            }
        }
        None => bail!("malformed request envelope"),
    }

    Ok(())
}
