//! The server side backup driver.
//!
//! One driver instance owns a pool and a hosts directory and runs one host
//! backup at a time per host (the host lock enforces that); different
//! hosts can be backed up concurrently by separate driver calls sharing
//! the same pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, format_err, Context, Error};
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use bbs_api_types::{
    chunk_count, BackupConfiguration, FileManifest, JournalEntry, CHUNK_SIZE,
};
use bbs_datastore::{ChunkRefCount, ChunkStore, Manifest, RecordReader, StoreError};

use crate::transport::BackupTransport;

/// Idle read timeout on the journal stream.
const JOURNAL_READ_TIMEOUT: Duration = Duration::from_secs(3 * 3600);

#[derive(Default)]
pub struct BackupReport {
    /// Records in the compacted manifest.
    pub files: u64,
    pub removed: u64,
    pub transferred_chunks: u64,
    pub transferred_bytes: u64,
    pub errors: u64,
    /// True when the journal stream ended with CLOSE and the manifest was
    /// compacted.
    pub finished: bool,
}

pub struct BackupDriver {
    pool: Arc<ChunkStore>,
    refcnt: ChunkRefCount,
    hosts_dir: PathBuf,
}

impl BackupDriver {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(
        pool_dir: P,
        hosts_dir: Q,
    ) -> Result<Self, Error> {
        let pool_dir = pool_dir.into();
        Ok(Self {
            pool: Arc::new(ChunkStore::open(&pool_dir)?),
            refcnt: ChunkRefCount::new(&pool_dir),
            hosts_dir: hosts_dir.into(),
        })
    }

    pub fn pool(&self) -> &ChunkStore {
        &self.pool
    }

    pub fn refcnt(&self) -> &ChunkRefCount {
        &self.refcnt
    }

    fn manifest_name(backup_id: i32) -> String {
        format!("backup.{}", backup_id)
    }

    /// Next backup number for `host`: successor of the newest manifest set
    /// on disk, 0 for a first backup.
    pub fn next_backup_number(&self, host: &str) -> Result<i32, Error> {
        let host_dir = self.hosts_dir.join(host);
        let entries = match std::fs::read_dir(&host_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut next = 0;
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(number) = name
                .strip_prefix("backup.")
                .and_then(|rest| rest.strip_suffix(".manifest"))
                .and_then(|number| number.parse::<i32>().ok())
            {
                next = next.max(number + 1);
            }
        }
        Ok(next)
    }

    /// Run one complete host backup.
    pub async fn run_backup(
        &self,
        transport: &dyn BackupTransport,
        host: &str,
        configuration: BackupConfiguration,
        last_backup_id: i32,
        new_backup_id: i32,
    ) -> Result<BackupReport, Error> {
        let host_dir = self.hosts_dir.join(host);
        std::fs::create_dir_all(&host_dir)?;

        log::info!("preparing backup {} of {}", new_backup_id, host);
        let prepare = transport
            .prepare_backup(configuration, last_backup_id, new_backup_id)
            .await?;

        if prepare.need_refresh_cache && last_backup_id >= 0 {
            log::info!(
                "client cache of {} is stale, replaying manifest of backup {}",
                host,
                last_backup_id
            );
            self.refresh_cache(transport, &host_dir, last_backup_id)
                .await?;
        }

        // seed the new set from the previous backup so unchanged files
        // survive without retransmission
        let previous = host_dir.join(format!("{}.manifest", Self::manifest_name(last_backup_id)));
        let current = host_dir.join(format!("{}.manifest", Self::manifest_name(new_backup_id)));
        if last_backup_id >= 0 && previous.exists() && !current.exists() {
            std::fs::copy(&previous, &current)?;
        }

        let mut manifest = Manifest::new(&Self::manifest_name(new_backup_id), &host_dir)?;
        let lock_path = manifest.lock_path().to_owned();
        let _guard = bbs_tools::lockfile::try_lock_file_pid(&lock_path)
            .with_context(|| format!("unable to open lock {:?}", lock_path))?
            .ok_or_else(|| {
                format_err!("backup of {} already running (lock {:?})", host, lock_path)
            })?;

        let index = manifest.load_index()?;
        log::info!("index of {} loaded with {} entries", host, index.len());

        let mut report = BackupReport::default();
        let mut entries = transport.launch_backup(new_backup_id).await?;

        loop {
            let next = tokio::time::timeout(JOURNAL_READ_TIMEOUT, entries.next())
                .await
                .map_err(|_| format_err!("journal stream of {} idle for too long", host))?;

            let entry = match next {
                Some(entry) => entry?,
                None => break,
            };

            match entry.entry {
                Some(JournalEntry::Close(_)) => {
                    report.finished = true;
                    break;
                }
                Some(JournalEntry::Remove(path)) => {
                    manifest.remove_path(&path)?;
                    report.removed += 1;
                }
                Some(JournalEntry::Add(received)) => {
                    self.store_entry(transport, &mut manifest, received, true, &mut report)
                        .await;
                }
                Some(JournalEntry::Modify(received)) => {
                    self.store_entry(transport, &mut manifest, received, false, &mut report)
                        .await;
                }
                None => bail!("malformed journal entry from {}", host),
            }
        }

        if report.finished {
            // the client compacts and saves its state after CLOSE; wait
            // for its side of the stream to end before committing ours
            while tokio::time::timeout(JOURNAL_READ_TIMEOUT, entries.next())
                .await
                .map_err(|_| format_err!("journal stream of {} idle for too long", host))?
                .is_some()
            {}
        }
        drop(entries);

        if !report.finished {
            log::warn!(
                "backup {} of {} did not finish; keeping the journal for a retry",
                new_backup_id,
                host
            );
            return Ok(report);
        }

        manifest.compact(|_| report.files += 1)?;

        // refcounts move only after the compaction committed
        let mut reader = RecordReader::<FileManifest>::open(manifest.manifest_path())?;
        while let Some((_, stored)) = reader.read_record()? {
            for chunk in &stored.chunks {
                self.refcnt.incr(chunk)?;
            }
        }

        log::info!(
            "backup {} of {} finished: {} files, {} removed, {} chunks / {} bytes transferred, {} error(s)",
            new_backup_id,
            host,
            report.files,
            report.removed,
            report.transferred_chunks,
            report.transferred_bytes,
            report.errors
        );
        Ok(report)
    }

    /// Drop one backup of a host: release its chunk references and delete
    /// the manifest set. Returns the number of dropped records.
    ///
    /// The chunks themselves stay in the pool until a reclamation pass
    /// removes those whose count reached zero.
    pub fn forget_backup(&self, host: &str, backup_id: i32) -> Result<u64, Error> {
        let host_dir = self.hosts_dir.join(host);
        let mut manifest = Manifest::new(&Self::manifest_name(backup_id), &host_dir)?;

        let lock_path = manifest.lock_path().to_owned();
        let _guard = bbs_tools::lockfile::try_lock_file_pid(&lock_path)
            .with_context(|| format!("unable to open lock {:?}", lock_path))?
            .ok_or_else(|| {
                format_err!("backup of {} already running (lock {:?})", host, lock_path)
            })?;

        if !manifest.manifest_path().exists() {
            bail!("backup {} of {} does not exist", backup_id, host);
        }

        let mut records = 0u64;
        let mut reader = RecordReader::<FileManifest>::open(manifest.manifest_path())?;
        while let Some((_, stored)) = reader.read_record()? {
            for chunk in &stored.chunks {
                self.refcnt.decr(chunk)?;
            }
            records += 1;
        }
        drop(reader);

        manifest.delete_manifest()?;
        log::info!("dropped backup {} of {} ({} records)", backup_id, host, records);
        Ok(records)
    }

    async fn refresh_cache(
        &self,
        transport: &dyn BackupTransport,
        host_dir: &Path,
        last_backup_id: i32,
    ) -> Result<(), Error> {
        let path = host_dir.join(format!("{}.manifest", Self::manifest_name(last_backup_id)));
        if !path.exists() {
            log::warn!("no previous manifest {:?} to replay", path);
            return Ok(());
        }

        let (sender, receiver) = tokio::sync::mpsc::channel(64);
        let reader_task = tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let mut reader = RecordReader::<FileManifest>::open(&path)?;
            while let Some((_, record)) = reader.read_record()? {
                if sender.blocking_send(Ok(record)).is_err() {
                    break;
                }
            }
            Ok(())
        });

        transport
            .refresh_cache(ReceiverStream::new(receiver).boxed())
            .await?;
        reader_task.await??;
        Ok(())
    }

    /// Store one ADD/MODIFY entry. Failures are contained here: the entry
    /// is logged and skipped, the journal stream continues.
    async fn store_entry(
        &self,
        transport: &dyn BackupTransport,
        manifest: &mut Manifest,
        mut received: FileManifest,
        added: bool,
        report: &mut BackupReport,
    ) {
        let path = received.path.clone();
        if let Err(err) = self
            .store_file(transport, manifest, &mut received, added, report)
            .await
        {
            report.errors += 1;
            log::error!("unable to back up {:?}: {}", path, err);
        }
    }

    async fn store_file(
        &self,
        transport: &dyn BackupTransport,
        manifest: &mut Manifest,
        received: &mut FileManifest,
        added: bool,
        report: &mut BackupReport,
    ) -> Result<(), Error> {
        if received.is_regular_file() {
            let expected = chunk_count(received.size()) as usize;
            if received.chunks.len() != expected {
                log::warn!(
                    "{:?} carries {} chunk digests, {} expected",
                    received.path,
                    received.chunks.len(),
                    expected
                );
            }

            for position in 0..received.chunks.len() {
                let digest = received.chunks[position].clone();
                if self.pool.exists(&digest) {
                    continue;
                }

                let stored = self
                    .fetch_chunk(transport, &received.path, position as u64, &digest, report)
                    .await?;
                if stored[..] != digest[..] {
                    log::warn!(
                        "chunk {} of {:?} drifted to {}",
                        position,
                        received.path,
                        hex::encode(stored)
                    );
                    received.chunks[position] = stored.to_vec();
                }
            }
        }

        manifest.add_manifest(received, added)?;
        Ok(())
    }

    /// Pull one chunk into the pool. When the digest observed at commit
    /// differs from the expected one (the file changed between the
    /// client's hash pass and this read), the chunk is fetched once more
    /// under the observed digest.
    async fn fetch_chunk(
        &self,
        transport: &dyn BackupTransport,
        filename: &str,
        position: u64,
        digest: &[u8],
        report: &mut BackupReport,
    ) -> Result<[u8; 32], Error> {
        match self
            .write_chunk(transport, filename, position, digest, report)
            .await
        {
            Ok(stored) => Ok(stored),
            Err(err) => match err.downcast::<StoreError>() {
                Ok(StoreError::DigestMismatch { observed, .. }) => {
                    if self.pool.exists(&observed) {
                        return Ok(observed);
                    }
                    self.write_chunk(transport, filename, position, &observed, report)
                        .await
                }
                Ok(store_err) => Err(store_err.into()),
                Err(err) => Err(err),
            },
        }
    }

    async fn write_chunk(
        &self,
        transport: &dyn BackupTransport,
        filename: &str,
        position: u64,
        digest: &[u8],
        report: &mut BackupReport,
    ) -> Result<[u8; 32], Error> {
        let mut stream = transport
            .get_chunk(filename, position * CHUNK_SIZE, CHUNK_SIZE, digest)
            .await?;
        let mut writer = self.pool.create(digest)?;

        let mut bytes = 0u64;
        while let Some(frame) = stream.next().await {
            let frame = frame?;
            std::io::Write::write_all(&mut writer, &frame)?;
            bytes += frame.len() as u64;
        }

        let stored = writer.check_and_close()?;
        report.transferred_chunks += 1;
        report.transferred_bytes += bytes;
        Ok(stored)
    }
}
