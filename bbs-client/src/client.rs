//! The client backup agent.
//!
//! `BackupClient` implements the four operations the server drives:
//! `prepare_backup`, `refresh_cache`, `launch_backup` and `get_chunk`. The
//! transport layer on top only moves these calls and their streams across
//! a wire; all protocol state lives here.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Context, Error};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use bbs_api_types::{
    BackupConfiguration, BackupTask, FileManifest, FileManifestJournalEntry,
};
use bbs_datastore::{hash_file, IndexManifest, Manifest};

use crate::command::run_shell_command;
use crate::config::ClientConfig;
use crate::walker::FileWalker;

/// Frame size for chunk transfers.
const CHUNK_FRAME_SIZE: usize = 256 * 1024;

const MANIFEST_NAME: &str = "backup";

pub struct PrepareResult {
    pub need_refresh_cache: bool,
}

pub type JournalEntryStream = BoxStream<'static, Result<FileManifestJournalEntry, Error>>;
pub type ChunkDataStream = BoxStream<'static, Result<Bytes, Error>>;
pub type FileManifestStream = BoxStream<'static, Result<FileManifest, Error>>;

struct CurrentBackup {
    configuration: BackupConfiguration,
    backup_id: i32,
}

#[derive(Default)]
struct BackupStats {
    files: u64,
    bytes: u64,
    errors: u64,
}

pub struct BackupClient {
    config: Mutex<ClientConfig>,
    current: Mutex<Option<CurrentBackup>>,
}

impl BackupClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            current: Mutex::new(None),
        })
    }

    /// Remember the configuration for the upcoming backup and tell the
    /// server whether the local manifest cache is stale.
    pub async fn prepare_backup(
        &self,
        configuration: BackupConfiguration,
        last_backup_id: i32,
        new_backup_id: i32,
    ) -> Result<PrepareResult, Error> {
        log::info!("preparing backup {}", new_backup_id);

        let need_refresh_cache = {
            let config = self.config.lock().unwrap();
            last_backup_id != config.last_backup_number()
        };

        *self.current.lock().unwrap() = Some(CurrentBackup {
            configuration,
            backup_id: new_backup_id,
        });

        Ok(PrepareResult { need_refresh_cache })
    }

    /// Rebuild the local manifest set from the manifests the server sends.
    pub async fn refresh_cache(&self, mut manifests: FileManifestStream) -> Result<(), Error> {
        log::info!("refreshing manifest cache");
        let dir = self.config.lock().unwrap().dir().to_owned();

        let mut manifest = Manifest::new(MANIFEST_NAME, &dir)?;
        let lock_path = manifest.lock_path().to_owned();
        let _guard = bbs_tools::lockfile::try_lock_file_pid(&lock_path)
            .with_context(|| format!("unable to open lock {:?}", lock_path))?
            .ok_or_else(|| {
                format_err!("another backup is already running (lock {:?})", lock_path)
            })?;

        manifest.delete_manifest()?;
        let mut count = 0u64;
        while let Some(received) = manifests.next().await {
            manifest.add_manifest(&received?, true)?;
            count += 1;
        }
        manifest.compact(|_| ())?;

        log::info!("manifest cache rebuilt with {} entries", count);
        Ok(())
    }

    /// Run the backup walk, streaming journal entries to the caller. Every
    /// entry is persisted to the local journal only after the stream
    /// accepted it; the stream ends with a CLOSE entry, then the local set
    /// is compacted and the stored backup number advances.
    pub async fn launch_backup(
        self: Arc<Self>,
        backup_number: i32,
    ) -> Result<JournalEntryStream, Error> {
        let current = self
            .current
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| format_err!("backup {} was not prepared", backup_number))?;
        if current.backup_id != backup_number {
            log::warn!(
                "backup number {} does not match prepared backup {}",
                backup_number,
                current.backup_id
            );
        }

        let (sender, receiver) = mpsc::channel(64);
        let client = Arc::clone(&self);
        tokio::task::spawn_blocking(move || {
            if let Err(err) = client.run_backup(current.configuration, backup_number, &sender) {
                log::error!("backup {} failed: {}", backup_number, err);
                let _ = sender.blocking_send(Err(err));
            }
        });

        Ok(ReceiverStream::new(receiver).boxed())
    }

    /// Stream `size` bytes of `filename` starting at `position`. The
    /// digest of the request is verified by the receiving side when it
    /// commits the chunk.
    pub async fn get_chunk(
        &self,
        filename: String,
        position: u64,
        size: u64,
    ) -> Result<ChunkDataStream, Error> {
        let (sender, receiver) = mpsc::channel(8);
        tokio::task::spawn_blocking(move || {
            if let Err(err) = stream_file_range(&filename, position, size, &sender) {
                let _ = sender.blocking_send(Err(err));
            }
        });
        Ok(ReceiverStream::new(receiver).boxed())
    }

    fn run_backup(
        &self,
        configuration: BackupConfiguration,
        backup_number: i32,
        sender: &mpsc::Sender<Result<FileManifestJournalEntry, Error>>,
    ) -> Result<(), Error> {
        let dir = self.config.lock().unwrap().dir().to_owned();
        let mut manifest = Manifest::new(MANIFEST_NAME, &dir)?;

        let lock_path = manifest.lock_path().to_owned();
        let _guard = bbs_tools::lockfile::try_lock_file_pid(&lock_path)
            .with_context(|| format!("unable to open lock {:?}", lock_path))?
            .ok_or_else(|| {
                format_err!("another backup is already running (lock {:?})", lock_path)
            })?;

        let mut index = manifest.load_index()?;
        log::info!("index loaded with {} entries", index.len());

        let mut stats = BackupStats::default();
        let operations = configuration.operations();

        for task in &operations.tasks {
            if let Err(err) = self.process_task(task, &mut index, &mut manifest, sender, &mut stats)
            {
                log::warn!("task failed, moving to finalisation: {}", err);
                break;
            }
        }
        // cleanup tasks run in any case, their failures are not re-raised
        for task in &operations.finalised_tasks {
            if let Err(err) = self.process_task(task, &mut index, &mut manifest, sender, &mut stats)
            {
                log::warn!("finalised task failed: {}", err);
            }
        }

        for path in index.unmarked_files() {
            send_entry(sender, FileManifestJournalEntry::remove(path.clone()))?;
            manifest.remove_path(&path)?;
        }

        send_entry(sender, FileManifestJournalEntry::close())?;

        manifest.compact(|_| ())?;
        self.config
            .lock()
            .unwrap()
            .set_last_backup_number(backup_number)?;

        log::info!(
            "backup {} finished: {} files, {} bytes, {} error(s)",
            backup_number,
            stats.files,
            stats.bytes,
            stats.errors
        );
        Ok(())
    }

    fn process_task(
        &self,
        task: &BackupTask,
        index: &mut IndexManifest,
        manifest: &mut Manifest,
        sender: &mpsc::Sender<Result<FileManifestJournalEntry, Error>>,
        stats: &mut BackupStats,
    ) -> Result<(), Error> {
        if !task.command.is_empty() {
            run_shell_command(&task.command)?;
        }

        for share in &task.shares {
            let includes: Vec<String> = task.includes.iter().chain(&share.includes).cloned().collect();
            let excludes: Vec<String> = task.excludes.iter().chain(&share.excludes).cloned().collect();

            let mut walker = FileWalker::new(&share.name, &includes, &excludes)?;
            let mut failure = None;
            walker.walk(&mut |mut walked| {
                if failure.is_some() {
                    return;
                }
                if let Err(err) = self.process_file(&mut walked, index, manifest, sender, stats) {
                    failure = Some(err);
                }
            });

            stats.errors += walker.errors().len() as u64;
            for err in walker.errors() {
                log::warn!("walk {:?}: {}", share.name, err);
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }
        Ok(())
    }

    fn process_file(
        &self,
        walked: &mut FileManifest,
        index: &mut IndexManifest,
        manifest: &mut Manifest,
        sender: &mpsc::Sender<Result<FileManifestJournalEntry, Error>>,
        stats: &mut BackupStats,
    ) -> Result<(), Error> {
        stats.files += 1;
        stats.bytes += walked.size();

        let entry_id = index.get_entry(&walked.path);
        let is_added = entry_id.is_none();

        let changed = match entry_id {
            Some(id) => {
                let cached = index.entry(id).to_manifest(&walked.path);
                !Manifest::compare_manifest(&cached, walked)
            }
            None => true,
        };

        if !changed {
            if let Some(id) = entry_id {
                index.mark(id);
            }
            return Ok(());
        }

        if walked.is_regular_file() {
            match hash_file(Path::new(&walked.path)) {
                Ok(hash) => {
                    walked.sha256 = hash.sha256;
                    walked.chunks = hash.chunks;
                }
                Err(err) => {
                    log::warn!("unable to hash {:?} - {}", walked.path, err);
                    stats.errors += 1;
                    return Ok(());
                }
            }
        }

        let entry = if is_added {
            FileManifestJournalEntry::add(walked.clone())
        } else {
            FileManifestJournalEntry::modify(walked.clone())
        };
        send_entry(sender, entry)?;

        manifest.add_manifest(walked, is_added)?;
        if let Some(id) = entry_id {
            index.mark(id);
        }
        Ok(())
    }
}

fn send_entry(
    sender: &mpsc::Sender<Result<FileManifestJournalEntry, Error>>,
    entry: FileManifestJournalEntry,
) -> Result<(), Error> {
    sender
        .blocking_send(Ok(entry))
        .map_err(|_| format_err!("journal stream receiver went away"))
}

fn stream_file_range(
    filename: &str,
    position: u64,
    size: u64,
    sender: &mpsc::Sender<Result<Bytes, Error>>,
) -> Result<(), Error> {
    let mut file = std::fs::File::open(filename)
        .with_context(|| format!("unable to open {:?}", filename))?;
    file.seek(SeekFrom::Start(position))?;

    let mut remaining = size;
    let mut buffer = vec![0u8; CHUNK_FRAME_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_FRAME_SIZE as u64) as usize;
        let count = file.read(&mut buffer[..want])?;
        if count == 0 {
            break;
        }
        sender
            .blocking_send(Ok(Bytes::copy_from_slice(&buffer[..count])))
            .map_err(|_| format_err!("chunk stream receiver went away"))?;
        remaining -= count as u64;
    }
    Ok(())
}
