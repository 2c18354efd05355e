//! File system based content-addressed chunk store.
//!
//! Chunks are zlib compressed and stored under a three level hex fan-out:
//! `<base>/<hex[0..2]>/<hex[2..4]>/<hex[4..6]>/<hex>-sha256.zz`. Each shard
//! directory carries a `LOCK` file serializing chunk writers and the
//! `REFCNT` map of the refcount store. Readers never take the lock; they
//! only ever see committed files.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use bbs_api_types::CHUNK_SIZE;
use bbs_tools::lockfile::{lock_file_blocking, LockGuard};

use crate::checksum_reader::ChecksumReader;
use crate::checksum_writer::ChecksumWriter;
use crate::StoreError;

pub const CHUNK_FILE_SUFFIX: &str = "-sha256.zz";

const SHARD_LOCK_NAME: &str = "LOCK";
const NEW_CHUNK_DIR: &str = "_new";

/// Shard directory of a digest, relative to the pool base.
pub(crate) fn digest_to_prefix(digest: &[u8]) -> PathBuf {
    let hex = hex::encode(&digest[0..3]);
    [&hex[0..2], &hex[2..4], &hex[4..6]].iter().collect()
}

pub struct ChunkStore {
    base: PathBuf,
}

impl ChunkStore {
    /// Open (or initialize) the pool rooted at `base`. Shard directories
    /// are created lazily by the first writer that needs them.
    pub fn open<P: Into<PathBuf>>(base: P) -> Result<Self, StoreError> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn shard_dir(&self, digest: &[u8]) -> PathBuf {
        if digest.len() < 3 {
            self.base.join(NEW_CHUNK_DIR)
        } else {
            self.base.join(digest_to_prefix(digest))
        }
    }

    /// Path of the chunk file and the digest as lowercase hex.
    pub fn chunk_path(&self, digest: &[u8]) -> (PathBuf, String) {
        let hex = hex::encode(digest);
        let path = self
            .shard_dir(digest)
            .join(format!("{}{}", hex, CHUNK_FILE_SUFFIX));
        (path, hex)
    }

    pub fn exists(&self, digest: &[u8]) -> bool {
        if digest.len() != 32 {
            return false;
        }
        self.chunk_path(digest).0.is_file()
    }

    /// Open a committed chunk for reading. The returned reader inflates
    /// and hashes, so the caller can verify content identity after the
    /// last byte.
    pub fn open_read(&self, digest: &[u8]) -> Result<ChunkReader, StoreError> {
        if digest.len() != 32 {
            return Err(StoreError::InvalidDigest(digest.len()));
        }
        let (path, _) = self.chunk_path(digest);
        let file = File::open(&path).map_err(|err| StoreError::FileOpen {
            path: path.clone(),
            source: err,
        })?;
        Ok(ChunkReader {
            inner: ChecksumReader::new(ZlibDecoder::new(file))?,
        })
    }

    /// Read a whole chunk into memory and verify its digest.
    pub fn read_chunk(&self, digest: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut reader = self.open_read(digest)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).map_err(|err| match err.kind() {
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                StoreError::Inflate(err)
            }
            _ => StoreError::Io(err),
        })?;

        let (observed, _) = reader.digest()?;
        if digest != &observed[..] {
            return Err(StoreError::DigestMismatch {
                expected: digest.to_vec(),
                observed,
            });
        }
        Ok(data)
    }

    /// Start writing the chunk `digest`. Takes the shard `LOCK` (blocking)
    /// and stages into a temporary file that only `check_and_close`
    /// commits.
    pub fn create(&self, digest: &[u8]) -> Result<ChunkWriter, StoreError> {
        if !digest.is_empty() && digest.len() != 32 {
            return Err(StoreError::InvalidDigest(digest.len()));
        }

        let dir = self.shard_dir(digest);
        std::fs::create_dir_all(&dir)?;

        let lock_path = dir.join(SHARD_LOCK_NAME);
        let lock = lock_file_blocking(&lock_path).map_err(|err| StoreError::Lock {
            path: lock_path,
            source: err,
        })?;

        let (chunk_path, _) = self.chunk_path(digest);
        let (file, tmp_path) = bbs_tools::fs::make_tmp_file(&chunk_path)?;
        let writer = ChecksumWriter::new(ZlibEncoder::new(file, Compression::new(9)))?;

        Ok(ChunkWriter {
            expected: digest.to_vec(),
            chunk_path,
            tmp_path,
            writer: Some(writer),
            _lock: lock,
        })
    }
}

pub struct ChunkReader {
    inner: ChecksumReader<ZlibDecoder<File>>,
}

impl ChunkReader {
    /// Digest and uncompressed length of the bytes read so far.
    pub fn digest(self) -> Result<([u8; 32], u64), StoreError> {
        self.inner.digest()
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        self.inner.read(buf)
    }
}

/// Writer handed out by [`ChunkStore::create`]. Data flows through the
/// hash and deflate stages into the staging file; nothing becomes visible
/// in the store before `check_and_close` verified digest and length.
pub struct ChunkWriter {
    expected: Vec<u8>,
    chunk_path: PathBuf,
    tmp_path: PathBuf,
    writer: Option<ChecksumWriter<ZlibEncoder<File>>>,
    _lock: LockGuard,
}

impl ChunkWriter {
    /// Flush compression, verify the content digest and length, then
    /// commit the chunk with an atomic rename. On any failure the staging
    /// file is discarded and the store is unchanged.
    pub fn check_and_close(mut self) -> Result<[u8; 32], StoreError> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "chunk writer already closed",
                )))
            }
        };

        let (encoder, observed, length) = writer.finish()?;
        let file = encoder.finish()?;
        file.sync_all()?;
        drop(file);

        if self.expected.is_empty() || self.expected[..] != observed[..] {
            return Err(StoreError::DigestMismatch {
                expected: std::mem::take(&mut self.expected),
                observed,
            });
        }
        if length > CHUNK_SIZE {
            return Err(StoreError::ChunkOverflow { length });
        }

        std::fs::rename(&self.tmp_path, &self.chunk_path)?;
        Ok(observed)
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "chunk writer already closed",
            )),
        }
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        // gone already if the rename committed
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use openssl::hash::{Hasher, MessageDigest};

    fn sha3(data: &[u8]) -> Vec<u8> {
        let mut hasher = Hasher::new(MessageDigest::sha3_256()).unwrap();
        hasher.update(data).unwrap();
        hasher.finish().unwrap().to_vec()
    }

    #[test]
    fn test_create_and_read() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let store = ChunkStore::open(dir.path())?;

        let data = b"some chunk content".to_vec();
        let digest = sha3(&data);

        assert!(!store.exists(&digest));

        let mut writer = store.create(&digest)?;
        writer.write_all(&data)?;
        let committed = writer.check_and_close()?;
        assert_eq!(&committed[..], &digest[..]);

        assert!(store.exists(&digest));
        assert_eq!(store.read_chunk(&digest)?, data);

        let (path, hex) = store.chunk_path(&digest);
        assert!(path.is_file());
        assert!(path.ends_with(format!(
            "{}/{}/{}/{}{}",
            &hex[0..2],
            &hex[2..4],
            &hex[4..6],
            hex,
            CHUNK_FILE_SUFFIX
        )));

        Ok(())
    }

    #[test]
    fn test_digest_mismatch_leaves_no_file() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let store = ChunkStore::open(dir.path())?;

        let claimed = sha3(b"what the writer claims");
        let mut writer = store.create(&claimed)?;
        writer.write_all(b"what actually gets written")?;

        match writer.check_and_close() {
            Err(StoreError::DigestMismatch { observed, .. }) => {
                assert_eq!(&observed[..], &sha3(b"what actually gets written")[..]);
            }
            other => panic!("expected DigestMismatch, got {:?}", other.map(|_| ())),
        }

        assert!(!store.exists(&claimed));
        // nothing staged either
        let (chunk_path, _) = store.chunk_path(&claimed);
        let leftovers = std::fs::read_dir(chunk_path.parent().unwrap())?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name() != SHARD_LOCK_NAME)
            .count();
        assert_eq!(leftovers, 0);

        Ok(())
    }

    #[test]
    fn test_empty_digest_never_commits() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let store = ChunkStore::open(dir.path())?;

        let mut writer = store.create(b"")?;
        writer.write_all(b"data")?;
        match writer.check_and_close() {
            Err(StoreError::DigestMismatch { .. }) => Ok(()),
            other => panic!("expected DigestMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_chunk_overflow() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let store = ChunkStore::open(dir.path())?;

        let data = vec![0u8; CHUNK_SIZE as usize + 1];
        let digest = sha3(&data);

        let mut writer = store.create(&digest)?;
        writer.write_all(&data)?;
        match writer.check_and_close() {
            Err(StoreError::ChunkOverflow { length }) => {
                assert_eq!(length, CHUNK_SIZE + 1);
                assert!(!store.exists(&digest));
                Ok(())
            }
            other => panic!("expected ChunkOverflow, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_concurrent_writers_dedup() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let base = dir.path().to_owned();

        let data = vec![0xabu8; 64 * 1024];
        let digest = sha3(&data);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let base = base.clone();
            let data = data.clone();
            let digest = digest.clone();
            handles.push(std::thread::spawn(move || -> Result<(), StoreError> {
                let store = ChunkStore::open(&base)?;
                if store.exists(&digest) {
                    return Ok(());
                }
                let mut writer = store.create(&digest)?;
                writer.write_all(&data)?;
                writer.check_and_close()?;
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().unwrap()?;
        }

        let store = ChunkStore::open(&base)?;
        assert!(store.exists(&digest));
        assert_eq!(store.read_chunk(&digest)?, data);

        // exactly one chunk file in the shard
        let (chunk_path, _) = store.chunk_path(&digest);
        let files = std::fs::read_dir(chunk_path.parent().unwrap())?
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .ends_with(CHUNK_FILE_SUFFIX)
            })
            .count();
        assert_eq!(files, 1);

        Ok(())
    }
}
