//! Whole-file and per-chunk digest computation.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use openssl::hash::{Hasher, MessageDigest};

use bbs_api_types::CHUNK_SIZE;

use crate::StoreError;

/// Read buffer of the hashing pass (128 KiB). Must divide `CHUNK_SIZE`
/// evenly so a chunk boundary always coincides with a buffer boundary.
pub const HASH_BUFFER_SIZE: usize = 128 * 1024;

const _: () = assert!(CHUNK_SIZE as usize % HASH_BUFFER_SIZE == 0);

pub struct FileHash {
    /// SHA3-256 over the whole content.
    pub sha256: Vec<u8>,
    /// One SHA3-256 per `CHUNK_SIZE` aligned segment,
    /// `ceil(size / CHUNK_SIZE)` of them.
    pub chunks: Vec<Vec<u8>>,
}

/// Single streaming pass over `path` feeding two digesters: the chunk
/// digester is finalized at every `CHUNK_SIZE` boundary and once more for a
/// trailing partial segment, the whole-file digester never resets.
pub fn hash_file(path: &Path) -> Result<FileHash, StoreError> {
    let mut file = File::open(path).map_err(|err| StoreError::FileOpen {
        path: path.to_owned(),
        source: err,
    })?;

    let mut whole = Hasher::new(MessageDigest::sha3_256())?;
    let mut chunk = Hasher::new(MessageDigest::sha3_256())?;

    let mut chunks = Vec::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut chunk_len: u64 = 0;

    loop {
        let want = std::cmp::min(HASH_BUFFER_SIZE as u64, CHUNK_SIZE - chunk_len) as usize;
        let count = file.read(&mut buffer[..want])?;
        if count == 0 {
            break;
        }

        whole.update(&buffer[..count])?;
        chunk.update(&buffer[..count])?;
        chunk_len += count as u64;

        if chunk_len >= CHUNK_SIZE {
            if chunk_len > CHUNK_SIZE {
                log::warn!("chunk boundary missed at {} bytes in {:?}", chunk_len, path);
            }
            chunks.push(chunk.finish()?.to_vec());
            chunk_len = 0;
        }
    }

    if chunk_len > 0 {
        chunks.push(chunk.finish()?.to_vec());
    }

    Ok(FileHash {
        sha256: whole.finish()?.to_vec(),
        chunks,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn sha3(data: &[u8]) -> Vec<u8> {
        let mut hasher = Hasher::new(MessageDigest::sha3_256()).unwrap();
        hasher.update(data).unwrap();
        hasher.finish().unwrap().to_vec()
    }

    fn write_test_file(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(data).unwrap();
        path
    }

    #[test]
    fn test_empty_file() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let path = write_test_file(&dir, "empty", b"");

        let hash = hash_file(&path)?;
        assert_eq!(hash.chunks.len(), 0);
        assert_eq!(hash.sha256, sha3(b""));
        Ok(())
    }

    #[test]
    fn test_small_file() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let path = write_test_file(&dir, "small", b"HELLOWORLD");

        let hash = hash_file(&path)?;
        assert_eq!(hash.chunks.len(), 1);
        assert_eq!(hash.sha256, sha3(b"HELLOWORLD"));
        assert_eq!(hash.chunks[0], sha3(b"HELLOWORLD"));
        Ok(())
    }

    #[test]
    fn test_multi_chunk_file() -> Result<(), StoreError> {
        let chunk_size = CHUNK_SIZE as usize;
        let data: Vec<u8> = (0..2 * chunk_size + 1234)
            .map(|i| (i % 251) as u8)
            .collect();

        let dir = tempfile::tempdir()?;
        let path = write_test_file(&dir, "large", &data);

        let hash = hash_file(&path)?;
        assert_eq!(hash.chunks.len(), 3);
        assert_eq!(hash.sha256, sha3(&data));
        assert_eq!(hash.chunks[0], sha3(&data[..chunk_size]));
        assert_eq!(hash.chunks[1], sha3(&data[chunk_size..2 * chunk_size]));
        assert_eq!(hash.chunks[2], sha3(&data[2 * chunk_size..]));
        Ok(())
    }

    #[test]
    fn test_exact_chunk_multiple() -> Result<(), StoreError> {
        let chunk_size = CHUNK_SIZE as usize;
        let data = vec![0x5au8; chunk_size];

        let dir = tempfile::tempdir()?;
        let path = write_test_file(&dir, "aligned", &data);

        let hash = hash_file(&path)?;
        assert_eq!(hash.chunks.len(), 1);
        assert_eq!(hash.chunks[0], sha3(&data));
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        match hash_file(Path::new("/this/path/does/not/exist")) {
            Err(StoreError::FileOpen { .. }) => (),
            other => panic!("expected FileOpen error, got {:?}", other.map(|_| ())),
        }
    }
}
