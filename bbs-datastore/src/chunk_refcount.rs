//! Per-chunk reference counts.
//!
//! Every pool shard carries a `REFCNT` file mapping hex chunk digests to a
//! signed count. Updates are read-modify-write under the shard's
//! `REFCNT.lock` and replace the file atomically, so a crash leaves either
//! the old or the new map. A digest whose count drops to zero is only ever
//! *reported* by the cleanup scan; deleting the chunk file is a separate,
//! deliberate step owned by the caller.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bbs_tools::lockfile::lock_file_blocking;

use crate::chunk_store::digest_to_prefix;
use crate::StoreError;

const REFCNT_NAME: &str = "REFCNT";
const REFCNT_LOCK_NAME: &str = "REFCNT.lock";

pub struct ChunkRefCount {
    base: PathBuf,
}

impl ChunkRefCount {
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self { base: base.into() }
    }

    fn shard_dir(&self, digest: &[u8]) -> PathBuf {
        self.base.join(digest_to_prefix(digest))
    }

    /// Increment and return the new count.
    pub fn incr(&self, digest: &[u8]) -> Result<i64, StoreError> {
        self.update(digest, 1)
    }

    /// Decrement and return the post-decrement count.
    pub fn decr(&self, digest: &[u8]) -> Result<i64, StoreError> {
        self.update(digest, -1)
    }

    /// Current count, 0 for an unknown digest.
    pub fn count(&self, digest: &[u8]) -> Result<i64, StoreError> {
        if digest.len() != 32 {
            return Err(StoreError::InvalidDigest(digest.len()));
        }
        let map = Self::read_map(&self.shard_dir(digest).join(REFCNT_NAME))?;
        Ok(map.get(&hex::encode(digest)).copied().unwrap_or(0))
    }

    fn update(&self, digest: &[u8], delta: i64) -> Result<i64, StoreError> {
        if digest.len() != 32 {
            return Err(StoreError::InvalidDigest(digest.len()));
        }

        let dir = self.shard_dir(digest);
        std::fs::create_dir_all(&dir)?;

        let lock_path = dir.join(REFCNT_LOCK_NAME);
        let _guard = lock_file_blocking(&lock_path).map_err(|err| StoreError::Lock {
            path: lock_path.clone(),
            source: err,
        })?;

        let path = dir.join(REFCNT_NAME);
        let mut map = Self::read_map(&path)?;

        let hex = hex::encode(digest);
        let count = map.get(&hex).copied().unwrap_or(0) + delta;
        if count < 0 {
            log::warn!("refcount of chunk {} dropped to {}", hex, count);
        }
        map.insert(hex, count);
        Self::write_map(&path, &map)?;

        Ok(count)
    }

    fn read_map(path: &Path) -> Result<BTreeMap<String, i64>, StoreError> {
        match std::fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_map(path: &Path, map: &BTreeMap<String, i64>) -> Result<(), StoreError> {
        let data = serde_json::to_vec(map)?;
        bbs_tools::fs::replace_file(path, &data, true)?;
        Ok(())
    }

    /// Scan every `REFCNT` file under the pool and return the digests whose
    /// count is zero or below. No lock is held during the enumeration; each
    /// map is read under its own lock.
    pub fn clean_up(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut result = Vec::new();

        for entry in walkdir::WalkDir::new(&self.base) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("refcount scan: {}", err);
                    continue;
                }
            };
            if !entry.file_type().is_file() || entry.file_name() != REFCNT_NAME {
                continue;
            }

            let lock_path = entry.path().with_file_name(REFCNT_LOCK_NAME);
            let _guard = lock_file_blocking(&lock_path).map_err(|err| StoreError::Lock {
                path: lock_path.clone(),
                source: err,
            })?;

            for (hex, count) in Self::read_map(entry.path())? {
                if count > 0 {
                    continue;
                }
                match hex::decode(&hex) {
                    Ok(digest) => result.push(digest),
                    Err(_) => log::warn!("invalid digest key {:?} in {:?}", hex, entry.path()),
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_incr_decr() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let refcnt = ChunkRefCount::new(dir.path());

        let digest = [7u8; 32];
        assert_eq!(refcnt.count(&digest)?, 0);
        assert_eq!(refcnt.incr(&digest)?, 1);
        assert_eq!(refcnt.incr(&digest)?, 2);
        assert_eq!(refcnt.decr(&digest)?, 1);
        assert_eq!(refcnt.decr(&digest)?, 0);
        assert_eq!(refcnt.count(&digest)?, 0);

        Ok(())
    }

    #[test]
    fn test_counts_survive_rewrite() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let refcnt = ChunkRefCount::new(dir.path());

        // two digests in the same shard: updating one must not erase the other
        let mut first = [1u8; 32];
        let mut second = [1u8; 32];
        first[31] = 1;
        second[31] = 2;

        refcnt.incr(&first)?;
        refcnt.incr(&second)?;
        refcnt.incr(&second)?;

        assert_eq!(refcnt.count(&first)?, 1);
        assert_eq!(refcnt.count(&second)?, 2);

        Ok(())
    }

    #[test]
    fn test_clean_up() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let refcnt = ChunkRefCount::new(dir.path());

        let live = [3u8; 32];
        let dead = [4u8; 32];

        refcnt.incr(&live)?;
        refcnt.incr(&dead)?;
        refcnt.decr(&dead)?;

        let candidates = refcnt.clean_up()?;
        assert_eq!(candidates, vec![dead.to_vec()]);

        Ok(())
    }

    #[test]
    fn test_concurrent_updates() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let base = dir.path().to_owned();
        let digest = [9u8; 32];

        let mut handles = Vec::new();
        for _ in 0..4 {
            let base = base.clone();
            handles.push(std::thread::spawn(move || -> Result<(), StoreError> {
                let refcnt = ChunkRefCount::new(&base);
                for _ in 0..10 {
                    refcnt.incr(&digest)?;
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().unwrap()?;
        }

        assert_eq!(ChunkRefCount::new(&base).count(&digest)?, 40);
        Ok(())
    }
}
