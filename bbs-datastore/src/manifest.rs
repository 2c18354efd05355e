//! The manifest engine.
//!
//! A manifest set consists of `<name>.manifest` (the base, one record per
//! live path), `<name>.journal` (the append-only overlay of the running
//! backup), `<name>.new` (only present while a compaction is writing it),
//! `<name>.index` (reserved) and `<name>.lock`. Compaction merges the
//! journal into a fresh base using write-to-temp-then-rename, so a crash at
//! any point leaves the previous state fully intact.

use std::path::{Path, PathBuf};

use bbs_api_types::{FileManifest, FileManifestJournalEntry, JournalEntry};

use crate::index::{IndexManifest, NodeId};
use crate::record_file::{RecordReader, RecordWriter};
use crate::StoreError;

pub struct Manifest {
    manifest_path: PathBuf,
    journal_path: PathBuf,
    new_path: PathBuf,
    index_path: PathBuf,
    lock_path: PathBuf,
    journal: Option<RecordWriter<FileManifestJournalEntry>>,
}

impl Manifest {
    pub fn new<P: AsRef<Path>>(name: &str, dir: P) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir.as_ref())?;
        let dir = dir.as_ref();
        Ok(Self {
            manifest_path: dir.join(format!("{}.manifest", name)),
            journal_path: dir.join(format!("{}.journal", name)),
            new_path: dir.join(format!("{}.new", name)),
            index_path: dir.join(format!("{}.index", name)),
            lock_path: dir.join(format!("{}.lock", name)),
            journal: None,
        })
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    fn journal_writer(
        &mut self,
    ) -> Result<&mut RecordWriter<FileManifestJournalEntry>, StoreError> {
        if self.journal.is_none() {
            self.journal = Some(RecordWriter::append(&self.journal_path)?);
        }
        Ok(self.journal.as_mut().unwrap())
    }

    /// Close the journal handle, flushing buffered entries.
    pub fn close_journal(&mut self) -> Result<(), StoreError> {
        if let Some(mut writer) = self.journal.take() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Append one ADD or MODIFY entry to the journal.
    pub fn add_manifest(&mut self, manifest: &FileManifest, added: bool) -> Result<(), StoreError> {
        let entry = if added {
            FileManifestJournalEntry::add(manifest.clone())
        } else {
            FileManifestJournalEntry::modify(manifest.clone())
        };
        let writer = self.journal_writer()?;
        writer.write_record(&entry)?;
        writer.flush()?;
        Ok(())
    }

    /// Append one REMOVE entry to the journal.
    pub fn remove_path(&mut self, path: &str) -> Result<(), StoreError> {
        let entry = FileManifestJournalEntry::remove(path.to_string());
        let writer = self.journal_writer()?;
        writer.write_record(&entry)?;
        writer.flush()?;
        Ok(())
    }

    /// Rebuild the in-memory index: base manifest first, then the journal
    /// overlay (ADD/MODIFY point into the journal, REMOVE flags deletion,
    /// CLOSE is a stream terminator and ignored here).
    pub fn load_index(&mut self) -> Result<IndexManifest, StoreError> {
        self.close_journal()?;

        let mut index = IndexManifest::new();

        if self.manifest_path.exists() {
            let mut reader = RecordReader::<FileManifest>::open(&self.manifest_path)?;
            while let Some((offset, manifest)) = reader.read_record()? {
                let id = index.add(&manifest.path, offset, false);
                index.set_cached_stats(id, manifest.last_modified(), manifest.size());
            }
        }

        if self.journal_path.exists() {
            let mut reader = RecordReader::<FileManifestJournalEntry>::open(&self.journal_path)?;
            while let Some((offset, entry)) = reader.read_record()? {
                match entry.entry {
                    Some(JournalEntry::Add(manifest)) | Some(JournalEntry::Modify(manifest)) => {
                        let id = index.add(&manifest.path, offset, true);
                        index.set_cached_stats(id, manifest.last_modified(), manifest.size());
                    }
                    Some(JournalEntry::Remove(path)) => index.remove(&path),
                    Some(JournalEntry::Close(_)) | None => (),
                }
            }
        }

        Ok(index)
    }

    /// Read the authoritative record for an index entry from the file it
    /// originates from.
    pub fn get_manifest(
        &self,
        index: &IndexManifest,
        id: NodeId,
    ) -> Result<Option<FileManifest>, StoreError> {
        let node = index.entry(id);
        if node.journal() {
            let mut reader = RecordReader::<FileManifestJournalEntry>::open(&self.journal_path)?;
            let entry = reader.read_at(node.offset())?;
            Ok(entry.manifest().cloned())
        } else {
            let mut reader = RecordReader::<FileManifest>::open(&self.manifest_path)?;
            Ok(Some(reader.read_at(node.offset())?))
        }
    }

    /// Merge the journal into a fresh base manifest.
    ///
    /// `on_entry` sees every record that made it into the new manifest, in
    /// walk order, before the new file is committed.
    pub fn compact<F>(&mut self, mut on_entry: F) -> Result<(), StoreError>
    where
        F: FnMut(&FileManifest),
    {
        self.close_journal()?;
        let index = self.load_index()?;

        let mut manifest_reader = if self.manifest_path.exists() {
            Some(RecordReader::<FileManifest>::open(&self.manifest_path)?)
        } else {
            None
        };
        let mut journal_reader = if self.journal_path.exists() {
            Some(RecordReader::<FileManifestJournalEntry>::open(
                &self.journal_path,
            )?)
        } else {
            None
        };

        let mut live: Vec<(bool, u64)> = Vec::new();
        index.walk(|_path, node| {
            if !node.deleted() {
                live.push((node.journal(), node.offset()));
            }
        });

        let mut writer = RecordWriter::<FileManifest>::create(&self.new_path)?;
        for (journal, offset) in live {
            let manifest = if journal {
                let Some(reader) = journal_reader.as_mut() else {
                    continue;
                };
                reader.read_at(offset)?.manifest().cloned()
            } else {
                let Some(reader) = manifest_reader.as_mut() else {
                    continue;
                };
                Some(reader.read_at(offset)?)
            };

            match manifest {
                Some(manifest) => {
                    writer.write_record(&manifest)?;
                    on_entry(&manifest);
                }
                None => log::warn!("file manifest not present at journal offset {}", offset),
            }
        }
        writer.flush()?;
        drop(writer);

        // rename(2) replaces the old base atomically; the journal is only
        // dropped once the new base is committed, so an interrupted
        // compaction converges on retry instead of losing merged entries
        std::fs::rename(&self.new_path, &self.manifest_path)?;
        if self.journal_path.exists() {
            std::fs::remove_file(&self.journal_path)?;
        }

        Ok(())
    }

    /// Remove every file of the manifest set; the lock file stays.
    pub fn delete_manifest(&mut self) -> Result<(), StoreError> {
        self.close_journal()?;
        for path in [
            &self.new_path,
            &self.index_path,
            &self.journal_path,
            &self.manifest_path,
        ] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Two manifests describe the same on-disk state when modification time
    /// and size agree.
    pub fn compare_manifest(a: &FileManifest, b: &FileManifest) -> bool {
        a.last_modified() == b.last_modified() && a.size() == b.size()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bbs_api_types::FileManifestStat;

    fn manifest(path: &str, size: u64, last_modified: i64) -> FileManifest {
        FileManifest {
            path: path.to_string(),
            stats: Some(FileManifestStat {
                size,
                last_modified,
                mode: 0o100644,
                ..Default::default()
            }),
            chunks: vec![vec![size as u8; 32]],
            sha256: vec![size as u8; 32],
        }
    }

    #[test]
    fn test_journal_overlay() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let mut set = Manifest::new("backup", dir.path())?;

        // base manifest: a, b
        set.add_manifest(&manifest("/a", 1, 100), true)?;
        set.add_manifest(&manifest("/b", 2, 200), true)?;
        set.compact(|_| ())?;

        // journal: MODIFY(b), ADD(c), REMOVE(a)
        set.add_manifest(&manifest("/b", 2, 300), false)?;
        set.add_manifest(&manifest("/c", 3, 400), true)?;
        set.remove_path("/a")?;

        let mut index = set.load_index()?;
        assert_eq!(index.unmarked_files(), vec!["/a", "/b", "/c"]);

        let b = index.get_entry("/b").unwrap();
        index.mark(b);
        let c = index.get_entry("/c").unwrap();
        index.mark(c);
        assert_eq!(index.unmarked_files(), vec!["/a"]);

        let a = index.get_entry("/a").unwrap();
        assert!(index.entry(a).deleted());

        // the authoritative record for b is the journal version
        let b_manifest = set.get_manifest(&index, b)?.unwrap();
        assert_eq!(b_manifest.last_modified(), 300);

        // the cached index stats compare equal to it
        let cached = index.entry(b).to_manifest("/b");
        assert!(Manifest::compare_manifest(&cached, &b_manifest));
        assert!(!Manifest::compare_manifest(&cached, &manifest("/b", 2, 301)));
        assert!(!Manifest::compare_manifest(&cached, &manifest("/b", 3, 300)));

        Ok(())
    }

    #[test]
    fn test_compact_idempotent() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let mut set = Manifest::new("backup", dir.path())?;

        set.add_manifest(&manifest("/a", 1, 100), true)?;
        set.add_manifest(&manifest("/b", 2, 200), true)?;
        set.remove_path("/a")?;
        set.add_manifest(&manifest("/c", 3, 300), true)?;

        let mut seen = Vec::new();
        set.compact(|m| seen.push(m.path.clone()))?;
        assert_eq!(seen, vec!["/b", "/c"]);
        assert!(!set.journal_path().exists());

        let first = std::fs::read(set.manifest_path())?;

        set.compact(|_| ())?;
        let second = std::fs::read(set.manifest_path())?;
        assert_eq!(first, second);

        Ok(())
    }

    #[test]
    fn test_compact_interrupted_before_journal_removal() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let mut set = Manifest::new("backup", dir.path())?;

        set.add_manifest(&manifest("/a", 1, 100), true)?;
        set.compact(|_| ())?;

        set.add_manifest(&manifest("/b", 2, 200), true)?;
        set.remove_path("/a")?;
        set.close_journal()?;
        let journal = std::fs::read(set.journal_path())?;

        set.compact(|_| ())?;
        let clean = std::fs::read(set.manifest_path())?;

        // a crash after the rename but before the journal removal leaves
        // the committed base with the already merged journal still on disk
        std::fs::write(set.journal_path(), &journal)?;

        set.compact(|_| ())?;
        assert_eq!(std::fs::read(set.manifest_path())?, clean);
        assert!(!set.journal_path().exists());

        Ok(())
    }

    #[test]
    fn test_compact_survives_stale_new_file() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let mut set = Manifest::new("backup", dir.path())?;

        set.add_manifest(&manifest("/a", 1, 100), true)?;
        set.compact(|_| ())?;
        let clean = std::fs::read(set.manifest_path())?;

        // a crash after writing `.new` but before the rename leaves the
        // previous manifest and journal untouched
        set.add_manifest(&manifest("/b", 2, 200), true)?;
        std::fs::write(dir.path().join("backup.new"), b"partial garbage")?;

        set.compact(|_| ())?;
        let after = std::fs::read(set.manifest_path())?;
        assert_ne!(clean, after);

        let index = set.load_index()?;
        assert!(index.get_entry("/a").is_some());
        assert!(index.get_entry("/b").is_some());
        assert_eq!(index.len(), 2);

        Ok(())
    }

    #[test]
    fn test_delete_manifest() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let mut set = Manifest::new("backup", dir.path())?;

        set.add_manifest(&manifest("/a", 1, 100), true)?;
        set.compact(|_| ())?;
        set.add_manifest(&manifest("/b", 2, 200), true)?;

        set.delete_manifest()?;
        assert!(!set.manifest_path().exists());
        assert!(!set.journal_path().exists());

        let index = set.load_index()?;
        assert!(index.is_empty());

        Ok(())
    }
}
