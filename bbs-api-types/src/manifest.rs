//! File manifest and journal entry records.
//!
//! A `FileManifest` describes one file or directory of a backed up share:
//! stat data, the whole-file SHA3-256 digest and the ordered list of chunk
//! digests. A `FileManifestJournalEntry` is one mutation of a manifest set;
//! the journal file is a sequence of these, terminated by a `Close` entry
//! on the wire.

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileManifestStat {
    #[prost(int64, tag = "1")]
    pub owner_id: i64,
    #[prost(int64, tag = "2")]
    pub group_id: i64,
    #[prost(uint64, tag = "3")]
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    #[prost(int64, tag = "4")]
    pub last_read: i64,
    /// Milliseconds since the Unix epoch.
    #[prost(int64, tag = "5")]
    pub last_modified: i64,
    /// Milliseconds since the Unix epoch.
    #[prost(int64, tag = "6")]
    pub created: i64,
    /// POSIX `st_mode`, including the file type bits.
    #[prost(uint32, tag = "7")]
    pub mode: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileManifest {
    /// Absolute path on the client.
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub stats: ::core::option::Option<FileManifestStat>,
    /// SHA3-256 digests, one per `CHUNK_SIZE` aligned segment. Empty for
    /// non-regular entries.
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub chunks: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    /// SHA3-256 of the whole file content.
    #[prost(bytes = "vec", tag = "4")]
    pub sha256: ::prost::alloc::vec::Vec<u8>,
}

impl FileManifest {
    pub fn stat(&self) -> FileManifestStat {
        self.stats.clone().unwrap_or_default()
    }

    pub fn size(&self) -> u64 {
        self.stats.as_ref().map(|s| s.size).unwrap_or(0)
    }

    pub fn last_modified(&self) -> i64 {
        self.stats.as_ref().map(|s| s.last_modified).unwrap_or(0)
    }

    pub fn is_regular_file(&self) -> bool {
        self.stat().mode & S_IFMT == S_IFREG
    }

    pub fn is_directory(&self) -> bool {
        self.stat().mode & S_IFMT == S_IFDIR
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileManifestJournalEntry {
    #[prost(oneof = "file_manifest_journal_entry::Entry", tags = "1, 2, 3, 4")]
    pub entry: ::core::option::Option<file_manifest_journal_entry::Entry>,
}

/// Nested message and enum types in `FileManifestJournalEntry`.
pub mod file_manifest_journal_entry {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Entry {
        /// A file that was not present in the previous backup.
        #[prost(message, tag = "1")]
        Add(super::FileManifest),
        /// A file whose size or modification time changed.
        #[prost(message, tag = "2")]
        Modify(super::FileManifest),
        /// Absolute path of a file that disappeared.
        #[prost(string, tag = "3")]
        Remove(::prost::alloc::string::String),
        /// Stream terminator. The payload carries no information.
        #[prost(bool, tag = "4")]
        Close(bool),
    }
}

pub use file_manifest_journal_entry::Entry as JournalEntry;

impl FileManifestJournalEntry {
    pub fn add(manifest: FileManifest) -> Self {
        Self {
            entry: Some(JournalEntry::Add(manifest)),
        }
    }

    pub fn modify(manifest: FileManifest) -> Self {
        Self {
            entry: Some(JournalEntry::Modify(manifest)),
        }
    }

    pub fn remove(path: String) -> Self {
        Self {
            entry: Some(JournalEntry::Remove(path)),
        }
    }

    pub fn close() -> Self {
        Self {
            entry: Some(JournalEntry::Close(true)),
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self.entry, Some(JournalEntry::Close(_)))
    }

    /// The path this entry applies to, whatever the variant.
    pub fn path(&self) -> Option<&str> {
        match &self.entry {
            Some(JournalEntry::Add(m)) | Some(JournalEntry::Modify(m)) => Some(&m.path),
            Some(JournalEntry::Remove(path)) => Some(path),
            _ => None,
        }
    }

    pub fn manifest(&self) -> Option<&FileManifest> {
        match &self.entry {
            Some(JournalEntry::Add(m)) | Some(JournalEntry::Modify(m)) => Some(m),
            _ => None,
        }
    }
}
