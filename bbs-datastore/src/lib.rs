//! Low level storage for burrow backup: the content-addressed chunk pool
//! with its reference counts, and the manifest engine (length-delimited
//! record files, the in-memory path index and journal compaction).

mod checksum_reader;
mod checksum_writer;
mod chunk_refcount;
mod chunk_store;
mod error;
mod hasher;
mod index;
mod manifest;
mod record_file;

pub use checksum_reader::ChecksumReader;
pub use checksum_writer::ChecksumWriter;
pub use chunk_refcount::ChunkRefCount;
pub use chunk_store::{ChunkReader, ChunkStore, ChunkWriter, CHUNK_FILE_SUFFIX};
pub use error::StoreError;
pub use hasher::{hash_file, FileHash, HASH_BUFFER_SIZE};
pub use index::{IndexManifest, IndexNode, NodeId};
pub use manifest::Manifest;
pub use record_file::{RecordReader, RecordWriter};
