//! The burrow backup client daemon: persisted configuration, the filtered
//! file walker and the backup agent answering the server's four remote
//! operations.

pub mod client;
pub mod command;
pub mod config;
pub mod walker;

pub use client::{
    BackupClient, ChunkDataStream, FileManifestStream, JournalEntryStream, PrepareResult,
};
pub use config::ClientConfig;
pub use walker::FileWalker;
