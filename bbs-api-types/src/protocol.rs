//! Request and reply messages of the four remote operations.
//!
//! The transport is a pluggable policy; these messages are the only
//! contract between server and client. Streams reuse
//! `FileManifestJournalEntry` with its `Close` terminator, chunk content is
//! carried in `FileChunk` frames.

use crate::BackupConfiguration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Failed = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrepareBackupRequest {
    #[prost(message, optional, tag = "1")]
    pub configuration: ::core::option::Option<BackupConfiguration>,
    #[prost(int32, tag = "2")]
    pub last_backup_id: i32,
    #[prost(int32, tag = "3")]
    pub new_backup_id: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrepareBackupReply {
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code: i32,
    /// True when the client's stored last backup number does not match the
    /// server's; the server should then replay the previous manifest.
    #[prost(bool, tag = "2")]
    pub need_refresh_cache: bool,
}

/// Header of a cache refresh; a stream of journal `Add` entries follows,
/// terminated by a `Close` entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RefreshCacheRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RefreshCacheReply {
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LaunchBackupRequest {
    #[prost(int32, tag = "1")]
    pub backup_number: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetChunkRequest {
    /// Absolute path of the file on the client.
    #[prost(string, tag = "1")]
    pub filename: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub position: u64,
    #[prost(uint64, tag = "3")]
    pub size: u64,
    /// Expected SHA3-256 of the returned range; verified by the receiver
    /// when it commits the chunk.
    #[prost(bytes = "vec", tag = "4")]
    pub sha256: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileChunk {
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// Envelope opening one remote call; sent first on every connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientRequest {
    #[prost(oneof = "client_request::Request", tags = "1, 2, 3, 4")]
    pub request: ::core::option::Option<client_request::Request>,
}

/// Nested message and enum types in `ClientRequest`.
pub mod client_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Prepare(super::PrepareBackupRequest),
        #[prost(message, tag = "2")]
        RefreshCache(super::RefreshCacheRequest),
        #[prost(message, tag = "3")]
        LaunchBackup(super::LaunchBackupRequest),
        #[prost(message, tag = "4")]
        GetChunk(super::GetChunkRequest),
    }
}
