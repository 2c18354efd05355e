//! Backup configuration as sent by the server, and the small persisted
//! client configuration.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BackupShare {
    /// Absolute path of the share root on the client.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// UNIX wildcard patterns, relative to the share root.
    #[prost(string, repeated, tag = "2")]
    pub includes: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, repeated, tag = "3")]
    pub excludes: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BackupTask {
    /// Shell command to run before the task's shares are walked. Empty
    /// means no command.
    #[prost(string, tag = "1")]
    pub command: ::prost::alloc::string::String,
    /// Patterns applied to every share of this task, in addition to the
    /// share's own lists.
    #[prost(string, repeated, tag = "2")]
    pub includes: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, repeated, tag = "3")]
    pub excludes: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "4")]
    pub shares: ::prost::alloc::vec::Vec<BackupShare>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BackupOperations {
    #[prost(message, repeated, tag = "1")]
    pub tasks: ::prost::alloc::vec::Vec<BackupTask>,
    /// Cleanup tasks that run even when a task of `tasks` failed.
    #[prost(message, repeated, tag = "2")]
    pub finalised_tasks: ::prost::alloc::vec::Vec<BackupTask>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BackupConfiguration {
    #[prost(message, optional, tag = "1")]
    pub operations: ::core::option::Option<BackupOperations>,
}

impl BackupConfiguration {
    pub fn operations(&self) -> BackupOperations {
        self.operations.clone().unwrap_or_default()
    }
}

/// Persisted client state, stored prost-encoded in the client's config file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientConfiguration {
    /// UUIDv4, generated on first run and never changed afterwards.
    #[prost(string, tag = "1")]
    pub machine_id: ::prost::alloc::string::String,
    /// Number of the last completed backup, -1 if none.
    #[prost(int32, tag = "2")]
    pub last_backup_number: i32,
}
