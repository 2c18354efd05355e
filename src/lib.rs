//! Burrow backup server library.
//!
//! The server drives backups: it pulls the journal stream from a client
//! daemon and fetches only the chunks the shared pool does not already
//! hold. The wire is a pluggable policy behind [`transport::BackupTransport`];
//! the protocol itself lives in the client agent and the
//! [`server::BackupDriver`].

pub mod server;
pub mod transport;
