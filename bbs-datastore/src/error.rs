use std::path::PathBuf;

/// Failure modes of the datastore layer.
///
/// Callers match on the variants they can act on (a server catching
/// `DigestMismatch` re-fetches under the observed digest); everything else
/// propagates up into the orchestration error context.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unable to open {path:?} - {source}")]
    FileOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unexpected end of file inside record at offset {offset} of {path:?}")]
    ShortRead { path: PathBuf, offset: u64 },

    #[error(
        "chunk digest mismatch - expected {}, got {}",
        hex::encode(expected),
        hex::encode(observed)
    )]
    DigestMismatch {
        expected: Vec<u8>,
        observed: [u8; 32],
    },

    #[error("chunk length {length} exceeds the chunk size")]
    ChunkOverflow { length: u64 },

    #[error("invalid chunk digest length {0}")]
    InvalidDigest(usize),

    #[error("unable to inflate compressed chunk - {0}")]
    Inflate(std::io::Error),

    #[error("unable to acquire lock {path:?} - {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unable to decode record - {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("digest computation failed - {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("refcount map corrupt - {0}")]
    Json(#[from] serde_json::Error),
}
