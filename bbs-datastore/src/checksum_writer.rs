use std::io::Write;

use openssl::hash::{Hasher, MessageDigest};

use crate::StoreError;

/// Write adapter computing the SHA3-256 digest and byte count of everything
/// written through it.
pub struct ChecksumWriter<W> {
    writer: W,
    hasher: Hasher,
    length: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(writer: W) -> Result<Self, StoreError> {
        Ok(Self {
            writer,
            hasher: Hasher::new(MessageDigest::sha3_256())?,
            length: 0,
        })
    }

    /// Consume the adapter, returning the inner writer, the digest of the
    /// bytes written and their count.
    pub fn finish(mut self) -> Result<(W, [u8; 32], u64), StoreError> {
        let digest = self.hasher.finish()?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok((self.writer, out, self.length))
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        let count = self.writer.write(buf)?;
        if count > 0 {
            self.hasher.update(&buf[..count]).map_err(|err| {
                std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("hash update failed - {}", err),
                )
            })?;
            self.length += count as u64;
        }
        Ok(count)
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.writer.flush()
    }
}
