use std::io::{Read, Seek, SeekFrom};

use openssl::hash::{Hasher, MessageDigest};

use crate::StoreError;

/// Read adapter computing the SHA3-256 digest and byte count of everything
/// read through it.
///
/// Seeking is only meaningful on the read path: it repositions the inner
/// reader and resets the running digest, so the digest always covers the
/// bytes read since the last seek.
pub struct ChecksumReader<R> {
    reader: R,
    hasher: Hasher,
    length: u64,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(reader: R) -> Result<Self, StoreError> {
        Ok(Self {
            reader,
            hasher: Hasher::new(MessageDigest::sha3_256())?,
            length: 0,
        })
    }

    /// Consume the adapter, returning the digest of the bytes read and
    /// their count.
    pub fn digest(mut self) -> Result<([u8; 32], u64), StoreError> {
        let digest = self.hasher.finish()?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok((out, self.length))
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        let count = self.reader.read(buf)?;
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
}

impl<R: Read + Seek> Seek for ChecksumReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, std::io::Error> {
        let offset = self.reader.seek(pos)?;
        self.hasher = Hasher::new(MessageDigest::sha3_256()).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("hash reset failed - {}", err),
            )
        })?;
        self.length = 0;
        Ok(offset)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn test_digest_matches_writer() -> Result<(), StoreError> {
        let data = b"burrow backup checksum test data";

        let mut reader = ChecksumReader::new(Cursor::new(&data[..]))?;
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back)?;
        assert_eq!(read_back, data);
        let (read_digest, read_len) = reader.digest()?;

        let mut writer = crate::ChecksumWriter::new(Vec::new())?;
        writer.write_all(data)?;
        let (_, write_digest, write_len) = writer.finish()?;

        assert_eq!(read_digest, write_digest);
        assert_eq!(read_len, write_len);
        Ok(())
    }

    #[test]
    fn test_seek_resets_digest() -> Result<(), StoreError> {
        let data = b"0123456789";

        let mut reader = ChecksumReader::new(Cursor::new(&data[..]))?;
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;

        reader.seek(SeekFrom::Start(4))?;
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest)?;
        let (digest, length) = reader.digest()?;

        let mut full = ChecksumReader::new(Cursor::new(&data[4..]))?;
        std::io::copy(&mut full, &mut std::io::sink())?;
        let (expected, _) = full.digest()?;

        assert_eq!(length, 6);
        assert_eq!(digest, expected);
        Ok(())
    }
}
