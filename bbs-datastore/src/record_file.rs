//! Length-delimited record files.
//!
//! Manifest and journal files are sequences of framed records: a 4 byte
//! little endian size followed by the prost encoded payload. Random access
//! is valid at record boundaries only; offsets are handed out by the
//! writer and by sequential reads.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use prost::Message;

use crate::StoreError;

pub struct RecordWriter<M> {
    writer: BufWriter<File>,
    offset: u64,
    _marker: PhantomData<M>,
}

impl<M: Message> RecordWriter<M> {
    /// Open for appending, creating the file when missing.
    pub fn append<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .map_err(|err| StoreError::FileOpen {
                path: path.as_ref().to_owned(),
                source: err,
            })?;
        let offset = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            offset,
            _marker: PhantomData,
        })
    }

    /// Open truncating any previous content.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path.as_ref())
            .map_err(|err| StoreError::FileOpen {
                path: path.as_ref().to_owned(),
                source: err,
            })?;
        Ok(Self {
            writer: BufWriter::new(file),
            offset: 0,
            _marker: PhantomData,
        })
    }

    /// Append one record, returning the offset its frame starts at.
    pub fn write_record(&mut self, record: &M) -> Result<u64, StoreError> {
        let start = self.offset;
        let buf = record.encode_to_vec();
        self.writer.write_all(&(buf.len() as u32).to_le_bytes())?;
        self.writer.write_all(&buf)?;
        self.offset += 4 + buf.len() as u64;
        Ok(start)
    }

    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.writer.flush()?;
        Ok(())
    }
}

pub struct RecordReader<M> {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    _marker: PhantomData<M>,
}

impl<M: Message + Default> RecordReader<M> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = File::open(path.as_ref()).map_err(|err| StoreError::FileOpen {
            path: path.as_ref().to_owned(),
            source: err,
        })?;
        Ok(Self {
            path: path.as_ref().to_owned(),
            reader: BufReader::new(file),
            offset: 0,
            _marker: PhantomData,
        })
    }

    /// Next record and the offset it starts at; `None` at a clean end of
    /// file, `ShortRead` when the file ends inside a record.
    pub fn read_record(&mut self) -> Result<Option<(u64, M)>, StoreError> {
        let start = self.offset;

        let mut size_buf = [0u8; 4];
        match read_up_to(&mut self.reader, &mut size_buf)? {
            0 => return Ok(None),
            4 => (),
            _ => {
                return Err(StoreError::ShortRead {
                    path: self.path.clone(),
                    offset: start,
                })
            }
        }

        let size = u32::from_le_bytes(size_buf) as usize;
        let mut buf = vec![0u8; size];
        self.reader.read_exact(&mut buf).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                StoreError::ShortRead {
                    path: self.path.clone(),
                    offset: start,
                }
            } else {
                StoreError::Io(err)
            }
        })?;
        self.offset = start + 4 + size as u64;

        Ok(Some((start, M::decode(&buf[..])?)))
    }

    /// Read the record whose frame starts at `offset`.
    pub fn read_at(&mut self, offset: u64) -> Result<M, StoreError> {
        self.reader.seek(SeekFrom::Start(offset))?;
        self.offset = offset;
        match self.read_record()? {
            Some((_, record)) => Ok(record),
            None => Err(StoreError::ShortRead {
                path: self.path.clone(),
                offset,
            }),
        }
    }
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, StoreError> {
    let mut total = 0;
    while total < buf.len() {
        let count = reader.read(&mut buf[total..])?;
        if count == 0 {
            break;
        }
        total += count;
    }
    Ok(total)
}

#[cfg(test)]
mod test {
    use super::*;
    use bbs_api_types::{FileManifest, FileManifestStat};

    fn manifest(path: &str, size: u64) -> FileManifest {
        FileManifest {
            path: path.to_string(),
            stats: Some(FileManifestStat {
                size,
                last_modified: 1000 + size as i64,
                mode: 0o100644,
                ..Default::default()
            }),
            chunks: vec![vec![size as u8; 32]],
            sha256: vec![size as u8; 32],
        }
    }

    #[test]
    fn test_round_trip() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.manifest");

        let records: Vec<FileManifest> = (0..10).map(|i| manifest(&format!("/f{}", i), i)).collect();

        let mut offsets = Vec::new();
        let mut writer = RecordWriter::create(&path)?;
        for record in &records {
            offsets.push(writer.write_record(record)?);
        }
        writer.flush()?;

        let mut reader = RecordReader::<FileManifest>::open(&path)?;
        let mut read_back = Vec::new();
        while let Some((offset, record)) = reader.read_record()? {
            assert_eq!(offset, offsets[read_back.len()]);
            read_back.push(record);
        }
        assert_eq!(read_back, records);

        // random access at stored offsets, in reverse order
        for (offset, record) in offsets.iter().zip(&records).rev() {
            assert_eq!(&reader.read_at(*offset)?, record);
        }

        Ok(())
    }

    #[test]
    fn test_append_continues_offsets() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.journal");

        let mut writer = RecordWriter::create(&path)?;
        let first = writer.write_record(&manifest("/a", 1))?;
        writer.flush()?;
        drop(writer);

        let mut writer = RecordWriter::append(&path)?;
        let second = writer.write_record(&manifest("/b", 2))?;
        writer.flush()?;

        assert_eq!(first, 0);
        assert!(second > 0);

        let mut reader = RecordReader::<FileManifest>::open(&path)?;
        assert_eq!(reader.read_at(second)?.path, "/b");
        Ok(())
    }

    #[test]
    fn test_short_read() -> Result<(), StoreError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("truncated.manifest");

        let mut writer = RecordWriter::create(&path)?;
        writer.write_record(&manifest("/a", 1))?;
        writer.flush()?;

        let len = std::fs::metadata(&path)?.len();
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(len - 2)?;

        let mut reader = RecordReader::<FileManifest>::open(&path)?;
        match reader.read_record() {
            Err(StoreError::ShortRead { .. }) => Ok(()),
            other => panic!("expected ShortRead, got {:?}", other.map(|_| ())),
        }
    }
}
