//! Atomic file helpers.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};

/// Create a temporary file next to `path` (same directory, so a later
/// rename stays on one filesystem). Returns the open file and its path.
pub fn make_tmp_file<P: AsRef<Path>>(path: P) -> io::Result<(File, PathBuf)> {
    let mut template = path.as_ref().to_owned();
    template.set_extension("tmp_XXXXXX");

    let (fd, tmp_path) = nix::unistd::mkstemp(&template).map_err(io::Error::from)?;
    let file = unsafe { File::from_raw_fd(fd) };

    Ok((file, tmp_path))
}

/// Atomically replace the contents of `path` with `data`
/// (write-to-temp-then-rename). A crash at any point leaves either the old
/// or the new content, never a mix.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8], fsync: bool) -> io::Result<()> {
    let (mut file, tmp_path) = make_tmp_file(path.as_ref())?;

    let result = (|| {
        file.write_all(data)?;
        if fsync {
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, path.as_ref())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_replace_file() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.json");

        replace_file(&path, b"first", false)?;
        assert_eq!(std::fs::read(&path)?, b"first");

        replace_file(&path, b"second", true)?;
        assert_eq!(std::fs::read(&path)?, b"second");

        // no temp files left behind
        let count = std::fs::read_dir(dir.path())?.count();
        assert_eq!(count, 1);

        Ok(())
    }
}
