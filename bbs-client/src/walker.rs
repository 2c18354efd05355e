//! Filtered recursive traversal of a backup share.

use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use pathpatterns::{MatchEntry, MatchList, MatchType, PatternFlag};

use bbs_api_types::{FileManifest, FileManifestStat};

/// Depth-first walk over a share root.
///
/// Include/exclude patterns are UNIX wildcards evaluated against the path
/// relative to the share root, *before* any recursion: a directory that is
/// filtered out is not descended into. Both files and directories are
/// reported; symlinks are stat'ed with `lstat` and never followed.
pub struct FileWalker {
    share_root: PathBuf,
    includes: Vec<MatchEntry>,
    excludes: Vec<MatchEntry>,
    errors: Vec<Error>,
}

fn parse_patterns(patterns: &[String], match_type: MatchType) -> Result<Vec<MatchEntry>, Error> {
    patterns
        .iter()
        .map(|pattern| {
            MatchEntry::parse_pattern(pattern, PatternFlag::PATH_NAME, match_type)
                .map_err(|err| format_err!("invalid pattern {:?} - {}", pattern, err))
        })
        .collect()
}

impl FileWalker {
    pub fn new<P: Into<PathBuf>>(
        share_root: P,
        includes: &[String],
        excludes: &[String],
    ) -> Result<Self, Error> {
        Ok(Self {
            share_root: share_root.into(),
            includes: parse_patterns(includes, MatchType::Include)?,
            excludes: parse_patterns(excludes, MatchType::Exclude)?,
            errors: Vec::new(),
        })
    }

    /// Walk the share and hand every accepted entry to `process`. Errors on
    /// individual entries are collected and the walk continues.
    pub fn walk<F: FnMut(FileManifest)>(&mut self, process: &mut F) {
        self.walk_dir(Path::new(""), process);
    }

    /// Errors encountered so far; surfaced by the caller as a warning count.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    fn walk_dir<F: FnMut(FileManifest)>(&mut self, relative: &Path, process: &mut F) {
        let dir = self.share_root.join(relative);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                self.errors
                    .push(format_err!("unable to read directory {:?} - {}", dir, err));
                return;
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => names.push(entry.file_name()),
                Err(err) => self
                    .errors
                    .push(format_err!("unable to list {:?} - {}", dir, err)),
            }
        }
        names.sort();

        for name in names {
            let relative_path = relative.join(&name);
            let absolute_path = self.share_root.join(&relative_path);

            let metadata = match std::fs::symlink_metadata(&absolute_path) {
                Ok(metadata) => metadata,
                Err(err) => {
                    self.errors
                        .push(format_err!("unable to stat {:?} - {}", absolute_path, err));
                    continue;
                }
            };

            if !self.accept(&relative_path, metadata.mode()) {
                continue;
            }

            if metadata.is_dir() {
                self.walk_dir(&relative_path, process);
            }

            process(manifest_from_metadata(&absolute_path, &metadata));
        }
    }

    fn accept(&self, relative_path: &Path, file_mode: u32) -> bool {
        let match_path = Path::new("/").join(relative_path);
        let bytes = match_path.as_os_str().as_bytes();

        if !self.includes.is_empty()
            && !matches!(
                self.includes.matches(bytes, Some(file_mode)),
                Some(MatchType::Include)
            )
        {
            log::debug!("not included: {:?}", relative_path);
            return false;
        }
        if matches!(
            self.excludes.matches(bytes, Some(file_mode)),
            Some(MatchType::Exclude)
        ) {
            log::debug!("excluded: {:?}", relative_path);
            return false;
        }
        true
    }
}

fn manifest_from_metadata(path: &Path, metadata: &std::fs::Metadata) -> FileManifest {
    FileManifest {
        path: path.to_string_lossy().into_owned(),
        stats: Some(FileManifestStat {
            owner_id: metadata.uid() as i64,
            group_id: metadata.gid() as i64,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            last_read: metadata.atime() * 1000 + metadata.atime_nsec() / 1_000_000,
            last_modified: metadata.mtime() * 1000 + metadata.mtime_nsec() / 1_000_000,
            created: metadata.ctime() * 1000 + metadata.ctime_nsec() / 1_000_000,
            mode: metadata.mode(),
        }),
        chunks: Vec::new(),
        sha256: Vec::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeSet;

    fn build_tree(dir: &Path) {
        std::fs::write(dir.join("a.txt"), b"aaa").unwrap();
        std::fs::write(dir.join("b.log"), b"bbb").unwrap();
        std::fs::create_dir(dir.join("sub")).unwrap();
        std::fs::write(dir.join("sub/c.txt"), b"ccc").unwrap();
        std::fs::create_dir(dir.join("skip")).unwrap();
        std::fs::write(dir.join("skip/d.txt"), b"ddd").unwrap();
    }

    fn collect(walker: &mut FileWalker, root: &Path) -> BTreeSet<String> {
        let mut paths = BTreeSet::new();
        walker.walk(&mut |manifest| {
            let relative = manifest
                .path
                .strip_prefix(&root.to_string_lossy().into_owned())
                .unwrap()
                .trim_start_matches('/')
                .to_string();
            paths.insert(relative);
        });
        paths
    }

    #[test]
    fn test_unfiltered_walk() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        build_tree(dir.path());

        let mut walker = FileWalker::new(dir.path(), &[], &[])?;
        let paths = collect(&mut walker, dir.path());

        let expected: BTreeSet<String> =
            ["a.txt", "b.log", "skip", "skip/d.txt", "sub", "sub/c.txt"]
                .iter()
                .map(|s| s.to_string())
                .collect();
        assert_eq!(paths, expected);
        assert!(walker.errors().is_empty());
        Ok(())
    }

    #[test]
    fn test_excluded_directory_not_descended() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        build_tree(dir.path());

        let mut walker = FileWalker::new(dir.path(), &[], &["skip".to_string()])?;
        let paths = collect(&mut walker, dir.path());

        assert!(!paths.contains("skip"));
        assert!(!paths.contains("skip/d.txt"));
        assert!(paths.contains("sub/c.txt"));
        Ok(())
    }

    #[test]
    fn test_includes_take_precedence_over_recursion() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        build_tree(dir.path());

        let includes = vec!["*.txt".to_string(), "sub".to_string()];
        let mut walker = FileWalker::new(dir.path(), &includes, &[])?;
        let paths = collect(&mut walker, dir.path());

        let expected: BTreeSet<String> = ["a.txt", "sub", "sub/c.txt"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(paths, expected);
        Ok(())
    }

    #[test]
    fn test_symlinks_not_followed() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("real"))?;
        std::fs::write(dir.path().join("real/file"), b"data")?;
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link"))?;

        let mut walker = FileWalker::new(dir.path(), &[], &[])?;
        let paths = collect(&mut walker, dir.path());

        assert!(paths.contains("link"));
        assert!(!paths.contains("link/file"));
        assert!(paths.contains("real/file"));
        Ok(())
    }

    #[test]
    fn test_directory_size_is_zero() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        build_tree(dir.path());

        let mut walker = FileWalker::new(dir.path(), &[], &[])?;
        walker.walk(&mut |manifest| {
            if manifest.is_directory() {
                assert_eq!(manifest.size(), 0);
                assert!(manifest.chunks.is_empty());
            }
        });
        Ok(())
    }
}
