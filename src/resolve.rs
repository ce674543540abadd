//! Mapping of report-relative file identifiers to real source files.
//!
//! Coverage reports name files relative to whatever source roots the build
//! declared (`"pkg/sub/Foo.groovy"`); the project's files live under one of
//! several configured directories. Resolution joins each candidate root with
//! the raw key in order and takes the first hit in the project's file index.
//! There is deliberately no fallback filesystem scan — a report that
//! references files outside the declared roots will simply not attribute
//! them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Classification of an indexed file. Test sources are indexed (the
/// resolver returns them) but callers suppress coverage measures for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Main,
    Test,
}

/// A real, existing file in the analyzed project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub path: PathBuf,
    pub kind: FileKind,
}

impl ResolvedFile {
    #[must_use]
    pub fn is_test(&self) -> bool {
        self.kind == FileKind::Test
    }
}

/// The project's file listing, keyed by absolute path.
#[derive(Debug, Default)]
pub struct FileIndex {
    files: HashMap<PathBuf, FileKind>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index by walking the given main and test source directories.
    /// Directories that do not exist are skipped.
    pub fn from_dirs<P: AsRef<Path>>(main_dirs: &[P], test_dirs: &[P]) -> Self {
        let mut index = Self::new();
        for dir in main_dirs {
            index.add_dir(dir.as_ref(), FileKind::Main);
        }
        for dir in test_dirs {
            index.add_dir(dir.as_ref(), FileKind::Test);
        }
        index
    }

    fn add_dir(&mut self, dir: &Path, kind: FileKind) {
        if !dir.is_dir() {
            return;
        }
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                self.insert(entry.into_path(), kind);
            }
        }
    }

    /// Register a single file. A path registered twice keeps the first kind.
    pub fn insert(&mut self, path: PathBuf, kind: FileKind) {
        self.files.entry(path).or_insert(kind);
    }

    pub fn lookup(&self, path: &Path) -> Option<ResolvedFile> {
        self.files.get(path).map(|&kind| ResolvedFile {
            path: path.to_path_buf(),
            kind,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

/// Resolve a report-relative file key against an ordered list of source
/// roots. The first root whose joined candidate exists in the index wins;
/// a blank key or an exhausted root list yields `None`.
pub fn resolve(index: &FileIndex, source_roots: &[PathBuf], raw_key: &str) -> Option<ResolvedFile> {
    let key = raw_key.trim();
    if key.is_empty() {
        return None;
    }
    for root in source_roots {
        let candidate = root.join(key);
        if let Some(file) = index.lookup(&candidate) {
            return Some(file);
        }
    }
    None
}
