// src/fs/mock.rs

use super::FileSystem;
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub enum MockEntry {
    File(Vec<u8>),
    Dir,
}

/// In-memory filesystem keyed by path. Parent directories are created
/// implicitly whenever a file is added.
#[derive(Debug, Clone, Default)]
pub struct MockFileSystem {
    entries: Arc<Mutex<BTreeMap<PathBuf, MockEntry>>>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(PathBuf::from("."), MockEntry::Dir);
        Self {
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let path = path.as_ref().to_path_buf();
        let mut entries = self.entries.lock().unwrap();
        if let Some(parent) = path.parent() {
            Self::ensure_dirs(&mut entries, parent);
        }
        entries.insert(path, MockEntry::File(content.into()));
    }

    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let mut entries = self.entries.lock().unwrap();
        Self::ensure_dirs(&mut entries, path.as_ref());
    }

    /// Contents of a file previously written, if any.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        match entries.get(path.as_ref()) {
            Some(MockEntry::File(bytes)) => String::from_utf8(bytes.clone()).ok(),
            _ => None,
        }
    }

    fn ensure_dirs(entries: &mut BTreeMap<PathBuf, MockEntry>, path: &Path) {
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            entries
                .entry(ancestor.to_path_buf())
                .or_insert(MockEntry::Dir);
        }
    }
}

impl FileSystem for MockFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let entries = self.entries.lock().unwrap();
        match entries.get(path) {
            Some(MockEntry::File(content)) => {
                String::from_utf8(content.clone()).map_err(|e| anyhow!("Invalid UTF-8: {}", e))
            }
            Some(MockEntry::Dir) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.add_file(path, contents);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        let entries = self.entries.lock().unwrap();
        matches!(entries.get(path), Some(MockEntry::Dir))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.add_dir(path);
        Ok(())
    }

    fn walk_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let entries = self.entries.lock().unwrap();
        match entries.get(root) {
            Some(MockEntry::Dir) => Ok(entries
                .iter()
                .filter(|(path, entry)| {
                    matches!(entry, MockEntry::File(_)) && path.starts_with(root)
                })
                .map(|(path, _)| path.clone())
                .collect()),
            _ => Err(anyhow!("Not a directory or not found: {:?}", root)),
        }
    }
}
