// Local hierarchical store: path-addressed files under a vault root.
//
// All paths are vault-relative and normalized before touching the
// filesystem (traversal components rejected). Missing files are a benign
// condition for readers and deleters; the sync flows treat them as no-ops.

use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};

use notelens_common::path::normalize_path;

/// Path-addressed read/write/delete of binary and text files.
pub trait LocalStore: Send + Sync {
    /// True when a file or folder exists at `rel`.
    fn exists(&self, rel: &str) -> bool;

    /// Create the folder `rel` (and parents) if absent.
    fn create_dir_all(&self, rel: &str) -> Result<()>;

    /// Write `bytes` to `rel`, creating parent folders and replacing any
    /// existing content.
    fn write(&self, rel: &str, bytes: &[u8]) -> Result<()>;

    /// Read `rel` as UTF-8 text. `Ok(None)` when the file is absent.
    fn read_to_string(&self, rel: &str) -> Result<Option<String>>;

    /// Delete the file at `rel`. Absent files are a no-op.
    fn delete(&self, rel: &str) -> Result<()>;

    /// File names (not paths) of the direct children of folder `rel`.
    /// Empty when the folder does not exist.
    fn list_dir(&self, rel: &str) -> Result<Vec<String>>;
}

/// Name of the first file in `dir` whose name ends with `suffix`.
pub fn find_by_suffix(
    store: &dyn LocalStore,
    dir: &str,
    suffix: &str,
) -> Result<Option<String>> {
    Ok(store.list_dir(dir)?.into_iter().find(|name| name.ends_with(suffix)))
}

/// Filesystem-backed store rooted at a vault directory.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let normalized = normalize_path(rel)
            .with_context(|| format!("invalid store path `{rel}`"))?;
        Ok(self.root.join(normalized))
    }
}

impl LocalStore for FsStore {
    fn exists(&self, rel: &str) -> bool {
        self.resolve(rel).map(|p| p.exists()).unwrap_or(false)
    }

    fn create_dir_all(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create folder {}", path.display()))
    }

    fn write(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create parent of {}", path.display()))?;
        }
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    fn read_to_string(&self, rel: &str) -> Result<Option<String>> {
        let path = self.resolve(rel)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => {
                Err(error).with_context(|| format!("failed to read {}", path.display()))
            }
        }
    }

    fn delete(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => {
                Err(error).with_context(|| format!("failed to delete {}", path.display()))
            }
        }
    }

    fn list_dir(&self, rel: &str) -> Result<Vec<String>> {
        let path = self.resolve(rel)?;
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to list {}", path.display()))
            }
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to list {}", path.display()))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn store() -> (TempDir, FsStore) {
        let dir = TempDir::new().expect("temp dir");
        let store = FsStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, store) = store();
        store.write("notebooks/Foo-42.md", b"# Foo").unwrap();
        assert!(store.exists("notebooks/Foo-42.md"));
        assert_eq!(store.read_to_string("notebooks/Foo-42.md").unwrap().as_deref(), Some("# Foo"));
    }

    #[test]
    fn write_creates_parent_folders() {
        let (_dir, store) = store();
        store.write("notebooks/images/a.png", b"\x89PNG").unwrap();
        assert!(store.exists("notebooks/images/a.png"));
    }

    #[test]
    fn read_missing_is_none() {
        let (_dir, store) = store();
        assert_eq!(store.read_to_string("nope.md").unwrap(), None);
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        store.write("a.md", b"x").unwrap();
        store.delete("a.md").unwrap();
        assert!(!store.exists("a.md"));
        store.delete("a.md").unwrap();
    }

    #[test]
    fn list_dir_returns_names_sorted() {
        let (_dir, store) = store();
        store.write("notebooks/Beta-2.md", b"b").unwrap();
        store.write("notebooks/Alpha-1.md", b"a").unwrap();
        assert_eq!(store.list_dir("notebooks").unwrap(), vec!["Alpha-1.md", "Beta-2.md"]);
    }

    #[test]
    fn list_missing_dir_is_empty() {
        let (_dir, store) = store();
        assert!(store.list_dir("absent").unwrap().is_empty());
    }

    #[test]
    fn traversal_paths_are_rejected() {
        let (_dir, store) = store();
        assert!(store.write("../outside.md", b"x").is_err());
        assert!(!store.exists("../outside.md"));
    }

    #[test]
    fn find_by_suffix_matches_id_tail() {
        let (_dir, store) = store();
        store.write("notebooks/Foo-42.md", b"x").unwrap();
        store.write("notebooks/Bar-7.md", b"y").unwrap();

        let found = find_by_suffix(&store, "notebooks", "-42.md").unwrap();
        assert_eq!(found.as_deref(), Some("Foo-42.md"));
        assert_eq!(find_by_suffix(&store, "notebooks", "-9.md").unwrap(), None);
    }
}
