//! Missing-file collector: the fallback for paths that do not exist.
//!
//! Unresolvable dependencies still need a vertex, so the scanner can keep
//! the graph complete and a later scan can reconcile the placeholder with
//! a real file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub struct MissingCollector;

impl MissingCollector {
    /// Accepts paths that neither exist nor are (possibly dangling)
    /// symlinks.
    pub fn initialize(path: &Path) -> Option<MissingCollector> {
        let is_symlink = path
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        (!path.exists() && !is_symlink).then_some(MissingCollector)
    }

    /// A file that does not exist depends on nothing.
    pub fn dependencies(&self) -> BTreeSet<PathBuf> {
        BTreeSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn test_accepts_nonexistent_path() {
        assert!(MissingCollector::initialize(Path::new("/no/such/file")).is_some());
    }

    #[test]
    fn test_rejects_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("present");
        std::fs::write(&file, b"x").unwrap();
        assert!(MissingCollector::initialize(&file).is_none());
    }

    #[test]
    fn test_rejects_dangling_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let link = tmp.path().join("dangling");
        symlink("/no/such/target", &link).unwrap();
        assert!(MissingCollector::initialize(&link).is_none());
    }
}
