//! Library-search oracles for the scanned filesystem image.
//!
//! One [`Env`] is built per scan, before any file is visited, and is
//! read-only afterwards. It holds the chroot root and the two platform
//! resolvers, addressable under the registry keys [`SHARED_LIBRARY`] and
//! [`WINDOWS_SYSTEM_ROOT`].

pub mod linux;
pub mod windows;

use std::path::{Path, PathBuf};

/// Registry key of the ELF resolver.
pub const SHARED_LIBRARY: &str = "SHARED_LIBRARY";
/// Registry key of the PE resolver.
pub const WINDOWS_SYSTEM_ROOT: &str = "WINDOWS_SYSTEM_ROOT";

/// Platform-specific library-search contract.
pub trait Resolver {
    /// Maps a library basename to an absolute path inside the image.
    fn resolve(&self, basename: &str) -> Option<PathBuf>;

    /// Ordered fallback directories for [`which`]-style searches.
    fn default_paths(&self) -> &[PathBuf];
}

/// The resolver registry plus the chroot root, built once per scan.
pub struct Env {
    root: PathBuf,
    shared_library: linux::SharedLibraryResolver,
    windows: windows::WindowsResolver,
}

impl Env {
    /// Builds every resolver against `root` (empty for the live system).
    pub fn initialize_all(root: &Path) -> Env {
        Env {
            root: root.to_path_buf(),
            shared_library: linux::SharedLibraryResolver::initialize(root),
            windows: windows::WindowsResolver::initialize(root),
        }
    }

    /// Base of the scanned file hierarchy; empty when scanning in place.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registry lookup by key, for callers that only need the abstract
    /// contract.
    pub fn resolver(&self, key: &str) -> Option<&dyn Resolver> {
        match key {
            SHARED_LIBRARY => Some(&self.shared_library),
            WINDOWS_SYSTEM_ROOT => Some(&self.windows),
            _ => None,
        }
    }

    pub fn shared_library(&self) -> &linux::SharedLibraryResolver {
        &self.shared_library
    }

    pub fn windows(&self) -> &windows::WindowsResolver {
        &self.windows
    }
}

/// Resolves `file` against the ordered `paths`, returning the first
/// directory that contains it. The result is canonicalized when possible
/// so symlinked directories collapse onto their target.
pub fn which(paths: &[PathBuf], file: &Path) -> Option<PathBuf> {
    for dir in paths {
        let candidate = dir.join(file);
        if candidate.exists() {
            return Some(std::fs::canonicalize(&candidate).unwrap_or(candidate));
        }
    }
    None
}

/// Joins `path` under `root`, keeping absolute paths inside the chroot.
/// With an empty root the path is returned unchanged.
pub fn chroot_join(root: &Path, path: &Path) -> PathBuf {
    if root.as_os_str().is_empty() {
        return path.to_path_buf();
    }
    match path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(path),
    }
}
