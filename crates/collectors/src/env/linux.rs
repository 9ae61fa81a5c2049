//! ELF shared-library resolver: ld.so.cache plus the default directories.
//!
//! The cache file exists in two formats. libc5/glibc 2.0 wrote
//! `ld.so-1.7.0` with 12-byte entries; glibc 2.2 introduced
//! `glibc-ld.so.cache1.1` with 24-byte entries, either standalone or
//! appended (8-byte aligned) after a legacy table. All three layouts are
//! handled, as the dynamic loader does.

use super::{chroot_join, Resolver};
use crate::CollectorError;
use scroll::Pread;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

const CACHEMAGIC: &[u8] = b"ld.so-1.7.0";
const CACHEMAGIC_NEW: &[u8] = b"glibc-ld.so.cache";
const CACHE_VERSION: &[u8] = b"1.1";

/// Legacy header: magic (padded to 12) + nlibs.
const OLD_HEADER_LEN: usize = 16;
/// Legacy entry: flags + key + value.
const OLD_ENTRY_LEN: usize = 12;
/// New header: magic + version + nlibs + len_strings + unused[5].
const NEW_HEADER_LEN: usize = 48;
/// New entry: flags + key + value + osversion + hwcap.
const NEW_ENTRY_LEN: usize = 24;

fn align_cache(offset: usize) -> usize {
    (offset + 7) & !7
}

fn read_cstr(bytes: &[u8], offset: usize) -> Option<&str> {
    let tail = bytes.get(offset..)?;
    let len = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..len]).ok()
}

/// Parses an ld.so.cache image into basename -> root-prefixed path.
pub fn parse_cache(
    bytes: &[u8],
    root: &Path,
) -> Result<HashMap<String, PathBuf>, CollectorError> {
    if bytes.len() >= CACHEMAGIC.len() && &bytes[..CACHEMAGIC.len()] == CACHEMAGIC {
        let nlibs = bytes.pread_with::<u32>(12, scroll::LE).map_err(bad)? as usize;
        let entries_end = OLD_HEADER_LEN + nlibs * OLD_ENTRY_LEN;

        // glibc 2.2 may embed the new table right after the old one
        let embedded = align_cache(entries_end);
        if bytes.len() > embedded + NEW_HEADER_LEN
            && bytes[embedded..].starts_with(CACHEMAGIC_NEW)
            && bytes[embedded + CACHEMAGIC_NEW.len()..].starts_with(CACHE_VERSION)
        {
            return parse_new_format(&bytes[embedded..], root);
        }
        return parse_old_format(bytes, nlibs, entries_end, root);
    }

    if bytes.starts_with(CACHEMAGIC_NEW)
        && bytes[CACHEMAGIC_NEW.len()..].starts_with(CACHE_VERSION)
    {
        return parse_new_format(bytes, root);
    }

    Err(CollectorError::format("ld.so.cache", "unrecognized magic"))
}

fn bad(e: scroll::Error) -> CollectorError {
    CollectorError::format("ld.so.cache", e.to_string())
}

fn parse_old_format(
    bytes: &[u8],
    nlibs: usize,
    strings_base: usize,
    root: &Path,
) -> Result<HashMap<String, PathBuf>, CollectorError> {
    let mut cache = HashMap::new();
    for i in 0..nlibs {
        let entry = OLD_HEADER_LEN + i * OLD_ENTRY_LEN;
        let key = bytes.pread_with::<u32>(entry + 4, scroll::LE).map_err(bad)? as usize;
        let value = bytes.pread_with::<u32>(entry + 8, scroll::LE).map_err(bad)? as usize;
        let (Some(name), Some(path)) = (
            read_cstr(bytes, strings_base + key),
            read_cstr(bytes, strings_base + value),
        ) else {
            warn!("ld.so.cache: entry {i} points outside the string table");
            continue;
        };
        cache.insert(name.to_owned(), chroot_join(root, Path::new(path)));
    }
    Ok(cache)
}

fn parse_new_format(
    bytes: &[u8],
    root: &Path,
) -> Result<HashMap<String, PathBuf>, CollectorError> {
    let nlibs = bytes.pread_with::<u32>(20, scroll::LE).map_err(bad)? as usize;
    let mut cache = HashMap::new();
    for i in 0..nlibs {
        let entry = NEW_HEADER_LEN + i * NEW_ENTRY_LEN;
        let key = bytes.pread_with::<u32>(entry + 4, scroll::LE).map_err(bad)? as usize;
        let value = bytes.pread_with::<u32>(entry + 8, scroll::LE).map_err(bad)? as usize;
        // string offsets are relative to the new header itself
        let (Some(name), Some(path)) = (read_cstr(bytes, key), read_cstr(bytes, value)) else {
            warn!("ld.so.cache: entry {i} points outside the string table");
            continue;
        };
        cache.insert(name.to_owned(), chroot_join(root, Path::new(path)));
    }
    Ok(cache)
}

/// Resolver backed by the image's ld.so.cache and default directories.
pub struct SharedLibraryResolver {
    cache: HashMap<String, PathBuf>,
    default_paths: Vec<PathBuf>,
}

impl SharedLibraryResolver {
    pub fn initialize(root: &Path) -> Self {
        let cache_path = chroot_join(root, Path::new("/etc/ld.so.cache"));
        let cache = if cache_path.exists() {
            match std::fs::read(&cache_path)
                .map_err(CollectorError::from)
                .and_then(|bytes| parse_cache(&bytes, root))
            {
                Ok(cache) => cache,
                Err(e) => {
                    warn!("unusable ld.so.cache at {}: {e}", cache_path.display());
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let default_paths = ["/lib", "/usr/lib", "/system/lib"]
            .iter()
            .map(|p| chroot_join(root, Path::new(p)))
            .filter(|p| p.exists())
            .collect();

        SharedLibraryResolver {
            cache,
            default_paths,
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

impl Resolver for SharedLibraryResolver {
    fn resolve(&self, basename: &str) -> Option<PathBuf> {
        self.cache.get(basename).cloned()
    }

    fn default_paths(&self) -> &[PathBuf] {
        &self.default_paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{new_format_cache, old_format_cache};

    #[test]
    fn test_parse_new_format() {
        let bytes = new_format_cache(&[
            ("libc.so.6", "/lib/x86_64-linux-gnu/libc.so.6"),
            ("libm.so.6", "/lib/x86_64-linux-gnu/libm.so.6"),
        ]);
        let cache = parse_cache(&bytes, Path::new("")).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache["libc.so.6"],
            PathBuf::from("/lib/x86_64-linux-gnu/libc.so.6")
        );
    }

    #[test]
    fn test_parse_new_format_applies_root() {
        let bytes = new_format_cache(&[("libc.so.6", "/lib/libc.so.6")]);
        let cache = parse_cache(&bytes, Path::new("/image")).unwrap();
        assert_eq!(cache["libc.so.6"], PathBuf::from("/image/lib/libc.so.6"));
    }

    #[test]
    fn test_parse_old_format() {
        let bytes = old_format_cache(&[("libdl.so.2", "/lib/libdl.so.2")]);
        let cache = parse_cache(&bytes, Path::new("")).unwrap();
        assert_eq!(cache["libdl.so.2"], PathBuf::from("/lib/libdl.so.2"));
    }

    #[test]
    fn test_parse_embedded_new_format() {
        // legacy header with zero legacy entries, new table appended at
        // the 8-byte aligned offset
        let mut bytes = old_format_cache(&[]);
        while bytes.len() % 8 != 0 {
            bytes.push(0);
        }
        bytes.extend_from_slice(&new_format_cache(&[("libz.so.1", "/usr/lib/libz.so.1")]));
        let cache = parse_cache(&bytes, Path::new("")).unwrap();
        assert_eq!(cache["libz.so.1"], PathBuf::from("/usr/lib/libz.so.1"));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_cache(b"not a cache at all", Path::new("")).is_err());
    }

    #[test]
    fn test_resolver_default_paths_exist() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("lib")).unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(
            tmp.path().join("etc/ld.so.cache"),
            new_format_cache(&[("libc.so.6", "/lib/libc.so.6")]),
        )
        .unwrap();

        let resolver = SharedLibraryResolver::initialize(tmp.path());
        assert_eq!(resolver.default_paths().len(), 1);
        assert_eq!(
            resolver.resolve("libc.so.6"),
            Some(tmp.path().join("lib/libc.so.6"))
        );
        assert!(resolver.resolve("libnope.so").is_none());
    }
}
