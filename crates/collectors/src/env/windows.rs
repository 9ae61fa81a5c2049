//! PE shared-library resolver: system folders, WoW64, WinSxS, ApiSetSchema.
//!
//! Windows resolution is cache-driven: at initialization the system
//! directories are enumerated once into lowercase basename -> path maps.
//! A 64-bit layout additionally gets a `syswow64` cache (consulted for
//! 32-bit images) and the ApiSetSchema redirections are lifted out of
//! `apisetschema.dll`. All comparisons are lowercase; the filesystem under
//! scan is a case-insensitive one.

use super::Resolver;
use crate::pe::apiset;
use crate::pe::decoder::Machine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

const WINDOWS_FOLDER: &str = "windows";
const SYSTEM_FOLDER: &str = "system";
const SYSTEM32_FOLDER: &str = "system32";
const SYSWOW64_FOLDER: &str = "syswow64";
const WINSXS_FOLDER: &str = "winsxs";

pub struct WindowsResolver {
    system_disk: PathBuf,
    system_folder: PathBuf,
    syswow64: Option<PathBuf>,
    winsxs: Option<PathBuf>,
    winsxs_dirs: Vec<PathBuf>,
    cache_default: HashMap<String, PathBuf>,
    cache_syswow64: HashMap<String, PathBuf>,
    cache_apiset: HashMap<String, String>,
    default_paths: Vec<PathBuf>,
}

impl WindowsResolver {
    pub fn initialize(root: &Path) -> Self {
        let mut resolver = WindowsResolver {
            system_disk: PathBuf::new(),
            system_folder: PathBuf::new(),
            syswow64: None,
            winsxs: None,
            winsxs_dirs: Vec::new(),
            cache_default: HashMap::new(),
            cache_syswow64: HashMap::new(),
            cache_apiset: HashMap::new(),
            default_paths: Vec::new(),
        };
        resolver.find_system_folder(root);
        if resolver.system_folder.as_os_str().is_empty() {
            // nothing Windows-shaped here; PE imports will stay unresolved
            return resolver;
        }

        let windows = resolver.system_disk.join(WINDOWS_FOLDER);

        let winsxs = windows.join(WINSXS_FOLDER);
        if winsxs.is_dir() {
            resolver.winsxs_dirs = list_dirs(&winsxs);
            resolver.winsxs = Some(winsxs);
        }

        resolver.default_paths = vec![
            windows.join(SYSTEM32_FOLDER),
            windows.join(SYSTEM_FOLDER),
            windows.clone(),
            resolver.system_disk.clone(),
        ];
        for dir in resolver.default_paths.clone() {
            fill_dll_cache(&dir, &mut resolver.cache_default);
        }

        if let Some(syswow64) = resolver.syswow64.clone() {
            fill_dll_cache(&syswow64, &mut resolver.cache_syswow64);
        }

        let apisetschema = windows.join(SYSTEM32_FOLDER).join("apisetschema.dll");
        if apisetschema.exists() {
            match load_apiset_cache(&apisetschema) {
                Ok(cache) => resolver.cache_apiset = cache,
                Err(e) => warn!("unusable apisetschema at {}: {e}", apisetschema.display()),
            }
        }

        resolver
    }

    fn find_system_folder(&mut self, root: &Path) {
        if root.as_os_str().is_empty() {
            // live system: probe drive letters, common ones first; A: and
            // B: last since they may sit behind slow removable readers
            let mut letters: Vec<char> = ('C'..='Z').collect();
            letters.extend(['A', 'B']);
            for letter in letters {
                let drive = PathBuf::from(format!("{letter}:\\"));
                let candidate = drive.join(WINDOWS_FOLDER).join(SYSTEM32_FOLDER);
                if candidate.exists() {
                    self.system_disk = drive;
                    self.system_folder = candidate;
                    break;
                }
            }
        } else {
            let candidate = root.join(WINDOWS_FOLDER).join(SYSTEM32_FOLDER);
            if candidate.exists() {
                self.system_disk = root.to_path_buf();
                self.system_folder = candidate;
            }
        }

        if !self.system_disk.as_os_str().is_empty() {
            let syswow64 = self
                .system_disk
                .join(WINDOWS_FOLDER)
                .join(SYSWOW64_FOLDER);
            if syswow64.exists() {
                self.syswow64 = Some(syswow64);
            }
        }
    }

    /// Resolves through the cache matching the importing image's machine:
    /// 32-bit images on a 64-bit layout get the WoW64 view.
    pub fn resolve_for_machine(&self, basename: &str, machine: Machine) -> Option<PathBuf> {
        let cache = match machine {
            Machine::I386 if self.has_wow64() => &self.cache_syswow64,
            Machine::I386 | Machine::Amd64 => &self.cache_default,
        };
        cache.get(&basename.to_lowercase()).cloned()
    }

    pub fn has_wow64(&self) -> bool {
        self.syswow64.is_some()
    }

    pub fn winsxs(&self) -> Option<&Path> {
        self.winsxs.as_deref()
    }

    pub fn winsxs_dirs(&self) -> &[PathBuf] {
        &self.winsxs_dirs
    }

    pub fn apiset_cache(&self) -> &HashMap<String, String> {
        &self.cache_apiset
    }

    pub fn system_folder(&self) -> &Path {
        &self.system_folder
    }
}

impl Resolver for WindowsResolver {
    fn resolve(&self, basename: &str) -> Option<PathBuf> {
        self.cache_default.get(&basename.to_lowercase()).cloned()
    }

    fn default_paths(&self) -> &[PathBuf] {
        &self.default_paths
    }
}

/// Registers every `.dll` directly inside `dir` under its lowercase name.
fn fill_dll_cache(dir: &Path, cache: &mut HashMap<String, PathBuf>) {
    if !dir.is_dir() {
        return;
    }
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .flatten()
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if name.ends_with(".dll") {
            cache.entry(name).or_insert_with(|| entry.path().to_path_buf());
        }
    }
}

/// All immediate subdirectories of `dir`.
fn list_dirs(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// All files directly inside `dir`.
pub fn list_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect()
}

fn load_apiset_cache(path: &Path) -> Result<HashMap<String, String>, crate::CollectorError> {
    let bytes = std::fs::read(path)?;
    let decoder = crate::pe::decoder::PeDecoder::parse(&bytes)?;
    let section = decoder
        .section_bytes(".apiset")
        .ok_or_else(|| crate::CollectorError::format("apiset", "no .apiset section"))?;
    apiset::parse_apiset(section)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_image() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let system32 = tmp.path().join("windows/system32");
        fs::create_dir_all(&system32).unwrap();
        fs::write(system32.join("Kernel32.DLL"), b"k32").unwrap();
        fs::write(system32.join("ntdll.dll"), b"nt").unwrap();
        fs::write(system32.join("notadll.txt"), b"x").unwrap();
        tmp
    }

    #[test]
    fn test_system_folder_under_root() {
        let tmp = fake_image();
        let resolver = WindowsResolver::initialize(tmp.path());
        assert_eq!(resolver.system_folder(), tmp.path().join("windows/system32"));
        assert!(!resolver.has_wow64());
    }

    #[test]
    fn test_cache_is_lowercase_and_dll_only() {
        let tmp = fake_image();
        let resolver = WindowsResolver::initialize(tmp.path());
        let hit = resolver.resolve("KERNEL32.dll").unwrap();
        assert!(hit.ends_with("Kernel32.DLL"));
        assert!(resolver.resolve("notadll.txt").is_none());
    }

    #[test]
    fn test_wow64_cache_serves_i386() {
        let tmp = fake_image();
        let syswow64 = tmp.path().join("windows/syswow64");
        fs::create_dir_all(&syswow64).unwrap();
        fs::write(syswow64.join("kernel32.dll"), b"k32-32").unwrap();

        let resolver = WindowsResolver::initialize(tmp.path());
        assert!(resolver.has_wow64());

        let for_32 = resolver
            .resolve_for_machine("kernel32.dll", Machine::I386)
            .unwrap();
        assert!(for_32.starts_with(&syswow64));
        let for_64 = resolver
            .resolve_for_machine("kernel32.dll", Machine::Amd64)
            .unwrap();
        assert!(for_64.starts_with(tmp.path().join("windows/system32")));
    }

    #[test]
    fn test_winsxs_dirs_listed() {
        let tmp = fake_image();
        let winsxs = tmp.path().join("windows/winsxs");
        fs::create_dir_all(winsxs.join("x86_something_token_1.0.0.0_none_abc")).unwrap();
        let resolver = WindowsResolver::initialize(tmp.path());
        assert_eq!(resolver.winsxs_dirs().len(), 1);
    }

    #[test]
    fn test_no_windows_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = WindowsResolver::initialize(tmp.path());
        assert!(resolver.resolve("kernel32.dll").is_none());
        assert!(resolver.default_paths().is_empty());
    }

    #[test]
    fn test_apiset_cache_from_schema_dll() {
        use crate::fixtures::PeFixture;
        use crate::pe::apiset::test_support::apiset_v4;

        let tmp = fake_image();
        let schema = PeFixture {
            extra_section: Some((
                ".apiset".to_string(),
                apiset_v4(&[("ms-win-core-console-l1-1-0", "kernelbase.dll")]),
            )),
            ..Default::default()
        };
        fs::write(
            tmp.path().join("windows/system32/apisetschema.dll"),
            schema.build(),
        )
        .unwrap();

        let resolver = WindowsResolver::initialize(tmp.path());
        assert_eq!(
            resolver.apiset_cache().get("ms-win-core-console-l1-1-0"),
            Some(&"kernelbase.dll".to_string())
        );
    }
}
