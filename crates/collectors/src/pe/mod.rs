//! PE collector: dependencies and metadata for Windows images.
//!
//! Import resolution order mirrors the loader's static view: the
//! side-by-side assembly map built from the image's own manifest, then
//! ApiSetSchema redirection for virtual DLLs, then the machine-matched
//! system caches, then the importing module's own directory. Whatever
//! stays unresolved is recorded under a `./` sentinel so the graph can
//! fold it onto the real file when a later scan finds one.

pub mod apiset;
pub mod decoder;
pub mod resources;

use crate::env::{self, chroot_join, Env};
use crate::CollectorError;
use binmap_common::MetadataInfo;
use self::decoder::PeDecoder;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::warn;

fn is_apiset_name(name: &str) -> bool {
    name.starts_with("api-ms-win-") || name.starts_with("ext-ms-win-")
}

pub struct PeCollector {
    path: PathBuf,
    decoder: PeDecoder,
    /// filename -> full path of every file in the WinSxS directories the
    /// manifest selected; consulted before the system caches.
    assembly_map: HashMap<String, PathBuf>,
}

impl PeCollector {
    /// Accepts non-symlink files with valid DOS/NT headers on a supported
    /// machine.
    pub fn initialize(path: &Path, env: &Env) -> Option<PeCollector> {
        if path.symlink_metadata().ok()?.file_type().is_symlink() {
            return None;
        }
        let bytes = std::fs::read(path).ok()?;
        if bytes.len() < 2 || &bytes[..2] != b"MZ" {
            return None;
        }
        let decoder = PeDecoder::parse(&bytes).ok()?;
        let mut collector = PeCollector {
            path: path.to_path_buf(),
            decoder,
            assembly_map: HashMap::new(),
        };
        collector.load_assembly_map(env);
        Some(collector)
    }

    /// Builds the WinSxS assembly map from the embedded manifest.
    fn load_assembly_map(&mut self, env: &Env) {
        let manifest = match resources::manifest_bytes(&self.decoder) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                warn!("{}: resource walk failed: {e}", self.path.display());
                return;
            }
        };
        let xml = String::from_utf8_lossy(&manifest);
        let identities = match resources::parse_manifest(&xml) {
            Ok(identities) => identities,
            Err(e) => {
                warn!("{}: unparsable manifest: {e}", self.path.display());
                return;
            }
        };
        for identity in identities {
            let Some(dir) = resources::winsxs_directory_for(
                &identity,
                self.decoder.machine(),
                env.windows().winsxs_dirs(),
            ) else {
                warn!(
                    "{}: no WinSxS directory satisfies {} {}",
                    self.path.display(),
                    identity.name,
                    identity.version
                );
                continue;
            };
            for file in env::windows::list_files(&dir) {
                if let Some(name) = file.file_name() {
                    self.assembly_map
                        .insert(name.to_string_lossy().to_lowercase(), file.clone());
                }
            }
        }
    }

    pub fn dependencies(&mut self, env: &Env) -> Result<BTreeSet<PathBuf>, CollectorError> {
        let mut deps = BTreeSet::new();

        if !self.decoder.has_import_table() {
            let filename = self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !is_apiset_name(&filename) {
                // modules without imports exist; virtual ApiSet DLLs are
                // the expected case here
                warn!("module {} has no import table", self.path.display());
            }
            return Ok(deps);
        }

        for module in self.decoder.import_modules().to_vec() {
            self.push_dependency(&module, env, &mut deps);
        }
        for delayed in self.decoder.delay_imports()? {
            self.push_dependency(&delayed.module, env, &mut deps);
        }
        Ok(deps)
    }

    fn push_dependency(&self, module: &str, env: &Env, deps: &mut BTreeSet<PathBuf>) {
        match self.find_module_path(module, env) {
            Some(path) => {
                deps.insert(path);
            }
            None => {
                warn!(
                    "couldn't find full path for module {module} imported by {}",
                    self.path.display()
                );
                deps.insert(chroot_join(env.root(), &Path::new(".").join(module)));
            }
        }
    }

    /// Static rendition of the DLL search: WinSxS assembly map, ApiSet
    /// redirection, machine-matched system cache, importer's directory.
    fn find_module_path(&self, module: &str, env: &Env) -> Option<PathBuf> {
        let windows = env.windows();
        let machine = self.decoder.machine();

        if is_apiset_name(module) {
            let key = apiset::schema_key(module)?;
            let concrete = windows.apiset_cache().get(key)?;
            return windows.resolve_for_machine(concrete, machine);
        }
        if let Some(path) = self.assembly_map.get(module) {
            return Some(path.clone());
        }
        if let Some(path) = windows.resolve_for_machine(module, machine) {
            return Some(path);
        }
        let parent = self.path.parent()?;
        env::which(&[parent.to_path_buf()], Path::new(module))
    }

    pub fn metadata(&mut self, info: &mut MetadataInfo) {
        info.imported_symbols
            .extend(self.decoder.imported_symbols().iter().cloned());
        match self.decoder.delay_imports() {
            Ok(delayed) => {
                for entry in delayed {
                    info.imported_symbols.extend(entry.symbols);
                }
            }
            Err(e) => warn!("{}: delay import walk failed: {e}", self.path.display()),
        }
        info.exported_symbols
            .extend(self.decoder.exported_symbols().iter().cloned());
        self.decoder.hardening(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::PeFixture;
    use binmap_common::{HardeningFeature, Hash};
    use std::fs;

    fn windows_image() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("windows/system32")).unwrap();
        fs::write(tmp.path().join("windows/system32/kernel32.dll"), b"k32").unwrap();
        tmp
    }

    fn write_pe(dir: &Path, name: &str, fixture: &PeFixture) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, fixture.build()).unwrap();
        path
    }

    #[test]
    fn test_initialize_rejects_non_pe() {
        let tmp = windows_image();
        let env = Env::initialize_all(tmp.path());
        let path = tmp.path().join("not-a-pe.txt");
        fs::write(&path, b"plain text").unwrap();
        assert!(PeCollector::initialize(&path, &env).is_none());
    }

    #[test]
    fn test_resolved_import_uses_system_cache() {
        let tmp = windows_image();
        let env = Env::initialize_all(tmp.path());
        let path = write_pe(tmp.path(), "app.exe", &PeFixture::importing(&["KERNEL32.dll"]));

        let mut collector = PeCollector::initialize(&path, &env).unwrap();
        let deps = collector.dependencies(&env).unwrap();
        assert_eq!(deps.len(), 1);
        let dep = deps.iter().next().unwrap();
        assert!(dep.ends_with("windows/system32/kernel32.dll"), "got {dep:?}");
    }

    #[test]
    fn test_unresolved_import_gets_sentinel_path() {
        let tmp = windows_image();
        let env = Env::initialize_all(tmp.path());
        let path = write_pe(tmp.path(), "app.exe", &PeFixture::importing(&["missing.dll"]));

        let mut collector = PeCollector::initialize(&path, &env).unwrap();
        let deps = collector.dependencies(&env).unwrap();
        assert_eq!(deps.len(), 1);
        let dep = deps.iter().next().unwrap().to_string_lossy().into_owned();
        assert!(dep.ends_with("./missing.dll"), "got {dep}");
    }

    #[test]
    fn test_import_from_own_directory() {
        let tmp = windows_image();
        let env = Env::initialize_all(tmp.path());
        let app_dir = tmp.path().join("apps");
        fs::create_dir_all(&app_dir).unwrap();
        fs::write(app_dir.join("helper.dll"), b"helper").unwrap();
        let path = write_pe(&app_dir, "app.exe", &PeFixture::importing(&["helper.dll"]));

        let mut collector = PeCollector::initialize(&path, &env).unwrap();
        let deps = collector.dependencies(&env).unwrap();
        assert_eq!(deps.len(), 1);
        assert!(deps.iter().next().unwrap().ends_with("apps/helper.dll"));
    }

    #[test]
    fn test_metadata_symbols_and_hardening() {
        let tmp = windows_image();
        let env = Env::initialize_all(tmp.path());
        let fixture = PeFixture {
            dll_characteristics: 0x100 | 0x40,
            delay_imports: vec![(
                "comctl32.dll".to_string(),
                vec!["InitCommonControls".to_string()],
            )],
            ..PeFixture::importing(&["kernel32.dll"])
        };
        let path = write_pe(tmp.path(), "app.exe", &fixture);

        let mut collector = PeCollector::initialize(&path, &env).unwrap();
        let mut info = MetadataInfo::new(Hash::of_path(&path));
        collector.metadata(&mut info);

        assert!(info.imported_symbols.contains("Func0"));
        assert!(info.imported_symbols.contains("InitCommonControls"));
        assert!(info.hardening_features.contains(&HardeningFeature::PeNxCompat));
        assert!(info
            .hardening_features
            .contains(&HardeningFeature::PeDynamicBase));
    }

    #[test]
    fn test_delay_import_module_is_a_dependency() {
        let tmp = windows_image();
        let env = Env::initialize_all(tmp.path());
        fs::write(tmp.path().join("windows/system32/comctl32.dll"), b"cc").unwrap();
        let fixture = PeFixture {
            delay_imports: vec![("comctl32.dll".to_string(), vec![])],
            ..PeFixture::importing(&["kernel32.dll"])
        };
        let path = write_pe(tmp.path(), "app.exe", &fixture);

        let mut collector = PeCollector::initialize(&path, &env).unwrap();
        let deps = collector.dependencies(&env).unwrap();
        assert!(deps
            .iter()
            .any(|d| d.ends_with("windows/system32/comctl32.dll")));
    }

    #[test]
    fn test_apiset_import_resolves_to_concrete_dll() {
        use crate::pe::apiset::test_support::apiset_v4;

        let tmp = windows_image();
        fs::write(tmp.path().join("windows/system32/kernelbase.dll"), b"kb").unwrap();
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

        let env = Env::initialize_all(tmp.path());
        let path = write_pe(
            tmp.path(),
            "app.exe",
            &PeFixture::importing(&["api-ms-win-core-console-l1-1-0.dll"]),
        );
        let mut collector = PeCollector::initialize(&path, &env).unwrap();
        let deps = collector.dependencies(&env).unwrap();
        assert_eq!(deps.len(), 1);
        let dep = deps.iter().next().unwrap();
        assert!(
            dep.ends_with("windows/system32/kernelbase.dll"),
            "virtual dll must resolve to its implementation, got {dep:?}"
        );
    }

    #[test]
    fn test_winsxs_manifest_redirection_wins_over_system32() {
        let tmp = windows_image();
        // comctl32 exists both in system32 and in a WinSxS assembly
        fs::write(tmp.path().join("windows/system32/comctl32.dll"), b"old").unwrap();
        let sxs = tmp.path().join(
            "windows/winsxs/amd64_microsoft.windows.common-controls_6595b64144ccf1df_6.0.9600.16384_none_a9f4965301334e09",
        );
        fs::create_dir_all(&sxs).unwrap();
        fs::write(sxs.join("comctl32.dll"), b"new").unwrap();

        let env = Env::initialize_all(tmp.path());
        let manifest = r#"<assembly xmlns="urn:schemas-microsoft-com:asm.v1" manifestVersion="1.0">
  <dependency><dependentAssembly>
    <assemblyIdentity type="win32" name="Microsoft.Windows.Common-Controls"
      version="6.0.0.0" processorArchitecture="*"
      publicKeyToken="6595b64144ccf1df" language="*"/>
  </dependentAssembly></dependency>
</assembly>"#;
        let fixture = PeFixture {
            manifest: Some(manifest.to_string()),
            ..PeFixture::importing(&["comctl32.dll"])
        };
        let path = write_pe(tmp.path(), "app.exe", &fixture);

        let mut collector = PeCollector::initialize(&path, &env).unwrap();
        let deps = collector.dependencies(&env).unwrap();
        assert_eq!(deps.len(), 1);
        let dep = deps.iter().next().unwrap();
        assert!(
            dep.to_string_lossy().contains("winsxs"),
            "expected the WinSxS copy, got {dep:?}"
        );
    }
}
