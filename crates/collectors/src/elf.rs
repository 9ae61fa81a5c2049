//! ELF collector: dependencies and metadata for Unix binaries.
//!
//! DT_NEEDED resolution follows the dynamic loader's documented order:
//! DT_RPATH (only without DT_RUNPATH), then DT_RUNPATH, then the
//! ld.so.cache, then the default directories. LD_LIBRARY_PATH is
//! deliberately not consulted: the scan is static and the variable
//! belongs to whoever ran it, not to the image under analysis.

use crate::env::{chroot_join, which, Env, Resolver};
use crate::version::VersionScanner;
use crate::CollectorError;
use binmap_common::{HardeningFeature, MetadataInfo};
use goblin::elf::dynamic::{DF_BIND_NOW, DT_BIND_NOW, DT_FLAGS};
use goblin::elf::header::ET_DYN;
use goblin::elf::program_header::{PT_GNU_RELRO, PT_PHDR};
use goblin::elf::section_header::{SHT_DYNSYM, SHT_PROGBITS, SHT_SYMTAB};
use goblin::elf::sym::{STB_GLOBAL, STB_WEAK};
use goblin::elf::Elf;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;

static SUFFIX_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+)*$").expect("suffix version regex"));
static FORTIFIED_SYMBOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^__.*chk(@.*)?$").expect("fortified symbol regex"));

pub struct ElfCollector {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl ElfCollector {
    /// Accepts non-symlink files goblin recognizes as ELF.
    pub fn initialize(path: &Path) -> Option<ElfCollector> {
        if path.symlink_metadata().ok()?.file_type().is_symlink() {
            return None;
        }
        let bytes = std::fs::read(path).ok()?;
        Elf::parse(&bytes).ok()?;
        Some(ElfCollector {
            path: path.to_path_buf(),
            bytes,
        })
    }

    pub fn dependencies(&mut self, env: &Env) -> Result<BTreeSet<PathBuf>, CollectorError> {
        let elf = Elf::parse(&self.bytes)?;
        let mut deps = BTreeSet::new();

        // the interpreter is an implicit dependency of every dynamic binary
        if let Some(interp) = elf.interpreter {
            deps.insert(chroot_join(env.root(), Path::new(interp)));
        }

        let rpaths = self.search_dirs(&elf.rpaths, env);
        let runpaths = self.search_dirs(&elf.runpaths, env);
        let resolver = env.shared_library();

        for lib in &elf.libraries {
            let file = Path::new(lib);

            // 1. DT_RPATH, honored only while DT_RUNPATH is absent
            if runpaths.is_empty() && !rpaths.is_empty() {
                if let Some(path) = which(&rpaths, file) {
                    deps.insert(path);
                    continue;
                }
            }
            // 2. LD_LIBRARY_PATH: not implemented on purpose
            // 3. DT_RUNPATH
            if !runpaths.is_empty() {
                if let Some(path) = which(&runpaths, file) {
                    deps.insert(path);
                    continue;
                }
            }
            // 4. ld.so.cache
            if let Some(path) = resolver.resolve(lib) {
                deps.insert(path);
                continue;
            }
            // 5. default directories
            if let Some(path) = which(resolver.default_paths(), file) {
                deps.insert(path);
            } else {
                // keep the unresolved name as a placeholder dependency
                deps.insert(PathBuf::from(lib));
            }
        }
        Ok(deps)
    }

    /// Splits `:`-separated rpath/runpath strings, substitutes `$ORIGIN`,
    /// and reroots each entry under the chroot.
    fn search_dirs(&self, raw: &[&str], env: &Env) -> Vec<PathBuf> {
        let origin = self
            .path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        raw.iter()
            .flat_map(|entry| entry.split(':'))
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let substituted = entry.replace("$ORIGIN", &origin);
                chroot_join(env.root(), Path::new(&substituted))
            })
            .collect()
    }

    pub fn metadata(&mut self, info: &mut MetadataInfo) -> Result<(), CollectorError> {
        let elf = Elf::parse(&self.bytes)?;

        let (canonical_name, version_hint) = canonical_name(&self.path);
        info.name = canonical_name.clone();

        let mut version = version_hint.unwrap_or_default();
        if let Some(from_suffix) = version_from_suffix(&self.path) {
            version = from_suffix;
        } else if let Some(from_sections) = self.version_from_sections(&elf, &canonical_name) {
            version = from_sections;
        }
        if version.is_empty() {
            warn!(
                "unable to find version for: {} as {canonical_name}",
                self.path.display()
            );
        }
        info.version = version;

        self.extract_symbols(&elf, info);
        self.extract_hardening(&elf, info);
        Ok(())
    }

    fn extract_symbols(&self, elf: &Elf, info: &mut MetadataInfo) {
        let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
        for (syms, strtab) in tables {
            for sym in syms.iter() {
                let Some(name) = strtab.get_at(sym.st_name) else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }
                if sym.st_shndx == 0 {
                    info.imported_symbols.insert(name.to_owned());
                } else if sym.st_bind() == STB_GLOBAL || sym.st_bind() == STB_WEAK {
                    info.exported_symbols.insert(name.to_owned());
                }
            }
        }
    }

    fn extract_hardening(&self, elf: &Elf, info: &mut MetadataInfo) {
        let has_phdr = elf
            .program_headers
            .iter()
            .any(|ph| ph.p_type == PT_PHDR);
        if elf.header.e_type == ET_DYN && has_phdr {
            info.hardening_features
                .insert(HardeningFeature::PositionIndependentExecutable);
        }
        if elf
            .program_headers
            .iter()
            .any(|ph| ph.p_type == PT_GNU_RELRO)
        {
            info.hardening_features
                .insert(HardeningFeature::ReadOnlyRelocations);
        }
        if let Some(dynamic) = &elf.dynamic {
            let bind_now = dynamic.dyns.iter().any(|d| {
                d.d_tag == DT_BIND_NOW || (d.d_tag == DT_FLAGS && d.d_val & DF_BIND_NOW != 0)
            });
            if bind_now {
                info.hardening_features
                    .insert(HardeningFeature::ImmediateBinding);
            }
        }
        symbol_hardening(info);
    }

    /// Scans every PROGBITS section for version strings; adopted only when
    /// exactly one distinct candidate shows up.
    fn version_from_sections(&self, elf: &Elf, canonical_name: &str) -> Option<String> {
        let scanner = VersionScanner::for_binary(canonical_name);
        let mut versions = BTreeSet::new();
        for header in &elf.section_headers {
            if header.sh_type != SHT_PROGBITS {
                continue;
            }
            let start = header.sh_offset as usize;
            let end = start + header.sh_size as usize;
            if let Some(bytes) = self.bytes.get(start..end) {
                scanner.scan(&mut versions, bytes);
            }
        }
        if versions.len() == 1 {
            versions.into_iter().next()
        } else {
            None
        }
    }
}

/// Hardening features readable off the imported-symbol set alone.
pub(crate) fn symbol_hardening(info: &mut MetadataInfo) {
    if info.imported_symbols.contains("__stack_chk_fail") {
        info.hardening_features
            .insert(HardeningFeature::StackProtected);
    }
    if info
        .imported_symbols
        .iter()
        .any(|s| FORTIFIED_SYMBOL.is_match(s))
    {
        info.hardening_features.insert(HardeningFeature::Fortified);
    }
}

/// Canonical name: filename with `.so` extensions stripped, lowercased;
/// a trailing `-<digits>[.<digits>]*` is split off as a version hint.
pub(crate) fn canonical_name(path: &Path) -> (String, Option<String>) {
    let mut basename = path.file_name().map(PathBuf::from).unwrap_or_default();
    while basename.extension().and_then(|e| e.to_str()) == Some("so") {
        basename = basename.file_stem().map(PathBuf::from).unwrap_or_default();
    }
    let mut name = basename.to_string_lossy().to_lowercase();

    let tail_start = name
        .rfind(|c: char| !c.is_ascii_digit() && c != '.')
        .map(|i| i + 1)
        .unwrap_or(0);
    if tail_start > 1 && name.as_bytes().get(tail_start - 1) == Some(&b'-') && tail_start < name.len()
    {
        let hint = name[tail_start..].to_owned();
        name.truncate(tail_start - 1);
        return (name, Some(hint));
    }
    (name, None)
}

/// Version taken from a `.so.<version>` naming scheme.
pub(crate) fn version_from_suffix(path: &Path) -> Option<String> {
    let name = path.to_string_lossy();
    let at = name.rfind(".so.")?;
    let suffix = &name[at + ".so.".len()..];
    SUFFIX_VERSION.is_match(suffix).then(|| suffix.to_owned())
}
