//! Resource directory walking, manifest extraction and WinSxS resolution.
//!
//! The resource tree nests directories three deep for a manifest:
//! type (RT_MANIFEST = 24) -> name/id -> language -> data entry. Entry
//! words use their MSB to distinguish named entries from ids and
//! subdirectories from data entries. The manifest itself is XML whose
//! `<assemblyIdentity>` dependencies are matched against the WinSxS
//! directory naming scheme `arch_name_token_version_culture_hash`.

use crate::pe::decoder::{Machine, PeDecoder};
use crate::CollectorError;
use scroll::Pread;
use std::path::{Path, PathBuf};
use tracing::warn;

const RT_MANIFEST: u32 = 24;
const DIR_HEADER_LEN: usize = 16;
const DIR_ENTRY_LEN: usize = 8;
const HIGH_BIT: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy)]
struct DirEntry {
    id: u32,
    offset: u32,
}

impl DirEntry {
    fn is_named(&self) -> bool {
        self.id & HIGH_BIT != 0
    }

    fn is_directory(&self) -> bool {
        self.offset & HIGH_BIT != 0
    }

    fn target(&self) -> usize {
        (self.offset & !HIGH_BIT) as usize
    }
}

fn bad(e: scroll::Error) -> CollectorError {
    CollectorError::format("pe resources", e.to_string())
}

fn read_entries(section: &[u8], dir_offset: usize) -> Result<Vec<DirEntry>, CollectorError> {
    let named = section
        .pread_with::<u16>(dir_offset + 12, scroll::LE)
        .map_err(bad)? as usize;
    let ids = section
        .pread_with::<u16>(dir_offset + 14, scroll::LE)
        .map_err(bad)? as usize;
    let mut entries = Vec::with_capacity(named + ids);
    for i in 0..named + ids {
        let at = dir_offset + DIR_HEADER_LEN + i * DIR_ENTRY_LEN;
        entries.push(DirEntry {
            id: section.pread_with::<u32>(at, scroll::LE).map_err(bad)?,
            offset: section.pread_with::<u32>(at + 4, scroll::LE).map_err(bad)?,
        });
    }
    Ok(entries)
}

fn first_entry(
    section: &[u8],
    entry: DirEntry,
) -> Result<Option<(DirEntry, usize)>, CollectorError> {
    if !entry.is_directory() {
        return Ok(None);
    }
    let entries = read_entries(section, entry.target())?;
    let count = entries.len();
    Ok(entries.into_iter().next().map(|e| (e, count)))
}

/// Extracts the embedded manifest XML, if the image carries one.
pub fn manifest_bytes(decoder: &PeDecoder) -> Result<Option<Vec<u8>>, CollectorError> {
    let Some((rva, size)) = decoder.resource_dir() else {
        return Ok(None);
    };
    let offset = decoder
        .rva_to_offset(rva)
        .ok_or_else(|| CollectorError::format("pe resources", "resource table outside sections"))?;
    let section = decoder
        .read_bytes(offset, size)
        .ok_or_else(|| CollectorError::format("pe resources", "truncated resource section"))?;

    let Some(manifest_entry) = read_entries(section, 0)?
        .into_iter()
        .find(|e| !e.is_named() && e.id == RT_MANIFEST)
    else {
        return Ok(None);
    };
    if !manifest_entry.is_directory() {
        warn!("RT_MANIFEST entry does not lead to a directory");
        return Ok(None);
    }

    let Some((sub, count)) = first_entry(section, manifest_entry)? else {
        warn!("RT_MANIFEST directory is empty");
        return Ok(None);
    };
    if count > 1 {
        warn!("more than one sub-entry under RT_MANIFEST, using the first");
    }
    let Some((sub_sub, count)) = first_entry(section, sub)? else {
        warn!("RT_MANIFEST name directory is empty");
        return Ok(None);
    };
    if count > 1 {
        warn!("more than one language entry under RT_MANIFEST, using the first");
    }
    if sub_sub.is_directory() {
        warn!("RT_MANIFEST language entry does not lead to data");
        return Ok(None);
    }

    // data entry: OffsetToData is an RVA into the image
    let data_at = sub_sub.target();
    let data_rva = section.pread_with::<u32>(data_at, scroll::LE).map_err(bad)?;
    let data_size = section
        .pread_with::<u32>(data_at + 4, scroll::LE)
        .map_err(bad)?;
    let data_offset = decoder
        .rva_to_offset(data_rva)
        .ok_or_else(|| CollectorError::format("pe resources", "manifest data outside sections"))?;
    let bytes = decoder
        .read_bytes(data_offset, data_size)
        .ok_or_else(|| CollectorError::format("pe resources", "truncated manifest data"))?;
    Ok(Some(bytes.to_vec()))
}

/// One `<assemblyIdentity>` from a `<dependentAssembly>` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyIdentity {
    pub kind: String,
    pub name: String,
    pub version: String,
    pub processor_architecture: String,
    pub public_key_token: String,
    pub language: String,
}

/// Parses the manifest XML into its declared assembly dependencies.
pub fn parse_manifest(xml: &str) -> Result<Vec<AssemblyIdentity>, CollectorError> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| CollectorError::format("manifest", e.to_string()))?;
    let mut identities = Vec::new();
    for dependency in doc
        .root_element()
        .children()
        .filter(|n| n.has_tag_name("dependency"))
    {
        for dependent in dependency
            .children()
            .filter(|n| n.has_tag_name("dependentAssembly"))
        {
            for identity in dependent
                .children()
                .filter(|n| n.has_tag_name("assemblyIdentity"))
            {
                let required = |attr: &str| identity.attribute(attr).map(str::to_owned);
                let (Some(kind), Some(name), Some(version), Some(token)) = (
                    required("type"),
                    required("name"),
                    required("version"),
                    required("publicKeyToken"),
                ) else {
                    warn!("assemblyIdentity with missing required attributes, skipped");
                    continue;
                };
                identities.push(AssemblyIdentity {
                    kind,
                    name,
                    version,
                    public_key_token: token,
                    processor_architecture: identity
                        .attribute("processorArchitecture")
                        .unwrap_or_default()
                        .to_owned(),
                    language: identity.attribute("language").unwrap_or_default().to_owned(),
                });
            }
        }
    }
    Ok(identities)
}

/// Four-component assembly version, ordered numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AssemblyVersion([u32; 4]);

impl AssemblyVersion {
    /// Parses `major.minor.build.revision`; all four parts are required.
    pub fn parse(version: &str) -> Option<AssemblyVersion> {
        let parts: Vec<&str> = version.split('.').collect();
        if parts.len() != 4 {
            return None;
        }
        let mut out = [0u32; 4];
        for (slot, part) in out.iter_mut().zip(parts) {
            *slot = part.parse().ok()?;
        }
        Some(AssemblyVersion(out))
    }

    /// Version component of a WinSxS directory name
    /// (`arch_name_token_version_culture_hash`).
    pub fn from_dir_name(dir: &Path) -> Option<AssemblyVersion> {
        let name = dir.file_name()?.to_str()?;
        let parts: Vec<&str> = name.split('_').collect();
        if parts.len() != 6 {
            return None;
        }
        Self::parse(parts[3])
    }
}

/// Picks the WinSxS directory satisfying `identity`: among directories
/// matching `arch_name_token`, the smallest version not below the
/// requested one.
pub fn winsxs_directory_for(
    identity: &AssemblyIdentity,
    machine: Machine,
    winsxs_dirs: &[PathBuf],
) -> Option<PathBuf> {
    let arch = match identity.processor_architecture.as_str() {
        "" | "*" => match machine {
            Machine::I386 => "x86",
            Machine::Amd64 => "amd64",
        },
        explicit => explicit,
    };
    let prefix = format!("{arch}_{}_{}", identity.name, identity.public_key_token).to_lowercase();

    let mut candidates: Vec<(AssemblyVersion, &PathBuf)> = winsxs_dirs
        .iter()
        .filter(|dir| {
            dir.file_name()
                .map(|n| n.to_string_lossy().to_lowercase().starts_with(&prefix))
                .unwrap_or(false)
        })
        .filter_map(|dir| AssemblyVersion::from_dir_name(dir).map(|v| (v, dir)))
        .collect();
    candidates.sort_by_key(|(v, _)| *v);

    let requested = AssemblyVersion::parse(&identity.version)?;
    candidates
        .into_iter()
        .find(|(v, _)| *v >= requested)
        .map(|(_, dir)| dir.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::PeFixture;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<assembly xmlns="urn:schemas-microsoft-com:asm.v1" manifestVersion="1.0">
  <dependency>
    <dependentAssembly>
      <assemblyIdentity type="win32" name="Microsoft.Windows.Common-Controls"
        version="6.0.0.0" processorArchitecture="*"
        publicKeyToken="6595b64144ccf1df" language="*"/>
    </dependentAssembly>
  </dependency>
</assembly>"#;

    #[test]
    fn test_manifest_extraction_from_resources() {
        let bytes = PeFixture {
            manifest: Some(MANIFEST.to_string()),
            ..Default::default()
        }
        .build();
        let decoder = PeDecoder::parse(&bytes).unwrap();
        let extracted = manifest_bytes(&decoder).unwrap().unwrap();
        assert_eq!(extracted, MANIFEST.as_bytes());
    }

    #[test]
    fn test_no_resource_section_yields_none() {
        let bytes = PeFixture::default().build();
        let decoder = PeDecoder::parse(&bytes).unwrap();
        assert!(manifest_bytes(&decoder).unwrap().is_none());
    }

    #[test]
    fn test_parse_manifest_identities() {
        let identities = parse_manifest(MANIFEST).unwrap();
        assert_eq!(identities.len(), 1);
        let id = &identities[0];
        assert_eq!(id.name, "Microsoft.Windows.Common-Controls");
        assert_eq!(id.version, "6.0.0.0");
        assert_eq!(id.public_key_token, "6595b64144ccf1df");
        assert_eq!(id.processor_architecture, "*");
    }

    #[test]
    fn test_parse_manifest_without_dependencies() {
        let xml = r#"<assembly xmlns="urn:schemas-microsoft-com:asm.v1"
            manifestVersion="1.0"></assembly>"#;
        assert!(parse_manifest(xml).unwrap().is_empty());
    }

    #[test]
    fn test_assembly_version_ordering() {
        let a = AssemblyVersion::parse("5.82.9600.16384").unwrap();
        let b = AssemblyVersion::parse("6.0.9600.16384").unwrap();
        let c = AssemblyVersion::parse("6.0.9600.17031").unwrap();
        assert!(a < b && b < c);
        assert!(AssemblyVersion::parse("6.0.0").is_none());
        assert!(AssemblyVersion::parse("6.0.0.x").is_none());
    }

    #[test]
    fn test_winsxs_picks_smallest_satisfying_version() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = [
            "x86_microsoft.windows.common-controls_6595b64144ccf1df_5.82.9600.16384_none_7c55c866aa0c3ff0",
            "x86_microsoft.windows.common-controls_6595b64144ccf1df_6.0.9600.16384_none_a9f4965301334e09",
            "x86_microsoft.windows.common-controls_6595b64144ccf1df_6.0.9600.17031_none_a9efdb8b01377ea7",
        ];
        let paths: Vec<PathBuf> = dirs.iter().map(|d| tmp.path().join(d)).collect();

        let identity = AssemblyIdentity {
            kind: "win32".into(),
            name: "Microsoft.Windows.Common-Controls".into(),
            version: "6.0.0.0".into(),
            processor_architecture: "*".into(),
            public_key_token: "6595b64144ccf1df".into(),
            language: "*".into(),
        };
        let chosen = winsxs_directory_for(&identity, Machine::I386, &paths).unwrap();
        assert!(chosen
            .to_string_lossy()
            .contains("6.0.9600.16384"));
    }

    #[test]
    fn test_winsxs_no_candidate_for_amd64() {
        let identity = AssemblyIdentity {
            kind: "win32".into(),
            name: "Microsoft.Windows.Common-Controls".into(),
            version: "6.0.0.0".into(),
            processor_architecture: "*".into(),
            public_key_token: "6595b64144ccf1df".into(),
            language: "*".into(),
        };
        let paths = vec![PathBuf::from(
            "x86_microsoft.windows.common-controls_6595b64144ccf1df_6.0.9600.16384_none_a9f4965301334e09",
        )];
        assert!(winsxs_directory_for(&identity, Machine::Amd64, &paths).is_none());
    }
}
