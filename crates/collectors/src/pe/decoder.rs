//! PE/PE+ decoder.
//!
//! Header, section, import and export walking is delegated to `goblin`;
//! the tables goblin does not surface (delay imports, the load-config
//! directory, raw section bytes for the ApiSetSchema) are read directly
//! with `scroll`. Only i386 and AMD64 images are accepted.

use crate::CollectorError;
use binmap_common::{HardeningFeature, MetadataInfo};
use goblin::pe::header::{COFF_MACHINE_X86, COFF_MACHINE_X86_64};
use goblin::pe::PE;
use scroll::Pread;
use tracing::warn;

/// Machine kinds the decoder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    I386,
    Amd64,
}

const DLLCHARACTERISTICS_HIGH_ENTROPY_VA: u16 = 0x20;
const DLLCHARACTERISTICS_DYNAMIC_BASE: u16 = 0x40;
const DLLCHARACTERISTICS_FORCE_INTEGRITY: u16 = 0x80;
const DLLCHARACTERISTICS_NX_COMPAT: u16 = 0x100;
const DLLCHARACTERISTICS_NO_SEH: u16 = 0x400;
const DLLCHARACTERISTICS_APPCONTAINER: u16 = 0x1000;
const DLLCHARACTERISTICS_GUARD_CF: u16 = 0x4000;

const DELAY_DESCRIPTOR_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_pointer: u32,
    pub raw_size: u32,
}

#[derive(Debug, Clone)]
pub struct DelayImport {
    pub module: String,
    pub symbols: Vec<String>,
}

/// Parsed PE image with everything the collector needs owned up front.
pub struct PeDecoder {
    bytes: Vec<u8>,
    machine: Machine,
    is_64: bool,
    dll_characteristics: u16,
    sections: Vec<Section>,
    import_dir: Option<(u32, u32)>,
    delay_import_dir: Option<(u32, u32)>,
    resource_dir: Option<(u32, u32)>,
    load_config_dir: Option<(u32, u32)>,
    import_modules: Vec<String>,
    imported_symbols: Vec<String>,
    exported_symbols: Vec<String>,
}

fn dir_entry(dir: Option<&goblin::pe::data_directories::DataDirectory>) -> Option<(u32, u32)> {
    dir.filter(|d| d.virtual_address != 0 && d.size != 0)
        .map(|d| (d.virtual_address, d.size))
}

impl PeDecoder {
    pub fn parse(bytes: &[u8]) -> Result<PeDecoder, CollectorError> {
        let pe = PE::parse(bytes)?;

        let machine = match pe.header.coff_header.machine {
            COFF_MACHINE_X86 => Machine::I386,
            COFF_MACHINE_X86_64 => Machine::Amd64,
            other => {
                return Err(CollectorError::format(
                    "pe",
                    format!("unsupported machine type {other:#x}"),
                ))
            }
        };
        let optional = pe
            .header
            .optional_header
            .ok_or_else(|| CollectorError::format("pe", "missing optional header"))?;

        let sections = pe
            .sections
            .iter()
            .map(|s| Section {
                name: s.name().unwrap_or_default().to_owned(),
                virtual_address: s.virtual_address,
                virtual_size: s.virtual_size,
                raw_pointer: s.pointer_to_raw_data,
                raw_size: s.size_of_raw_data,
            })
            .collect();

        // case folded once: Windows names are case-insensitive
        let mut import_modules: Vec<String> = Vec::new();
        for import in &pe.imports {
            let dll = import.dll.to_lowercase();
            if !import_modules.contains(&dll) {
                import_modules.push(dll);
            }
        }
        let imported_symbols = pe
            .imports
            .iter()
            .filter(|i| !i.name.starts_with("ORDINAL "))
            .map(|i| i.name.to_string())
            .collect();
        let exported_symbols = pe
            .exports
            .iter()
            .filter_map(|e| e.name.map(str::to_owned))
            .collect();

        let dirs = &optional.data_directories;
        Ok(PeDecoder {
            bytes: bytes.to_vec(),
            machine,
            is_64: pe.is_64,
            dll_characteristics: optional.windows_fields.dll_characteristics,
            sections,
            import_dir: dir_entry(dirs.get_import_table()),
            delay_import_dir: dir_entry(dirs.get_delay_import_descriptor()),
            resource_dir: dir_entry(dirs.get_resource_table()),
            load_config_dir: dir_entry(dirs.get_load_config_table()),
            import_modules,
            imported_symbols,
            exported_symbols,
        })
    }

    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn is_64(&self) -> bool {
        self.is_64
    }

    pub fn has_import_table(&self) -> bool {
        self.import_dir.is_some()
    }

    /// Imported module basenames, lowercased, in table order.
    pub fn import_modules(&self) -> &[String] {
        &self.import_modules
    }

    pub fn imported_symbols(&self) -> &[String] {
        &self.imported_symbols
    }

    pub fn exported_symbols(&self) -> &[String] {
        &self.exported_symbols
    }

    pub fn resource_dir(&self) -> Option<(u32, u32)> {
        self.resource_dir
    }

    /// File offset backing `rva`, through the section table.
    pub fn rva_to_offset(&self, rva: u32) -> Option<u32> {
        self.sections
            .iter()
            .find(|s| rva >= s.virtual_address && rva < s.virtual_address + s.virtual_size)
            .map(|s| s.raw_pointer + (rva - s.virtual_address))
    }

    pub fn read_bytes(&self, offset: u32, len: u32) -> Option<&[u8]> {
        self.bytes.get(offset as usize..(offset + len) as usize)
    }

    pub fn read_cstr(&self, offset: u32) -> Option<&str> {
        let tail = self.bytes.get(offset as usize..)?;
        let len = tail.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&tail[..len]).ok()
    }

    /// Raw contents of the section called `name`.
    pub fn section_bytes(&self, name: &str) -> Option<&[u8]> {
        let section = self.sections.iter().find(|s| s.name == name)?;
        self.read_bytes(section.raw_pointer, section.raw_size)
    }

    /// Walks the delay-import descriptor table. Entries terminate on a
    /// zero `szName`; each contributes its module and the symbols named
    /// by its import name table.
    pub fn delay_imports(&self) -> Result<Vec<DelayImport>, CollectorError> {
        let Some((rva, _)) = self.delay_import_dir else {
            return Ok(Vec::new());
        };
        let mut offset = self
            .rva_to_offset(rva)
            .ok_or_else(|| CollectorError::format("pe", "delay import table outside sections"))?
            as usize;

        let mut out = Vec::new();
        loop {
            let name_rva = self
                .bytes
                .pread_with::<u32>(offset + 4, scroll::LE)
                .map_err(|e| CollectorError::format("pe", e.to_string()))?;
            if name_rva == 0 {
                break;
            }
            let Some(name_off) = self.rva_to_offset(name_rva) else {
                warn!("delay import descriptor has an unmappable name rva");
                break;
            };
            let Some(module) = self.read_cstr(name_off) else {
                warn!("delay import module name is unreadable");
                break;
            };
            let pint_rva = self
                .bytes
                .pread_with::<u32>(offset + 16, scroll::LE)
                .map_err(|e| CollectorError::format("pe", e.to_string()))?;
            out.push(DelayImport {
                module: module.to_lowercase(),
                symbols: self.walk_name_table(pint_rva),
            });
            offset += DELAY_DESCRIPTOR_LEN;
        }
        Ok(out)
    }

    /// Name table walk shared by delay imports: a zero-terminated array of
    /// thunks (native word size) pointing at `WORD hint` + string entries.
    fn walk_name_table(&self, table_rva: u32) -> Vec<String> {
        let mut symbols = Vec::new();
        let Some(mut offset) = self.rva_to_offset(table_rva).map(|o| o as usize) else {
            warn!("delay import name table outside sections");
            return symbols;
        };
        let step = if self.is_64 { 8 } else { 4 };
        let ordinal_flag: u64 = 1 << (step * 8 - 1);
        loop {
            let entry: u64 = if self.is_64 {
                match self.bytes.pread_with::<u64>(offset, scroll::LE) {
                    Ok(v) => v,
                    Err(_) => break,
                }
            } else {
                match self.bytes.pread_with::<u32>(offset, scroll::LE) {
                    Ok(v) => u64::from(v),
                    Err(_) => break,
                }
            };
            if entry == 0 {
                break;
            }
            offset += step;
            if entry & ordinal_flag != 0 {
                // import by ordinal, no name to record
                continue;
            }
            let Some(name_off) = self.rva_to_offset(entry as u32) else {
                warn!("delay import thunk has an unmappable rva");
                continue;
            };
            if let Some(symbol) = self.read_cstr(name_off + 2) {
                symbols.push(symbol.to_owned());
            }
        }
        symbols
    }

    /// Flags the mitigations visible in DllCharacteristics and the
    /// load-config directory.
    pub fn hardening(&self, info: &mut MetadataInfo) {
        let characteristics = self.dll_characteristics;
        let flags = [
            (DLLCHARACTERISTICS_HIGH_ENTROPY_VA, HardeningFeature::PeHighEntropyVa),
            (DLLCHARACTERISTICS_DYNAMIC_BASE, HardeningFeature::PeDynamicBase),
            (DLLCHARACTERISTICS_FORCE_INTEGRITY, HardeningFeature::PeForceIntegrity),
            (DLLCHARACTERISTICS_NX_COMPAT, HardeningFeature::PeNxCompat),
            (DLLCHARACTERISTICS_APPCONTAINER, HardeningFeature::PeAppContainer),
            (DLLCHARACTERISTICS_GUARD_CF, HardeningFeature::PeGuardCf),
        ];
        for (bit, feature) in flags {
            if characteristics & bit != 0 {
                info.hardening_features.insert(feature);
            }
        }

        let Some((rva, _)) = self.load_config_dir else {
            return;
        };
        let Some(offset) = self.rva_to_offset(rva).map(|o| o as usize) else {
            warn!("load config directory outside sections");
            return;
        };
        let field = |at: usize| -> Option<u64> {
            if self.is_64 {
                self.bytes.pread_with::<u64>(offset + at, scroll::LE).ok()
            } else {
                self.bytes
                    .pread_with::<u32>(offset + at, scroll::LE)
                    .ok()
                    .map(u64::from)
            }
        };
        let (cookie_at, seh_table_at, seh_count_at) =
            if self.is_64 { (88, 96, 104) } else { (60, 64, 68) };

        if field(cookie_at).unwrap_or(0) != 0 {
            info.hardening_features
                .insert(HardeningFeature::PeStackProtected);
        }
        if characteristics & DLLCHARACTERISTICS_NO_SEH == 0
            && field(seh_count_at).unwrap_or(0) != 0
            && field(seh_table_at).unwrap_or(0) != 0
        {
            info.hardening_features.insert(HardeningFeature::PeSafeSeh);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{PeFixture, PE_MACHINE_I386};
    use binmap_common::Hash;

    #[test]
    fn test_parse_rejects_unknown_machine() {
        let bytes = PeFixture {
            machine: 0x1c0, // ARM
            ..PeFixture::importing(&["kernel32.dll"])
        }
        .build();
        assert!(PeDecoder::parse(&bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(PeDecoder::parse(b"MZ but not a PE").is_err());
        assert!(PeDecoder::parse(b"").is_err());
    }

    #[test]
    fn test_import_modules_lowercased() {
        let bytes = PeFixture::importing(&["KERNEL32.dll", "User32.DLL"]).build();
        let decoder = PeDecoder::parse(&bytes).unwrap();
        assert_eq!(decoder.machine(), Machine::Amd64);
        assert_eq!(decoder.import_modules(), &["kernel32.dll", "user32.dll"]);
        assert_eq!(decoder.imported_symbols().len(), 2);
    }

    #[test]
    fn test_machine_i386_accepted() {
        let bytes = PeFixture {
            machine: PE_MACHINE_I386,
            ..Default::default()
        }
        .build();
        let decoder = PeDecoder::parse(&bytes).unwrap();
        assert_eq!(decoder.machine(), Machine::I386);
        assert!(!decoder.has_import_table());
    }

    #[test]
    fn test_rva_to_offset() {
        let bytes = PeFixture::importing(&["kernel32.dll"]).build();
        let decoder = PeDecoder::parse(&bytes).unwrap();
        assert_eq!(decoder.rva_to_offset(0x1000), Some(0x200));
        assert_eq!(decoder.rva_to_offset(0x1010), Some(0x210));
        assert_eq!(decoder.rva_to_offset(0x9_0000), None);
    }

    #[test]
    fn test_delay_imports() {
        let bytes = PeFixture {
            delay_imports: vec![(
                "Comctl32.dll".to_string(),
                vec!["InitCommonControls".to_string(), "ImageList_Add".to_string()],
            )],
            ..Default::default()
        }
        .build();
        let decoder = PeDecoder::parse(&bytes).unwrap();
        let delayed = decoder.delay_imports().unwrap();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].module, "comctl32.dll");
        assert_eq!(
            delayed[0].symbols,
            vec!["InitCommonControls", "ImageList_Add"]
        );
    }

    #[test]
    fn test_dll_characteristics_hardening() {
        let bytes = PeFixture {
            dll_characteristics: 0x20 | 0x40 | 0x100 | 0x4000,
            ..Default::default()
        }
        .build();
        let decoder = PeDecoder::parse(&bytes).unwrap();
        let mut info = MetadataInfo::new(Hash::of_str("x"));
        decoder.hardening(&mut info);
        for feature in [
            HardeningFeature::PeHighEntropyVa,
            HardeningFeature::PeDynamicBase,
            HardeningFeature::PeNxCompat,
            HardeningFeature::PeGuardCf,
        ] {
            assert!(info.hardening_features.contains(&feature));
        }
        assert!(!info
            .hardening_features
            .contains(&HardeningFeature::PeForceIntegrity));
    }

    #[test]
    fn test_load_config_hardening() {
        let bytes = PeFixture {
            security_cookie: true,
            safe_seh: true,
            ..Default::default()
        }
        .build();
        let decoder = PeDecoder::parse(&bytes).unwrap();
        let mut info = MetadataInfo::new(Hash::of_str("x"));
        decoder.hardening(&mut info);
        assert!(info
            .hardening_features
            .contains(&HardeningFeature::PeStackProtected));
        assert!(info.hardening_features.contains(&HardeningFeature::PeSafeSeh));
    }

    #[test]
    fn test_no_seh_flag_suppresses_safe_seh() {
        let bytes = PeFixture {
            safe_seh: true,
            dll_characteristics: 0x400, // NO_SEH
            ..Default::default()
        }
        .build();
        let decoder = PeDecoder::parse(&bytes).unwrap();
        let mut info = MetadataInfo::new(Hash::of_str("x"));
        decoder.hardening(&mut info);
        assert!(!info.hardening_features.contains(&HardeningFeature::PeSafeSeh));
    }

    #[test]
    fn test_section_bytes() {
        let bytes = PeFixture::importing(&["kernel32.dll"]).build();
        let decoder = PeDecoder::parse(&bytes).unwrap();
        assert!(decoder.section_bytes(".idata").is_some());
        assert!(decoder.section_bytes(".apiset").is_none());
    }
}
