//! Byte-level ELF and PE fixture builders for tests.
//!
//! Real binaries cannot be checked in, so the tests synthesize the
//! smallest images the parsers accept: an x86-64 little-endian ELF with a
//! program-header-only dynamic table, and a PE32+ with one `.idata`
//! section (plus an optional `.rsrc` section carrying a manifest).

/// Builds a standalone glibc-2.2 format ld.so.cache image.
pub fn new_format_cache(entries: &[(&str, &str)]) -> Vec<u8> {
    const HEADER_LEN: usize = 48;
    const ENTRY_LEN: usize = 24;

    let mut strings = Vec::new();
    let mut offsets = Vec::new();
    let strings_base = HEADER_LEN + entries.len() * ENTRY_LEN;
    for (name, path) in entries {
        let key = strings_base + strings.len();
        strings.extend_from_slice(name.as_bytes());
        strings.push(0);
        let value = strings_base + strings.len();
        strings.extend_from_slice(path.as_bytes());
        strings.push(0);
        offsets.push((key as u32, value as u32));
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"glibc-ld.so.cache");
    out.extend_from_slice(b"1.1");
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0u8; 20]); // unused[5]
    for (key, value) in offsets {
        out.extend_from_slice(&1i32.to_le_bytes()); // flags: ELF library
        out.extend_from_slice(&key.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // osversion
        out.extend_from_slice(&0u64.to_le_bytes()); // hwcap
    }
    out.extend_from_slice(&strings);
    out
}

/// Builds a legacy libc5 format ld.so.cache image.
pub fn old_format_cache(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut strings = Vec::new();
    let mut offsets = Vec::new();
    for (name, path) in entries {
        let key = strings.len();
        strings.extend_from_slice(name.as_bytes());
        strings.push(0);
        let value = strings.len();
        strings.extend_from_slice(path.as_bytes());
        strings.push(0);
        offsets.push((key as u32, value as u32));
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"ld.so-1.7.0");
    out.push(0); // pad magic to the aligned header size
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (key, value) in offsets {
        out.extend_from_slice(&1i32.to_le_bytes());
        out.extend_from_slice(&key.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }
    out.extend_from_slice(&strings);
    out
}

/// Minimal x86-64 ELF builder.
#[derive(Debug, Clone, Default)]
pub struct ElfFixture {
    pub needed: Vec<String>,
    pub rpath: Option<String>,
    pub runpath: Option<String>,
    pub interp: Option<String>,
    /// Emit ET_EXEC instead of ET_DYN.
    pub executable: bool,
    /// Omit the PT_PHDR segment.
    pub no_phdr: bool,
    pub relro: bool,
    pub bind_now: bool,
}

const PHDR_LEN: usize = 56;
const EHDR_LEN: usize = 64;
const DYN_ENTRY_LEN: usize = 16;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_PHDR: u32 = 6;
const PT_GNU_RELRO: u32 = 0x6474_e552;

const DT_NEEDED: i64 = 1;
const DT_STRTAB: i64 = 5;
const DT_STRSZ: i64 = 10;
const DT_RPATH: i64 = 15;
const DT_BIND_NOW: i64 = 24;
const DT_RUNPATH: i64 = 29;

impl ElfFixture {
    pub fn with_needed(needed: &[&str]) -> Self {
        ElfFixture {
            needed: needed.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn build(&self) -> Vec<u8> {
        // string table: leading NUL, then every referenced string
        let mut strtab = vec![0u8];
        let mut str_offset = |s: &str, strtab: &mut Vec<u8>| {
            let off = strtab.len() as u64;
            strtab.extend_from_slice(s.as_bytes());
            strtab.push(0);
            off
        };
        let needed_offs: Vec<u64> = self
            .needed
            .iter()
            .map(|n| str_offset(n, &mut strtab))
            .collect();
        let rpath_off = self.rpath.as_deref().map(|s| str_offset(s, &mut strtab));
        let runpath_off = self.runpath.as_deref().map(|s| str_offset(s, &mut strtab));

        let mut dyn_entries: Vec<(i64, u64)> =
            needed_offs.iter().map(|&off| (DT_NEEDED, off)).collect();
        if let Some(off) = rpath_off {
            dyn_entries.push((DT_RPATH, off));
        }
        if let Some(off) = runpath_off {
            dyn_entries.push((DT_RUNPATH, off));
        }
        if self.bind_now {
            dyn_entries.push((DT_BIND_NOW, 0));
        }

        let interp_bytes: Vec<u8> = self
            .interp
            .as_deref()
            .map(|s| {
                let mut v = s.as_bytes().to_vec();
                v.push(0);
                v
            })
            .unwrap_or_default();

        let n_phdrs = 2
            + usize::from(!self.no_phdr)
            + usize::from(self.interp.is_some())
            + usize::from(self.relro);

        let phdrs_off = EHDR_LEN;
        let interp_off = phdrs_off + n_phdrs * PHDR_LEN;
        let strtab_off = interp_off + interp_bytes.len();
        let mut dyn_off = strtab_off + strtab.len();
        dyn_off = (dyn_off + 7) & !7;
        // entries plus the terminating DT_NULL
        let dyn_len = (dyn_entries.len() + 1) * DYN_ENTRY_LEN;
        let file_len = dyn_off + dyn_len;

        let mut out = Vec::with_capacity(file_len);

        // ELF header
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&(if self.executable { 2u16 } else { 3u16 }).to_le_bytes());
        out.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        out.extend_from_slice(&(phdrs_off as u64).to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(EHDR_LEN as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_LEN as u16).to_le_bytes());
        out.extend_from_slice(&(n_phdrs as u16).to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

        let phdr = |out: &mut Vec<u8>, p_type: u32, offset: u64, filesz: u64, flags: u32| {
            out.extend_from_slice(&p_type.to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes()); // p_offset
            out.extend_from_slice(&offset.to_le_bytes()); // p_vaddr
            out.extend_from_slice(&offset.to_le_bytes()); // p_paddr
            out.extend_from_slice(&filesz.to_le_bytes());
            out.extend_from_slice(&filesz.to_le_bytes()); // p_memsz
            out.extend_from_slice(&8u64.to_le_bytes());
        };

        if !self.no_phdr {
            phdr(
                &mut out,
                PT_PHDR,
                phdrs_off as u64,
                (n_phdrs * PHDR_LEN) as u64,
                4,
            );
        }
        if self.interp.is_some() {
            phdr(
                &mut out,
                PT_INTERP,
                interp_off as u64,
                interp_bytes.len() as u64,
                4,
            );
        }
        phdr(&mut out, PT_LOAD, 0, file_len as u64, 5);
        phdr(&mut out, PT_DYNAMIC, dyn_off as u64, dyn_len as u64, 6);
        if self.relro {
            phdr(&mut out, PT_GNU_RELRO, dyn_off as u64, dyn_len as u64, 4);
        }

        out.extend_from_slice(&interp_bytes);
        out.extend_from_slice(&strtab);
        while out.len() < dyn_off {
            out.push(0);
        }

        dyn_entries.push((DT_STRTAB, strtab_off as u64));
        dyn_entries.push((DT_STRSZ, strtab.len() as u64));
        // keep DT_NULL last
        let null_idx = dyn_entries.len();
        dyn_entries.push((0, 0));
        debug_assert_eq!(null_idx + 1, dyn_entries.len());
        for (tag, val) in dyn_entries {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&val.to_le_bytes());
        }
        out
    }
}

/// Minimal PE32+ builder: one `.idata` section, optionally a `.rsrc`
/// section holding an RT_MANIFEST resource.
#[derive(Debug, Clone)]
pub struct PeFixture {
    pub machine: u16,
    pub dll_characteristics: u16,
    /// Imported modules with one imported symbol each.
    pub imports: Vec<(String, String)>,
    /// Delay-loaded modules with their symbol lists.
    pub delay_imports: Vec<(String, Vec<String>)>,
    pub security_cookie: bool,
    pub safe_seh: bool,
    pub manifest: Option<String>,
    /// Extra named section with raw contents (e.g. `.apiset`).
    pub extra_section: Option<(String, Vec<u8>)>,
}

pub const PE_MACHINE_AMD64: u16 = 0x8664;
pub const PE_MACHINE_I386: u16 = 0x14c;

const IDATA_RVA: u32 = 0x1000;
const IDATA_RAW: u32 = 0x200;
const IDATA_RAW_SIZE: u32 = 0x600;
const RSRC_RVA: u32 = 0x2000;
const RSRC_RAW: u32 = IDATA_RAW + IDATA_RAW_SIZE;
const RSRC_RAW_SIZE: u32 = 0x400;
const EXTRA_RVA: u32 = 0x3000;

impl Default for PeFixture {
    fn default() -> Self {
        PeFixture {
            machine: PE_MACHINE_AMD64,
            dll_characteristics: 0,
            imports: Vec::new(),
            delay_imports: Vec::new(),
            security_cookie: false,
            safe_seh: false,
            manifest: None,
            extra_section: None,
        }
    }
}

impl PeFixture {
    pub fn importing(dlls: &[&str]) -> Self {
        PeFixture {
            imports: dlls
                .iter()
                .enumerate()
                .map(|(i, d)| (d.to_string(), format!("Func{i}")))
                .collect(),
            ..Default::default()
        }
    }

    pub fn build(&self) -> Vec<u8> {
        // .idata content, positions relative to the section start
        let mut data: Vec<u8> = Vec::new();
        let rva = |pos: usize| IDATA_RVA + pos as u32;

        let mut import_dir = (0u32, 0u32);
        if !self.imports.is_empty() {
            let desc_len = (self.imports.len() + 1) * 20;
            let mut cursor = desc_len;
            let mut descriptors = Vec::new();
            let mut tail: Vec<u8> = Vec::new();
            for (dll, symbol) in &self.imports {
                let int_pos = cursor;
                let iat_pos = int_pos + 16;
                let hint_pos = iat_pos + 16;
                let name_pos = hint_pos + 2 + symbol.len() + 1;
                cursor = name_pos + dll.len() + 1;

                // INT then IAT, identical on disk
                for _ in 0..2 {
                    tail.extend_from_slice(&(rva(hint_pos) as u64).to_le_bytes());
                    tail.extend_from_slice(&0u64.to_le_bytes());
                }
                tail.extend_from_slice(&0u16.to_le_bytes()); // hint
                tail.extend_from_slice(symbol.as_bytes());
                tail.push(0);
                tail.extend_from_slice(dll.as_bytes());
                tail.push(0);

                descriptors.push((rva(int_pos), rva(name_pos), rva(iat_pos)));
            }
            for (int_rva, name_rva, iat_rva) in descriptors {
                data.extend_from_slice(&int_rva.to_le_bytes());
                data.extend_from_slice(&0u32.to_le_bytes()); // TimeDateStamp
                data.extend_from_slice(&0u32.to_le_bytes()); // ForwarderChain
                data.extend_from_slice(&name_rva.to_le_bytes());
                data.extend_from_slice(&iat_rva.to_le_bytes());
            }
            data.extend_from_slice(&[0u8; 20]); // terminator
            data.extend_from_slice(&tail);
            import_dir = (IDATA_RVA, desc_len as u32);
            debug_assert_eq!(data.len(), cursor);
        }

        let mut delay_dir = (0u32, 0u32);
        if !self.delay_imports.is_empty() {
            let table_pos = data.len();
            let table_len = (self.delay_imports.len() + 1) * 32;
            let mut cursor = table_pos + table_len;
            let mut entries = Vec::new();
            let mut tail: Vec<u8> = Vec::new();
            for (module, symbols) in &self.delay_imports {
                let pint_pos = cursor;
                cursor += (symbols.len() + 1) * 8;
                let mut hint_positions = Vec::new();
                for symbol in symbols {
                    hint_positions.push(cursor);
                    cursor += 2 + symbol.len() + 1;
                }
                let name_pos = cursor;
                cursor += module.len() + 1;

                for &hint_pos in &hint_positions {
                    tail.extend_from_slice(&(rva(hint_pos) as u64).to_le_bytes());
                }
                tail.extend_from_slice(&0u64.to_le_bytes());
                for symbol in symbols {
                    tail.extend_from_slice(&0u16.to_le_bytes());
                    tail.extend_from_slice(symbol.as_bytes());
                    tail.push(0);
                }
                tail.extend_from_slice(module.as_bytes());
                tail.push(0);

                entries.push((rva(name_pos), rva(pint_pos)));
            }
            for (name_rva, pint_rva) in entries {
                data.extend_from_slice(&1u32.to_le_bytes()); // grAttrs
                data.extend_from_slice(&name_rva.to_le_bytes());
                data.extend_from_slice(&0u32.to_le_bytes()); // phmod
                data.extend_from_slice(&0u32.to_le_bytes()); // pIAT
                data.extend_from_slice(&pint_rva.to_le_bytes());
                data.extend_from_slice(&[0u8; 12]); // bound/unload/timestamp
            }
            data.extend_from_slice(&[0u8; 32]); // terminator
            data.extend_from_slice(&tail);
            delay_dir = (rva(table_pos), table_len as u32);
            debug_assert_eq!(data.len(), cursor);
        }

        let mut load_config_dir = (0u32, 0u32);
        if self.security_cookie || self.safe_seh {
            let pos = data.len();
            let mut cfg = vec![0u8; 112];
            cfg[0..4].copy_from_slice(&112u32.to_le_bytes());
            if self.security_cookie {
                cfg[88..96].copy_from_slice(&0x1_4000_1000u64.to_le_bytes());
            }
            if self.safe_seh {
                cfg[96..104].copy_from_slice(&0x1_4000_2000u64.to_le_bytes());
                cfg[104..112].copy_from_slice(&2u64.to_le_bytes());
            }
            data.extend_from_slice(&cfg);
            load_config_dir = (rva(pos), 112);
        }

        assert!(data.len() <= IDATA_RAW_SIZE as usize, "idata overflow");
        data.resize(IDATA_RAW_SIZE as usize, 0);

        // optional .rsrc section
        let mut rsrc: Vec<u8> = Vec::new();
        let mut resource_dir = (0u32, 0u32);
        if let Some(manifest) = &self.manifest {
            rsrc = build_manifest_resource(manifest.as_bytes());
            resource_dir = (RSRC_RVA, rsrc.len() as u32);
            assert!(rsrc.len() <= RSRC_RAW_SIZE as usize, "rsrc overflow");
            rsrc.resize(RSRC_RAW_SIZE as usize, 0);
        }
        let mut extra: Vec<u8> = Vec::new();
        let mut extra_name = String::new();
        if let Some((name, contents)) = &self.extra_section {
            extra_name = name.clone();
            extra = contents.clone();
            let padded = (extra.len() + 0x1ff) & !0x1ff;
            extra.resize(padded, 0);
        }
        let n_sections: u16 =
            1 + u16::from(!rsrc.is_empty()) + u16::from(!extra.is_empty());

        let mut out = Vec::new();
        // DOS header
        out.extend_from_slice(&[b'M', b'Z']);
        out.extend_from_slice(&[0u8; 58]);
        out.extend_from_slice(&64u32.to_le_bytes()); // e_lfanew
        // NT signature + COFF header
        out.extend_from_slice(b"PE\0\0");
        out.extend_from_slice(&self.machine.to_le_bytes());
        out.extend_from_slice(&n_sections.to_le_bytes());
        out.extend_from_slice(&[0u8; 12]); // timestamp, symtab, nsyms
        out.extend_from_slice(&240u16.to_le_bytes()); // optional header size
        out.extend_from_slice(&0x0022u16.to_le_bytes());
        // optional header, PE32+
        out.extend_from_slice(&0x20bu16.to_le_bytes());
        out.extend_from_slice(&[0u8; 22]); // linker, sizes, entry, base of code
        out.extend_from_slice(&0x1_4000_0000u64.to_le_bytes()); // ImageBase
        out.extend_from_slice(&0x1000u32.to_le_bytes()); // SectionAlignment
        out.extend_from_slice(&0x200u32.to_le_bytes()); // FileAlignment
        out.extend_from_slice(&6u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]); // image version
        out.extend_from_slice(&6u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // Win32VersionValue
        out.extend_from_slice(&0x4000u32.to_le_bytes()); // SizeOfImage
        out.extend_from_slice(&0x200u32.to_le_bytes()); // SizeOfHeaders
        out.extend_from_slice(&0u32.to_le_bytes()); // CheckSum
        out.extend_from_slice(&3u16.to_le_bytes()); // Subsystem: console
        out.extend_from_slice(&self.dll_characteristics.to_le_bytes());
        out.extend_from_slice(&0x10_0000u64.to_le_bytes());
        out.extend_from_slice(&0x1000u64.to_le_bytes());
        out.extend_from_slice(&0x10_0000u64.to_le_bytes());
        out.extend_from_slice(&0x1000u64.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // LoaderFlags
        out.extend_from_slice(&16u32.to_le_bytes()); // NumberOfRvaAndSizes

        let mut dirs = [(0u32, 0u32); 16];
        dirs[1] = import_dir;
        dirs[2] = resource_dir;
        dirs[10] = load_config_dir;
        dirs[13] = delay_dir;
        for (dir_rva, dir_size) in dirs {
            out.extend_from_slice(&dir_rva.to_le_bytes());
            out.extend_from_slice(&dir_size.to_le_bytes());
        }

        let section_header = |out: &mut Vec<u8>,
                              name: &[u8],
                              va: u32,
                              vsize: u32,
                              raw: u32,
                              raw_size: u32| {
            let mut name8 = [0u8; 8];
            name8[..name.len()].copy_from_slice(name);
            out.extend_from_slice(&name8);
            out.extend_from_slice(&vsize.to_le_bytes());
            out.extend_from_slice(&va.to_le_bytes());
            out.extend_from_slice(&raw_size.to_le_bytes());
            out.extend_from_slice(&raw.to_le_bytes());
            out.extend_from_slice(&[0u8; 12]); // relocs, linenumbers
            out.extend_from_slice(&[0u8; 4]);
            out.extend_from_slice(&0xC000_0040u32.to_le_bytes());
        };
        section_header(&mut out, b".idata", IDATA_RVA, 0x1000, IDATA_RAW, IDATA_RAW_SIZE);
        if !rsrc.is_empty() {
            section_header(&mut out, b".rsrc", RSRC_RVA, 0x1000, RSRC_RAW, RSRC_RAW_SIZE);
        }
        if !extra.is_empty() {
            let raw = RSRC_RAW + if rsrc.is_empty() { 0 } else { RSRC_RAW_SIZE };
            section_header(
                &mut out,
                extra_name.as_bytes(),
                EXTRA_RVA,
                0x1000,
                raw,
                extra.len() as u32,
            );
        }

        out.resize(IDATA_RAW as usize, 0);
        out.extend_from_slice(&data);
        out.extend_from_slice(&rsrc);
        out.extend_from_slice(&extra);
        out
    }
}

/// Resource section bytes: root -> RT_MANIFEST(24) -> id 1 -> lang 1033
/// -> data entry -> manifest bytes.
fn build_manifest_resource(manifest: &[u8]) -> Vec<u8> {
    const DIR_LEN: u32 = 16;
    const ENTRY_LEN: u32 = 8;
    const DATA_ENTRY_LEN: u32 = 16;

    let dir1 = 0u32;
    let dir2 = dir1 + DIR_LEN + ENTRY_LEN;
    let dir3 = dir2 + DIR_LEN + ENTRY_LEN;
    let data_entry = dir3 + DIR_LEN + ENTRY_LEN;
    let payload = data_entry + DATA_ENTRY_LEN;

    let mut out = Vec::new();
    let dir = |out: &mut Vec<u8>, id: u32, target: u32, is_dir: bool| {
        out.extend_from_slice(&[0u8; 12]); // characteristics, stamp, versions
        out.extend_from_slice(&0u16.to_le_bytes()); // named entries
        out.extend_from_slice(&1u16.to_le_bytes()); // id entries
        out.extend_from_slice(&id.to_le_bytes());
        let flagged = if is_dir { target | 0x8000_0000 } else { target };
        out.extend_from_slice(&flagged.to_le_bytes());
    };
    dir(&mut out, 24, dir2, true); // RT_MANIFEST
    dir(&mut out, 1, dir3, true);
    dir(&mut out, 1033, data_entry, false);
    // data entry: OffsetToData is an RVA into the mapped image
    out.extend_from_slice(&(RSRC_RVA + payload).to_le_bytes());
    out.extend_from_slice(&(manifest.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // codepage
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved
    out.extend_from_slice(manifest);
    out
}
