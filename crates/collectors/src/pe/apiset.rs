//! ApiSetSchema: the virtual-DLL redirection table.
//!
//! Windows ships the table in the `.apiset` section of
//! `system32/apisetschema.dll`. Version 4 is parsed here; version 2 is
//! detected and refused. Strings are UTF-16LE. Keys are the virtual names
//! as stored (no `api-`/`ext-` prefix, no `.dll`), values are concrete
//! DLL basenames.

use crate::CollectorError;
use scroll::Pread;
use std::collections::HashMap;
use tracing::warn;

const V4_HEADER_LEN: usize = 16;
const V4_DESCRIPTOR_LEN: usize = 24;

fn bad(e: scroll::Error) -> CollectorError {
    CollectorError::format("apiset", e.to_string())
}

fn read_utf16(bytes: &[u8], offset: usize, byte_len: usize) -> Option<String> {
    let raw = bytes.get(offset..offset + byte_len)?;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// Parses a raw `.apiset` section into the redirection map.
pub fn parse_apiset(section: &[u8]) -> Result<HashMap<String, String>, CollectorError> {
    let version = section.pread_with::<u32>(0, scroll::LE).map_err(bad)?;
    match version {
        2 => Err(CollectorError::format(
            "apiset",
            "schema version 2 is not supported",
        )),
        4 => parse_apiset_v4(section),
        other => Err(CollectorError::format(
            "apiset",
            format!("unknown schema version {other}"),
        )),
    }
}

fn parse_apiset_v4(section: &[u8]) -> Result<HashMap<String, String>, CollectorError> {
    let num_structs = section.pread_with::<u32>(12, scroll::LE).map_err(bad)? as usize;
    let mut cache = HashMap::new();

    for i in 0..num_structs {
        let descriptor = V4_HEADER_LEN + i * V4_DESCRIPTOR_LEN;
        let name_offset = section
            .pread_with::<u32>(descriptor + 4, scroll::LE)
            .map_err(bad)? as usize;
        let name_len = section
            .pread_with::<u32>(descriptor + 8, scroll::LE)
            .map_err(bad)? as usize;
        let redirector_offset = section
            .pread_with::<u32>(descriptor + 20, scroll::LE)
            .map_err(bad)? as usize;

        if name_offset == 0 {
            warn!("apiset: descriptor {i} has no virtual dll string");
            continue;
        }
        let Some(virtual_dll) = read_utf16(section, name_offset, name_len) else {
            warn!("apiset: descriptor {i} has an unreadable virtual dll string");
            continue;
        };

        // only the second redirection of the first entry names the
        // implementation dll
        let first_redirection = redirector_offset + 8;
        let target_offset = section
            .pread_with::<u32>(first_redirection + 12, scroll::LE)
            .map_err(bad)? as usize;
        let target_len = section
            .pread_with::<u16>(first_redirection + 16, scroll::LE)
            .map_err(bad)? as usize;

        if target_offset == 0 {
            // seen in the wild: a virtual DLL with no backing implementation
            warn!("apiset: virtual dll {virtual_dll} has no implementation counterpart");
            continue;
        }
        let Some(target) = read_utf16(section, target_offset, target_len) else {
            warn!("apiset: redirection target of {virtual_dll} is unreadable");
            continue;
        };
        cache.insert(virtual_dll.to_lowercase(), target.to_lowercase());
    }

    Ok(cache)
}

/// Strips the `api-`/`ext-` prefix and the `.dll` suffix, producing the
/// form the schema uses as a key.
pub fn schema_key(module_name: &str) -> Option<&str> {
    let rest = module_name
        .strip_prefix("api-")
        .or_else(|| module_name.strip_prefix("ext-"))?;
    Some(rest.strip_suffix(".dll").unwrap_or(rest))
}
