//! Version-string scanner.
//!
//! Binaries embed their version somewhere in their constant data; where
//! exactly, and in what surrounding text, is program-specific. The
//! catalogue mapping canonical binary names to extraction regexes is a
//! data table (`versions.json`, embedded at build time), with a very
//! restrictive default for everything not listed.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

static CATALOGUE_JSON: &str = include_str!("versions.json");

struct Catalogue {
    entries: HashMap<String, Regex>,
    default: Regex,
}

static CATALOGUE: Lazy<Catalogue> = Lazy::new(|| {
    let raw: HashMap<String, String> = match serde_json::from_str(CATALOGUE_JSON) {
        Ok(map) => map,
        Err(e) => {
            warn!("embedded version catalogue is unparsable: {e}");
            HashMap::new()
        }
    };
    let mut entries = HashMap::new();
    let mut default = None;
    for (name, pattern) in raw {
        match Regex::new(&pattern) {
            Ok(regex) if name.is_empty() => default = Some(regex),
            Ok(regex) => {
                entries.insert(name, regex);
            }
            Err(e) => warn!("version catalogue entry {name:?} is invalid: {e}"),
        }
    }
    Catalogue {
        entries,
        default: default
            .unwrap_or_else(|| Regex::new(r"^(\d+\.(\d+\.)*\d+)$").expect("default version regex")),
    }
});

/// Scanner bound to the regex registered for one binary name.
pub struct VersionScanner {
    regex: &'static Regex,
}

impl VersionScanner {
    pub fn for_binary(canonical_name: &str) -> VersionScanner {
        VersionScanner {
            regex: CATALOGUE
                .entries
                .get(canonical_name)
                .unwrap_or(&CATALOGUE.default),
        }
    }

    /// Runs the regex over every NUL-terminated substring of `bytes`,
    /// collecting the first capture group of each match.
    pub fn scan(&self, versions: &mut BTreeSet<String>, bytes: &[u8]) {
        for chunk in bytes.split(|&b| b == 0) {
            if chunk.is_empty() {
                continue;
            }
            let Ok(text) = std::str::from_utf8(chunk) else {
                continue;
            };
            if let Some(captures) = self.regex.captures(text) {
                if let Some(version) = captures.iter().skip(1).flatten().next() {
                    versions.insert(version.as_str().to_owned());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_str(name: &str, haystack: &[u8]) -> BTreeSet<String> {
        let mut versions = BTreeSet::new();
        VersionScanner::for_binary(name).scan(&mut versions, haystack);
        versions
    }

    #[test]
    fn test_default_regex_is_strict() {
        let found = scan_str("unknown-binary", b"2.7.3\0not-a-version\0v1.2\0");
        assert_eq!(found.len(), 1);
        assert!(found.contains("2.7.3"));
    }

    #[test]
    fn test_ssh_catalogue_entry() {
        let found = scan_str("ssh", b"junk\0OpenSSH_6.6p1 Ubuntu-2ubuntu2\0");
        assert_eq!(found.len(), 1);
        assert!(found.contains("6.6p1"));
    }

    #[test]
    fn test_bash_catalogue_entry() {
        let found = scan_str("bash", b"GNU bash, version 4.3.11(1)-release\0");
        assert!(found.contains("4.3.11"));
    }

    #[test]
    fn test_python_catalogue_entry() {
        let found = scan_str("python2.7", b"2.7.6\03.4.0\0");
        assert_eq!(found.len(), 1);
        assert!(found.contains("2.7.6"));
    }

    #[test]
    fn test_nul_split_respects_boundaries() {
        // the default anchors both ends, so embedded text must not match
        let found = scan_str("unknown", b"prefix 1.2.3 suffix\0");
        assert!(found.is_empty());
    }

    #[test]
    fn test_invalid_utf8_skipped() {
        let mut bytes = vec![0xff, 0xfe, 0x00];
        bytes.extend_from_slice(b"1.2.3\0");
        let found = scan_str("unknown", &bytes);
        assert!(found.contains("1.2.3"));
    }
}
