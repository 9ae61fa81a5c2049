//! Per-binary metadata records and the hash-keyed store.
//!
//! One [`MetadataInfo`] exists per distinct content hash; several graph
//! vertices (hardlinks, copies, the same library seen in two scans) may
//! point at the same record. Insertion merges: fields already known win,
//! and a warning is raised when two scans disagree on a non-empty field.

use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Compile/link-time mitigations detectable from headers or symbol tables.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum HardeningFeature {
    /// ET_DYN executable with a PT_PHDR segment.
    PositionIndependentExecutable = 0,
    /// `__stack_chk_fail` is imported.
    StackProtected = 1,
    /// At least one `__*_chk` fortified libc entry point is imported.
    Fortified = 2,
    /// PT_GNU_RELRO segment present.
    ReadOnlyRelocations = 3,
    /// DT_BIND_NOW (or DF_BIND_NOW) requested.
    ImmediateBinding = 4,
    /// /GS stack cookie (non-zero SecurityCookie in the load config).
    PeStackProtected = 5,
    /// /SAFESEH handler table registered.
    PeSafeSeh = 6,
    /// ASLR-compatible image (DYNAMIC_BASE).
    PeDynamicBase = 7,
    /// 64-bit ASLR entropy (HIGH_ENTROPY_VA).
    PeHighEntropyVa = 8,
    /// Code-integrity signing enforced (FORCE_INTEGRITY).
    PeForceIntegrity = 9,
    /// DEP/NX compatible image.
    PeNxCompat = 10,
    /// Image must run in an AppContainer.
    PeAppContainer = 11,
    /// Control Flow Guard instrumented.
    PeGuardCf = 12,
}

impl HardeningFeature {
    pub fn from_repr(v: u8) -> Option<Self> {
        use HardeningFeature::*;
        Some(match v {
            0 => PositionIndependentExecutable,
            1 => StackProtected,
            2 => Fortified,
            3 => ReadOnlyRelocations,
            4 => ImmediateBinding,
            5 => PeStackProtected,
            6 => PeSafeSeh,
            7 => PeDynamicBase,
            8 => PeHighEntropyVa,
            9 => PeForceIntegrity,
            10 => PeNxCompat,
            11 => PeAppContainer,
            12 => PeGuardCf,
            _ => return None,
        })
    }
}

/// Everything the collectors learned about one binary, keyed by its hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataInfo {
    pub hash: Hash,
    pub name: String,
    pub version: String,
    pub imported_symbols: BTreeSet<String>,
    pub exported_symbols: BTreeSet<String>,
    pub hardening_features: BTreeSet<HardeningFeature>,
}

impl MetadataInfo {
    pub fn new(hash: Hash) -> Self {
        MetadataInfo {
            hash,
            ..Default::default()
        }
    }

    pub fn with_name(hash: Hash, name: impl Into<String>) -> Self {
        MetadataInfo {
            hash,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Merges `incoming` into `self`: non-empty incumbent fields win, empty
    /// ones are filled. Disagreements between two non-empty sides are
    /// surfaced as warnings and the incumbent is kept.
    pub fn update(&mut self, incoming: &MetadataInfo) {
        if self.name.is_empty() {
            self.name = incoming.name.clone();
        } else if !incoming.name.is_empty() && self.name != incoming.name {
            warn!(
                "found different canonical names for sha1 `{}': {} vs. {}",
                self.hash, self.name, incoming.name
            );
        }

        if self.version.is_empty() {
            self.version = incoming.version.clone();
        } else if !incoming.version.is_empty() && self.version != incoming.version {
            warn!(
                "found different versions for sha1 `{}': {} vs. {}",
                self.hash, self.version, incoming.version
            );
        }

        if self.imported_symbols.is_empty() {
            self.imported_symbols = incoming.imported_symbols.clone();
        } else if !incoming.imported_symbols.is_empty()
            && self.imported_symbols != incoming.imported_symbols
        {
            warn!("found different imported symbol sets for sha1 `{}'", self.hash);
        }

        if self.exported_symbols.is_empty() {
            self.exported_symbols = incoming.exported_symbols.clone();
        } else if !incoming.exported_symbols.is_empty()
            && self.exported_symbols != incoming.exported_symbols
        {
            warn!("found different exported symbol sets for sha1 `{}'", self.hash);
        }

        if self.hardening_features.is_empty() {
            self.hardening_features = incoming.hardening_features.clone();
        } else if !incoming.hardening_features.is_empty()
            && self.hardening_features != incoming.hardening_features
        {
            warn!("found different hardening features for sha1 `{}'", self.hash);
        }
    }
}

impl fmt::Display for MetadataInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.hash)?;
        if !self.version.is_empty() {
            write!(f, "[{}]", self.version)?;
        }
        if !self.exported_symbols.is_empty() {
            write!(f, "({} exported symbols)", self.exported_symbols.len())?;
        }
        if !self.imported_symbols.is_empty() {
            write!(f, "({} imported symbols)", self.imported_symbols.len())?;
        }
        if !self.hardening_features.is_empty() {
            write!(f, "({} hardening features)", self.hardening_features.len())?;
        }
        Ok(())
    }
}

/// Errors from the metadata store.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Lookup of a hash nobody inserted. Reading back a hash that was never
    /// produced by a scan is an API misuse, not a scan-time condition.
    #[error("no metadata record for hash {0}")]
    NotFound(Hash),
}

/// Hash-keyed store of [`MetadataInfo`], shared by all graphs of a blobmap.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    db: HashMap<String, MetadataInfo>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `info`, merging into any record already present for its hash.
    pub fn insert(&mut self, info: MetadataInfo) {
        let key = info.hash.as_str().to_owned();
        match self.db.get_mut(&key) {
            Some(existing) => existing.update(&info),
            None => {
                self.db.insert(key, info);
            }
        }
    }

    pub fn get(&self, hash: &Hash) -> Result<&MetadataInfo, MetadataError> {
        self.db
            .get(hash.as_str())
            .ok_or_else(|| MetadataError::NotFound(hash.clone()))
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.db.contains_key(hash.as_str())
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetadataInfo> {
        self.db.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(hash: &str, name: &str, version: &str) -> MetadataInfo {
        MetadataInfo {
            hash: Hash::from_digest(hash),
            name: name.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_then_get() {
        let mut md = Metadata::new();
        md.insert(info("aa", "bash", "4.3"));
        let got = md.get(&Hash::from_digest("aa")).unwrap();
        assert_eq!(got.name, "bash");
        assert_eq!(got.version, "4.3");
    }

    #[test]
    fn test_get_unknown_hash_fails() {
        let md = Metadata::new();
        assert!(matches!(
            md.get(&Hash::from_digest("dead")),
            Err(MetadataError::NotFound(_))
        ));
    }

    #[test]
    fn test_merge_fills_empty_fields() {
        let mut md = Metadata::new();
        md.insert(info("aa", "", ""));
        md.insert(info("aa", "bash", "4.3"));
        let got = md.get(&Hash::from_digest("aa")).unwrap();
        assert_eq!(got.name, "bash");
        assert_eq!(got.version, "4.3");
        assert_eq!(md.len(), 1);
    }

    #[test]
    fn test_merge_incumbent_wins_on_conflict() {
        let mut md = Metadata::new();
        md.insert(info("aa", "bash", "4.3"));
        md.insert(info("aa", "dash", "0.5"));
        let got = md.get(&Hash::from_digest("aa")).unwrap();
        assert_eq!(got.name, "bash");
        assert_eq!(got.version, "4.3");
    }

    #[test]
    fn test_merge_set_fields() {
        let mut a = info("aa", "bash", "");
        let mut b = info("aa", "", "");
        b.imported_symbols.insert("printf".to_string());
        let mut md = Metadata::new();
        md.insert(a.clone());
        md.insert(b);
        let got = md.get(&Hash::from_digest("aa")).unwrap();
        assert!(got.imported_symbols.contains("printf"));

        // incumbent set wins once non-empty
        a.imported_symbols.insert("puts".to_string());
        md.insert(a);
        let got = md.get(&Hash::from_digest("aa")).unwrap();
        assert_eq!(got.imported_symbols.len(), 1);
    }

    #[test]
    fn test_info_equality_covers_all_fields() {
        let mut a = info("aa", "bash", "4.3");
        let b = a.clone();
        assert_eq!(a, b);
        a.hardening_features
            .insert(HardeningFeature::StackProtected);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hardening_repr_roundtrip() {
        for v in 0u8..13 {
            let f = HardeningFeature::from_repr(v).unwrap();
            assert_eq!(f as u8, v);
        }
        assert!(HardeningFeature::from_repr(13).is_none());
    }
}
