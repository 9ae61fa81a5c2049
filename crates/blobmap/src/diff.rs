//! Differences between two blobmap views.

use binmap_common::MetadataInfo;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Change record for one path present in both views.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeDiff {
    /// Metadata in (self, other) order.
    pub metadata: (MetadataInfo, MetadataInfo),
    /// Dependency sets in (self, other) order.
    pub deps: (BTreeSet<String>, BTreeSet<String>),
}

impl NodeDiff {
    /// A node diff is empty when metadata and dependencies both agree.
    pub fn is_empty(&self) -> bool {
        self.metadata.0 == self.metadata.1 && self.deps.0 == self.deps.1
    }
}

impl fmt::Display for NodeDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.metadata.0 != self.metadata.1 {
            writeln!(f, "metadata changes:")?;
            writeln!(f, "-{}", self.metadata.0)?;
            writeln!(f, "+{}", self.metadata.1)?;
        }
        if self.deps.0 != self.deps.1 {
            let added: Vec<_> = self.deps.1.difference(&self.deps.0).collect();
            let removed: Vec<_> = self.deps.0.difference(&self.deps.1).collect();
            writeln!(f, "dependency changes:")?;
            writeln!(f, "-{}", removed.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "))?;
            writeln!(f, "+{}", added.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "))?;
        }
        Ok(())
    }
}

/// Full difference between two views: paths only in the other view, paths
/// only in this one, and per-path changes for the intersection.
#[derive(Debug, Clone, Default)]
pub struct BlobMapDiff {
    pub added_nodes: BTreeSet<String>,
    pub removed_nodes: BTreeSet<String>,
    pub updated: BTreeMap<String, NodeDiff>,
}

impl BlobMapDiff {
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty() && self.removed_nodes.is_empty() && self.updated.is_empty()
    }
}
