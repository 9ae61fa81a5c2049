//! The blobmap: a timestamped collection of dependency graphs sharing one
//! metadata store.
//!
//! Each scan adds exactly one graph, keyed by the wall-clock second the
//! scan started; graphs already in the map are never touched again. Views
//! expose the query side (reachability, filters, induced subgraphs,
//! projections, diffs, DOT and JSON export), and the whole structure
//! round-trips through a single archive file.

pub mod archive;
pub mod diff;
pub mod graph;
pub mod view;

pub use archive::ArchiveError;
pub use diff::{BlobMapDiff, NodeDiff};
pub use graph::{Graph, GraphProjection, NodeWeight};
pub use view::BlobMapView;

use binmap_common::{Metadata, MetadataError};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobMapError {
    /// A query named a path with no vertex behind it.
    #[error("no node for path {0}")]
    UnknownPath(String),
    /// `last()`/`back_key()` on a blobmap with no graphs.
    #[error("no graph available")]
    Empty,
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Timestamp → graph map plus the shared metadata store.
#[derive(Debug, Default)]
pub struct BlobMap {
    graphs: BTreeMap<u64, Graph>,
    metadata: Metadata,
}

impl BlobMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the archive at `path`, or starts empty when no file exists.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        if path.exists() {
            archive::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Serializes the whole blobmap into a single archive file.
    pub fn store(&self, path: &Path) -> Result<(), ArchiveError> {
        archive::save(self, path)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Creates the (empty) graph for `timestamp`. The key must be fresh;
    /// the scanner guarantees this by spinning for an unused second.
    pub fn create(&mut self, timestamp: u64) -> &mut Graph {
        debug_assert!(!self.graphs.contains_key(&timestamp));
        self.graphs.entry(timestamp).or_default()
    }

    pub fn contains_key(&self, timestamp: u64) -> bool {
        self.graphs.contains_key(&timestamp)
    }

    pub fn graph(&self, timestamp: u64) -> Option<&Graph> {
        self.graphs.get(&timestamp)
    }

    pub fn graph_mut(&mut self, timestamp: u64) -> Option<&mut Graph> {
        self.graphs.get_mut(&timestamp)
    }

    pub fn keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.graphs.keys().copied()
    }

    /// View over the graph stored at `timestamp`.
    pub fn at(&self, timestamp: u64) -> Option<BlobMapView<'_>> {
        self.graphs
            .get(&timestamp)
            .map(|g| BlobMapView::new(&self.metadata, g.clone()))
    }

    pub fn values(&self) -> impl Iterator<Item = BlobMapView<'_>> {
        self.graphs
            .values()
            .map(|g| BlobMapView::new(&self.metadata, g.clone()))
    }

    pub fn items(&self) -> impl Iterator<Item = (u64, BlobMapView<'_>)> {
        self.graphs
            .iter()
            .map(|(&ts, g)| (ts, BlobMapView::new(&self.metadata, g.clone())))
    }

    /// Largest timestamp present.
    pub fn back_key(&self) -> Result<u64, BlobMapError> {
        self.graphs
            .keys()
            .next_back()
            .copied()
            .ok_or(BlobMapError::Empty)
    }

    /// View over the most recent graph.
    pub fn last(&self) -> Result<BlobMapView<'_>, BlobMapError> {
        let key = self.back_key()?;
        self.at(key).ok_or(BlobMapError::Empty)
    }

    pub fn size(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    pub(crate) fn items_raw(&self) -> impl Iterator<Item = (u64, &Graph)> {
        self.graphs.iter().map(|(&ts, g)| (ts, g))
    }

    pub(crate) fn insert_graph(&mut self, timestamp: u64, graph: Graph) {
        self.graphs.insert(timestamp, graph);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmap_common::{Hash, MetadataInfo};

    #[test]
    fn test_empty_blobmap_has_no_last() {
        let bm = BlobMap::new();
        assert!(matches!(bm.back_key(), Err(BlobMapError::Empty)));
        assert!(bm.last().is_err());
    }

    #[test]
    fn test_back_key_is_max() {
        let mut bm = BlobMap::new();
        bm.create(5);
        bm.create(50);
        bm.create(10);
        assert_eq!(bm.back_key().unwrap(), 50);
        assert_eq!(bm.size(), 3);
    }

    #[test]
    fn test_open_missing_archive_is_empty() {
        let bm = BlobMap::open(Path::new("/nonexistent/blobs.dat")).unwrap();
        assert!(bm.is_empty());
    }

    #[test]
    fn test_view_shares_metadata() {
        let mut bm = BlobMap::new();
        let hash = Hash::of_str("app");
        bm.metadata_mut()
            .insert(MetadataInfo::with_name(hash.clone(), "app"));
        let graph = bm.create(1);
        graph.add_node("/bin/app", hash);

        let view = bm.last().unwrap();
        assert_eq!(view.get("/bin/app").unwrap().name, "app");
    }

    #[test]
    fn test_store_and_reopen() {
        let tmp = std::env::temp_dir().join("binmap_blobmap_reopen.dat");
        let mut bm = BlobMap::new();
        let hash = Hash::of_str("x");
        bm.metadata_mut()
            .insert(MetadataInfo::with_name(hash.clone(), "x"));
        bm.create(7).add_node("/bin/x", hash);
        bm.store(&tmp).unwrap();

        let reloaded = BlobMap::open(&tmp).unwrap();
        assert_eq!(reloaded.back_key().unwrap(), 7);
        assert_eq!(reloaded.last().unwrap().size(), 1);
        std::fs::remove_file(&tmp).ok();
    }
}
