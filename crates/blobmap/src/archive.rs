//! On-disk archive for a blobmap.
//!
//! The wire format is a flat rkyv document: per-graph node and edge lists
//! plus the metadata table, all in deterministic order so that a
//! load/store cycle reproduces the same bytes. The in-memory graph is
//! rebuilt by inserting vertices in archived order, which keeps edge
//! indices valid.

use crate::graph::Graph;
use crate::BlobMap;
use binmap_common::{HardeningFeature, Hash, Metadata, MetadataInfo};
use rkyv::{Archive, Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive encoding failed: {0}")]
    Encode(String),
    #[error("archive decoding failed: {0}")]
    Decode(String),
}

#[derive(Debug, PartialEq, Archive, Deserialize, Serialize)]
struct NodeRecord {
    path: String,
    hash: String,
}

#[derive(Debug, PartialEq, Archive, Deserialize, Serialize)]
struct GraphRecord {
    timestamp: u64,
    nodes: Vec<NodeRecord>,
    edges: Vec<(u32, u32)>,
}

#[derive(Debug, PartialEq, Archive, Deserialize, Serialize)]
struct MetadataRecord {
    hash: String,
    name: String,
    version: String,
    imported_symbols: Vec<String>,
    exported_symbols: Vec<String>,
    hardening_features: Vec<u8>,
}

#[derive(Debug, PartialEq, Archive, Deserialize, Serialize)]
struct ArchiveDoc {
    graphs: Vec<GraphRecord>,
    metadata: Vec<MetadataRecord>,
}

fn graph_to_record(timestamp: u64, graph: &Graph) -> GraphRecord {
    let nodes = graph
        .node_indices()
        .map(|idx| NodeRecord {
            path: graph.key(idx).to_owned(),
            hash: graph.hash_at(idx).as_str().to_owned(),
        })
        .collect();
    let edges = graph
        .edge_indices()
        .map(|(a, b)| (a as u32, b as u32))
        .collect();
    GraphRecord {
        timestamp,
        nodes,
        edges,
    }
}

fn record_to_graph(record: &GraphRecord) -> Graph {
    let mut graph = Graph::new();
    for node in &record.nodes {
        graph.restore_node(node.path.clone(), Hash::from_digest(node.hash.clone()));
    }
    for &(a, b) in &record.edges {
        graph.restore_edge(a as usize, b as usize);
    }
    graph
}

fn metadata_to_records(metadata: &Metadata) -> Vec<MetadataRecord> {
    let mut records: Vec<MetadataRecord> = metadata
        .iter()
        .map(|info| MetadataRecord {
            hash: info.hash.as_str().to_owned(),
            name: info.name.clone(),
            version: info.version.clone(),
            imported_symbols: info.imported_symbols.iter().cloned().collect(),
            exported_symbols: info.exported_symbols.iter().cloned().collect(),
            hardening_features: info.hardening_features.iter().map(|&f| f as u8).collect(),
        })
        .collect();
    records.sort_by(|a, b| a.hash.cmp(&b.hash));
    records
}

fn records_to_metadata(records: &[MetadataRecord]) -> Metadata {
    let mut metadata = Metadata::new();
    for record in records {
        let mut info = MetadataInfo::new(Hash::from_digest(record.hash.clone()));
        info.name = record.name.clone();
        info.version = record.version.clone();
        info.imported_symbols = record.imported_symbols.iter().cloned().collect();
        info.exported_symbols = record.exported_symbols.iter().cloned().collect();
        for &raw in &record.hardening_features {
            match HardeningFeature::from_repr(raw) {
                Some(feature) => {
                    info.hardening_features.insert(feature);
                }
                None => warn!("unknown hardening feature tag {raw} in archive, dropped"),
            }
        }
        metadata.insert(info);
    }
    metadata
}

/// Serializes `blobmap` into `path` as a single archive file.
pub fn save(blobmap: &BlobMap, path: &Path) -> Result<(), ArchiveError> {
    let doc = ArchiveDoc {
        graphs: blobmap
            .items_raw()
            .map(|(ts, graph)| graph_to_record(ts, graph))
            .collect(),
        metadata: metadata_to_records(blobmap.metadata()),
    };
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&doc)
        .map_err(|e| ArchiveError::Encode(e.to_string()))?;
    std::fs::write(path, &bytes)?;
    Ok(())
}

/// Loads a blobmap from the archive at `path`.
pub fn load(path: &Path) -> Result<BlobMap, ArchiveError> {
    let bytes = std::fs::read(path)?;
    let doc = rkyv::from_bytes::<ArchiveDoc, rkyv::rancor::Error>(&bytes)
        .map_err(|e| ArchiveError::Decode(e.to_string()))?;
    let mut blobmap = BlobMap::new();
    *blobmap.metadata_mut() = records_to_metadata(&doc.metadata);
    for record in &doc.graphs {
        blobmap.insert_graph(record.timestamp, record_to_graph(record));
    }
    Ok(blobmap)
}
