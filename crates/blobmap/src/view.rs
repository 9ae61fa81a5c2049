//! Read-only query surface over one graph plus the shared metadata.
//!
//! A view owns its graph (filters and induced subgraphs build new ones)
//! and borrows the metadata store of the blobmap it came from.

use crate::diff::{BlobMapDiff, NodeDiff};
use crate::graph::{Graph, GraphProjection};
use crate::BlobMapError;
use binmap_common::{Metadata, MetadataInfo};
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::io::{self, Write};

pub struct BlobMapView<'m> {
    metadata: &'m Metadata,
    graph: Graph,
}

impl<'m> BlobMapView<'m> {
    pub fn new(metadata: &'m Metadata, graph: Graph) -> Self {
        BlobMapView { metadata, graph }
    }

    pub fn metadata(&self) -> &'m Metadata {
        self.metadata
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn size(&self) -> usize {
        self.graph.size()
    }

    pub fn has_node(&self, key: &str) -> bool {
        self.graph.has_node(key)
    }

    pub fn has_path(&self, from: &str, to: &str) -> bool {
        self.graph.has_path(from, to)
    }

    pub fn successors(&self, key: &str) -> BTreeSet<String> {
        self.graph.successors(key)
    }

    pub fn predecessors(&self, key: &str) -> BTreeSet<String> {
        self.graph.predecessors(key)
    }

    /// Metadata record for the binary at `key`.
    pub fn get(&self, key: &str) -> Result<&'m MetadataInfo, BlobMapError> {
        let hash = self
            .graph
            .hash(key)
            .ok_or_else(|| BlobMapError::UnknownPath(key.to_owned()))?;
        Ok(self.metadata.get(hash)?)
    }

    /// New view keeping the nodes `predicate` accepts and the edges whose
    /// endpoints both survive.
    pub fn filter<F>(&self, predicate: F) -> Result<BlobMapView<'m>, BlobMapError>
    where
        F: Fn(&str, &MetadataInfo, &BlobMapView) -> bool,
    {
        let mut out = Graph::new();
        for idx in self.graph.node_indices() {
            let key = self.graph.key(idx);
            let md = self.metadata.get(self.graph.hash_at(idx))?;
            if predicate(key, md, self) {
                out.add_node(key, self.graph.hash_at(idx).clone());
            }
        }
        for idx in self.graph.node_indices() {
            let key = self.graph.key(idx).to_owned();
            if !out.has_node(&key) {
                continue;
            }
            for target in self.graph.out_targets(idx) {
                let tkey = self.graph.key(target);
                if out.has_node(tkey) {
                    out.add_edge(&key, tkey);
                }
            }
        }
        Ok(BlobMapView::new(self.metadata, out))
    }

    /// Subgraph of nodes reachable from `key`.
    pub fn induced_successors(&self, key: &str) -> Result<BlobMapView<'m>, BlobMapError> {
        self.filter(|to, _, view| view.has_path(key, to))
    }

    /// Subgraph of nodes from which `key` is reachable.
    pub fn induced_predecessors(&self, key: &str) -> Result<BlobMapView<'m>, BlobMapError> {
        self.filter(|from, _, view| view.has_path(from, key))
    }

    /// Subgraph of nodes connected to `key` in either direction.
    pub fn induced_graph(&self, key: &str) -> Result<BlobMapView<'m>, BlobMapError> {
        self.filter(|node, _, view| view.has_path(node, key) || view.has_path(key, node))
    }

    /// Collapses the graph through `project`: vertices whose metadata map
    /// to the same value merge into one.
    pub fn project<T, P>(&self, project: P) -> Result<GraphProjection<T>, BlobMapError>
    where
        T: Clone + Eq + std::hash::Hash + Display,
        P: Fn(&MetadataInfo) -> T,
    {
        let mut out = GraphProjection::new();
        for idx in self.graph.node_indices() {
            let md = self.metadata.get(self.graph.hash_at(idx))?;
            let key = project(md);
            if !out.has_node(&key) {
                out.add_node(key);
            }
        }
        for idx in self.graph.node_indices() {
            let md = self.metadata.get(self.graph.hash_at(idx))?;
            let key = project(md);
            for target in self.graph.out_targets(idx) {
                let tmd = self.metadata.get(self.graph.hash_at(target))?;
                out.add_edge(&key, &project(tmd));
            }
        }
        Ok(out)
    }

    /// Difference against `other`: added = only there, removed = only here,
    /// updated = present in both with different metadata or dependencies.
    pub fn diff(&self, other: &BlobMapView) -> Result<BlobMapDiff, BlobMapError> {
        let mut diff = BlobMapDiff::default();
        for idx in self.graph.node_indices() {
            let key = self.graph.key(idx);
            if other.graph.has_node(key) {
                let node_diff = NodeDiff {
                    metadata: (self.get(key)?.clone(), other.get(key)?.clone()),
                    deps: (self.graph.successors(key), other.graph.successors(key)),
                };
                if !node_diff.is_empty() {
                    diff.updated.insert(key.to_owned(), node_diff);
                }
            } else {
                diff.removed_nodes.insert(key.to_owned());
            }
        }
        for idx in other.graph.node_indices() {
            let key = other.graph.key(idx);
            if !self.graph.has_node(key) {
                diff.added_nodes.insert(key.to_owned());
            }
        }
        Ok(diff)
    }

    pub fn dot(&self, out: impl Write) -> io::Result<()> {
        self.graph.dot(out)
    }

    /// JSON rendering:
    /// `{"nodes":[{"path","meta":{"version","hash","name"},"nbChildren"}],
    ///   "links":[{"source","target"}]}`.
    pub fn json(&self) -> Result<String, BlobMapError> {
        let mut nodes = Vec::new();
        let mut links = Vec::new();
        for idx in self.graph.node_indices() {
            let key = self.graph.key(idx);
            let hash = self.graph.hash_at(idx);
            let md = self.metadata.get(hash)?;
            let succs = self.graph.successors(key);
            nodes.push(json!({
                "path": key,
                "meta": {
                    "version": md.version,
                    "hash": hash.as_str(),
                    "name": md.name,
                },
                "nbChildren": succs.len(),
            }));
            for succ in succs {
                links.push(json!({
                    "source": key,
                    "target": succ,
                }));
            }
        }
        Ok(json!({ "nodes": nodes, "links": links }).to_string())
    }
}
