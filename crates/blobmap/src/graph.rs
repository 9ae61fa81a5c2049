//! Directed graph of canonical binary paths.
//!
//! Vertices carry `{path, hash}`; edges point from a binary to the
//! libraries it loads. Keys are path strings, not `PathBuf`: the
//! reconciliation scheme below depends on sentinel `.` / `/.` parent
//! components that `Path` equality would normalize away.
//!
//! During a scan, unresolved imports arrive keyed under a sentinel parent,
//! and the same library may later show up fully qualified. Both directions
//! are reconciled in [`Graph::add_node`] so one physical binary is always
//! one vertex.

use binmap_common::Hash;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Display;
use std::io::{self, Write};
use std::path::Path;

/// Vertex payload: the canonical path and the content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeWeight {
    pub path: String,
    pub hash: Hash,
}

/// Splits off the final path component, boost-style: `"/./x"` has parent
/// `"/."`, `"./x"` has parent `"."`, a bare name has an empty parent.
fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

fn join(dir: &str, file: &str) -> String {
    if dir.is_empty() {
        file.to_owned()
    } else if dir.ends_with('/') {
        format!("{dir}{file}")
    } else {
        format!("{dir}/{file}")
    }
}

/// Parent values marking an unresolved library name.
fn is_sentinel_parent(parent: &str) -> bool {
    parent == "." || parent == "/."
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    graph: DiGraph<NodeWeight, ()>,
    mapping: HashMap<String, NodeIndex>,
    /// Every parent directory seen while adding nodes, sentinels included.
    seen_parents: HashSet<String>,
    /// Lazy all-pairs reachability, invalidated by any mutation.
    reach: RefCell<Option<Vec<Vec<bool>>>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_node(&self, path: &str) -> bool {
        self.mapping.contains_key(path)
    }

    pub fn size(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Inserts a vertex for `input` and returns its canonical path.
    ///
    /// Reconciliation rules, applied before allocating anything:
    /// 1. Known path: return it unchanged.
    /// 2. Sentinel parent: if some previously seen directory already holds
    ///    a node with the same filename, that node is the canonical one.
    /// 3. Qualified parent: if a sentinel-keyed node with the same filename
    ///    exists, rekey it to `input` and adopt `hash`.
    /// 4. Otherwise allocate a fresh vertex.
    pub fn add_node(&mut self, input: &str, hash: Hash) -> String {
        let key = self.reconcile(input, hash);
        debug_assert!(
            self.has_node(&key),
            "canonicalization must return a live vertex"
        );
        key
    }

    fn reconcile(&mut self, input: &str, hash: Hash) -> String {
        if self.has_node(input) {
            return input.to_owned();
        }
        *self.reach.get_mut() = None;

        let (parent, filename) = split_parent(input);
        self.seen_parents.insert(parent.to_owned());

        if is_sentinel_parent(parent) {
            for dir in &self.seen_parents {
                if is_sentinel_parent(dir) {
                    continue;
                }
                let candidate = join(dir, filename);
                if self.mapping.contains_key(&candidate) {
                    return candidate;
                }
            }
        } else {
            for sentinel in ["/.", "."] {
                let placeholder = join(sentinel, filename);
                if let Some(&idx) = self.mapping.get(&placeholder) {
                    self.mapping.remove(&placeholder);
                    self.mapping.insert(input.to_owned(), idx);
                    self.graph[idx] = NodeWeight {
                        path: input.to_owned(),
                        hash,
                    };
                    return input.to_owned();
                }
            }
        }

        let idx = self.graph.add_node(NodeWeight {
            path: input.to_owned(),
            hash,
        });
        self.mapping.insert(input.to_owned(), idx);
        input.to_owned()
    }

    /// Adds an edge `from -> to`. `from` must already be a vertex; `to` is
    /// created on demand (content hash when the file exists, string hash
    /// otherwise). Self-loops are dropped.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        assert!(self.has_node(from), "add_edge: unknown source {from:?}");
        let to_path = if self.has_node(to) {
            to.to_owned()
        } else {
            self.add_node(to, Hash::of_path(Path::new(to)))
        };
        if from == to_path {
            return;
        }
        *self.reach.get_mut() = None;
        let a = self.mapping[from];
        let b = self.mapping[&to_path];
        self.graph.update_edge(a, b, ());
    }

    /// Whether a directed path `from -> ... -> to` exists. Both endpoints
    /// must be vertices. The first call pays for the all-pairs closure;
    /// subsequent calls on an unchanged graph are O(1).
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        let a = self.mapping[from].index();
        let b = self.mapping[to].index();
        let mut cache = self.reach.borrow_mut();
        let reach = cache.get_or_insert_with(|| self.compute_reachability());
        reach[a][b]
    }

    fn compute_reachability(&self) -> Vec<Vec<bool>> {
        let n = self.graph.node_count();
        let mut reach = vec![vec![false; n]; n];
        for (i, row) in reach.iter_mut().enumerate() {
            row[i] = true;
        }
        for edge in self.graph.edge_references() {
            reach[edge.source().index()][edge.target().index()] = true;
        }
        for k in 0..n {
            for i in 0..n {
                if !reach[i][k] {
                    continue;
                }
                for j in 0..n {
                    if reach[k][j] {
                        reach[i][j] = true;
                    }
                }
            }
        }
        reach
    }

    /// Canonical path attached to a vertex.
    pub fn key(&self, idx: NodeIndex) -> &str {
        &self.graph[idx].path
    }

    /// Hash attached to a vertex.
    pub fn hash_at(&self, idx: NodeIndex) -> &Hash {
        &self.graph[idx].hash
    }

    /// Hash attached to a path, if the path is a vertex.
    pub fn hash(&self, path: &str) -> Option<&Hash> {
        self.mapping.get(path).map(|&idx| &self.graph[idx].hash)
    }

    pub fn successors(&self, key: &str) -> BTreeSet<String> {
        self.neighbors(key, Direction::Outgoing)
    }

    pub fn predecessors(&self, key: &str) -> BTreeSet<String> {
        self.neighbors(key, Direction::Incoming)
    }

    fn neighbors(&self, key: &str, dir: Direction) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        if let Some(&idx) = self.mapping.get(key) {
            for n in self.graph.neighbors_directed(idx, dir) {
                out.insert(self.graph[n].path.clone());
            }
        }
        out
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|w| w.path.as_str())
    }

    /// Out-edge targets of a vertex, by index.
    pub fn out_targets(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(idx, Direction::Outgoing)
    }

    /// Edge list as `(source index, target index)` pairs.
    pub fn edge_indices(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.graph
            .edge_references()
            .map(|e| (e.source().index(), e.target().index()))
    }

    /// Writes the graph in Graphviz DOT form, vertices labelled by path.
    pub fn dot(&self, mut out: impl Write) -> io::Result<()> {
        writeln!(out, "digraph G {{")?;
        for idx in self.graph.node_indices() {
            writeln!(
                out,
                "  {} [label=\"{}\"];",
                idx.index(),
                escape_label(&self.graph[idx].path)
            )?;
        }
        for edge in self.graph.edge_references() {
            writeln!(out, "  {} -> {};", edge.source().index(), edge.target().index())?;
        }
        writeln!(out, "}}")
    }

    /// Reinstates a vertex exactly as archived, bypassing reconciliation.
    pub(crate) fn restore_node(&mut self, path: String, hash: Hash) {
        let (parent, _) = split_parent(&path);
        self.seen_parents.insert(parent.to_owned());
        let idx = self.graph.add_node(NodeWeight {
            path: path.clone(),
            hash,
        });
        self.mapping.insert(path, idx);
    }

    /// Reinstates an archived edge by vertex insertion order.
    pub(crate) fn restore_edge(&mut self, from: usize, to: usize) {
        self.graph
            .update_edge(NodeIndex::new(from), NodeIndex::new(to), ());
    }
}

fn escape_label(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Graph obtained by collapsing vertices through a projection of their
/// metadata; vertices mapping to the same value merge.
#[derive(Debug, Clone)]
pub struct GraphProjection<T> {
    graph: DiGraph<T, ()>,
    mapping: HashMap<T, NodeIndex>,
}

impl<T> Default for GraphProjection<T> {
    fn default() -> Self {
        GraphProjection {
            graph: DiGraph::new(),
            mapping: HashMap::new(),
        }
    }
}

impl<T: Clone + Eq + std::hash::Hash + Display> GraphProjection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_node(&self, key: &T) -> bool {
        self.mapping.contains_key(key)
    }

    pub fn add_node(&mut self, key: T) {
        debug_assert!(!self.has_node(&key));
        let idx = self.graph.add_node(key.clone());
        self.mapping.insert(key, idx);
    }

    pub fn add_edge(&mut self, from: &T, to: &T) {
        let a = self.mapping[from];
        let b = self.mapping[to];
        self.graph.update_edge(a, b, ());
    }

    pub fn size(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn keys(&self) -> impl Iterator<Item = &T> {
        self.graph.node_weights()
    }

    pub fn dot(&self, mut out: impl Write) -> io::Result<()> {
        writeln!(out, "digraph G {{")?;
        for idx in self.graph.node_indices() {
            writeln!(
                out,
                "  {} [label=\"{}\"];",
                idx.index(),
                escape_label(&self.graph[idx].to_string())
            )?;
        }
        for edge in self.graph.edge_references() {
            writeln!(out, "  {} -> {};", edge.source().index(), edge.target().index())?;
        }
        writeln!(out, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> Hash {
        Hash::of_str(s)
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("/bin/app"), ("/bin", "app"));
        assert_eq!(split_parent("/./x.dll"), ("/.", "x.dll"));
        assert_eq!(split_parent("./x.dll"), (".", "x.dll"));
        assert_eq!(split_parent("libc.so.6"), ("", "libc.so.6"));
        assert_eq!(split_parent("/app"), ("/", "app"));
    }

    #[test]
    fn test_add_node_and_lookup() {
        let mut g = Graph::new();
        let key = g.add_node("/bin/app", h("app"));
        assert_eq!(key, "/bin/app");
        assert!(g.has_node("/bin/app"));
        assert_eq!(g.hash("/bin/app"), Some(&h("app")));
        assert_eq!(g.size(), 1);
    }

    #[test]
    fn test_add_node_twice_is_one_vertex() {
        let mut g = Graph::new();
        g.add_node("/bin/app", h("a"));
        g.add_node("/bin/app", h("b"));
        assert_eq!(g.size(), 1);
        // first hash wins, the node was not rewritten
        assert_eq!(g.hash("/bin/app"), Some(&h("a")));
    }

    #[test]
    fn test_sentinel_folds_into_known_directory() {
        let mut g = Graph::new();
        g.add_node("/lib/libc.so.6", h("libc"));
        // an unresolved reference to the same filename folds into /lib
        let key = g.add_node("./libc.so.6", h("placeholder"));
        assert_eq!(key, "/lib/libc.so.6");
        assert_eq!(g.size(), 1);
    }

    #[test]
    fn test_qualified_path_rekeys_placeholder() {
        let mut g = Graph::new();
        g.add_node("./libssl.so.1", h("str-hash"));
        assert_eq!(g.size(), 1);
        let key = g.add_node("/usr/lib/libssl.so.1", h("content"));
        assert_eq!(key, "/usr/lib/libssl.so.1");
        assert_eq!(g.size(), 1);
        assert!(!g.has_node("./libssl.so.1"));
        assert_eq!(g.hash("/usr/lib/libssl.so.1"), Some(&h("content")));
    }

    #[test]
    fn test_rooted_sentinel_rekeys_too() {
        let mut g = Graph::new();
        g.add_node("/./comctl32.dll", h("str-hash"));
        let key = g.add_node("/windows/system32/comctl32.dll", h("content"));
        assert_eq!(key, "/windows/system32/comctl32.dll");
        assert_eq!(g.size(), 1);
    }

    #[test]
    fn test_rekey_preserves_edges() {
        let mut g = Graph::new();
        g.add_node("/bin/app", h("app"));
        g.add_edge("/bin/app", "./libz.so.1");
        assert_eq!(g.size(), 2);
        g.add_node("/lib/libz.so.1", h("z"));
        assert_eq!(g.size(), 2);
        let succs = g.successors("/bin/app");
        assert!(succs.contains("/lib/libz.so.1"));
    }

    #[test]
    fn test_add_edge_creates_target() {
        let mut g = Graph::new();
        g.add_node("/bin/app", h("app"));
        g.add_edge("/bin/app", "libm.so.6");
        assert_eq!(g.size(), 2);
        assert!(g.has_node("libm.so.6"));
    }

    #[test]
    fn test_self_loop_suppressed() {
        let mut g = Graph::new();
        g.add_node("/bin/app", h("app"));
        g.add_edge("/bin/app", "/bin/app");
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn test_parallel_edges_collapse() {
        let mut g = Graph::new();
        g.add_node("/bin/app", h("app"));
        g.add_edge("/bin/app", "/lib/libc.so.6");
        g.add_edge("/bin/app", "/lib/libc.so.6");
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn test_has_path_reflexive_and_transitive() {
        let mut g = Graph::new();
        g.add_node("/a", h("a"));
        g.add_edge("/a", "/b");
        g.add_edge("/b", "/c");
        assert!(g.has_path("/a", "/a"));
        assert!(g.has_path("/a", "/b"));
        assert!(g.has_path("/a", "/c"));
        assert!(!g.has_path("/c", "/a"));
    }

    #[test]
    fn test_has_path_cache_invalidated_by_mutation() {
        let mut g = Graph::new();
        g.add_node("/a", h("a"));
        g.add_node("/b", h("b"));
        assert!(!g.has_path("/a", "/b"));
        g.add_edge("/a", "/b");
        assert!(g.has_path("/a", "/b"));
    }

    #[test]
    fn test_successors_predecessors() {
        let mut g = Graph::new();
        g.add_node("/a", h("a"));
        g.add_edge("/a", "/b");
        g.add_edge("/a", "/c");
        assert_eq!(g.successors("/a").len(), 2);
        assert!(g.predecessors("/b").contains("/a"));
        assert!(g.predecessors("/a").is_empty());
    }

    #[test]
    fn test_dot_output_labels_paths() {
        let mut g = Graph::new();
        g.add_node("/bin/app", h("app"));
        g.add_edge("/bin/app", "/lib/libc.so.6");
        let mut buf = Vec::new();
        g.dot(&mut buf).unwrap();
        let dot = String::from_utf8(buf).unwrap();
        assert!(dot.starts_with("digraph G {"));
        assert!(dot.contains("label=\"/bin/app\""));
        assert!(dot.contains("->"));
    }

    #[test]
    fn test_projection_collapses_duplicates() {
        let mut p: GraphProjection<String> = GraphProjection::new();
        p.add_node("libc".to_string());
        p.add_node("app".to_string());
        p.add_edge(&"app".to_string(), &"libc".to_string());
        assert_eq!(p.size(), 2);
        assert_eq!(p.edge_count(), 1);
    }
}
