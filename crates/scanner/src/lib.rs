//! Recursive scan driver.
//!
//! Starting from the entry points, every visited binary contributes one
//! vertex (keyed by its trimmed, basename-lowercased path) and one edge
//! per dependency. Dependencies are visited before their edges are
//! inserted, so a reader never observes a dangling edge. Everything from
//! one scan lands in a single graph keyed by the wall-clock second the
//! first mutation happened; the scanner spins until it sees a second not
//! already taken by an earlier scan.

use anyhow::Context;
use binmap_blobmap::BlobMap;
use binmap_collectors::{Collector, Env};
use binmap_common::{Hash, MetadataInfo};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Paths never worth descending into, prepended to every blacklist.
const DEFAULT_BLACKLIST: &[&str] = &["/dev", "/proc", "/sys", "/tmp"];

/// Scans `inputs` against the image rooted at `root` (empty for the live
/// system), records the result as a new timestamped graph in the blobmap
/// at `output`, and writes the archive back.
pub fn scan(
    inputs: &[PathBuf],
    output: &Path,
    root: &Path,
    blacklist: &[PathBuf],
) -> anyhow::Result<()> {
    let mut visited: HashSet<String> = HashSet::new();
    for entry in DEFAULT_BLACKLIST
        .iter()
        .map(PathBuf::from)
        .chain(blacklist.iter().cloned())
    {
        info!("blacklisting: {}", entry.display());
        visited.insert(entry.to_string_lossy().into_owned());
    }

    let env = Env::initialize_all(root);
    let blobmap = BlobMap::open(output)
        .with_context(|| format!("opening blobmap at {}", output.display()))?;

    let mut scanner = Scanner {
        blobmap,
        env,
        now: None,
        visited,
    };
    for input in inputs {
        if let Err(e) = scanner.visit(input) {
            warn!("giving up on entry point {}: {e}", input.display());
        }
    }

    scanner
        .blobmap
        .store(output)
        .with_context(|| format!("writing blobmap to {}", output.display()))?;
    Ok(())
}

struct Scanner {
    blobmap: BlobMap,
    env: Env,
    /// Timestamp of this scan's graph, fixed on first mutation.
    now: Option<u64>,
    visited: HashSet<String>,
}

impl Scanner {
    fn visit(&mut self, path: &Path) -> anyhow::Result<bool> {
        let path_key = path.to_string_lossy().into_owned();
        if self.visited.contains(&path_key) {
            return Ok(true);
        }
        self.visited.insert(path_key);

        let file_type = path.symlink_metadata().map(|m| m.file_type());
        let is_symlink = file_type.as_ref().map(|t| t.is_symlink()).unwrap_or(false);

        if path.is_dir() {
            if is_symlink {
                // treat a directory symlink as one hop to its target
                if let Some(mut collector) = Collector::for_path(path, &self.env) {
                    for dep in collector.dependencies(&self.env)? {
                        self.visit(&dep)?;
                    }
                }
                return Ok(true);
            }
            info!("walking directory: {}", path.display());
            let entries =
                std::fs::read_dir(path).with_context(|| format!("reading {}", path.display()))?;
            for entry in entries {
                let child = match entry {
                    Ok(entry) => entry.path(),
                    Err(e) => {
                        warn!("unreadable entry under {}: {e}", path.display());
                        continue;
                    }
                };
                match self.visit(&child) {
                    Ok(true) => {}
                    Ok(false) => warn!("skipping entry '{}'", child.display()),
                    Err(e) => warn!("skipping entry '{}': {e}", child.display()),
                }
            }
            return Ok(true);
        }

        if let Ok(t) = file_type {
            if !t.is_file() && !t.is_symlink() {
                warn!("skipping special file: {}", path.display());
                return Ok(true);
            }
        }

        let Some(mut collector) = Collector::for_path(path, &self.env) else {
            warn!("skipping unhandled file: {}", path.display());
            return Ok(false);
        };

        let hash = Hash::of_path(path);
        let trimmed = self.trim_root(path);
        let canonical = self.current_graph().add_node(&trimmed, hash.clone());
        info!("adding file: {canonical} {hash}");

        // a redirected canonical path may have been fully analyzed already
        if canonical != trimmed && self.visited.contains(&canonical) {
            return Ok(true);
        }
        self.visited.insert(canonical.clone());

        match self.analyze(&mut collector, &canonical, &hash) {
            Ok(()) => info!("done for {canonical}"),
            Err(e) => {
                // the collector accepted the file but choked on its
                // innards; keep a consistent empty record for the hash
                warn!("bad format: skipping {} (error was: {e})", path.display());
                self.blobmap.metadata_mut().insert(MetadataInfo::new(hash));
            }
        }
        Ok(true)
    }

    fn analyze(
        &mut self,
        collector: &mut Collector,
        canonical: &str,
        hash: &Hash,
    ) -> anyhow::Result<()> {
        let deps = collector.dependencies(&self.env)?;
        for dep in &deps {
            if let Err(e) = self.visit(dep) {
                warn!("skipping dependency {}: {e}", dep.display());
            }
        }

        let mut info = MetadataInfo::new(hash.clone());
        collector.metadata(&mut info)?;
        self.blobmap.metadata_mut().insert(info);

        let trimmed_deps: Vec<String> = deps.iter().map(|d| self.trim_root(d)).collect();
        let graph = self.current_graph();
        for dep in trimmed_deps {
            graph.add_edge(canonical, &dep);
        }
        Ok(())
    }

    /// Graph receiving this scan's vertices, created on first use under a
    /// second no earlier scan occupies.
    fn current_graph(&mut self) -> &mut binmap_blobmap::Graph {
        if self.now.is_none() {
            let mut timestamp = unix_now();
            while self.blobmap.contains_key(timestamp) {
                std::thread::sleep(Duration::from_millis(100));
                timestamp = unix_now();
            }
            self.blobmap.create(timestamp);
            self.now = Some(timestamp);
        }
        let now = self.now.unwrap_or_default();
        self.blobmap
            .graph_mut(now)
            .expect("current graph was just created")
    }

    /// Lowercases the basename and strips the chroot root when it is a
    /// strict prefix. Unresolved names, which the root never prefixes,
    /// pass through so the graph can reconcile them later.
    fn trim_root(&self, path: &Path) -> String {
        let full = path.to_string_lossy();
        let lowered = match full.rfind('/') {
            Some(i) => format!("{}/{}", &full[..i], full[i + 1..].to_lowercase()),
            None => full.to_lowercase(),
        };
        let root = self.env.root().to_string_lossy();
        if root.len() < lowered.len() && lowered.starts_with(root.as_ref()) {
            lowered[root.len()..].to_owned()
        } else {
            lowered
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
