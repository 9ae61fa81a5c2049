//! # binmap
//!
//! Builds and queries timestamped, content-addressed dependency graphs of
//! the executable binaries found on a (possibly chrooted) filesystem image.
//!
//! Starting from one or more entry points, the scanner follows every
//! shared-library import it can resolve (ld.so semantics for ELF,
//! system/WoW64/WinSxS/ApiSetSchema semantics for PE) and records one
//! vertex per canonical binary path, one metadata record per content hash.
//! Each scan lands in its own wall-clock-stamped graph inside a single
//! archive file, so successive scans of the same image can be diffed,
//! filtered, projected, or exported.
//!
//! This crate is a facade over the workspace members:
//! - [`common`]: hashes and metadata records.
//! - [`blobmap`]: the graph store, views, diffs, and the archive format.
//! - [`collectors`]: per-format analyzers and the library-search resolvers.
//! - [`scanner`]: the recursive scan driver.

pub use binmap_blobmap as blobmap;
pub use binmap_collectors as collectors;
pub use binmap_common as common;
pub use binmap_scanner as scanner;

pub use binmap_blobmap::{BlobMap, BlobMapDiff, BlobMapView, Graph};
pub use binmap_common::{HardeningFeature, Hash, Metadata, MetadataInfo};
pub use binmap_scanner::scan;
