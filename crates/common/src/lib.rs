//! Shared leaf types for the binmap workspace.
//!
//! [`Hash`] identifies binary content; [`MetadataInfo`] carries what the
//! collectors learned about one binary; [`Metadata`] is the hash-keyed
//! store shared by every graph of a blobmap.

pub mod hash;
pub mod metadata;

pub use hash::Hash;
pub use metadata::{HardeningFeature, Metadata, MetadataError, MetadataInfo};
