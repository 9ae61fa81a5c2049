//! Dependency and metadata collectors.
//!
//! A collector owns the analysis of one file: which libraries it pulls in
//! and what is worth remembering about it (name, version, symbols,
//! hardening). Dispatch is first-match over the built-in kinds, in order:
//! ELF, PE, symlink, missing file. Symlinks are refused by the format
//! collectors so they fall through to the symlink kind; paths that do not
//! exist at all land on the missing kind, which produces the placeholder
//! vertices the graph layer later reconciles.

pub mod elf;
pub mod env;
pub mod link;
pub mod missing;
pub mod pe;
pub mod version;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

use binmap_common::MetadataInfo;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use env::Env;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object parsing failed: {0}")]
    Object(#[from] goblin::error::Error),
    #[error("malformed {kind} structure: {detail}")]
    Format { kind: &'static str, detail: String },
}

impl CollectorError {
    pub(crate) fn format(kind: &'static str, detail: impl Into<String>) -> Self {
        CollectorError::Format {
            kind,
            detail: detail.into(),
        }
    }
}

/// The built-in collector kinds, dispatched first-match.
pub enum Collector {
    Elf(elf::ElfCollector),
    Pe(pe::PeCollector),
    Link(link::LinkCollector),
    Missing(missing::MissingCollector),
}

impl Collector {
    /// Finds the first collector kind accepting `path`, or `None` when the
    /// file is of no known kind (regular files in unhandled formats).
    pub fn for_path(path: &Path, env: &Env) -> Option<Collector> {
        if let Some(c) = elf::ElfCollector::initialize(path) {
            return Some(Collector::Elf(c));
        }
        if let Some(c) = pe::PeCollector::initialize(path, env) {
            return Some(Collector::Pe(c));
        }
        if let Some(c) = link::LinkCollector::initialize(path, env) {
            return Some(Collector::Link(c));
        }
        if let Some(c) = missing::MissingCollector::initialize(path) {
            return Some(Collector::Missing(c));
        }
        None
    }

    /// Like [`Collector::for_path`] but without the symlink kind; used to
    /// decide whether a symlink chain terminates on something analyzable.
    pub(crate) fn accepts_target(path: &Path, env: &Env) -> bool {
        elf::ElfCollector::initialize(path).is_some()
            || pe::PeCollector::initialize(path, env).is_some()
    }

    /// Absolute paths of everything this binary loads.
    pub fn dependencies(&mut self, env: &Env) -> Result<BTreeSet<PathBuf>, CollectorError> {
        match self {
            Collector::Elf(c) => c.dependencies(env),
            Collector::Pe(c) => c.dependencies(env),
            Collector::Link(c) => c.dependencies(env),
            Collector::Missing(c) => Ok(c.dependencies()),
        }
    }

    /// Fills `info` with what the format analyzer can extract.
    pub fn metadata(&mut self, info: &mut MetadataInfo) -> Result<(), CollectorError> {
        match self {
            Collector::Elf(c) => c.metadata(info),
            Collector::Pe(c) => {
                c.metadata(info);
                Ok(())
            }
            // symlink targets are analyzed in their own right
            Collector::Link(_) => Ok(()),
            Collector::Missing(_) => Ok(()),
        }
    }
}
