//! Symlink collector.
//!
//! A symlink is analyzable when its chain terminates on a file one of the
//! format collectors accepts. Its single dependency is the immediate
//! target; the target gets visited, and analyzed, in its own right.

use crate::env::{chroot_join, Env};
use crate::{Collector, CollectorError};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub struct LinkCollector {
    path: PathBuf,
}

fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// One resolution step: absolute targets are re-rooted under the chroot,
/// relative ones resolved against the link's directory.
fn resolve_target(link: &Path, env: &Env) -> std::io::Result<PathBuf> {
    let target = std::fs::read_link(link)?;
    let resolved = if target.is_absolute() {
        chroot_join(env.root(), &target)
    } else {
        let base = link.parent().unwrap_or_else(|| Path::new("")).join(target);
        std::fs::canonicalize(&base).unwrap_or(base)
    };
    if !resolved.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "dangling symlink",
        ));
    }
    Ok(resolved)
}

impl LinkCollector {
    /// Accepts symlinks whose chain ends on something a non-symlink
    /// collector knows how to analyze.
    pub fn initialize(path: &Path, env: &Env) -> Option<LinkCollector> {
        if !is_symlink(path) {
            return None;
        }
        let mut current = path.to_path_buf();
        loop {
            current = resolve_target(&current, env).ok()?;
            if !is_symlink(&current) {
                break;
            }
        }
        if !Collector::accepts_target(&current, env) {
            return None;
        }
        Some(LinkCollector {
            path: path.to_path_buf(),
        })
    }

    pub fn dependencies(&mut self, env: &Env) -> Result<BTreeSet<PathBuf>, CollectorError> {
        let mut deps = BTreeSet::new();
        deps.insert(resolve_target(&self.path, env)?);
        Ok(deps)
    }
}
