//! binmap command-line front end.
//!
//! `binmap scan` walks one or more entry points and records the resulting
//! dependency graph into an archive; `binmap view` exports the most
//! recent graph as Graphviz DOT. A `.binmap.cfg` file in the working
//! directory supplies scan defaults.

use anyhow::{bail, Context};
use binmap_blobmap::BlobMap;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing_subscriber::filter::LevelFilter;

const DEFAULT_BLOBS: &str = "blobs.dat";
const DEFAULT_DOT: &str = "blobs.dot";
const CONFIG_FILE: &str = ".binmap.cfg";

#[derive(Parser)]
#[command(name = "binmap", version, about = "a system dependency analyzer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan entry points and record a new dependency graph.
    Scan {
        /// Files or directories to scan.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Archive to create or extend.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// The first input is the root of another system's image.
        #[arg(long)]
        chroot: bool,
        /// Paths excluded from the scan.
        #[arg(long)]
        exclude: Vec<PathBuf>,
        /// Verbosity level: 0 errors, 1 warnings, 2 info, 3 everything.
        #[arg(short, long)]
        verbose: Option<u8>,
    },
    /// Export the most recent graph as Graphviz DOT.
    View {
        /// Archive to read.
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// DOT file to write.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Scan defaults from `.binmap.cfg`, all optional.
#[derive(Debug, Default, Deserialize)]
struct ScanConfig {
    output: Option<PathBuf>,
    #[serde(default)]
    exclude: Vec<PathBuf>,
    verbose: Option<u8>,
}

impl ScanConfig {
    fn load(dir: &Path) -> ScanConfig {
        let path = dir.join(CONFIG_FILE);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return ScanConfig::default();
        };
        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("in configuration file {}: {e}", path.display());
                ScanConfig::default()
            }
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn canonicalized(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .iter()
        .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
        .collect()
}

/// With `--chroot`, the first input is the image root; any further inputs
/// are the entry points, otherwise the root doubles as the entry point.
fn split_chroot(inputs: Vec<PathBuf>, chroot: bool) -> (PathBuf, Vec<PathBuf>) {
    if !chroot {
        return (PathBuf::new(), inputs);
    }
    let root = inputs[0].clone();
    if inputs.len() > 1 {
        (root, inputs[1..].to_vec())
    } else {
        (root.clone(), vec![root])
    }
}

fn run_scan(
    inputs: Vec<PathBuf>,
    output: Option<PathBuf>,
    chroot: bool,
    exclude: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let inputs = canonicalized(&inputs);
    let exclude = canonicalized(&exclude);
    let output = output.unwrap_or_else(|| PathBuf::from(DEFAULT_BLOBS));
    let (root, entry_points) = split_chroot(inputs, chroot);
    binmap_scanner::scan(&entry_points, &output, &root, &exclude)
}

fn run_view(input: Option<PathBuf>, output: Option<PathBuf>) -> anyhow::Result<()> {
    let input = input.unwrap_or_else(|| PathBuf::from(DEFAULT_BLOBS));
    let output = output.unwrap_or_else(|| PathBuf::from(DEFAULT_DOT));
    if !input.exists() {
        bail!("input not found: {}", input.display());
    }
    let blobmap = BlobMap::open(&input)?;
    let view = blobmap.last()?;
    let file = File::create(&output)
        .with_context(|| format!("creating {}", output.display()))?;
    view.dot(BufWriter::new(file))?;
    Ok(())
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // help and version are not argument errors
            if e.use_stderr() {
                e.print().ok();
                std::process::exit(1);
            }
            e.print().ok();
            std::process::exit(0);
        }
    };

    let result = match cli.command {
        Commands::Scan {
            inputs,
            output,
            chroot,
            exclude,
            verbose,
        } => {
            let config = ScanConfig::load(Path::new("."));
            init_logging(verbose.or(config.verbose).unwrap_or(0));
            let output = output.or(config.output);
            let mut exclude = exclude;
            exclude.extend(config.exclude);
            run_scan(inputs, output, chroot, exclude)
        }
        Commands::View { input, output } => {
            init_logging(0);
            run_view(input, output)
        }
    };

    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmap_collectors::fixtures::ElfFixture;
    use std::fs;

    #[test]
    fn test_split_chroot_multiple_inputs() {
        let inputs = vec![
            PathBuf::from("/image"),
            PathBuf::from("/image/bin"),
            PathBuf::from("/image/sbin"),
        ];
        let (root, entries) = split_chroot(inputs, true);
        assert_eq!(root, PathBuf::from("/image"));
        assert_eq!(
            entries,
            vec![PathBuf::from("/image/bin"), PathBuf::from("/image/sbin")]
        );
    }

    #[test]
    fn test_split_chroot_single_input_is_both() {
        let (root, entries) = split_chroot(vec![PathBuf::from("/image")], true);
        assert_eq!(root, PathBuf::from("/image"));
        assert_eq!(entries, vec![PathBuf::from("/image")]);
    }

    #[test]
    fn test_split_without_chroot() {
        let (root, entries) = split_chroot(vec![PathBuf::from("/bin/ls")], false);
        assert_eq!(root, PathBuf::new());
        assert_eq!(entries, vec![PathBuf::from("/bin/ls")]);
    }

    #[test]
    fn test_config_parsing() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"{"output": "mine.dat", "exclude": ["/mnt"], "verbose": 2}"#,
        )
        .unwrap();
        let config = ScanConfig::load(tmp.path());
        assert_eq!(config.output, Some(PathBuf::from("mine.dat")));
        assert_eq!(config.exclude, vec![PathBuf::from("/mnt")]);
        assert_eq!(config.verbose, Some(2));
    }

    #[test]
    fn test_config_missing_is_default() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ScanConfig::load(tmp.path());
        assert!(config.output.is_none());
        assert!(config.exclude.is_empty());
        assert!(config.verbose.is_none());
    }

    #[test]
    fn test_view_on_missing_archive_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let result = run_view(
            Some(tmp.path().join("absent.dat")),
            Some(tmp.path().join("out.dot")),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_scan_then_view_writes_dot() {
        let tmp = tempfile::tempdir().unwrap();
        let fsroot = tmp.path().join("fs");
        fs::create_dir_all(fsroot.join("bin")).unwrap();
        fs::write(
            fsroot.join("bin/app"),
            ElfFixture::with_needed(&[]).build(),
        )
        .unwrap();
        let archive = tmp.path().join("blobs.dat");
        let dot = tmp.path().join("blobs.dot");

        run_scan(
            vec![fsroot.clone()],
            Some(archive.clone()),
            true,
            Vec::new(),
        )
        .unwrap();
        run_view(Some(archive), Some(dot.clone())).unwrap();

        let rendered = fs::read_to_string(&dot).unwrap();
        assert!(rendered.starts_with("digraph G {"));
        assert!(rendered.contains("/bin/app"));
    }
}
