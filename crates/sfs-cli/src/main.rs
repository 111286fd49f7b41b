#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use sfs_block::{BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice};
use sfs_core::{Filesystem, OpenOptions, Superblock};
use sfs_journal::{Journal, JournalRecord};
use sfs_types::{FsConfig, Geometry, SUPERBLOCK_SIZE};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct InspectOutput {
    superblock: Superblock,
    geometry: Geometry,
    disk_size: u64,
    data_blocks: u64,
    used_blocks: u64,
}

#[derive(Debug, Serialize)]
struct JournalOutput {
    path: PathBuf,
    records: Vec<JournalRecord>,
    uncommitted: usize,
    discarded_tail_bytes: u64,
    compacted: Option<usize>,
}

/// Flags shared by every subcommand.
#[derive(Debug, Default)]
struct Flags {
    json: bool,
    compact: bool,
    config: Option<PathBuf>,
    journal: Option<PathBuf>,
}

impl Flags {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut flags = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--json" => flags.json = true,
                "--compact" => flags.compact = true,
                "--config" => {
                    let Some(path) = args.next() else {
                        bail!("--config requires a path");
                    };
                    flags.config = Some(PathBuf::from(path));
                }
                "--journal" => {
                    let Some(path) = args.next() else {
                        bail!("--journal requires a path");
                    };
                    flags.journal = Some(PathBuf::from(path));
                }
                other => bail!("unexpected argument: {other}"),
            }
        }
        Ok(flags)
    }

    /// Journal path, defaulting to `<image>.journal`.
    fn journal_for(&self, image: &Path) -> PathBuf {
        self.journal.clone().unwrap_or_else(|| {
            let mut name = image.as_os_str().to_owned();
            name.push(".journal");
            PathBuf::from(name)
        })
    }
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "mkfs" => {
            let Some(path) = args.next() else {
                bail!("mkfs requires an image path");
            };
            mkfs(Path::new(&path), &Flags::parse(args)?)
        }
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires an image path");
            };
            inspect(Path::new(&path), &Flags::parse(args)?)
        }
        "check" => {
            let Some(path) = args.next() else {
                bail!("check requires an image path");
            };
            check(Path::new(&path), &Flags::parse(args)?)
        }
        "journal" => {
            let Some(path) = args.next() else {
                bail!("journal requires a journal path");
            };
            journal(Path::new(&path), &Flags::parse(args)?)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("sfs\n");
    println!("USAGE:");
    println!("  sfs mkfs <image-path> [--config <fs.json>] [--journal <path>] [--json]");
    println!("  sfs inspect <image-path> [--json]");
    println!("  sfs check <image-path> [--journal <path>] [--json]");
    println!("  sfs journal <journal-path> [--compact] [--json]");
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<FsConfig> {
    let Some(path) = path else {
        return Ok(FsConfig::default());
    };
    let raw = std::fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse config {}", path.display()))
}

/// Decode block 0 of an image without knowing its block size in advance.
fn read_superblock(dev: &FileByteDevice) -> Result<Superblock> {
    let mut head = vec![0_u8; SUPERBLOCK_SIZE];
    dev.read_exact_at(0, &mut head)
        .context("read superblock bytes")?;
    Superblock::decode(&head).context("decode superblock")
}

fn open_image(path: &Path) -> Result<(FileByteDevice, Superblock)> {
    let file = FileByteDevice::open(path)
        .with_context(|| format!("failed to open image: {}", path.display()))?;
    let superblock = read_superblock(&file)?;
    Ok((file, superblock))
}

fn mkfs(path: &Path, flags: &Flags) -> Result<()> {
    let config = load_config(flags.config.as_deref())?;
    let file = FileByteDevice::create(path, config.disk_size)
        .with_context(|| format!("failed to create image: {}", path.display()))?;
    let dev: Arc<dyn BlockDevice> = Arc::new(
        ByteBlockDevice::new(file, config.block_size).context("invalid block size")?,
    );
    let journal = flags.journal_for(path);
    let fs = Filesystem::format(dev, &config, OpenOptions::new(&journal))
        .with_context(|| format!("failed to format {}", path.display()))?;

    let stats = fs.stats();
    if flags.json {
        print_json(&stats)?;
    } else {
        println!("SFS image created");
        println!("image: {}", path.display());
        println!("journal: {}", journal.display());
        println!("block_size: {}", fs.geometry().block_size);
        println!("total_blocks: {}", stats.total_blocks);
        println!("data_blocks: {}", stats.data_blocks);
        println!("max_files: {}", stats.slot_capacity);
        println!("order: {}", fs.geometry().order);
    }
    Ok(())
}

fn inspect(path: &Path, flags: &Flags) -> Result<()> {
    let (_file, superblock) = open_image(path)?;
    let geometry = superblock
        .geometry()
        .context("superblock geometry is inconsistent")?;
    let output = InspectOutput {
        disk_size: geometry.disk_size(),
        data_blocks: geometry.data_blocks(),
        used_blocks: geometry.data_blocks().saturating_sub(superblock.free_blocks),
        superblock,
        geometry,
    };

    if flags.json {
        return print_json(&output);
    }
    println!("SFS Inspector");
    println!("version: {}", output.superblock.version);
    println!("block_size: {}", output.geometry.block_size);
    println!("total_blocks: {}", output.geometry.total_blocks);
    println!("disk_size: {}", output.disk_size);
    println!(
        "regions: bitmap@{} tree@{} meta@{} data@{}",
        output.geometry.bitmap_start,
        output.geometry.tree_start,
        output.geometry.meta_start,
        output.geometry.data_start
    );
    println!(
        "data_blocks: {} ({} used, {} free)",
        output.data_blocks, output.used_blocks, output.superblock.free_blocks
    );
    println!("max_files: {}", output.geometry.max_files);
    println!("order: {}", output.geometry.order);
    println!("next_dir_id: {}", output.superblock.next_dir_id);
    Ok(())
}

fn check(path: &Path, flags: &Flags) -> Result<()> {
    let (file, superblock) = open_image(path)?;
    let dev: Arc<dyn BlockDevice> = Arc::new(
        ByteBlockDevice::new(file, superblock.block_size).context("invalid block size")?,
    );
    let fs = Filesystem::open(dev, OpenOptions::new(flags.journal_for(path)))
        .with_context(|| format!("failed to open filesystem: {}", path.display()))?;
    let report = fs.check();

    if flags.json {
        print_json(&report)?;
    } else {
        println!("{report}");
        for finding in &report.findings {
            println!("  {finding}");
        }
        println!("{}", fs.stats());
    }
    if !report.is_clean() {
        bail!("{} inconsistencies found", report.findings.len());
    }
    Ok(())
}

fn journal(path: &Path, flags: &Flags) -> Result<()> {
    let journal = Journal::open(path)
        .with_context(|| format!("failed to open journal: {}", path.display()))?;
    let compacted = if flags.compact {
        Some(journal.compact().context("compact journal")?)
    } else {
        None
    };
    let load = journal.load_report();
    let output = JournalOutput {
        path: path.to_path_buf(),
        records: journal.records(),
        uncommitted: journal.records().iter().filter(|r| !r.committed).count(),
        discarded_tail_bytes: load.discarded_tail_bytes,
        compacted,
    };

    if flags.json {
        return print_json(&output);
    }
    println!("journal: {}", output.path.display());
    println!(
        "records: {} ({} uncommitted)",
        output.records.len(),
        output.uncommitted
    );
    if output.discarded_tail_bytes > 0 {
        println!("torn tail discarded: {} bytes", output.discarded_tail_bytes);
    }
    if let Some(dropped) = output.compacted {
        println!("compacted: {dropped} committed records dropped");
    }
    for r in &output.records {
        let state = if r.committed { "committed" } else { "pending" };
        println!(
            "  {} {} {} {:?} dir={} size={} payload={}B {state}",
            r.timestamp,
            r.identity,
            r.op,
            r.name,
            r.directory,
            r.size,
            r.payload.len()
        );
    }
    Ok(())
}
