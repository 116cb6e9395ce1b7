#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bfs::{
    ByteDevice, CheckReport, DegradedReason, FileByteDevice, InitializeOptions, MountOptions,
    MountReport, SuperBlock, SuperBlockLocation, Volume,
};
use serde::Serialize;
use std::env;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// ── Logging ─────────────────────────────────────────────────────────────────

/// Log to stderr, filtered by `BFS_LOG`, then `RUST_LOG`, then `info`.
fn init_logging() {
    let filter = env::var("BFS_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

// ── Output records ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    name: String,
    location: SuperBlockLocation,
    block_size: u32,
    num_blocks: u64,
    used_blocks: u64,
    num_ags: u32,
    blocks_per_ag: u32,
    ag_shift: u32,
    log_blocks: String,
    log_start: u64,
    log_end: u64,
    root_dir: String,
    indices: Option<String>,
    clean: bool,
}

impl InspectOutput {
    fn new(sb: &SuperBlock, location: SuperBlockLocation) -> Self {
        Self {
            name: sb.name.clone(),
            location,
            block_size: sb.block_size,
            num_blocks: sb.num_blocks,
            used_blocks: sb.used_blocks,
            num_ags: sb.num_ags,
            blocks_per_ag: sb.blocks_per_ag,
            ag_shift: sb.ag_shift,
            log_blocks: sb.log_blocks.to_string(),
            log_start: sb.log_start,
            log_end: sb.log_end,
            root_dir: sb.root_dir.to_string(),
            indices: sb.has_indices().then(|| sb.indices.to_string()),
            clean: sb.is_clean(),
        }
    }
}

#[derive(Debug, Serialize)]
struct MountOutput {
    name: String,
    options: MountOptions,
    report: MountReport,
    root_entries: Vec<String>,
    indices: Vec<String>,
}

fn main() {
    init_logging();
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
    let remaining: Vec<String> = args.collect();
    tracing::debug!(target: "bfs::cli", %command, args = remaining.len(), "command_started");

    match command.as_str() {
        "mkfs" => {
            let [path, name, flags @ ..] = remaining.as_slice() else {
                bail!("mkfs requires <image-path> <name>");
            };
            mkfs(Path::new(path), &MkfsArgs::parse(name, flags)?)
        }
        "inspect" => {
            let Some(path) = remaining.first() else {
                bail!("inspect requires an image path");
            };
            inspect(Path::new(path), has_flag(&remaining, "--json"))
        }
        "mount" => {
            let Some(path) = remaining.first() else {
                bail!("mount requires an image path");
            };
            let options = MountOptions {
                read_only: has_flag(&remaining, "--read-only"),
                ..MountOptions::default()
            };
            mount_cmd(Path::new(path), &options, has_flag(&remaining, "--json"))
        }
        "check" => {
            let Some(path) = remaining.first() else {
                bail!("check requires an image path");
            };
            check(Path::new(path), has_flag(&remaining, "--json"))
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
    println!("bfs\n");
    println!("USAGE:");
    println!(
        "  bfs mkfs <image-path> <name> [--size <bytes>] [--block-size <bytes>] \
         [--no-indices] [--seed <n>]"
    );
    println!("  bfs inspect <image-path> [--json]");
    println!("  bfs mount <image-path> [--read-only] [--json]");
    println!("  bfs check <image-path> [--json]");
    println!();
    println!("Set BFS_LOG (or RUST_LOG) to control log output, e.g. BFS_LOG=bfs=debug.");
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| arg == flag)
}

// ── mkfs ────────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
struct MkfsArgs {
    name: String,
    size: Option<u64>,
    options: InitializeOptions,
}

impl MkfsArgs {
    fn parse(name: &str, args: &[String]) -> Result<Self> {
        let mut parsed = Self {
            name: name.to_owned(),
            size: None,
            options: InitializeOptions::default(),
        };
        let mut args = args.iter();
        while let Some(arg) = args.next() {
            let mut value = || {
                args.next()
                    .with_context(|| format!("{arg} requires a value"))
            };
            match arg.as_str() {
                "--size" => parsed.size = Some(parse_size(value()?)?),
                "--block-size" => {
                    let raw = value()?;
                    parsed.options.block_size = raw
                        .parse()
                        .with_context(|| format!("invalid block size: {raw}"))?;
                }
                "--seed" => {
                    let raw = value()?;
                    let seed = raw
                        .parse()
                        .with_context(|| format!("invalid seed: {raw}"))?;
                    parsed.options.volume_id_seed = Some(seed);
                }
                "--no-indices" => parsed.options.no_indices = true,
                other => bail!("unknown mkfs option: {other}"),
            }
        }
        Ok(parsed)
    }
}

/// Parse a byte count with an optional `K`, `M` or `G` suffix.
fn parse_size(raw: &str) -> Result<u64> {
    let (digits, shift) = match raw.as_bytes().last() {
        Some(b'K' | b'k') => (&raw[..raw.len() - 1], 10),
        Some(b'M' | b'm') => (&raw[..raw.len() - 1], 20),
        Some(b'G' | b'g') => (&raw[..raw.len() - 1], 30),
        _ => (raw, 0),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid size: {raw}"))?;
    value
        .checked_mul(1 << shift)
        .with_context(|| format!("size overflows: {raw}"))
}

fn mkfs(path: &Path, args: &MkfsArgs) -> Result<()> {
    if let Some(size) = args.size {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .and_then(|file| file.set_len(size))
            .with_context(|| format!("failed to size image: {}", path.display()))?;
    }
    let device: Arc<dyn ByteDevice> = Arc::new(
        FileByteDevice::open(path)
            .with_context(|| format!("failed to open image: {}", path.display()))?,
    );
    let sb = Volume::initialize(device, &args.name, &args.options)
        .with_context(|| format!("failed to initialize {}", path.display()))?;
    println!(
        "initialized {:?}: {} blocks of {} bytes, {} allocation groups",
        sb.name, sb.num_blocks, sb.block_size, sb.num_ags
    );
    Ok(())
}

// ── inspect ─────────────────────────────────────────────────────────────────

fn inspect(path: &Path, json: bool) -> Result<()> {
    let device = FileByteDevice::open_read_only(path)
        .with_context(|| format!("failed to open image: {}", path.display()))?;
    let (sb, location) = Volume::identify(&device)
        .with_context(|| format!("no BFS superblock in {}", path.display()))?;
    let output = InspectOutput::new(&sb, location);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }
    println!("BFS Inspector");
    println!("name: {}", output.name);
    println!("superblock: {:?}", output.location);
    println!("block_size: {}", output.block_size);
    println!("num_blocks: {}", output.num_blocks);
    println!("used_blocks: {}", output.used_blocks);
    println!(
        "allocation_groups: {} x {} blocks (ag_shift {})",
        output.num_ags, output.blocks_per_ag, output.ag_shift
    );
    println!(
        "log: {} [{}..{})",
        output.log_blocks, output.log_start, output.log_end
    );
    println!("root_dir: {}", output.root_dir);
    println!("indices: {}", output.indices.as_deref().unwrap_or("none"));
    println!("clean: {}", output.clean);
    Ok(())
}

// ── mount ───────────────────────────────────────────────────────────────────

/// Mount, report what the mount found, and unmount again.
fn mount_cmd(path: &Path, options: &MountOptions, json: bool) -> Result<()> {
    let volume = Volume::mount(path, options)
        .with_context(|| format!("failed to mount {}", path.display()))?;
    let root = volume.root().id();
    let output = MountOutput {
        name: volume.superblock().name,
        options: options.clone(),
        report: volume.mount_report().clone(),
        root_entries: volume
            .entries(root)
            .context("read root directory")?
            .into_iter()
            .map(|entry| entry.name)
            .collect(),
        indices: volume.index_names().context("read indices directory")?,
    };
    volume.unmount().context("unmount")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }
    println!("mounted {:?}", output.name);
    println!("read_only: {}", output.report.read_only);
    for reason in &output.report.degraded {
        println!("degraded: {}", describe(reason));
    }
    if let Some(replay) = output.report.replay {
        println!(
            "replayed: {} entries, {} blocks",
            replay.entries, replay.blocks
        );
    }
    if let Some(used) = output.report.corrected_used_blocks {
        println!("used_blocks recounted: {used}");
    }
    println!("root: {}", output.root_entries.join(" "));
    println!("indices: {}", output.indices.join(" "));
    Ok(())
}

fn describe(reason: &DegradedReason) -> String {
    match reason {
        DegradedReason::DeviceReadOnly => "device is read-only".to_owned(),
        DegradedReason::ForeignByteOrder => "host byte order cannot write".to_owned(),
        DegradedReason::JournalReplayFailed { detail } => format!("journal replay: {detail}"),
        DegradedReason::IndicesUnavailable { detail } => format!("indices: {detail}"),
    }
}

// ── check ───────────────────────────────────────────────────────────────────

fn check(path: &Path, json: bool) -> Result<()> {
    let options = MountOptions {
        read_only: true,
        ..MountOptions::default()
    };
    let volume = Volume::mount(path, &options)
        .with_context(|| format!("failed to mount {}", path.display()))?;
    volume.create_check_visitor().context("create check visitor")?;
    let report = volume.run_check().context("run check")?;
    volume.delete_check_visitor().context("delete check visitor")?;
    volume.unmount().context("unmount")?;

    print_check(&report, json)?;
    if !report.is_consistent() {
        bail!("{} check(s) failed", report.failed);
    }
    Ok(())
}

fn print_check(report: &CheckReport, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("serialize output")?
        );
        return Ok(());
    }
    println!(
        "inodes: {} ({} directories, {} files, {} indices)",
        report.inodes, report.directories, report.files, report.indices
    );
    println!(
        "used_blocks: bitmap {}, superblock {}",
        report.bitmap_used_blocks, report.recorded_used_blocks
    );
    for issue in &report.issues {
        println!("FAIL {}: {}", issue.component, issue.detail);
    }
    println!("passed: {}, failed: {}", report.passed, report.failed);
    Ok(())
}
