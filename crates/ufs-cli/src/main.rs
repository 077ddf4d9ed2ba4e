#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::env;
use std::path::Path;
use std::sync::Arc;
use ufs::{
    AllocPolicy, BlockDevice, ByteBlockDevice, ByteOrder, CheckReport, FileByteDevice, Filesystem,
    FormatOptions, FsStats, InodeNumber, MountOptions, SnapshotInfo, Superblock, memory_device,
};

/// Fragment size used to read the superblock before the real one is known.
const PROBE_FSIZE: u32 = 512;

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    frag_size: u32,
    cylinder_groups: u32,
    frags_per_group: u32,
    inodes_per_group: u32,
    size_frags: u64,
    byte_order: ByteOrder,
    clean: bool,
    free_blocks: u64,
    free_frags: u64,
    free_inodes: u64,
    directories: u64,
    snapshots: Vec<u32>,
    policy: AllocPolicy,
}

#[derive(Debug, Serialize)]
struct DemoOutput {
    stats: FsStats,
    snapshots: Vec<SnapshotInfo>,
    preserved_ok: bool,
    check: CheckReport,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        return Ok(());
    }
    let command = args.remove(0);
    let json = take_switch(&mut args, "--json");

    match command.as_str() {
        "mkfs" => {
            let policy = take_value(&mut args, "--policy")?;
            let opts = format_options(&mut args, policy.as_deref())?;
            let Some(path) = args.first() else {
                bail!("mkfs requires an image path");
            };
            mkfs(Path::new(path), &opts, json)
        }
        "inspect" => {
            let Some(path) = args.first() else {
                bail!("inspect requires an image path");
            };
            inspect(Path::new(path), json)
        }
        "check" => {
            let Some(path) = args.first() else {
                bail!("check requires an image path");
            };
            check(Path::new(path), json)
        }
        "snapshot" => snapshot_cmd(&args, json),
        "demo" => demo(json),
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
    println!("ufs-cli\n");
    println!("USAGE:");
    println!("  ufs-cli mkfs <image-path> [--groups N] [--bsize N] [--fsize N]");
    println!("               [--blocks-per-group N] [--inodes-per-group N] [--big-endian]");
    println!("               [--policy <policy.json>] [--json]");
    println!("  ufs-cli inspect <image-path> [--json]");
    println!("  ufs-cli check <image-path> [--json]");
    println!("  ufs-cli snapshot create <image-path> [--json]");
    println!("  ufs-cli snapshot list <image-path> [--json]");
    println!("  ufs-cli snapshot delete <image-path> <inode>");
    println!("  ufs-cli demo [--json]");
}

// ── Argument helpers ────────────────────────────────────────────────────────

fn take_switch(args: &mut Vec<String>, name: &str) -> bool {
    let before = args.len();
    args.retain(|arg| arg != name);
    args.len() != before
}

fn take_value(args: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    let Some(pos) = args.iter().position(|arg| arg == name) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{name} requires a value");
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

fn take_number(args: &mut Vec<String>, name: &str) -> Result<Option<u32>> {
    take_value(args, name)?
        .map(|raw| {
            raw.parse::<u32>()
                .with_context(|| format!("{name} expects a number, got {raw:?}"))
        })
        .transpose()
}

fn format_options(args: &mut Vec<String>, policy_path: Option<&str>) -> Result<FormatOptions> {
    let mut opts = FormatOptions {
        ncg: Some(8),
        ..FormatOptions::default()
    };
    if let Some(groups) = take_number(args, "--groups")? {
        opts.ncg = Some(groups);
    }
    if let Some(bsize) = take_number(args, "--bsize")? {
        opts.bsize = bsize;
    }
    if let Some(fsize) = take_number(args, "--fsize")? {
        opts.fsize = fsize;
    }
    if let Some(bpg) = take_number(args, "--blocks-per-group")? {
        opts.blocks_per_group = bpg;
    }
    if let Some(ipg) = take_number(args, "--inodes-per-group")? {
        opts.inodes_per_group = ipg;
    }
    if take_switch(args, "--big-endian") {
        opts.byte_order = ByteOrder::Big;
    }
    if let Some(path) = policy_path {
        let text = std::fs::read_to_string(path).with_context(|| format!("failed to read policy file {path}"))?;
        opts.policy = serde_json::from_str(&text).with_context(|| format!("invalid policy in {path}"))?;
    }
    Ok(opts)
}

// ── Devices ─────────────────────────────────────────────────────────────────

/// Open an image with the fragment size its superblock records.
fn open_image(path: &Path) -> Result<(Arc<dyn BlockDevice>, Superblock)> {
    let file = FileByteDevice::open(path).with_context(|| format!("failed to open image {}", path.display()))?;
    let probe = ByteBlockDevice::new(file.clone(), PROBE_FSIZE).context("image is not fragment aligned")?;
    let sb = Filesystem::read_superblock(&probe)
        .with_context(|| format!("no UFS superblock in {}", path.display()))?;
    let dev = ByteBlockDevice::new(file, sb.params.fsize).context("image does not match its fragment size")?;
    Ok((Arc::new(dev), sb))
}

fn mount_image(path: &Path, read_only: bool) -> Result<Filesystem> {
    let (dev, _) = open_image(path)?;
    Filesystem::mount(dev, &MountOptions {
        read_only,
        ..MountOptions::default()
    })
    .with_context(|| format!("failed to mount {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize output")?);
    Ok(())
}

// ── Commands ────────────────────────────────────────────────────────────────

fn mkfs(path: &Path, opts: &FormatOptions, json: bool) -> Result<()> {
    let ncg = opts.ncg.unwrap_or(1);
    let bytes = u64::from(ncg) * u64::from(opts.blocks_per_group) * u64::from(opts.bsize);
    let file = FileByteDevice::create(path, bytes).with_context(|| format!("failed to create {}", path.display()))?;
    let dev: Arc<dyn BlockDevice> = Arc::new(ByteBlockDevice::new(file, opts.fsize).context("invalid fragment size")?);
    let sb = Filesystem::format(dev, opts).with_context(|| format!("failed to format {}", path.display()))?;
    if json {
        return print_json(&sb.cstotal);
    }
    println!("created {} ({bytes} bytes)", path.display());
    println!("cylinder_groups: {}", sb.params.ncg);
    println!("free_blocks: {}", sb.cstotal.nbfree);
    println!("free_inodes: {}", sb.cstotal.nifree);
    Ok(())
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let (_, sb) = open_image(path)?;
    let output = InspectOutput {
        block_size: sb.params.bsize,
        frag_size: sb.params.fsize,
        cylinder_groups: sb.params.ncg,
        frags_per_group: sb.params.fpg,
        inodes_per_group: sb.params.ipg,
        size_frags: sb.params.size,
        byte_order: sb.params.order,
        clean: sb.flags & ufs::FS_UNCLEAN == 0,
        free_blocks: sb.cstotal.nbfree,
        free_frags: sb.cstotal.nffree,
        free_inodes: sb.cstotal.nifree,
        directories: sb.cstotal.ndir,
        snapshots: sb.snapshots().collect(),
        policy: AllocPolicy::from_superblock(&sb),
    };
    if json {
        return print_json(&output);
    }
    println!("UFS Inspector");
    println!("block_size: {}", output.block_size);
    println!("frag_size: {}", output.frag_size);
    println!("cylinder_groups: {}", output.cylinder_groups);
    println!("frags_per_group: {}", output.frags_per_group);
    println!("inodes_per_group: {}", output.inodes_per_group);
    println!("size_frags: {}", output.size_frags);
    println!("byte_order: {:?}", output.byte_order);
    println!("clean: {}", output.clean);
    println!("free_blocks: {}", output.free_blocks);
    println!("free_frags: {}", output.free_frags);
    println!("free_inodes: {}", output.free_inodes);
    println!("directories: {}", output.directories);
    println!("snapshots: {:?}", output.snapshots);
    Ok(())
}

fn check(path: &Path, json: bool) -> Result<()> {
    let fs = mount_image(path, true)?;
    let report = fs.check().context("check failed")?;
    if json {
        print_json(&report)?;
    } else {
        println!("groups_checked: {}", report.groups_checked);
        for cg in &report.unreadable_groups {
            println!("unreadable group: {cg}");
        }
        for problem in &report.problems {
            println!("problem: {problem}");
        }
    }
    if !report.is_clean() {
        bail!("{} problem(s) found", report.problems.len() + report.unreadable_groups.len());
    }
    Ok(())
}

fn snapshot_cmd(args: &[String], json: bool) -> Result<()> {
    let (Some(action), Some(path)) = (args.first(), args.get(1)) else {
        bail!("snapshot requires <create|list|delete> <image-path>");
    };
    let path = Path::new(path);
    match action.as_str() {
        "create" => {
            let fs = mount_image(path, false)?;
            let info = fs.snapshot_create().context("snapshot creation failed")?;
            fs.unmount().context("unmount failed")?;
            if json {
                return print_json(&info);
            }
            println!("created snapshot inode {} ({} blocks owned)", info.ino, info.owned_blocks);
            Ok(())
        }
        "list" => {
            let fs = mount_image(path, true)?;
            let snaps = fs.snapshot_list().context("listing snapshots failed")?;
            if json {
                return print_json(&snaps);
            }
            for snap in &snaps {
                println!(
                    "#{} inode {} created {} owned_blocks {} frags {}",
                    snap.index, snap.ino, snap.created, snap.owned_blocks, snap.frags
                );
            }
            Ok(())
        }
        "delete" => {
            let Some(raw) = args.get(2) else {
                bail!("snapshot delete requires an inode number");
            };
            let ino: u64 = raw.parse().with_context(|| format!("invalid inode number {raw:?}"))?;
            let fs = mount_image(path, false)?;
            fs.snapshot_delete(InodeNumber(ino))
                .with_context(|| format!("failed to delete snapshot {ino}"))?;
            fs.unmount().context("unmount failed")?;
            println!("deleted snapshot inode {ino}");
            Ok(())
        }
        other => bail!("unknown snapshot action: {other}"),
    }
}

/// Exercise the allocator, copy-on-write, and truncation on a memory image.
fn demo(json: bool) -> Result<()> {
    let opts = FormatOptions {
        blocks_per_group: 256,
        inodes_per_group: 64,
        ncg: Some(4),
        ..FormatOptions::default()
    };
    let frags = u64::from(4 * 256 * (opts.bsize / opts.fsize));
    let dev: Arc<dyn BlockDevice> = Arc::new(memory_device(opts.fsize, frags).context("memory device")?);
    Filesystem::format(Arc::clone(&dev), &opts).context("format")?;
    let fs = Filesystem::mount(dev, &MountOptions::default()).context("mount")?;

    let file = fs.create_file(InodeNumber::ROOT).context("create file")?;
    let original = vec![0xA5_u8; 64 * 1024];
    fs.write(file, 0, &original).context("write")?;
    let snap = fs.snapshot_create().context("snapshot")?;
    fs.write(file, 0, &vec![0x5A_u8; 16 * 1024]).context("overwrite")?;

    let first = fs.stat(file).context("stat")?.db[0];
    let lbn = fs.geometry().fragstoblks(ufs::FragNumber(first));
    let preserved = fs.snapshot_read(InodeNumber(snap.ino), lbn).context("snapshot read")?;
    let preserved_ok = preserved.iter().all(|&b| b == 0xA5);

    fs.truncate(file, 3000).context("truncate")?;
    let output = DemoOutput {
        stats: fs.stats(),
        snapshots: fs.snapshot_list().context("list")?,
        preserved_ok,
        check: fs.check().context("check")?,
    };
    fs.snapshot_delete(InodeNumber(snap.ino)).context("delete snapshot")?;
    fs.unmount().context("unmount")?;

    if json {
        return print_json(&output);
    }
    println!("UFS demo");
    println!("snapshot inode: {}", snap.ino);
    println!("preserved pre-image intact: {}", output.preserved_ok);
    println!(
        "copy-on-write: {} copies, {} adoptions, {} pre-image reads",
        output.stats.cow.copies, output.stats.cow.adoptions, output.stats.cow.preimage_reads
    );
    println!("free fragments after truncate: {}", output.stats.free_frags);
    println!("check clean: {}", output.check.is_clean());
    Ok(())
}
