#![forbid(unsafe_code)]

use std::sync::Arc;
use ufs_alloc::{AllocPolicy, Allocator};
use ufs_block::{BlockDevice, InterceptDevice, WriteMode, memory_device};
use ufs_error::UfsError;
use ufs_inode::{DeviceIndirect, FileIo, InodeTable, balloc, decode_slot, truncate};
use ufs_ondisk::{DiskInode, Geometry, GeometryParams};
use ufs_snapshot::{LiveDevice, SnapshotEngine};
use ufs_types::{ByteOrder, FSMAXSNAP, FragNumber, GroupNumber, InodeNumber, S_IFREG};

struct Mount {
    geo: Geometry,
    raw: Arc<dyn BlockDevice>,
    live: Arc<LiveDevice>,
    alloc: Arc<Allocator>,
    engine: Arc<SnapshotEngine>,
    policy: AllocPolicy,
}

fn geometry() -> Geometry {
    Geometry::new(GeometryParams {
        bsize: 4096,
        fsize: 512,
        fpg: 832,
        ipg: 32,
        ncg: 4,
        size: 4 * 832,
        order: ByteOrder::Little,
    })
    .expect("geometry")
}

fn mount() -> Mount {
    let geo = geometry();
    let raw: Arc<dyn BlockDevice> = Arc::new(memory_device(geo.fsize, geo.size).expect("device"));
    let policy = AllocPolicy {
        minfree_percent: 0,
        dirpref_seed: Some(3),
        ..AllocPolicy::default()
    };
    let sb = Allocator::format(&geo, raw.as_ref(), &policy).expect("format");
    let alloc = Arc::new(Allocator::open(geo, Arc::clone(&raw), sb, policy.clone()).expect("open"));
    let live: Arc<LiveDevice> = Arc::new(InterceptDevice::new(Arc::clone(&raw)));
    let engine = SnapshotEngine::new(Arc::clone(&alloc), Arc::clone(&live));
    Mount {
        geo,
        raw,
        live,
        alloc,
        engine,
        policy,
    }
}

impl Mount {
    fn new_file(&self) -> InodeNumber {
        let ino = self.alloc.valloc(InodeNumber::ROOT, S_IFREG).expect("valloc");
        InodeTable::new(self.live.as_ref(), &self.geo)
            .write(ino, &DiskInode::new(S_IFREG), WriteMode::Sync)
            .expect("inode");
        ino
    }

    /// Fill logical block `lbn` of `ino` with `byte`; returns its address.
    fn write_block(&self, ino: InodeNumber, lbn: u64, byte: u8) -> FragNumber {
        let gate = self.engine.write_gate();
        let table = InodeTable::new(self.live.as_ref(), &self.geo);
        let mut inode = table.read(ino).expect("read inode");
        let io = FileIo::new(&self.alloc, self.live.as_ref());
        let addr = balloc(&io, ino, &mut inode, lbn, self.geo.bsize).expect("balloc");
        self.live
            .write(addr, &vec![byte; self.geo.bsize_usize()], WriteMode::Sync)
            .expect("data write");
        inode.size = inode.size.max((lbn + 1) * u64::from(self.geo.bsize));
        table.write(ino, &inode, WriteMode::Sync).expect("inode write");
        drop(gate);
        self.engine.flush().expect("flush");
        addr
    }

    /// Give an empty `ino` a single fragment-sized block of `len` bytes.
    fn write_tail(&self, ino: InodeNumber, len: u32, byte: u8) -> FragNumber {
        let gate = self.engine.write_gate();
        let table = InodeTable::new(self.live.as_ref(), &self.geo);
        let mut inode = table.read(ino).expect("read inode");
        let io = FileIo::new(&self.alloc, self.live.as_ref());
        let addr = balloc(&io, ino, &mut inode, 0, len).expect("balloc");
        let span = usize::try_from(self.geo.fragroundup(u64::from(len))).expect("span");
        self.live.write(addr, &vec![byte; span], WriteMode::Sync).expect("data write");
        inode.size = u64::from(len);
        table.write(ino, &inode, WriteMode::Sync).expect("inode write");
        drop(gate);
        self.engine.flush().expect("flush");
        addr
    }

    fn remove_all(&self, ino: InodeNumber) {
        let gate = self.engine.write_gate();
        let table = InodeTable::new(self.live.as_ref(), &self.geo);
        let mut inode = table.read(ino).expect("read inode");
        let io = DeviceIndirect::new(self.live.as_ref(), &self.geo, WriteMode::Async);
        truncate(
            &io,
            &mut inode,
            0,
            &mut |cut| table.write(ino, cut, WriteMode::Sync),
            &mut |addr, size| self.alloc.free(addr, size, ino),
        )
        .expect("truncate");
        drop(gate);
        self.engine.flush().expect("flush");
    }

    fn snapshot(&self) -> InodeNumber {
        let ino = self.new_file();
        self.engine.create(ino, &Vec::new).expect("create");
        ino
    }

    fn snap_block(&self, snap: InodeNumber, addr: FragNumber) -> Vec<u8> {
        self.engine
            .read_block(snap, self.geo.fragstoblks(addr))
            .expect("snapshot read")
    }
}

#[test]
fn overwrite_is_preserved_once_per_snapshot() {
    let m = mount();
    let file = m.new_file();
    let addr = m.write_block(file, 0, 0xAA);
    let snap = m.snapshot();
    assert!(m.live.is_hooked());
    assert!(m.alloc.has_free_hook());

    m.write_block(file, 0, 0xBB);
    m.write_block(file, 0, 0xCC);
    assert!(m.snap_block(snap, addr).iter().all(|&b| b == 0xAA));
    let live = m.raw.read(addr, m.geo.bsize_usize()).expect("live read");
    assert!(live.as_slice().iter().all(|&b| b == 0xCC));

    let stats = m.engine.stats();
    assert_eq!(stats.copies, 1);
    assert_eq!(stats.preimage_reads, 1);
}

#[test]
fn two_snapshots_share_one_preimage_read() {
    let m = mount();
    let file = m.new_file();
    let addr = m.write_block(file, 0, 0x11);
    let older = m.snapshot();
    let newer = m.snapshot();

    m.write_block(file, 0, 0x22);
    assert!(m.snap_block(older, addr).iter().all(|&b| b == 0x11));
    assert!(m.snap_block(newer, addr).iter().all(|&b| b == 0x11));
    let stats = m.engine.stats();
    assert_eq!(stats.preimage_reads, 1);
    assert_eq!(stats.copies, 2);

    let listed = m.engine.list().expect("list");
    assert_eq!(listed.iter().map(|s| s.ino).collect::<Vec<_>>(), vec![older.0, newer.0]);
    assert_eq!(listed[1].index, 1);
}

#[test]
fn freed_block_is_adopted_not_copied() {
    let m = mount();
    let file = m.new_file();
    let addr = m.write_block(file, 0, 0x5A);
    let snap = m.snapshot();

    m.remove_all(file);
    let stats = m.engine.stats();
    assert_eq!(stats.adoptions, 1);
    assert_eq!(stats.copies, 0);
    assert!(m.snap_block(snap, addr).iter().all(|&b| b == 0x5A));
    assert!(m.alloc.check().expect("check").is_clean());
}

#[test]
fn blocks_free_at_creation_are_never_copied() {
    let m = mount();
    let snap = m.snapshot();
    let file = m.new_file();
    let addr = m.write_block(file, 0, 0x77);

    assert_eq!(m.engine.stats().copies, 0);
    assert!(m.snap_block(snap, addr).iter().all(|&b| b == 0));
}

#[test]
fn unlinked_open_files_are_hidden() {
    let m = mount();
    let victim = m.new_file();
    let addr = m.write_block(victim, 0, 0x33);
    InodeTable::new(m.live.as_ref(), &m.geo)
        .update(victim, WriteMode::Sync, |inode| {
            inode.nlink = 0;
            Ok(())
        })
        .expect("unlink");

    let snap = m.new_file();
    m.engine.create(snap, &|| vec![victim]).expect("create");

    let table_block = m.snap_block(snap, m.geo.ino_to_fsba(victim));
    let seen = decode_slot(&m.geo, &table_block, victim).expect("decode");
    assert!(!seen.is_allocated());
    let own = decode_slot(&m.geo, &m.snap_block(snap, m.geo.ino_to_fsba(snap)), snap).expect("decode");
    assert!(!own.is_allocated());

    // Its data was marked as not needing a copy.
    m.write_block(victim, 0, 0x44);
    assert_eq!(m.engine.stats().copies, 0);
    assert!(m.snap_block(snap, addr).iter().all(|&b| b == 0));
}

#[test]
fn delete_returns_every_block() {
    let m = mount();
    let file = m.new_file();
    let addr = m.write_block(file, 0, 0x01);
    let before = m.alloc.total();

    let snap = m.snapshot();
    m.write_block(file, 0, 0x02);
    m.engine.delete(snap).expect("delete");

    assert_eq!(m.alloc.total(), before);
    assert_eq!(m.engine.count(), 0);
    assert!(!m.live.is_hooked());
    assert!(!m.alloc.has_free_hook());
    assert_eq!(m.alloc.superblock().snapshots().count(), 0);
    assert!(matches!(m.engine.read_block(snap, m.geo.fragstoblks(addr)), Err(UfsError::NotSnapshot(_))));
    assert!(m.alloc.check().expect("check").is_clean());
}

#[test]
fn freed_block_shared_by_two_snapshots_is_adopted_and_copied() {
    let m = mount();
    let file = m.new_file();
    let addr = m.write_block(file, 0, 0x61);
    let older = m.snapshot();
    let newer = m.snapshot();

    // The older snapshot takes the block itself; the newer one gets a copy.
    m.remove_all(file);
    let stats = m.engine.stats();
    assert_eq!(stats.adoptions, 1);
    assert_eq!(stats.copies, 1);

    m.engine.delete(older).expect("delete");
    assert!(m.snap_block(newer, addr).iter().all(|&b| b == 0x61));
    assert!(m.alloc.check().expect("check").is_clean());
}

#[test]
fn snapshots_reload_from_the_superblock() {
    let m = mount();
    let file = m.new_file();
    let addr = m.write_block(file, 0, 0x9C);
    let snap = m.snapshot();
    m.write_block(file, 0, 0x9D);
    m.alloc.flush().expect("flush");

    let alloc = Arc::new(Allocator::open(m.geo, Arc::clone(&m.raw), m.alloc.superblock(), m.policy.clone()).expect("reopen"));
    let live: Arc<LiveDevice> = Arc::new(InterceptDevice::new(Arc::clone(&m.raw)));
    let engine = SnapshotEngine::new(alloc, Arc::clone(&live));
    assert_eq!(engine.load().expect("load"), 1);
    assert!(live.is_hooked());
    let block = engine.read_block(snap, m.geo.fragstoblks(addr)).expect("read");
    assert!(block.iter().all(|&b| b == 0x9C));
}

#[test]
fn creation_rejects_bad_targets_and_limits() {
    let m = mount();
    let file = m.new_file();
    m.write_block(file, 0, 1);
    assert!(matches!(m.engine.create(file, &Vec::new), Err(UfsError::InvalidArgument(_))));
    assert!(matches!(m.engine.delete(file), Err(UfsError::NotSnapshot(_))));

    for _ in 0..FSMAXSNAP {
        m.snapshot();
    }
    let extra = m.new_file();
    assert!(matches!(m.engine.create(extra, &Vec::new), Err(UfsError::SnapshotLimit)));
    assert_eq!(m.alloc.superblock().snapshots().count(), FSMAXSNAP);
}

#[test]
fn reads_past_the_filesystem_are_rejected() {
    let m = mount();
    let snap = m.snapshot();
    let numblks = m.geo.numblks();
    assert!(matches!(m.engine.read_block(snap, numblks), Err(UfsError::InvalidArgument(_))));
}

#[test]
fn lazily_initialized_inode_blocks_read_empty() {
    let m = mount();
    // Stale bytes in an inode table block no group has handed out yet.
    let groups = [1_u32, 2, 3];
    for &cg in &groups {
        let table = m.geo.ino_to_fsba(m.geo.make_ino(GroupNumber(cg), 0));
        m.raw
            .write(table, &vec![0xEE; m.geo.bsize_usize()], WriteMode::Sync)
            .expect("stale table");
    }
    let snap = m.snapshot();
    let before: Vec<Vec<u8>> = groups
        .iter()
        .map(|&cg| m.snap_block(snap, m.geo.ino_to_fsba(m.geo.make_ino(GroupNumber(cg), 0))))
        .collect();
    assert!(before.iter().all(|block| block.iter().all(|&b| b == 0)));

    for &cg in &groups {
        let ino = m
            .alloc
            .valloc(m.geo.make_ino(GroupNumber(cg), 5), S_IFREG)
            .expect("valloc");
        assert_eq!(m.geo.ino_to_cg(ino), GroupNumber(cg));
        let gate = m.engine.write_gate();
        InodeTable::new(m.live.as_ref(), &m.geo)
            .write(ino, &DiskInode::new(S_IFREG), WriteMode::Sync)
            .expect("inode");
        drop(gate);
        m.engine.flush().expect("flush");

        let block = m.snap_block(snap, m.geo.ino_to_fsba(ino));
        assert!(!decode_slot(&m.geo, &block, ino).expect("decode").is_allocated());
    }
    let after: Vec<Vec<u8>> = groups
        .iter()
        .map(|&cg| m.snap_block(snap, m.geo.ino_to_fsba(m.geo.make_ino(GroupNumber(cg), 0))))
        .collect();
    assert_eq!(before, after);
    assert_eq!(m.engine.stats().copies, 0);
}

#[test]
fn fragment_tail_of_a_hidden_file_stays_shared() {
    let m = mount();
    let victim = m.new_file();
    let hidden = m.write_tail(victim, 1000, 0x11);
    let neighbor = m.new_file();
    let kept = m.write_tail(neighbor, 1000, 0x21);
    assert_eq!(m.geo.blknum(hidden), m.geo.blknum(kept));
    InodeTable::new(m.live.as_ref(), &m.geo)
        .update(victim, WriteMode::Sync, |inode| {
            inode.nlink = 0;
            Ok(())
        })
        .expect("unlink");

    let snap = m.new_file();
    m.engine.create(snap, &|| vec![victim]).expect("create");

    // The block also holds the neighbor's fragments, so it is copied on
    // the neighbor's overwrite rather than skipped with the hidden file.
    let gate = m.engine.write_gate();
    m.live.write(kept, &[0x22; 1024], WriteMode::Sync).expect("overwrite");
    drop(gate);
    m.engine.flush().expect("flush");
    assert_eq!(m.engine.stats().copies, 1);

    let block = m.snap_block(snap, kept);
    let at = (m.geo.fragnum(kept) * m.geo.fsize) as usize;
    assert!(block[at..at + 1000].iter().all(|&b| b == 0x21));
}
