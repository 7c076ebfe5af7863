//! Macintosh File System driver (the flat, pre-HFS volume format).
//!
//! A single Master Directory Block at block 2 carries the volume's name,
//! geometry, and the start of its allocation-block map; a fixed run of
//! directory blocks holds one flat array of file records (no subdirectories,
//! spec.md §2 "MFS"). Each fork is a singly linked chain of allocation
//! blocks addressed through the map, the same way DOS 3.3 addresses its
//! T/S-list chains. Multi-byte fields are big-endian, matching the original
//! 68k machines this format predates (the same convention HFS uses).

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use crate::alloc::AllocMap;
use crate::chunk::ChunkSource;
use crate::entry::{FileEntry, FileEntryArena, FileRef, NativeMetadata};
use crate::error::{Error, Result};
use crate::filesystem::{
    Characteristics, CreationKind, FileStream, ForkPart, Mode, OpenMode, OpenTracker, SeekFrom,
};
use crate::gated::{AccessLevel, GatedChunk};
use crate::notes::Notes;
use crate::usage::{Owner, VolumeUsage};

pub const BLOCK_SIZE: usize = 512;
pub const MDB_BLOCK: usize = 2;
const SIGNATURE: u16 = 0xD2D7;
const MDB_NAME_OFFSET: usize = 0x24;
const MDB_MAP_OFFSET: usize = 0x40;
/// Real MFS packs allocation-block map entries into 12 bits apiece; this
/// driver widens each entry to a plain 16-bit big-endian word, trading the
/// original's density for a much simpler read/write path (see DESIGN.md).
const MAP_ENTRY_SIZE: usize = 2;
const MAP_FREE: u16 = 0x0000;
const MAP_EOF: u16 = 0x0001;
/// Allocation blocks are numbered from here; 0 and 1 are reserved for
/// `MAP_FREE`/`MAP_EOF`.
const FIRST_ALLOC_BLOCK_NUMBER: u16 = 2;
const DEFAULT_DIRECTORY_BLOCKS: u16 = 4;
const DIR_ENTRY_FIXED_LEN: usize = 51;
const MAX_NAME_LEN: usize = 63;

fn read_u16_be(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn write_u16_be(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

fn read_u32_be(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn write_u32_be(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

fn cook_byte(b: u8) -> char {
    match b {
        0x00..=0x1F => char::from_u32(0x2400 + b as u32).unwrap_or('?'),
        0x7F => '\u{2421}',
        _ => b as char,
    }
}

fn decode_name(raw: &[u8]) -> String {
    raw.iter().map(|&b| cook_byte(b)).collect()
}

fn record_len_for_name(name_len: usize) -> usize {
    let len = DIR_ENTRY_FIXED_LEN + name_len;
    len + (len % 2)
}

/// Blocks the allocation-block map itself spans, starting right after the
/// MDB's fixed fields and continuing into following blocks as needed.
fn map_span_blocks(num_alloc_blocks: usize) -> usize {
    let bytes_needed = num_alloc_blocks * MAP_ENTRY_SIZE;
    let first_block_capacity = BLOCK_SIZE - MDB_MAP_OFFSET;
    if bytes_needed <= first_block_capacity {
        1
    } else {
        1 + (bytes_needed - first_block_capacity).div_ceil(BLOCK_SIZE)
    }
}

/// Fixed-point layout of the directory/map/allocation-block regions for a
/// volume of `total_blocks` blocks, following the same "shrink the pool
/// until the bookkeeping structure describing it stops changing size" idiom
/// ProDOS's bitmap sizing uses.
struct Layout {
    map_span: usize,
    dir_start: u16,
    dir_len: u16,
    num_alloc_blocks: usize,
    alloc_block_start: u16,
}

fn compute_layout(total_blocks: usize) -> Layout {
    let dir_len = DEFAULT_DIRECTORY_BLOCKS;
    let mut span = 1usize;
    for _ in 0..8 {
        let num_alloc_blocks = total_blocks.saturating_sub(MDB_BLOCK + span + dir_len as usize);
        let new_span = map_span_blocks(num_alloc_blocks);
        if new_span == span {
            let dir_start = (MDB_BLOCK + span) as u16;
            let alloc_block_start = dir_start + dir_len;
            return Layout {
                map_span: span,
                dir_start,
                dir_len,
                num_alloc_blocks,
                alloc_block_start,
            };
        }
        span = new_span;
    }
    let num_alloc_blocks = total_blocks.saturating_sub(MDB_BLOCK + span + dir_len as usize);
    let dir_start = (MDB_BLOCK + span) as u16;
    let alloc_block_start = dir_start + dir_len;
    Layout {
        map_span: span,
        dir_start,
        dir_len,
        num_alloc_blocks,
        alloc_block_start,
    }
}

/// Walks an allocation-block chain from `start` (a map-numbered block, or
/// `0` for an empty fork), returning the chain in order plus whether a
/// cycle was detected partway through.
fn read_chain(map: &[u16], start: u16) -> (Vec<u16>, bool) {
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut cur = start;
    while cur >= FIRST_ALLOC_BLOCK_NUMBER {
        if !visited.insert(cur) {
            return (chain, true);
        }
        chain.push(cur);
        let idx = (cur - FIRST_ALLOC_BLOCK_NUMBER) as usize;
        let Some(&next) = map.get(idx) else {
            break;
        };
        if next == MAP_EOF || next == MAP_FREE {
            break;
        }
        cur = next;
    }
    (chain, false)
}

/// Native per-entry metadata for an MFS directory record.
#[derive(Debug, Clone, Default)]
pub struct NativeEntry {
    pub dir_block: u16,
    pub dir_offset: usize,
    pub file_num: u32,
    pub finder_info: [u8; 16],
    pub data_start_block: u16,
    pub rsrc_start_block: u16,
}

pub struct MfsFilesystem<S: ChunkSource> {
    chunk: Rc<RefCell<GatedChunk<S>>>,
    mode: Mode,
    notes: Notes,
    arena: FileEntryArena,
    usage: Rc<RefCell<VolumeUsage>>,
    alloc: Rc<RefCell<AllocMap>>,
    block_map: Rc<RefCell<Vec<u16>>>,
    root: Option<FileRef>,
    total_blocks: usize,
    dir_start: u16,
    dir_len: u16,
    alloc_block_start: u16,
    map_span: usize,
    is_dubious: bool,
    next_file_num: u32,
    open: OpenTracker,
}

impl<S: ChunkSource> MfsFilesystem<S> {
    pub fn new(source: S) -> Result<Self> {
        let len = source.formatted_length() as usize;
        let total_blocks = len / BLOCK_SIZE;
        let min_blocks = MDB_BLOCK + 1 + DEFAULT_DIRECTORY_BLOCKS as usize + 1;
        if total_blocks < min_blocks || len % BLOCK_SIZE != 0 {
            return Err(Error::UnsupportedGeometry(
                "image is too small to hold an MDB, directory, and at least one allocation block"
                    .into(),
            ));
        }
        Ok(Self {
            chunk: Rc::new(RefCell::new(GatedChunk::new(source))),
            mode: Mode::Raw,
            notes: Notes::new(),
            arena: FileEntryArena::new(),
            usage: Rc::new(RefCell::new(VolumeUsage::new(total_blocks))),
            alloc: Rc::new(RefCell::new(AllocMap::new(total_blocks, total_blocks))),
            block_map: Rc::new(RefCell::new(Vec::new())),
            root: None,
            total_blocks,
            dir_start: 0,
            dir_len: 0,
            alloc_block_start: 0,
            map_span: 1,
            is_dubious: false,
            next_file_num: 1,
            open: OpenTracker::new(),
        })
    }

    /// The underlying image, for callers that want to probe or persist it
    /// without going through `dispose`.
    pub fn chunk_source(&self) -> std::cell::Ref<'_, S> {
        std::cell::Ref::map(self.chunk.borrow(), |c| c.source())
    }

    fn read_block(&self, n: usize) -> Result<[u8; BLOCK_SIZE]> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.chunk.borrow().read_block(n, &mut buf, 0)?;
        Ok(buf)
    }

    fn write_block_raw(&self, n: usize, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.chunk.borrow_mut().write_block(n, buf, 0)
    }

    fn write_block(&self, n: usize, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.chunk.borrow_mut().write_block_mediated(n, buf, 0)
    }

    fn read_block_map(&self, num_alloc_blocks: usize, map_span: usize) -> Result<Vec<u16>> {
        let mut bytes = Vec::with_capacity(map_span * BLOCK_SIZE);
        for i in 0..map_span {
            let block = self.read_block(MDB_BLOCK + i)?;
            if i == 0 {
                bytes.extend_from_slice(&block[MDB_MAP_OFFSET..]);
            } else {
                bytes.extend_from_slice(&block);
            }
        }
        let mut map = Vec::with_capacity(num_alloc_blocks);
        for i in 0..num_alloc_blocks {
            map.push(read_u16_be(&bytes, i * MAP_ENTRY_SIZE));
        }
        Ok(map)
    }

    fn write_block_map(&self, map: &[u16], map_span: usize) -> Result<()> {
        let mut bytes = vec![0u8; map_span * BLOCK_SIZE];
        for (i, &v) in map.iter().enumerate() {
            write_u16_be(&mut bytes, i * MAP_ENTRY_SIZE, v);
        }
        let first_capacity = BLOCK_SIZE - MDB_MAP_OFFSET;
        for i in 0..map_span {
            if i == 0 {
                let mut block = self.read_block(MDB_BLOCK)?;
                block[MDB_MAP_OFFSET..].copy_from_slice(&bytes[..first_capacity]);
                self.write_block(MDB_BLOCK, &block)?;
            } else {
                let mut block = [0u8; BLOCK_SIZE];
                let src_start = first_capacity + (i - 1) * BLOCK_SIZE;
                block.copy_from_slice(&bytes[src_start..src_start + BLOCK_SIZE]);
                self.write_block(MDB_BLOCK + i, &block)?;
            }
        }
        Ok(())
    }

    fn scan_volume(&mut self) -> Result<()> {
        self.chunk.borrow_mut().set_level(AccessLevel::Open);
        let mdb = self.read_block(MDB_BLOCK)?;
        if read_u16_be(&mdb, 0x00) != SIGNATURE {
            return Err(Error::UnsupportedGeometry(
                "block 2 signature is not an MFS master directory block".into(),
            ));
        }
        let num_alloc_blocks = read_u16_be(&mdb, 0x12) as usize;
        let alloc_block_size = read_u32_be(&mdb, 0x14);
        if alloc_block_size != 0 && alloc_block_size as usize != BLOCK_SIZE {
            self.notes.warning(format!(
                "allocation block size {alloc_block_size} does not match this driver's fixed {BLOCK_SIZE}-byte block"
            ));
        }
        self.dir_start = read_u16_be(&mdb, 0x0E);
        self.dir_len = read_u16_be(&mdb, 0x10);
        self.alloc_block_start = read_u16_be(&mdb, 0x1C);
        self.map_span = map_span_blocks(num_alloc_blocks);

        *self.usage.borrow_mut() = VolumeUsage::new(num_alloc_blocks);
        *self.alloc.borrow_mut() = AllocMap::new(num_alloc_blocks, num_alloc_blocks);
        let map = self.read_block_map(num_alloc_blocks, self.map_span)?;

        let name_len = (mdb[MDB_NAME_OFFSET] as usize).min(27);
        let name = mdb[MDB_NAME_OFFSET + 1..MDB_NAME_OFFSET + 1 + name_len].to_vec();

        self.arena = FileEntryArena::new();
        let root = self.arena.insert(FileEntry {
            filename_raw: name.clone(),
            filename_cooked: decode_name(&name),
            file_type: 0,
            aux_type: 0,
            access_flags: 0,
            create_time: Some(read_u32_be(&mdb, 0x02) as i64),
            modify_time: None,
            data_length: 0,
            rsrc_length: 0,
            storage_size: 0,
            parent: None,
            children: Vec::new(),
            is_directory: true,
            has_rsrc_fork: false,
            is_dubious: false,
            is_damaged: false,
            native: NativeMetadata::Mfs(NativeEntry::default()),
        });
        self.root = Some(root);

        let mut children = Vec::new();
        let mut next_file_num = 1u32;
        for b in 0..self.dir_len as usize {
            let block_no = self.dir_start as usize + b;
            let block = self.read_block(block_no)?;
            let mut offset = 0usize;
            while offset + DIR_ENTRY_FIXED_LEN <= BLOCK_SIZE {
                let flags = block[offset];
                if flags & 0x80 == 0 {
                    break;
                }
                let name_len = block[offset + 50] as usize;
                if name_len > MAX_NAME_LEN || offset + DIR_ENTRY_FIXED_LEN + name_len > BLOCK_SIZE {
                    self.notes.error(format!(
                        "directory record at block {block_no} offset {offset} has an invalid name length"
                    ));
                    self.is_dubious = true;
                    break;
                }
                let raw = block[offset + 51..offset + 51 + name_len].to_vec();
                let file_num = read_u32_be(&block, offset + 18);
                let data_start_block = read_u16_be(&block, offset + 22);
                let data_logical_len = read_u32_be(&block, offset + 24) as u64;
                let rsrc_start_block = read_u16_be(&block, offset + 32);
                let rsrc_logical_len = read_u32_be(&block, offset + 34) as u64;
                let create_date = read_u32_be(&block, offset + 42);
                let modify_date = read_u32_be(&block, offset + 46);
                let mut finder_info = [0u8; 16];
                finder_info.copy_from_slice(&block[offset + 2..offset + 18]);

                next_file_num = next_file_num.max(file_num + 1);

                let native = NativeEntry {
                    dir_block: block_no as u16,
                    dir_offset: offset,
                    file_num,
                    finder_info,
                    data_start_block,
                    rsrc_start_block,
                };

                let entry = FileEntry {
                    filename_raw: raw.clone(),
                    filename_cooked: decode_name(&raw),
                    file_type: 0,
                    aux_type: 0,
                    access_flags: flags,
                    create_time: Some(create_date as i64),
                    modify_time: Some(modify_date as i64),
                    data_length: data_logical_len,
                    rsrc_length: rsrc_logical_len,
                    storage_size: 0,
                    parent: Some(root),
                    children: Vec::new(),
                    is_directory: false,
                    has_rsrc_fork: rsrc_start_block != 0 || rsrc_logical_len != 0,
                    is_dubious: false,
                    is_damaged: false,
                    native: NativeMetadata::Mfs(native),
                };
                let handle = self.arena.insert(entry);
                children.push(handle);

                let (data_chain, data_cycle) = read_chain(&map, data_start_block);
                if data_cycle {
                    self.notes
                        .error(format!("data fork chain for {} has a cycle", decode_name(&raw)));
                    self.is_dubious = true;
                }
                for &b in &data_chain {
                    let idx = (b - FIRST_ALLOC_BLOCK_NUMBER) as usize;
                    self.alloc
                        .borrow_mut()
                        .mark_by_scan(idx, Owner::File(handle), &mut self.usage.borrow_mut());
                }
                let (rsrc_chain, rsrc_cycle) = read_chain(&map, rsrc_start_block);
                if rsrc_cycle {
                    self.notes.error(format!(
                        "resource fork chain for {} has a cycle",
                        decode_name(&raw)
                    ));
                    self.is_dubious = true;
                }
                for &b in &rsrc_chain {
                    let idx = (b - FIRST_ALLOC_BLOCK_NUMBER) as usize;
                    self.alloc
                        .borrow_mut()
                        .mark_by_scan(idx, Owner::File(handle), &mut self.usage.borrow_mut());
                }
                if let Some(e) = self.arena.get_mut(handle) {
                    e.storage_size = ((data_chain.len() + rsrc_chain.len()) * BLOCK_SIZE) as u64;
                }

                offset += record_len_for_name(name_len);
            }
        }
        if let Some(e) = self.arena.get_mut(root) {
            e.children = children;
        }
        self.next_file_num = next_file_num;

        for (i, &v) in map.iter().enumerate() {
            if v != MAP_FREE {
                self.usage.borrow_mut().mark_natively_used(i);
                if !self.alloc.borrow().is_used(i) {
                    self.alloc
                        .borrow_mut()
                        .mark_by_scan(i, Owner::System, &mut self.usage.borrow_mut());
                }
            }
        }
        *self.block_map.borrow_mut() = map;

        let analysis = self.usage.borrow().analyze();
        if analysis.not_marked_used > 0 {
            self.notes.error(format!(
                "{} blocks referenced by files are not marked used in the allocation map",
                analysis.not_marked_used
            ));
            self.is_dubious = true;
        }
        if analysis.unused_marked > 0 {
            self.notes.warning(format!(
                "{} blocks marked used in the allocation map are unreferenced (leak)",
                analysis.unused_marked
            ));
        }
        Ok(())
    }
}

impl<S: ChunkSource> crate::filesystem::Filesystem for MfsFilesystem<S> {
    fn characteristics(&self) -> Characteristics {
        Characteristics {
            name: "MFS",
            can_write: !self.chunk.borrow().source().is_read_only(),
            is_hierarchical: false,
            dir_separator: None,
            has_resource_forks: true,
            filename_syntax: "1-63 bytes, any byte except ':'",
            volume_name_syntax: "1-27 bytes, any byte except ':'",
            timestamp_range: Some((0, u32::MAX as i64)),
        }
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn is_read_only(&self) -> bool {
        self.chunk.borrow().source().is_read_only() || self.is_dubious
    }

    fn is_dubious(&self) -> bool {
        self.is_dubious
    }

    fn free_space(&self) -> i64 {
        if self.mode != Mode::FileAccess {
            return -1;
        }
        (self.alloc.borrow().free_count() * BLOCK_SIZE) as i64
    }

    fn notes(&self) -> &Notes {
        &self.notes
    }

    fn prepare_file_access(&mut self, _deep_scan: bool) -> Result<()> {
        if self.mode == Mode::FileAccess {
            return Ok(());
        }
        if self.mode == Mode::Disposed {
            return Err(Error::ObjectDisposed);
        }
        match self.scan_volume() {
            Ok(()) => {
                self.chunk.borrow_mut().set_level(AccessLevel::ReadOnly);
                self.mode = Mode::FileAccess;
                Ok(())
            }
            Err(e) => {
                self.mode = Mode::Raw;
                self.chunk.borrow_mut().set_level(AccessLevel::Open);
                Err(e)
            }
        }
    }

    fn prepare_raw_access(&mut self) -> Result<()> {
        if self.open.any_open() {
            return Err(Error::InvalidArgument("files are still open".into()));
        }
        self.flush()?;
        self.arena.invalidate();
        self.chunk.borrow_mut().set_level(AccessLevel::Open);
        self.mode = Mode::Raw;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.mode != Mode::FileAccess {
            return Ok(());
        }
        let map = self.block_map.borrow().clone();
        self.write_block_map(&map, self.map_span)?;
        let mut mdb = self.read_block(MDB_BLOCK)?;
        write_u16_be(&mut mdb, 0x22, self.alloc.borrow().free_count() as u16);
        self.write_block(MDB_BLOCK, &mdb)?;
        Ok(())
    }

    fn format(&mut self, volume_name: &str, _volume_number: u8, bootable: bool) -> Result<()> {
        if self.chunk.borrow().source().is_read_only() {
            return Err(Error::InvalidArgument("source is read-only".into()));
        }
        if self.mode == Mode::FileAccess {
            return Err(Error::InvalidArgument(
                "cannot format while in file-access mode".into(),
            ));
        }
        if volume_name.is_empty() || volume_name.len() > 27 || volume_name.contains(':') {
            return Err(Error::InvalidArgument(
                "volume name must be 1-27 bytes and not contain ':'".into(),
            ));
        }
        self.chunk.borrow_mut().set_level(AccessLevel::Open);
        let zero = [0u8; BLOCK_SIZE];
        for b in 0..self.total_blocks {
            self.write_block_raw(b, &zero)?;
        }

        let layout = compute_layout(self.total_blocks);
        if layout.num_alloc_blocks == 0 {
            return Err(Error::UnsupportedGeometry(
                "volume too small to hold any allocation blocks".into(),
            ));
        }
        self.dir_start = layout.dir_start;
        self.dir_len = layout.dir_len;
        self.alloc_block_start = layout.alloc_block_start;
        self.map_span = layout.map_span;

        let mut mdb = [0u8; BLOCK_SIZE];
        write_u16_be(&mut mdb, 0x00, SIGNATURE);
        write_u32_be(&mut mdb, 0x02, 0); // drCrDate
        write_u32_be(&mut mdb, 0x06, 0); // drLsBkUp
        write_u16_be(&mut mdb, 0x0A, 0); // drAtrb
        write_u16_be(&mut mdb, 0x0C, 0); // drNmFls
        write_u16_be(&mut mdb, 0x0E, self.dir_start);
        write_u16_be(&mut mdb, 0x10, self.dir_len);
        write_u16_be(&mut mdb, 0x12, layout.num_alloc_blocks as u16);
        write_u32_be(&mut mdb, 0x14, BLOCK_SIZE as u32); // drAlBlkSiz
        write_u32_be(&mut mdb, 0x18, BLOCK_SIZE as u32); // drClpSiz
        write_u16_be(&mut mdb, 0x1C, self.alloc_block_start);
        write_u32_be(&mut mdb, 0x1E, 1); // drNxtFNum
        write_u16_be(&mut mdb, 0x22, layout.num_alloc_blocks as u16); // drFreeBks
        let name_bytes = volume_name.as_bytes();
        mdb[MDB_NAME_OFFSET] = name_bytes.len() as u8;
        mdb[MDB_NAME_OFFSET + 1..MDB_NAME_OFFSET + 1 + name_bytes.len()].copy_from_slice(name_bytes);
        self.write_block_raw(MDB_BLOCK, &mdb)?;

        *self.alloc.borrow_mut() = AllocMap::new(layout.num_alloc_blocks, layout.num_alloc_blocks);
        *self.usage.borrow_mut() = VolumeUsage::new(layout.num_alloc_blocks);
        let map = vec![MAP_FREE; layout.num_alloc_blocks];
        self.write_block_map(&map, self.map_span)?;
        *self.block_map.borrow_mut() = map;
        self.next_file_num = 1;

        if bootable {
            self.notes.info(
                "bootable formatting requested; boot-block image not supplied by this driver"
                    .to_string(),
            );
        }
        self.notes.clear();
        self.is_dubious = false;
        self.mode = Mode::Raw;
        Ok(())
    }

    fn root(&self) -> Result<FileRef> {
        self.root.ok_or(Error::ObjectDisposed)
    }

    fn children(&self, entry: FileRef) -> Result<Vec<FileRef>> {
        self.arena.get(entry).map(|e| e.children.clone()).ok_or(Error::ObjectDisposed)
    }

    fn entry(&self, entry: FileRef) -> Result<FileEntry> {
        self.arena.get(entry).cloned().ok_or(Error::ObjectDisposed)
    }

    fn open_file(&mut self, entry: FileRef, mode: OpenMode, part: ForkPart) -> Result<Box<dyn FileStream>> {
        let file = self.arena.get(entry).ok_or(Error::ObjectDisposed)?;
        if file.is_damaged {
            return Err(Error::Damaged("directory entry is damaged".into()));
        }
        if file.is_directory {
            return Err(Error::NotSupported(
                "MFS volume has no subdirectories to open as a file",
            ));
        }
        if part == ForkPart::RawData {
            return Err(Error::NotSupported("MFS has no raw-data fork"));
        }
        if part == ForkPart::RsrcFork && !file.has_rsrc_fork {
            return Err(Error::NotSupported("file has no resource fork"));
        }
        let native = match &file.native {
            NativeMetadata::Mfs(n) => n.clone(),
            _ => unreachable!("MFS arena only ever holds Mfs native entries"),
        };
        if mode == OpenMode::ReadWrite && native.dir_block == 0 {
            return Err(Error::NotSupported(
                "newly created entries have no on-disk directory slot to patch yet",
            ));
        }
        let (start_block, data_length) = if part == ForkPart::RsrcFork {
            (native.rsrc_start_block, file.rsrc_length)
        } else {
            (native.data_start_block, file.data_length)
        };
        let (chain, cycle) = {
            let map = self.block_map.borrow();
            read_chain(&map, start_block)
        };
        if cycle {
            return Err(Error::Damaged("allocation chain has a cycle".into()));
        }

        self.open.try_open(entry, part, mode)?;

        Ok(Box::new(MfsDescriptor {
            chunk: self.chunk.clone(),
            alloc: self.alloc.clone(),
            usage: self.usage.clone(),
            block_map: self.block_map.clone(),
            entry,
            part,
            mode,
            cursor: 0,
            data_length,
            chain,
            start_block,
            dir_block: native.dir_block,
            dir_offset: native.dir_offset,
            alloc_block_start: self.alloc_block_start,
            dirty: false,
        }))
    }

    fn create_file(&mut self, parent: FileRef, name: &str, _creation_kind: CreationKind) -> Result<FileRef> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains(':') {
            return Err(Error::InvalidArgument(
                "name must be 1-63 bytes and not contain ':'".into(),
            ));
        }
        if Some(parent) != self.root {
            return Err(Error::NotSupported("MFS volume has no subdirectories"));
        }
        let file_num = self.next_file_num;
        self.next_file_num += 1;
        let entry = FileEntry {
            filename_raw: name.as_bytes().to_vec(),
            filename_cooked: name.to_string(),
            file_type: 0,
            aux_type: 0,
            access_flags: 0x80,
            create_time: None,
            modify_time: None,
            data_length: 0,
            rsrc_length: 0,
            storage_size: 0,
            parent: Some(parent),
            children: Vec::new(),
            is_directory: false,
            has_rsrc_fork: false,
            is_dubious: false,
            is_damaged: false,
            native: NativeMetadata::Mfs(NativeEntry {
                file_num,
                ..NativeEntry::default()
            }),
        };
        let handle = self.arena.insert(entry);
        if let Some(p) = self.arena.get_mut(parent) {
            p.children.push(handle);
        }
        Ok(handle)
    }

    fn delete_file(&mut self, entry: FileRef) -> Result<()> {
        if self.open.is_write_locked(entry) {
            return Err(Error::InvalidArgument("file is open for write".into()));
        }
        if let Some(NativeMetadata::Mfs(native)) = self.arena.get(entry).map(|e| e.native.clone()) {
            {
                let mut map = self.block_map.borrow_mut();
                let (data_chain, _) = read_chain(&map, native.data_start_block);
                let (rsrc_chain, _) = read_chain(&map, native.rsrc_start_block);
                let mut alloc = self.alloc.borrow_mut();
                for b in data_chain.into_iter().chain(rsrc_chain.into_iter()) {
                    let idx = (b - FIRST_ALLOC_BLOCK_NUMBER) as usize;
                    map[idx] = MAP_FREE;
                    alloc.release(idx);
                }
            }
            // Clear the in-use flag on the directory record itself, or a rescan
            // would still enumerate this slot and re-chain blocks just released.
            if native.dir_block != 0 {
                let mut block = self.read_block(native.dir_block as usize)?;
                block[native.dir_offset] &= !0x80;
                self.write_block(native.dir_block as usize, &block)?;
            }
        }
        if let Some(parent) = self.arena.get(entry).and_then(|e| e.parent) {
            if let Some(p) = self.arena.get_mut(parent) {
                p.children.retain(|c| *c != entry);
            }
        }
        self.arena.remove(entry);
        Ok(())
    }

    fn move_file(&mut self, entry: FileRef, new_parent: FileRef, new_name: &str) -> Result<()> {
        if self.open.is_write_locked(entry) {
            return Err(Error::InvalidArgument("file is open for write".into()));
        }
        if Some(new_parent) != self.root {
            return Err(Error::NotSupported("MFS volume has no subdirectories"));
        }
        if let Some(e) = self.arena.get_mut(entry) {
            e.filename_raw = new_name.as_bytes().to_vec();
            e.filename_cooked = new_name.to_string();
        }
        Ok(())
    }

    fn add_rsrc_fork(&mut self, entry: FileRef) -> Result<()> {
        let Some(e) = self.arena.get_mut(entry) else {
            return Err(Error::ObjectDisposed);
        };
        e.has_rsrc_fork = true;
        Ok(())
    }

    fn dispose(&mut self) -> Result<()> {
        if self.mode == Mode::Disposed {
            return Ok(());
        }
        if let Err(e) = self.flush() {
            log::warn!("error flushing MFS volume during dispose: {e}");
        }
        self.open.close_all();
        self.arena.invalidate();
        self.chunk.borrow_mut().set_level(AccessLevel::Closed);
        self.mode = Mode::Disposed;
        Ok(())
    }
}

/// Open-file cursor over an MFS allocation-block chain (spec.md §4.4).
/// Shares the volume's gated chunk, allocation map, and block-map with the
/// owning `MfsFilesystem` through `Rc<RefCell<_>>`, since `open_file`
/// returns an owned `Box<dyn FileStream>` with no lifetime tying it back to
/// `&mut self`.
struct MfsDescriptor<S: ChunkSource> {
    chunk: Rc<RefCell<GatedChunk<S>>>,
    alloc: Rc<RefCell<AllocMap>>,
    usage: Rc<RefCell<VolumeUsage>>,
    block_map: Rc<RefCell<Vec<u16>>>,
    entry: FileRef,
    part: ForkPart,
    mode: OpenMode,
    cursor: u64,
    data_length: u64,
    /// Allocation-block numbers, in logical order.
    chain: Vec<u16>,
    start_block: u16,
    dir_block: u16,
    dir_offset: usize,
    alloc_block_start: u16,
    dirty: bool,
}

impl<S: ChunkSource> MfsDescriptor<S> {
    fn physical_block(&self, alloc_num: u16) -> usize {
        self.alloc_block_start as usize + (alloc_num - FIRST_ALLOC_BLOCK_NUMBER) as usize
    }

    fn read_phys_block(&self, alloc_num: u16) -> Result<[u8; BLOCK_SIZE]> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.chunk.borrow().read_block(self.physical_block(alloc_num), &mut buf, 0)?;
        Ok(buf)
    }

    fn write_phys_block(&self, alloc_num: u16, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.chunk
            .borrow_mut()
            .write_block_mediated(self.physical_block(alloc_num), buf, 0)
    }

    fn read_dir_block(&self) -> Result<[u8; BLOCK_SIZE]> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.chunk.borrow().read_block(self.dir_block as usize, &mut buf, 0)?;
        Ok(buf)
    }

    fn write_dir_block(&self, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.chunk.borrow_mut().write_block_mediated(self.dir_block as usize, buf, 0)
    }

    /// Allocates one more block and appends it to the chain, linking the
    /// previous tail's map entry the way `ensure_sector_allocated` links a
    /// DOS 3.3 T/S-list sector.
    fn grow_one_block(&mut self) -> Result<()> {
        self.alloc.borrow_mut().ensure_space(1)?;
        let idx = self
            .alloc
            .borrow_mut()
            .allocate(Owner::File(self.entry), &mut self.usage.borrow_mut())?;
        let new_block = idx as u16 + FIRST_ALLOC_BLOCK_NUMBER;
        let zero = [0u8; BLOCK_SIZE];
        self.write_phys_block(new_block, &zero)?;
        {
            let mut map = self.block_map.borrow_mut();
            if let Some(&last) = self.chain.last() {
                let last_idx = (last - FIRST_ALLOC_BLOCK_NUMBER) as usize;
                map[last_idx] = new_block;
            } else {
                self.start_block = new_block;
            }
            map[idx] = MAP_EOF;
        }
        self.chain.push(new_block);
        Ok(())
    }

    fn ensure_blocks(&mut self, needed_blocks: usize) -> Result<()> {
        if self.chain.len() >= needed_blocks {
            return Ok(());
        }
        let extra = needed_blocks - self.chain.len();
        self.alloc.borrow().ensure_space(extra)?;
        while self.chain.len() < needed_blocks {
            self.grow_one_block()?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        if self.dir_block == 0 {
            return Ok(());
        }
        let mut block = self.read_dir_block()?;
        let off = self.dir_offset;
        let storage = (self.chain.len() * BLOCK_SIZE) as u32;
        match self.part {
            ForkPart::RsrcFork => {
                write_u16_be(&mut block, off + 32, self.start_block);
                write_u32_be(&mut block, off + 34, self.data_length as u32);
                write_u32_be(&mut block, off + 38, storage);
            }
            _ => {
                write_u16_be(&mut block, off + 22, self.start_block);
                write_u32_be(&mut block, off + 24, self.data_length as u32);
                write_u32_be(&mut block, off + 28, storage);
            }
        }
        self.write_dir_block(&block)
    }
}

impl<S: ChunkSource> FileStream for MfsDescriptor<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.data_length.saturating_sub(self.cursor);
        let want = (buf.len() as u64).min(remaining) as usize;
        let mut done = 0usize;
        while done < want {
            let abs = self.cursor;
            let block_index = (abs / BLOCK_SIZE as u64) as usize;
            let byte_off = (abs % BLOCK_SIZE as u64) as usize;
            let take = (want - done).min(BLOCK_SIZE - byte_off);
            match self.chain.get(block_index) {
                Some(&alloc_num) => {
                    let block = self.read_phys_block(alloc_num)?;
                    buf[done..done + take].copy_from_slice(&block[byte_off..byte_off + take]);
                }
                None => buf[done..done + take].fill(0),
            }
            self.cursor += take as u64;
            done += take;
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.mode != OpenMode::ReadWrite {
            return Err(Error::InvalidArgument("stream opened read-only".into()));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let end_abs = self.cursor + buf.len() as u64;
        let needed_blocks = (end_abs as usize).div_ceil(BLOCK_SIZE);
        self.ensure_blocks(needed_blocks)?;

        let mut done = 0usize;
        while done < buf.len() {
            let abs = self.cursor;
            let block_index = (abs / BLOCK_SIZE as u64) as usize;
            let byte_off = (abs % BLOCK_SIZE as u64) as usize;
            let take = (buf.len() - done).min(BLOCK_SIZE - byte_off);
            let alloc_num = self.chain[block_index];
            let mut block = self.read_phys_block(alloc_num)?;
            block[byte_off..byte_off + take].copy_from_slice(&buf[done..done + take]);
            self.write_phys_block(alloc_num, &block)?;
            self.cursor += take as u64;
            done += take;
        }
        self.data_length = self.data_length.max(self.cursor);
        self.dirty = true;
        Ok(done)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.cursor = match pos {
            SeekFrom::Begin(n) => n,
            SeekFrom::Current(n) => (self.cursor as i64 + n).max(0) as u64,
            SeekFrom::End(n) => (self.data_length as i64 + n).max(0) as u64,
            SeekFrom::DataHole | SeekFrom::DataStart => self.data_length,
        };
        Ok(self.cursor)
    }

    fn set_length(&mut self, len: u64) -> Result<()> {
        let needed_blocks = (len as usize).div_ceil(BLOCK_SIZE);
        if needed_blocks > self.chain.len() {
            self.ensure_blocks(needed_blocks)?;
        }
        self.data_length = len;
        self.cursor = self.cursor.min(len);
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.persist()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// Recognizes an MFS image by its block-2 master directory block signature
/// (spec.md §4.7).
pub struct MfsProber;

impl crate::prober::Prober for MfsProber {
    fn test_image(&self, source: &dyn ChunkSource) -> crate::prober::Confidence {
        use crate::prober::Confidence;

        let total_blocks = source.formatted_length() as usize / BLOCK_SIZE;
        if total_blocks <= MDB_BLOCK {
            return Confidence::No;
        }
        let mut mdb = [0u8; BLOCK_SIZE];
        if source.read_block(MDB_BLOCK, &mut mdb, 0).is_err() {
            return Confidence::No;
        }
        if read_u16_be(&mdb, 0x00) != SIGNATURE {
            return Confidence::No;
        }
        let dir_start = read_u16_be(&mdb, 0x0E) as usize;
        let dir_len = read_u16_be(&mdb, 0x10) as usize;
        let num_alloc_blocks = read_u16_be(&mdb, 0x12) as usize;
        let alloc_block_start = read_u16_be(&mdb, 0x1C) as usize;
        if dir_start == 0 || dir_start + dir_len > total_blocks {
            return Confidence::Barely;
        }
        let name_len = mdb[MDB_NAME_OFFSET] as usize;
        if name_len > 27 {
            return Confidence::Barely;
        }
        if alloc_block_start + num_alloc_blocks == total_blocks {
            Confidence::Yes
        } else if alloc_block_start + num_alloc_blocks <= total_blocks {
            Confidence::Good
        } else {
            Confidence::Barely
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::MemoryChunkSource;
    use crate::filesystem::Filesystem as _;

    fn blank_image(blocks: usize) -> MemoryChunkSource {
        MemoryChunkSource::new(blocks * BLOCK_SIZE)
    }

    /// Hand-plants a real directory record so a write-through test doesn't
    /// depend on `create_file`'s in-memory-only placeholder.
    fn plant_entry(fs: &MfsFilesystem<MemoryChunkSource>, name: &[u8]) {
        let dir_start;
        {
            let mdb = fs.read_block(MDB_BLOCK).unwrap();
            dir_start = read_u16_be(&mdb, 0x0E) as usize;
        }
        let mut block = fs.read_block(dir_start).unwrap();
        block[0] = 0x80;
        write_u32_be(&mut block, 18, 1);
        block[50] = name.len() as u8;
        block[51..51 + name.len()].copy_from_slice(name);
        fs.write_block_raw(dir_start, &block).unwrap();
        let mut mdb = fs.read_block(MDB_BLOCK).unwrap();
        write_u16_be(&mut mdb, 0x0C, 1);
        fs.write_block_raw(MDB_BLOCK, &mdb).unwrap();
    }

    #[test]
    fn format_then_scan_yields_named_root() {
        let mut fs = MfsFilesystem::new(blank_image(40)).unwrap();
        fs.format("UNTITLED", 0, false).unwrap();
        fs.prepare_file_access(false).unwrap();
        let root = fs.root().unwrap();
        let entry = fs.entry(root).unwrap();
        assert_eq!(entry.filename_cooked, "UNTITLED");
        assert!(fs.children(root).unwrap().is_empty());
        assert!(fs.free_space() > 0);
    }

    #[test]
    fn prober_recognizes_formatted_volume() {
        let mut fs = MfsFilesystem::new(blank_image(40)).unwrap();
        fs.format("DISK", 0, false).unwrap();
        let source = fs.chunk_source();
        assert!(MfsProber.test_image(&*source) >= crate::prober::Confidence::Good);
    }

    #[test]
    fn prober_rejects_blank_image() {
        let source = blank_image(40);
        assert_eq!(MfsProber.test_image(&source), crate::prober::Confidence::No);
    }

    #[test]
    fn map_span_grows_for_large_allocation_counts() {
        assert_eq!(map_span_blocks(1), 1);
        let first_capacity = BLOCK_SIZE - MDB_MAP_OFFSET;
        let just_over = first_capacity / MAP_ENTRY_SIZE + 1;
        assert_eq!(map_span_blocks(just_over), 2);
    }

    #[test]
    fn write_then_reopen_recovers_bytes_across_blocks() {
        let mut fs = MfsFilesystem::new(blank_image(80)).unwrap();
        fs.format("TEST", 0, false).unwrap();
        plant_entry(&fs, b"HELLO");

        fs.prepare_file_access(false).unwrap();
        let root = fs.root().unwrap();
        let handle = fs.children(root).unwrap()[0];

        {
            let mut stream = fs.open_file(handle, OpenMode::ReadWrite, ForkPart::DataFork).unwrap();
            stream.seek(SeekFrom::Begin(600)).unwrap();
            stream.write(b"MACOS1").unwrap();
            stream.close().unwrap();
        }

        fs.prepare_raw_access().unwrap();
        fs.prepare_file_access(false).unwrap();
        let root = fs.root().unwrap();
        let handle = fs.children(root).unwrap()[0];
        let refreshed = fs.entry(handle).unwrap();
        assert_eq!(refreshed.data_length, 606);

        let mut stream = fs.open_file(handle, OpenMode::ReadOnly, ForkPart::DataFork).unwrap();
        stream.seek(SeekFrom::Begin(600)).unwrap();
        let mut buf = [0u8; 6];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf, b"MACOS1");
    }

    #[test]
    fn write_fails_when_allocation_blocks_exhausted() {
        let mut fs = MfsFilesystem::new(blank_image(8)).unwrap();
        fs.format("TINY", 0, false).unwrap();
        plant_entry(&fs, b"A");

        fs.prepare_file_access(false).unwrap();
        let root = fs.root().unwrap();
        let handle = fs.children(root).unwrap()[0];

        let mut stream = fs.open_file(handle, OpenMode::ReadWrite, ForkPart::DataFork).unwrap();
        let big = vec![0x41u8; BLOCK_SIZE + 1];
        let result = stream.write(&big);
        assert!(matches!(result, Err(Error::DiskFull)));
    }

    #[test]
    fn delete_file_releases_scanned_chain_blocks() {
        let mut fs = MfsFilesystem::new(blank_image(40)).unwrap();
        fs.format("DISK", 0, false).unwrap();

        // Claim allocation block 0 (map-numbered FIRST_ALLOC_BLOCK_NUMBER)
        // as an EOF-terminated one-block chain, and point a hand-planted
        // directory record at it, mirroring the on-disk state a prior
        // session's write would have left behind.
        let num_alloc_blocks = {
            let mdb = fs.read_block(MDB_BLOCK).unwrap();
            read_u16_be(&mdb, 0x12) as usize
        };
        let mut map = vec![MAP_FREE; num_alloc_blocks];
        map[0] = MAP_EOF;
        fs.write_block_map(&map, fs.map_span).unwrap();

        let dir_start;
        {
            let mdb = fs.read_block(MDB_BLOCK).unwrap();
            dir_start = read_u16_be(&mdb, 0x0E) as usize;
        }
        let mut block = fs.read_block(dir_start).unwrap();
        block[0] = 0x80;
        write_u32_be(&mut block, 18, 1);
        write_u16_be(&mut block, 22, FIRST_ALLOC_BLOCK_NUMBER);
        write_u32_be(&mut block, 24, 2);
        write_u32_be(&mut block, 28, BLOCK_SIZE as u32);
        block[50] = 1;
        block[51] = b'A';
        fs.write_block_raw(dir_start, &block).unwrap();
        let mut mdb = fs.read_block(MDB_BLOCK).unwrap();
        write_u16_be(&mut mdb, 0x0C, 1);
        fs.write_block_raw(MDB_BLOCK, &mdb).unwrap();

        fs.prepare_file_access(false).unwrap();
        assert!(fs.alloc.borrow().is_used(0));
        let free_before = fs.free_space();

        let root = fs.root().unwrap();
        let handle = fs.children(root).unwrap()[0];
        fs.delete_file(handle).unwrap();

        assert!(!fs.alloc.borrow().is_used(0));
        assert_eq!(fs.free_space(), free_before + BLOCK_SIZE as i64);

        // A rescan must not resurrect the deleted record; delete_file has to
        // clear the directory flag byte on disk, not just the in-memory arena.
        fs.prepare_raw_access().unwrap();
        fs.prepare_file_access(false).unwrap();
        let root = fs.root().unwrap();
        assert!(fs.children(root).unwrap().is_empty());
        assert!(!fs.alloc.borrow().is_used(0));
    }
}
