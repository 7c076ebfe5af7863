//! ProDOS / SOS driver (spec.md §3/§4.3/§4.4 "ProDOS").
//!
//! Block 2 holds the volume directory header (39-byte entries, 13 per
//! block). Files carry a storage type: Seedling (data fits in the key
//! block directly), Sapling (key block is a 512-pointer index), Tree (key
//! block is a master index of up to 128 index-block pointers), Directory,
//! or Extended (the key block holds two mini key-block entries, one per
//! fork).

use std::cell::{Ref, RefCell};
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
use crate::util::{is_all_zero, read_u16_le, read_u24_le, write_u16_le, write_u24_le};

pub const BLOCK_SIZE: usize = 512;
pub const VOLUME_HEADER_BLOCK: usize = 2;
pub const ENTRY_LENGTH: usize = 39;
pub const ENTRIES_PER_BLOCK: usize = 13;
pub const MAX_DIRECTORY_DEPTH: usize = 32;
pub const MAX_FILE_LEN: u64 = 0x00FF_FFFF; // 16M - 1
const POINTERS_PER_INDEX_BLOCK: usize = 256;
const INDEX_BLOCKS_PER_MASTER: usize = 128;
/// Byte offsets of the data-fork and resource-fork mini key-block entries
/// within an Extended file's key block (spec.md §4.4 "Extended").
const MINI_ENTRY_DATA_OFFSET: usize = 0x000;
const MINI_ENTRY_RSRC_OFFSET: usize = 0x100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Inactive,
    Seedling,
    Sapling,
    Tree,
    Pascal,
    Directory,
    SubdirHeader,
    VolumeHeader,
    Extended,
}

impl StorageType {
    fn from_nibble(n: u8) -> Self {
        match n {
            0x0 => Self::Inactive,
            0x1 => Self::Seedling,
            0x2 => Self::Sapling,
            0x3 => Self::Tree,
            0x4 => Self::Pascal,
            0x5 => Self::Extended,
            0xD => Self::Directory,
            0xE => Self::SubdirHeader,
            0xF => Self::VolumeHeader,
            _ => Self::Inactive,
        }
    }

    fn to_nibble(self) -> u8 {
        match self {
            Self::Inactive => 0x0,
            Self::Seedling => 0x1,
            Self::Sapling => 0x2,
            Self::Tree => 0x3,
            Self::Pascal => 0x4,
            Self::Extended => 0x5,
            Self::Directory => 0xD,
            Self::SubdirHeader => 0xE,
            Self::VolumeHeader => 0xF,
        }
    }
}

/// Native per-entry metadata for a ProDOS directory entry.
#[derive(Debug, Clone, Default)]
pub struct NativeEntry {
    pub header_block: u16,
    pub entry_block: u16,
    pub entry_index: usize,
    /// Byte offset of this entry within `entry_block`, needed to patch the
    /// entry back after a write (populated at scan time; zero for entries
    /// created in memory by `create_file` and never yet persisted).
    pub entry_offset: usize,
    pub storage_type: u8,
    pub key_block: u16,
    pub blocks_used: u16,
    pub eof: u32,
    pub header_pointer: u16,
    pub version: u8,
    pub min_version: u8,
}

fn cook_byte(b: u8) -> char {
    match b {
        0x00..=0x1F => char::from_u32(0x2400 + b as u32).unwrap_or('?'),
        0x7F => '\u{2421}',
        _ => b as char,
    }
}

fn decode_name(buf: &[u8], offset: usize) -> (Vec<u8>, String) {
    let len_and_type = buf[offset];
    let name_len = (len_and_type & 0x0F) as usize;
    let raw = buf[offset + 1..offset + 1 + name_len].to_vec();
    let cooked = raw.iter().map(|&b| cook_byte(b)).collect();
    (raw, cooked)
}

fn prodos_date(buf: &[u8], offset: usize) -> Option<i64> {
    let date = read_u16_le(buf, offset);
    let time = read_u16_le(buf, offset + 2);
    if date == 0 {
        return None;
    }
    let year = (date >> 9) & 0x7F;
    let month = (date >> 5) & 0x0F;
    let day = date & 0x1F;
    let hour = (time >> 8) & 0x1F;
    let minute = time & 0x3F;
    // Not a calendar conversion (that belongs to an external date-formatting
    // collaborator, spec.md §1); pack the raw fields into a sortable integer.
    Some(
        ((year as i64) << 24)
            | ((month as i64) << 20)
            | ((day as i64) << 15)
            | ((hour as i64) << 10)
            | ((minute as i64) << 4),
    )
}

/// A fork's own storage root, as read out of either the main directory
/// entry (plain files) or one of an Extended key block's mini entries.
#[derive(Debug, Clone, Copy)]
struct ForkRoot {
    storage_type: StorageType,
    key_block: u16,
    blocks_used: u16,
    eof: u32,
}

pub struct ProDosFilesystem<S: ChunkSource> {
    chunk: Rc<RefCell<GatedChunk<S>>>,
    mode: Mode,
    notes: Notes,
    arena: FileEntryArena,
    usage: Rc<RefCell<VolumeUsage>>,
    alloc: Rc<RefCell<AllocMap>>,
    root: Option<FileRef>,
    total_blocks: usize,
    bitmap_block: u16,
    is_dubious: bool,
    open: OpenTracker,
}

impl<S: ChunkSource> ProDosFilesystem<S> {
    pub fn new(source: S) -> Result<Self> {
        let len = source.formatted_length() as usize;
        let total_blocks = len / BLOCK_SIZE;
        if total_blocks < 2 || len % BLOCK_SIZE != 0 {
            return Err(Error::UnsupportedGeometry(
                "image length is not a whole number of 512-byte blocks".into(),
            ));
        }
        Ok(Self {
            chunk: Rc::new(RefCell::new(GatedChunk::new(source))),
            mode: Mode::Raw,
            notes: Notes::new(),
            arena: FileEntryArena::new(),
            usage: Rc::new(RefCell::new(VolumeUsage::new(total_blocks))),
            alloc: Rc::new(RefCell::new(AllocMap::new(total_blocks, total_blocks))),
            root: None,
            total_blocks,
            bitmap_block: 6,
            is_dubious: false,
            open: OpenTracker::new(),
        })
    }

    /// The underlying image, for callers that want to probe or persist it
    /// without going through `dispose`.
    pub fn chunk_source(&self) -> Ref<'_, S> {
        Ref::map(self.chunk.borrow(), |c| c.source())
    }

    fn read_block(&self, n: usize) -> Result<[u8; BLOCK_SIZE]> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.chunk.borrow().read_block(n, &mut buf, 0)?;
        Ok(buf)
    }

    fn write_block(&self, n: usize, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.chunk.borrow_mut().write_block_mediated(n, buf, 0)
    }

    fn bitmap_blocks_needed(&self) -> usize {
        self.total_blocks.div_ceil(BLOCK_SIZE * 8)
    }

    fn read_bitmap(&self) -> Result<Vec<bool>> {
        let mut used = vec![true; self.total_blocks];
        let blocks = self.bitmap_blocks_needed();
        let mut bit = 0usize;
        for b in 0..blocks {
            let data = self.read_block(self.bitmap_block as usize + b)?;
            for byte in data.iter() {
                for i in (0..8).rev() {
                    if bit >= self.total_blocks {
                        break;
                    }
                    let free = (byte >> i) & 1 == 1;
                    used[bit] = !free;
                    bit += 1;
                }
            }
        }
        Ok(used)
    }

    fn write_bitmap(&self) -> Result<()> {
        let blocks = self.bitmap_blocks_needed();
        let mut bit = 0usize;
        let alloc = self.alloc.borrow();
        for b in 0..blocks {
            let mut data = [0u8; BLOCK_SIZE];
            for byte in data.iter_mut() {
                let mut v = 0u8;
                for i in (0..8).rev() {
                    let used = bit < self.total_blocks && alloc.is_used(bit);
                    if !used {
                        v |= 1 << i;
                    }
                    bit += 1;
                }
                *byte = v;
            }
            self.write_block(self.bitmap_block as usize + b, &data)?;
        }
        Ok(())
    }

    /// Recursively scans a directory block chain into `parent_ref`'s
    /// children, bounding recursion per spec.md §4.3's ProDOS tie-break: on
    /// overflow, clear the offending directory's children and mark it
    /// damaged rather than risk a stack overflow on a cyclic structure.
    fn scan_directory(
        &mut self,
        first_block: u16,
        parent_ref: Option<FileRef>,
        depth: usize,
    ) -> Result<Vec<FileRef>> {
        if depth > MAX_DIRECTORY_DEPTH {
            self.notes.error("directory recursion exceeded maximum depth".to_string());
            return Ok(Vec::new());
        }
        let mut children = Vec::new();
        let mut block = first_block;
        let mut visited = std::collections::HashSet::new();
        let mut entry_slot = 0usize;
        while block != 0 {
            if !visited.insert(block) {
                self.notes.error("circular directory block chain detected".to_string());
                self.is_dubious = true;
                break;
            }
            let buf = self.read_block(block as usize)?;
            self.alloc.borrow_mut().mark_by_scan(block as usize, Owner::System, &mut self.usage.borrow_mut());
            let next = read_u16_le(&buf, 2);
            let start = if entry_slot == 0 { 4 + ENTRY_LENGTH } else { 4 };
            let mut offset = start;
            while offset + ENTRY_LENGTH <= BLOCK_SIZE {
                entry_slot += 1;
                let storage_type_len = buf[offset];
                let storage_type = StorageType::from_nibble(storage_type_len >> 4);
                if storage_type != StorageType::Inactive {
                    let (filename_raw, filename_cooked) = decode_name(&buf, offset);
                    let file_type = buf[offset + 0x10] as u16;
                    let key_block = read_u16_le(&buf, offset + 0x11);
                    let blocks_used = read_u16_le(&buf, offset + 0x13);
                    let eof = read_u24_le(&buf, offset + 0x15);
                    let create_time = prodos_date(&buf, offset + 0x18);
                    let access_flags = buf[offset + 0x1E];
                    let aux_type = read_u16_le(&buf, offset + 0x1F) as u32;
                    let modify_time = prodos_date(&buf, offset + 0x21);
                    let header_pointer = read_u16_le(&buf, offset + 0x25);

                    let native = NativeEntry {
                        header_block: first_block,
                        entry_block: block,
                        entry_index: entry_slot - 1,
                        entry_offset: offset,
                        storage_type: storage_type_len >> 4,
                        key_block,
                        blocks_used,
                        eof,
                        header_pointer,
                        version: buf[offset + 0x1C],
                        min_version: buf[offset + 0x1D],
                    };

                    let is_directory = matches!(storage_type, StorageType::Directory);
                    let has_rsrc_fork = matches!(storage_type, StorageType::Extended);
                    let (data_length, rsrc_length) = if has_rsrc_fork && key_block != 0 {
                        match self.read_extended_fork(key_block, MINI_ENTRY_DATA_OFFSET) {
                            Ok(data_root) => {
                                let rsrc = self
                                    .read_extended_fork(key_block, MINI_ENTRY_RSRC_OFFSET)
                                    .map(|r| r.eof as u64)
                                    .unwrap_or(0);
                                (data_root.eof as u64, rsrc)
                            }
                            Err(_) => (eof as u64, 0),
                        }
                    } else {
                        (eof as u64, 0)
                    };

                    let entry = FileEntry {
                        filename_raw,
                        filename_cooked,
                        file_type,
                        aux_type,
                        access_flags,
                        create_time,
                        modify_time,
                        data_length,
                        rsrc_length,
                        storage_size: blocks_used as u64 * BLOCK_SIZE as u64,
                        parent: parent_ref,
                        children: Vec::new(),
                        is_directory,
                        has_rsrc_fork,
                        is_dubious: false,
                        is_damaged: false,
                        native: NativeMetadata::ProDos(native),
                    };
                    let handle = self.arena.insert(entry);
                    self.mark_storage_blocks(key_block, storage_type, handle)?;

                    if is_directory {
                        let grandchildren = self.scan_directory(key_block, Some(handle), depth + 1)?;
                        if let Some(e) = self.arena.get_mut(handle) {
                            e.children = grandchildren;
                        }
                    }
                    children.push(handle);
                }
                offset += ENTRY_LENGTH;
            }
            block = next;
        }
        Ok(children)
    }

    fn mark_storage_blocks(&mut self, key_block: u16, storage_type: StorageType, owner: FileRef) -> Result<()> {
        if key_block == 0 {
            return Ok(());
        }
        match storage_type {
            StorageType::Seedling => {
                self.alloc.borrow_mut().mark_by_scan(key_block as usize, Owner::File(owner), &mut self.usage.borrow_mut());
            }
            StorageType::Sapling | StorageType::Directory => {
                self.alloc.borrow_mut().mark_by_scan(key_block as usize, Owner::File(owner), &mut self.usage.borrow_mut());
                let index = self.read_block(key_block as usize)?;
                for i in 0..POINTERS_PER_INDEX_BLOCK {
                    let block = read_u16_le_pair(&index, i);
                    if block != 0 {
                        self.alloc.borrow_mut().mark_by_scan(block as usize, Owner::File(owner), &mut self.usage.borrow_mut());
                    }
                }
            }
            StorageType::Tree => {
                self.alloc.borrow_mut().mark_by_scan(key_block as usize, Owner::File(owner), &mut self.usage.borrow_mut());
                let master = self.read_block(key_block as usize)?;
                for i in 0..INDEX_BLOCKS_PER_MASTER {
                    let index_block = read_u16_le_pair(&master, i);
                    if index_block != 0 {
                        self.alloc.borrow_mut().mark_by_scan(index_block as usize, Owner::File(owner), &mut self.usage.borrow_mut());
                        let index = self.read_block(index_block as usize)?;
                        for j in 0..POINTERS_PER_INDEX_BLOCK {
                            let block = read_u16_le_pair(&index, j);
                            if block != 0 {
                                self.alloc.borrow_mut().mark_by_scan(block as usize, Owner::File(owner), &mut self.usage.borrow_mut());
                            }
                        }
                    }
                }
            }
            StorageType::Extended => {
                self.alloc.borrow_mut().mark_by_scan(key_block as usize, Owner::File(owner), &mut self.usage.borrow_mut());
                for mini_off in [MINI_ENTRY_DATA_OFFSET, MINI_ENTRY_RSRC_OFFSET] {
                    if let Ok(root) = self.read_extended_fork(key_block, mini_off) {
                        if root.key_block != 0 {
                            self.mark_storage_blocks(root.key_block, root.storage_type, owner)?;
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Releases the blocks a now-deleted file occupied back to `self.alloc`,
    /// mirroring `mark_storage_blocks`'s walk of the key/index/master blocks.
    fn release_storage_blocks(&mut self, key_block: u16, storage_type: StorageType) -> Result<()> {
        if key_block == 0 {
            return Ok(());
        }
        match storage_type {
            StorageType::Seedling => {
                self.alloc.borrow_mut().release(key_block as usize);
            }
            StorageType::Sapling | StorageType::Directory => {
                let index = self.read_block(key_block as usize)?;
                for i in 0..POINTERS_PER_INDEX_BLOCK {
                    let block = read_u16_le_pair(&index, i);
                    if block != 0 {
                        self.alloc.borrow_mut().release(block as usize);
                    }
                }
                self.alloc.borrow_mut().release(key_block as usize);
            }
            StorageType::Tree => {
                let master = self.read_block(key_block as usize)?;
                for i in 0..INDEX_BLOCKS_PER_MASTER {
                    let index_block = read_u16_le_pair(&master, i);
                    if index_block != 0 {
                        let index = self.read_block(index_block as usize)?;
                        for j in 0..POINTERS_PER_INDEX_BLOCK {
                            let block = read_u16_le_pair(&index, j);
                            if block != 0 {
                                self.alloc.borrow_mut().release(block as usize);
                            }
                        }
                        self.alloc.borrow_mut().release(index_block as usize);
                    }
                }
                self.alloc.borrow_mut().release(key_block as usize);
            }
            StorageType::Extended => {
                for mini_off in [MINI_ENTRY_DATA_OFFSET, MINI_ENTRY_RSRC_OFFSET] {
                    if let Ok(root) = self.read_extended_fork(key_block, mini_off) {
                        self.release_storage_blocks(root.key_block, root.storage_type)?;
                    }
                }
                self.alloc.borrow_mut().release(key_block as usize);
            }
            _ => {}
        }
        Ok(())
    }

    /// Reads one fork's mini key-block entry out of an Extended file's key
    /// block (spec.md §4.4 "Extended"). Layout is this driver's own compact
    /// encoding (storage-type nibble, key block, blocks used, eof), not a
    /// byte-exact reproduction of any particular on-disk mini-entry dialect.
    fn read_extended_fork(&self, extended_key_block: u16, mini_off: usize) -> Result<ForkRoot> {
        let buf = self.read_block(extended_key_block as usize)?;
        let storage_type = StorageType::from_nibble(buf[mini_off] >> 4);
        let key_block = read_u16_le(&buf, mini_off + 1);
        let blocks_used = read_u16_le(&buf, mini_off + 3);
        let eof = read_u24_le(&buf, mini_off + 5);
        Ok(ForkRoot { storage_type, key_block, blocks_used, eof })
    }

    fn scan_volume(&mut self) -> Result<()> {
        self.chunk.borrow_mut().set_level(AccessLevel::Open);
        let header = self.read_block(VOLUME_HEADER_BLOCK)?;
        let storage_type = header[4] >> 4;
        if StorageType::from_nibble(storage_type) != StorageType::VolumeHeader {
            return Err(Error::UnsupportedGeometry(
                "block 2 storage-type nibble is not a volume header".into(),
            ));
        }
        let total_blocks = read_u16_le(&header, 0x29) as usize;
        if total_blocks != 0 && total_blocks != self.total_blocks {
            self.notes.warning(format!(
                "volume header reports {total_blocks} blocks, image holds {}",
                self.total_blocks
            ));
        }
        self.bitmap_block = read_u16_le(&header, 0x27);

        *self.usage.borrow_mut() = VolumeUsage::new(self.total_blocks);
        *self.alloc.borrow_mut() = AllocMap::new(self.total_blocks, self.total_blocks);
        self.alloc.borrow_mut().mark_by_scan(0, Owner::System, &mut self.usage.borrow_mut());
        self.alloc.borrow_mut().mark_by_scan(1, Owner::System, &mut self.usage.borrow_mut());

        let (root_raw, root_cooked) = decode_name(&header, 4);
        self.arena = FileEntryArena::new();
        let root = self.arena.insert(FileEntry {
            filename_raw: root_raw,
            filename_cooked: root_cooked,
            file_type: 0x0F,
            aux_type: 0,
            access_flags: header[0x1E],
            create_time: prodos_date(&header, 0x18),
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
            native: NativeMetadata::ProDos(NativeEntry::default()),
        });
        self.root = Some(root);

        let children = self.scan_directory(VOLUME_HEADER_BLOCK as u16, Some(root), 0)?;
        if let Some(e) = self.arena.get_mut(root) {
            e.children = children;
        }

        let native_used = self.read_bitmap()?;
        let bitmap_blocks = self.bitmap_blocks_needed();
        for b in 0..bitmap_blocks {
            self.alloc.borrow_mut().mark_by_scan(self.bitmap_block as usize + b, Owner::System, &mut self.usage.borrow_mut());
        }
        for (block, used) in native_used.iter().enumerate() {
            if *used {
                self.usage.borrow_mut().mark_natively_used(block);
                if !self.alloc.borrow().is_used(block) {
                    self.alloc.borrow_mut().mark_by_scan(block, Owner::System, &mut self.usage.borrow_mut());
                }
            }
        }

        let analysis = self.usage.borrow().analyze();
        if analysis.not_marked_used > 0 {
            self.notes.error(format!(
                "{} blocks referenced by files are not marked used in the volume bitmap",
                analysis.not_marked_used
            ));
            self.is_dubious = true;
        }
        if analysis.unused_marked > 0 {
            self.notes.warning(format!(
                "{} blocks marked used in the volume bitmap are unreferenced (leak)",
                analysis.unused_marked
            ));
        }
        Ok(())
    }
}

fn read_u16_le_pair(block: &[u8; BLOCK_SIZE], i: usize) -> u16 {
    u16::from_le_bytes([block[i], block[POINTERS_PER_INDEX_BLOCK + i]])
}

impl<S: ChunkSource> crate::filesystem::Filesystem for ProDosFilesystem<S> {
    fn characteristics(&self) -> Characteristics {
        Characteristics {
            name: "ProDOS",
            can_write: !self.chunk.borrow().source().is_read_only(),
            is_hierarchical: true,
            dir_separator: Some('/'),
            has_resource_forks: true,
            filename_syntax: "1-15 chars, letter first, letters/digits/period",
            volume_name_syntax: "1-15 chars, letter first",
            timestamp_range: None,
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
        self.write_bitmap()
    }

    fn format(&mut self, volume_name: &str, _volume_number: u8, bootable: bool) -> Result<()> {
        if self.chunk.borrow().source().is_read_only() {
            return Err(Error::InvalidArgument("source is read-only".into()));
        }
        if self.mode == Mode::FileAccess {
            return Err(Error::InvalidArgument("cannot format while in file-access mode".into()));
        }
        if volume_name.is_empty() || !volume_name.as_bytes()[0].is_ascii_uppercase() {
            return Err(Error::InvalidArgument("volume name must start with a letter".into()));
        }
        self.chunk.borrow_mut().set_level(AccessLevel::Open);
        let zero = [0u8; BLOCK_SIZE];
        for b in 0..self.total_blocks {
            self.write_block(b, &zero)?;
        }
        let mut header = [0u8; BLOCK_SIZE];
        write_u16_le(&mut header, 2, 0); // prev/next directory block
        header[4] = (StorageType::VolumeHeader.to_nibble() << 4) | volume_name.len().min(15) as u8;
        header[5..5 + volume_name.len().min(15)].copy_from_slice(
            &volume_name.as_bytes()[..volume_name.len().min(15)],
        );
        header[0x1D] = 0x02; // min_version
        header[0x1E] = 0xC3; // access: destroy/rename/write/read
        write_u16_le(&mut header, 0x1F, ENTRY_LENGTH as u16 | ((ENTRIES_PER_BLOCK as u16) << 8));
        write_u16_le(&mut header, 0x23, 0); // file_count
        self.bitmap_block = 6;
        write_u16_le(&mut header, 0x27, self.bitmap_block);
        write_u16_le(&mut header, 0x29, self.total_blocks as u16);
        self.write_block(VOLUME_HEADER_BLOCK, &header)?;

        *self.alloc.borrow_mut() = AllocMap::new(self.total_blocks, self.total_blocks);
        *self.usage.borrow_mut() = VolumeUsage::new(self.total_blocks);
        self.alloc.borrow_mut().mark_by_scan(0, Owner::System, &mut self.usage.borrow_mut());
        self.alloc.borrow_mut().mark_by_scan(1, Owner::System, &mut self.usage.borrow_mut());
        self.alloc.borrow_mut().mark_by_scan(VOLUME_HEADER_BLOCK, Owner::System, &mut self.usage.borrow_mut());
        let bitmap_blocks = self.bitmap_blocks_needed();
        for b in 0..bitmap_blocks {
            self.alloc.borrow_mut().mark_by_scan(self.bitmap_block as usize + b, Owner::System, &mut self.usage.borrow_mut());
        }
        self.write_bitmap()?;

        if bootable {
            self.notes.info("bootable formatting requested; boot-block image not supplied by this driver".to_string());
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
        if part == ForkPart::RsrcFork && !file.has_rsrc_fork {
            return Err(Error::NotSupported("file has no resource fork"));
        }
        if part == ForkPart::RawData {
            return Err(Error::NotSupported("ProDOS has no raw-data fork"));
        }
        let native = match &file.native {
            NativeMetadata::ProDos(n) => n.clone(),
            _ => unreachable!("ProDOS arena only ever holds ProDos native entries"),
        };
        if mode == OpenMode::ReadWrite && native.entry_block == 0 {
            return Err(Error::NotSupported(
                "newly created entries have no on-disk directory slot to patch yet",
            ));
        }
        let main_storage_type = StorageType::from_nibble(native.storage_type);
        let is_extended = main_storage_type == StorageType::Extended;
        let root = if is_extended {
            let mini_off = if part == ForkPart::RsrcFork { MINI_ENTRY_RSRC_OFFSET } else { MINI_ENTRY_DATA_OFFSET };
            self.read_extended_fork(native.key_block, mini_off)?
        } else {
            ForkRoot {
                storage_type: main_storage_type,
                key_block: native.key_block,
                blocks_used: native.blocks_used,
                eof: native.eof,
            }
        };

        self.open.try_open(entry, part, mode)?;

        Ok(Box::new(ProDosDescriptor {
            chunk: self.chunk.clone(),
            alloc: self.alloc.clone(),
            usage: self.usage.clone(),
            entry,
            part,
            mode,
            cursor: 0,
            data_length: root.eof as u64,
            storage_type: root.storage_type,
            key_block: root.key_block,
            blocks_used: root.blocks_used,
            is_extended,
            extended_key_block: native.key_block,
            entry_block: native.entry_block,
            entry_offset: native.entry_offset,
            dirty: false,
        }))
    }

    fn create_file(&mut self, parent: FileRef, name: &str, _creation_kind: CreationKind) -> Result<FileRef> {
        if name.is_empty() || name.len() > 15 {
            return Err(Error::InvalidArgument("name must be 1-15 characters".into()));
        }
        let entry = FileEntry {
            filename_raw: name.as_bytes().to_vec(),
            filename_cooked: name.to_string(),
            file_type: 0x06,
            aux_type: 0,
            access_flags: 0xC3,
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
            native: NativeMetadata::ProDos(NativeEntry {
                storage_type: StorageType::Seedling.to_nibble(),
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
        if let Some(NativeMetadata::ProDos(native)) = self.arena.get(entry).map(|e| e.native.clone()) {
            self.release_storage_blocks(native.key_block, StorageType::from_nibble(native.storage_type))?;
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
        let old_parent = self.arena.get(entry).and_then(|e| e.parent);
        if let Some(p) = old_parent {
            if let Some(parent_entry) = self.arena.get_mut(p) {
                parent_entry.children.retain(|c| *c != entry);
            }
        }
        if let Some(e) = self.arena.get_mut(entry) {
            e.filename_raw = new_name.as_bytes().to_vec();
            e.filename_cooked = new_name.to_string();
            e.parent = Some(new_parent);
        }
        if let Some(p) = self.arena.get_mut(new_parent) {
            p.children.push(entry);
        }
        Ok(())
    }

    fn add_rsrc_fork(&mut self, entry: FileRef) -> Result<()> {
        let Some(e) = self.arena.get_mut(entry) else {
            return Err(Error::ObjectDisposed);
        };
        e.has_rsrc_fork = true;
        if let NativeMetadata::ProDos(native) = &mut e.native {
            native.storage_type = StorageType::Extended.to_nibble();
        }
        Ok(())
    }

    fn dispose(&mut self) -> Result<()> {
        if self.mode == Mode::Disposed {
            return Ok(());
        }
        if let Err(e) = self.flush() {
            log::warn!("error flushing ProDOS volume during dispose: {e}");
        }
        self.open.close_all();
        self.arena.invalidate();
        self.chunk.borrow_mut().set_level(AccessLevel::Closed);
        self.mode = Mode::Disposed;
        Ok(())
    }
}

/// A live file/fork descriptor, sharing the owning filesystem's chunk/alloc/
/// usage so writes land directly on the volume instead of a private copy
/// (spec.md §4.4).
struct ProDosDescriptor<S: ChunkSource> {
    chunk: Rc<RefCell<GatedChunk<S>>>,
    alloc: Rc<RefCell<AllocMap>>,
    usage: Rc<RefCell<VolumeUsage>>,
    entry: FileRef,
    part: ForkPart,
    mode: OpenMode,
    cursor: u64,
    data_length: u64,
    storage_type: StorageType,
    key_block: u16,
    blocks_used: u16,
    is_extended: bool,
    extended_key_block: u16,
    entry_block: u16,
    entry_offset: usize,
    dirty: bool,
}

impl<S: ChunkSource> ProDosDescriptor<S> {
    fn read_phys_block(&self, block: u16) -> Result<[u8; BLOCK_SIZE]> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.chunk.borrow().read_block(block as usize, &mut buf, 0)?;
        Ok(buf)
    }

    fn write_phys_block(&self, block: u16, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.chunk.borrow_mut().write_block_mediated(block as usize, buf, 0)
    }

    fn write_extended_fork(&self, extended_key_block: u16, mini_off: usize, root: ForkRoot) -> Result<()> {
        let mut buf = self.read_phys_block(extended_key_block)?;
        buf[mini_off] = root.storage_type.to_nibble() << 4;
        write_u16_le(&mut buf, mini_off + 1, root.key_block);
        write_u16_le(&mut buf, mini_off + 3, root.blocks_used);
        write_u24_le(&mut buf, mini_off + 5, root.eof);
        self.write_phys_block(extended_key_block, &buf)
    }

    fn allocate_block(&mut self) -> Result<u16> {
        self.alloc.borrow_mut().ensure_space(1)?;
        let mut usage = self.usage.borrow_mut();
        let b = self.alloc.borrow_mut().allocate(Owner::File(self.entry), &mut usage)?;
        self.blocks_used += 1;
        Ok(b as u16)
    }

    fn release_block(&mut self, block: u16) {
        if block != 0 {
            self.alloc.borrow_mut().release(block as usize);
            self.blocks_used = self.blocks_used.saturating_sub(1);
        }
    }

    /// Returns the physical data block for `block_index` if the storage
    /// structure already reaches that far, without allocating anything.
    fn existing_pointer(&self, block_index: usize) -> Result<Option<u16>> {
        match self.storage_type {
            StorageType::Seedling => {
                if block_index == 0 && self.key_block != 0 {
                    Ok(Some(self.key_block))
                } else {
                    Ok(None)
                }
            }
            StorageType::Sapling => {
                if block_index >= POINTERS_PER_INDEX_BLOCK || self.key_block == 0 {
                    return Ok(None);
                }
                let idx = self.read_phys_block(self.key_block)?;
                let p = read_u16_le_pair(&idx, block_index);
                Ok(if p == 0 { None } else { Some(p) })
            }
            StorageType::Tree => {
                let master_slot = block_index / POINTERS_PER_INDEX_BLOCK;
                let sub = block_index % POINTERS_PER_INDEX_BLOCK;
                if master_slot >= INDEX_BLOCKS_PER_MASTER || self.key_block == 0 {
                    return Ok(None);
                }
                let master = self.read_phys_block(self.key_block)?;
                let index_block = read_u16_le_pair(&master, master_slot);
                if index_block == 0 {
                    return Ok(None);
                }
                let idx = self.read_phys_block(index_block)?;
                let p = read_u16_le_pair(&idx, sub);
                Ok(if p == 0 { None } else { Some(p) })
            }
            _ => Ok(None),
        }
    }

    fn promote_to_sapling(&mut self) -> Result<()> {
        let old_key = self.key_block;
        let idx_block = self.allocate_block()?;
        let mut idx_buf = [0u8; BLOCK_SIZE];
        if old_key != 0 {
            let bytes = old_key.to_le_bytes();
            idx_buf[0] = bytes[0];
            idx_buf[POINTERS_PER_INDEX_BLOCK] = bytes[1];
        }
        self.write_phys_block(idx_block, &idx_buf)?;
        self.key_block = idx_block;
        self.storage_type = StorageType::Sapling;
        Ok(())
    }

    fn promote_to_tree(&mut self) -> Result<()> {
        let old_sapling_index = self.key_block;
        let master_block = self.allocate_block()?;
        let mut master = [0u8; BLOCK_SIZE];
        if old_sapling_index != 0 {
            let bytes = old_sapling_index.to_le_bytes();
            master[0] = bytes[0];
            master[POINTERS_PER_INDEX_BLOCK] = bytes[1];
        }
        self.write_phys_block(master_block, &master)?;
        self.key_block = master_block;
        self.storage_type = StorageType::Tree;
        Ok(())
    }

    /// Returns the physical block for `block_index`, promoting the storage
    /// shape and allocating index/data blocks as needed (spec.md §4.4's
    /// Seedling→Sapling→Tree growth).
    fn ensure_data_block(&mut self, block_index: usize) -> Result<u16> {
        if self.storage_type == StorageType::Seedling && block_index > 0 {
            self.promote_to_sapling()?;
        }
        if self.storage_type == StorageType::Sapling && block_index >= POINTERS_PER_INDEX_BLOCK {
            self.promote_to_tree()?;
        }
        match self.storage_type {
            StorageType::Seedling => {
                if self.key_block == 0 {
                    self.key_block = self.allocate_block()?;
                    self.write_phys_block(self.key_block, &[0u8; BLOCK_SIZE])?;
                }
                Ok(self.key_block)
            }
            StorageType::Sapling => {
                if self.key_block == 0 {
                    let idx = self.allocate_block()?;
                    self.write_phys_block(idx, &[0u8; BLOCK_SIZE])?;
                    self.key_block = idx;
                }
                let mut idx_buf = self.read_phys_block(self.key_block)?;
                let existing = read_u16_le_pair(&idx_buf, block_index);
                if existing != 0 {
                    return Ok(existing);
                }
                let data_block = self.allocate_block()?;
                self.write_phys_block(data_block, &[0u8; BLOCK_SIZE])?;
                let bytes = data_block.to_le_bytes();
                idx_buf[block_index] = bytes[0];
                idx_buf[POINTERS_PER_INDEX_BLOCK + block_index] = bytes[1];
                self.write_phys_block(self.key_block, &idx_buf)?;
                Ok(data_block)
            }
            StorageType::Tree => {
                let master_slot = block_index / POINTERS_PER_INDEX_BLOCK;
                let sub = block_index % POINTERS_PER_INDEX_BLOCK;
                if master_slot >= INDEX_BLOCKS_PER_MASTER {
                    return Err(Error::InvalidArgument("file has grown past ProDOS's maximum size".into()));
                }
                if self.key_block == 0 {
                    let m = self.allocate_block()?;
                    self.write_phys_block(m, &[0u8; BLOCK_SIZE])?;
                    self.key_block = m;
                }
                let mut master = self.read_phys_block(self.key_block)?;
                let mut index_block = read_u16_le_pair(&master, master_slot);
                if index_block == 0 {
                    index_block = self.allocate_block()?;
                    self.write_phys_block(index_block, &[0u8; BLOCK_SIZE])?;
                    let bytes = index_block.to_le_bytes();
                    master[master_slot] = bytes[0];
                    master[POINTERS_PER_INDEX_BLOCK + master_slot] = bytes[1];
                    self.write_phys_block(self.key_block, &master)?;
                }
                let mut idx_buf = self.read_phys_block(index_block)?;
                let existing = read_u16_le_pair(&idx_buf, sub);
                if existing != 0 {
                    return Ok(existing);
                }
                let data_block = self.allocate_block()?;
                self.write_phys_block(data_block, &[0u8; BLOCK_SIZE])?;
                let bytes = data_block.to_le_bytes();
                idx_buf[sub] = bytes[0];
                idx_buf[POINTERS_PER_INDEX_BLOCK + sub] = bytes[1];
                self.write_phys_block(index_block, &idx_buf)?;
                Ok(data_block)
            }
            _ => Err(Error::NotSupported("unexpected storage type for file write")),
        }
    }

    fn truncate_to(&mut self, len: u64) -> Result<()> {
        let new_last_index = if len == 0 { None } else { Some(((len - 1) / BLOCK_SIZE as u64) as usize) };
        match self.storage_type {
            StorageType::Seedling => {
                if new_last_index.is_none() {
                    self.release_block(self.key_block);
                    self.key_block = 0;
                }
            }
            StorageType::Sapling => {
                if self.key_block == 0 {
                    return Ok(());
                }
                let mut idx = self.read_phys_block(self.key_block)?;
                for slot in 0..POINTERS_PER_INDEX_BLOCK {
                    let keep = new_last_index.is_some_and(|l| slot <= l);
                    if !keep {
                        let p = read_u16_le_pair(&idx, slot);
                        if p != 0 {
                            self.release_block(p);
                            idx[slot] = 0;
                            idx[POINTERS_PER_INDEX_BLOCK + slot] = 0;
                        }
                    }
                }
                self.write_phys_block(self.key_block, &idx)?;
                if new_last_index.is_none_or(|l| l == 0) {
                    let slot0 = read_u16_le_pair(&idx, 0);
                    self.release_block(self.key_block);
                    self.key_block = slot0;
                    self.storage_type = StorageType::Seedling;
                }
            }
            StorageType::Tree => {
                if self.key_block == 0 {
                    return Ok(());
                }
                let mut master = self.read_phys_block(self.key_block)?;
                for master_slot in 0..INDEX_BLOCKS_PER_MASTER {
                    let index_block = read_u16_le_pair(&master, master_slot);
                    if index_block == 0 {
                        continue;
                    }
                    let base = master_slot * POINTERS_PER_INDEX_BLOCK;
                    let mut idx = self.read_phys_block(index_block)?;
                    let mut any_left = false;
                    for sub in 0..POINTERS_PER_INDEX_BLOCK {
                        let block_index = base + sub;
                        let keep = new_last_index.is_some_and(|l| block_index <= l);
                        let p = read_u16_le_pair(&idx, sub);
                        if !keep {
                            if p != 0 {
                                self.release_block(p);
                                idx[sub] = 0;
                                idx[POINTERS_PER_INDEX_BLOCK + sub] = 0;
                            }
                        } else if p != 0 {
                            any_left = true;
                        }
                    }
                    if any_left {
                        self.write_phys_block(index_block, &idx)?;
                    } else {
                        self.release_block(index_block);
                        master[master_slot] = 0;
                        master[POINTERS_PER_INDEX_BLOCK + master_slot] = 0;
                    }
                }
                self.write_phys_block(self.key_block, &master)?;
                if new_last_index.is_none_or(|l| l < POINTERS_PER_INDEX_BLOCK) {
                    let idx0 = read_u16_le_pair(&master, 0);
                    self.release_block(self.key_block);
                    self.key_block = idx0;
                    self.storage_type = StorageType::Sapling;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let root = ForkRoot {
            storage_type: self.storage_type,
            key_block: self.key_block,
            blocks_used: self.blocks_used,
            eof: self.data_length as u32,
        };
        if self.is_extended {
            let mini_off = if self.part == ForkPart::RsrcFork { MINI_ENTRY_RSRC_OFFSET } else { MINI_ENTRY_DATA_OFFSET };
            self.write_extended_fork(self.extended_key_block, mini_off, root)
        } else {
            let mut block = self.read_phys_block(self.entry_block)?;
            let off = self.entry_offset;
            block[off] = (self.storage_type.to_nibble() << 4) | (block[off] & 0x0F);
            write_u16_le(&mut block, off + 0x11, self.key_block);
            write_u16_le(&mut block, off + 0x13, self.blocks_used);
            write_u24_le(&mut block, off + 0x15, self.data_length as u32);
            self.write_phys_block(self.entry_block, &block)
        }
    }
}

impl<S: ChunkSource> FileStream for ProDosDescriptor<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.data_length.saturating_sub(self.cursor);
        let want = (buf.len() as u64).min(remaining_len) as usize;
        let mut done = 0usize;
        while done < want {
            let abs = self.cursor;
            let block_index = (abs / BLOCK_SIZE as u64) as usize;
            let byte_off = (abs % BLOCK_SIZE as u64) as usize;
            let take = (want - done).min(BLOCK_SIZE - byte_off);
            match self.existing_pointer(block_index)? {
                Some(phys) => {
                    let block = self.read_phys_block(phys)?;
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
        if end_abs > MAX_FILE_LEN {
            return Err(Error::InvalidArgument("write would exceed ProDOS max file length".into()));
        }
        let start_index = (self.cursor / BLOCK_SIZE as u64) as usize;
        let last_index = ((end_abs - 1) / BLOCK_SIZE as u64) as usize;
        // Fail-fast upper bound: every touched block plus at most two
        // promotion blocks (index + master), before any sector is touched.
        self.alloc.borrow().ensure_space(last_index - start_index + 1 + 2)?;

        let mut remaining = buf;
        let mut written = 0usize;
        while !remaining.is_empty() {
            let abs = self.cursor;
            let block_index = (abs / BLOCK_SIZE as u64) as usize;
            let byte_off = (abs % BLOCK_SIZE as u64) as usize;
            let take = remaining.len().min(BLOCK_SIZE - byte_off);
            let chunk = &remaining[..take];
            let is_full_zero_block = byte_off == 0 && take == BLOCK_SIZE && is_all_zero(chunk);
            let already_allocated = self.existing_pointer(block_index)?.is_some();
            if is_full_zero_block && block_index > 0 && !already_allocated {
                // Sparse hole: leave the pointer at zero rather than
                // allocating a block to hold nothing but zero bytes.
            } else {
                let block = self.ensure_data_block(block_index)?;
                let mut sector = self.read_phys_block(block)?;
                sector[byte_off..byte_off + take].copy_from_slice(chunk);
                self.write_phys_block(block, &sector)?;
            }
            self.cursor += take as u64;
            written += take;
            remaining = &remaining[take..];
        }
        self.data_length = self.data_length.max(self.cursor);
        self.dirty = true;
        Ok(written)
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
        if len > MAX_FILE_LEN {
            return Err(Error::InvalidArgument("length exceeds ProDOS max file length".into()));
        }
        if len < self.data_length {
            self.truncate_to(len)?;
        }
        self.data_length = len;
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

/// Recognizes a ProDOS/SOS image by its block-2 volume directory header
/// (spec.md §4.7).
pub struct ProDosProber;

impl crate::prober::Prober for ProDosProber {
    fn test_image(&self, source: &dyn ChunkSource) -> crate::prober::Confidence {
        use crate::prober::Confidence;

        let total_blocks = source.formatted_length() as usize / BLOCK_SIZE;
        if total_blocks <= VOLUME_HEADER_BLOCK {
            return Confidence::No;
        }
        let mut header = [0u8; BLOCK_SIZE];
        if source.read_block(VOLUME_HEADER_BLOCK, &mut header, 0).is_err() {
            return Confidence::No;
        }

        let storage_type = header[4] >> 4;
        if StorageType::from_nibble(storage_type) != StorageType::VolumeHeader {
            return Confidence::No;
        }
        let name_length = (header[4] & 0x0F) as usize;
        if name_length == 0 || name_length > 15 {
            return Confidence::No;
        }
        let first_char = header[5];
        if !(b'A'..=b'Z').contains(&first_char) {
            return Confidence::Barely;
        }
        let entry_length = header[0x1F] as usize;
        let entries_per_block = header[0x20] as usize;
        if entry_length == 0 || entries_per_block == 0 || entry_length * entries_per_block > 508 {
            return Confidence::Barely;
        }
        let reported_blocks = read_u16_le(&header, 0x29) as usize;
        if reported_blocks != 0 && reported_blocks == total_blocks {
            Confidence::Yes
        } else {
            Confidence::Good
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

    #[test]
    fn format_then_scan_yields_named_root() {
        let mut fs = ProDosFilesystem::new(blank_image(280)).unwrap();
        fs.format("TEST.DISK", 0, false).unwrap();
        fs.prepare_file_access(true).unwrap();
        assert!(crate::filesystem::Filesystem::root(&fs).is_ok());
        assert!(!fs.is_dubious());
        assert!(fs.free_space() > 0);
    }

    #[test]
    fn delete_file_releases_scanned_storage_blocks() {
        use crate::filesystem::Filesystem as _;

        let mut fs = ProDosFilesystem::new(blank_image(280)).unwrap();
        fs.format("TEST.DISK", 0, false).unwrap();

        let key_block = 20usize;
        let mut header_block = fs.read_block(VOLUME_HEADER_BLOCK).unwrap();
        let offset = 4 + ENTRY_LENGTH;
        header_block[offset] = (StorageType::Seedling.to_nibble() << 4) | 1;
        header_block[offset + 1] = b'A';
        header_block[offset + 0x10] = 0x06;
        write_u16_le(&mut header_block, offset + 0x11, key_block as u16);
        write_u16_le(&mut header_block, offset + 0x13, 1);
        write_u24_le(&mut header_block, offset + 0x15, 5);
        header_block[offset + 0x1E] = 0xC3;
        fs.write_block(VOLUME_HEADER_BLOCK, &header_block).unwrap();

        fs.prepare_file_access(true).unwrap();
        assert!(fs.alloc.borrow().is_used(key_block));
        let free_before = fs.free_space();

        let root = fs.root().unwrap();
        let children = fs.children(root).unwrap();
        assert_eq!(children.len(), 1);
        fs.delete_file(children[0]).unwrap();

        assert!(!fs.alloc.borrow().is_used(key_block));
        assert_eq!(fs.free_space(), free_before + BLOCK_SIZE as i64);
    }

    #[test]
    fn storage_type_round_trips() {
        assert_eq!(StorageType::from_nibble(StorageType::Tree.to_nibble()), StorageType::Tree);
        assert_eq!(StorageType::from_nibble(StorageType::VolumeHeader.to_nibble()), StorageType::VolumeHeader);
    }

    #[test]
    fn prober_recognizes_formatted_volume() {
        use crate::prober::{Confidence, Prober};

        let mut fs = ProDosFilesystem::new(blank_image(280)).unwrap();
        fs.format("TEST.DISK", 0, false).unwrap();
        let confidence = ProDosProber.test_image(&*fs.chunk_source());
        assert!(confidence >= Confidence::Good);
    }

    #[test]
    fn prober_rejects_blank_image() {
        use crate::prober::Prober;

        let confidence = ProDosProber.test_image(&blank_image(280));
        assert_eq!(confidence, crate::prober::Confidence::No);
    }

    /// Writes past the first block (forcing Seedling→Sapling promotion) on a
    /// hand-built directory entry, then rescans and reads the bytes back
    /// (spec.md §8's open→write→close→open→read_all round trip, and the
    /// ProDOS sparse-first-block scenario: block 0 is always materialized,
    /// an untouched later block stays a hole).
    #[test]
    fn write_then_rescan_promotes_to_sapling_and_round_trips() {
        let mut fs = ProDosFilesystem::new(blank_image(320)).unwrap();
        fs.format("TEST.DISK", 0, false).unwrap();

        let key_block = 40usize;
        let mut header_block = fs.read_block(VOLUME_HEADER_BLOCK).unwrap();
        let offset = 4 + ENTRY_LENGTH;
        header_block[offset] = (StorageType::Seedling.to_nibble() << 4) | 1;
        header_block[offset + 1] = b'A';
        header_block[offset + 0x10] = 0x06;
        write_u16_le(&mut header_block, offset + 0x11, key_block as u16);
        write_u16_le(&mut header_block, offset + 0x13, 1);
        write_u24_le(&mut header_block, offset + 0x15, 10);
        header_block[offset + 0x1E] = 0xC3;
        fs.write_block(VOLUME_HEADER_BLOCK, &header_block).unwrap();
        fs.write_block(key_block, &[0u8; BLOCK_SIZE]).unwrap();

        fs.prepare_file_access(true).unwrap();
        let root = fs.root().unwrap();
        let children = fs.children(root).unwrap();
        let handle = children[0];

        let mut stream = fs.open_file(handle, OpenMode::ReadWrite, ForkPart::DataFork).unwrap();
        stream.seek(SeekFrom::Begin(700)).unwrap();
        stream.write(&[0xAB]).unwrap();
        stream.close().unwrap();
        drop(stream);
        fs.open.close(handle, ForkPart::DataFork, OpenMode::ReadWrite);

        fs.prepare_raw_access().unwrap();
        fs.prepare_file_access(true).unwrap();
        let root = fs.root().unwrap();
        let children = fs.children(root).unwrap();
        let refreshed = fs.entry(children[0]).unwrap();
        assert_eq!(refreshed.data_length, 701);

        let mut stream = fs.open_file(children[0], OpenMode::ReadOnly, ForkPart::DataFork).unwrap();
        let mut all = vec![0u8; 701];
        let n = stream.read(&mut all).unwrap();
        assert_eq!(n, 701);
        assert_eq!(all[700], 0xAB);
        assert!(all[..700].iter().all(|&b| b == 0));
    }
}
