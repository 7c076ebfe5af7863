//! DOS 3.2/3.3 driver (spec.md §3/§4.3 "DOS 3.3").
//!
//! Track 17 holds the VTOC (sector 0) followed by the catalog (a linked
//! chain of sectors, 7 entries of 35 bytes each). A file's directory entry
//! points at the head of a track/sector list; each T/S list sector holds up
//! to 122 `(track, sector)` pairs plus a link to the next T/S list sector.

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

pub const SECTOR_SIZE: usize = 256;
pub const DEFAULT_SECTORS_PER_TRACK: usize = 16;
pub const DEFAULT_TRACKS: usize = 35;
pub const VTOC_TRACK: usize = 17;
pub const ENTRIES_PER_CATALOG_SECTOR: usize = 7;
pub const CATALOG_ENTRY_SIZE: usize = 35;
pub const TS_LIST_MAX_PAIRS: usize = 122;
pub const TS_LIST_FIRST_PAIR_OFFSET: usize = 0x0C;
pub const DELETED_TRACK_MARKER: u8 = 0xFF;

/// DOS 3.3 file-type bits (the low nibble of the catalog entry's type byte);
/// bit 7 of that byte is the lock flag, handled separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Text,
    IntegerBasic,
    ApplesoftBasic,
    Binary,
    SType,
    Relocatable,
    ANewType,
    BNewType,
}

impl FileKind {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x7F {
            0x00 => Self::Text,
            0x01 => Self::IntegerBasic,
            0x02 => Self::ApplesoftBasic,
            0x04 => Self::Binary,
            0x08 => Self::SType,
            0x10 => Self::Relocatable,
            0x20 => Self::ANewType,
            0x40 => Self::BNewType,
            _ => Self::Binary,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            Self::Text => 0x00,
            Self::IntegerBasic => 0x01,
            Self::ApplesoftBasic => 0x02,
            Self::Binary => 0x04,
            Self::SType => 0x08,
            Self::Relocatable => 0x10,
            Self::ANewType => 0x20,
            Self::BNewType => 0x40,
        }
    }

    fn letter(self) -> char {
        match self {
            Self::Text => 'T',
            Self::IntegerBasic => 'I',
            Self::ApplesoftBasic => 'A',
            Self::Binary => 'B',
            Self::SType => 'S',
            Self::Relocatable => 'R',
            Self::ANewType => 'a',
            Self::BNewType => 'b',
        }
    }

    /// Bytes a stream's logical offset 0 is shifted past within the first
    /// data sector: Basic's 2-byte length prefix, Binary's 4-byte
    /// address+length header, or nothing for everything else.
    fn header_len(self) -> u64 {
        match self {
            Self::ApplesoftBasic | Self::IntegerBasic => 2,
            Self::Binary => 4,
            _ => 0,
        }
    }
}

/// Native per-entry metadata for a DOS 3.3 catalog entry.
#[derive(Debug, Clone, Default)]
pub struct NativeEntry {
    pub catalog_track: u8,
    pub catalog_sector: u8,
    pub catalog_index: usize,
    pub tslist_track: u8,
    pub tslist_sector: u8,
    pub type_bits: u8,
    pub locked: bool,
    pub sector_count: u16,
}

fn decode_filename(raw: &[u8; 30]) -> (Vec<u8>, String) {
    let raw_bytes: Vec<u8> = raw.iter().map(|b| b & 0x7F).collect();
    let mut end = 30;
    while end > 0 && raw_bytes[end - 1] == b' ' {
        end -= 1;
    }
    let cooked = raw_bytes[..end]
        .iter()
        .map(|&b| cook_byte(b))
        .collect::<String>();
    (raw[..end].to_vec(), cooked)
}

fn cook_byte(b: u8) -> char {
    match b {
        0x00..=0x1F => char::from_u32(0x2400 + b as u32).unwrap_or('?'),
        0x7F => '\u{2421}',
        _ => b as char,
    }
}

fn encode_filename(name: &str) -> [u8; 30] {
    let mut out = [0xA0u8; 30]; // high-bit-set spaces
    for (i, b) in name.bytes().take(30).enumerate() {
        out[i] = b | 0x80;
    }
    out
}

/// DOS 3.3 filesystem driver over a `ChunkSource`.
pub struct Dos33Filesystem<S: ChunkSource> {
    chunk: Rc<RefCell<GatedChunk<S>>>,
    mode: Mode,
    notes: Notes,
    arena: FileEntryArena,
    usage: Rc<RefCell<VolumeUsage>>,
    alloc: Rc<RefCell<AllocMap>>,
    root: Option<FileRef>,
    tracks: usize,
    sectors_per_track: usize,
    volume_number: u8,
    catalog_track: usize,
    catalog_sector: usize,
    /// Scanner policy (spec.md §4.3): stop at the first unused catalog slot
    /// unless exhaustive scanning is requested. Defaults on, because garbage
    /// past the "real" end of the catalog is common on real media.
    exhaustive_scan: bool,
    open: OpenTracker,
    is_dubious: bool,
}

impl<S: ChunkSource> Dos33Filesystem<S> {
    pub fn new(source: S) -> Result<Self> {
        let len = source.formatted_length() as usize;
        let sectors_per_track = DEFAULT_SECTORS_PER_TRACK;
        let tracks = len / (sectors_per_track * SECTOR_SIZE);
        if tracks == 0 || len % (sectors_per_track * SECTOR_SIZE) != 0 {
            return Err(Error::UnsupportedGeometry(
                "image length is not a multiple of a 16-sector track".into(),
            ));
        }
        Ok(Self {
            chunk: Rc::new(RefCell::new(GatedChunk::new(source))),
            mode: Mode::Raw,
            notes: Notes::new(),
            arena: FileEntryArena::new(),
            usage: Rc::new(RefCell::new(VolumeUsage::new(tracks * sectors_per_track))),
            alloc: Rc::new(RefCell::new(AllocMap::new(
                tracks * sectors_per_track,
                tracks * sectors_per_track,
            ))),
            root: None,
            tracks,
            sectors_per_track,
            volume_number: 254,
            catalog_track: VTOC_TRACK,
            catalog_sector: 15,
            exhaustive_scan: true,
            open: OpenTracker::new(),
            is_dubious: false,
        })
    }

    /// The underlying image, for callers that want to probe or persist it
    /// without going through `dispose`.
    pub fn chunk_source(&self) -> Ref<'_, S> {
        Ref::map(self.chunk.borrow(), |c| c.source())
    }

    fn block_index(&self, track: usize, sector: usize) -> usize {
        track * self.sectors_per_track + sector
    }

    fn read_sector(&self, track: usize, sector: usize) -> Result<[u8; SECTOR_SIZE]> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.chunk.borrow().read_sector(track, sector, &mut buf, 0)?;
        Ok(buf)
    }

    fn write_sector(&self, track: usize, sector: usize, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.chunk
            .borrow_mut()
            .write_sector_mediated(track, sector, buf, 0)
    }

    fn read_vtoc_bitmap(&self, vtoc: &[u8; SECTOR_SIZE]) -> Vec<bool> {
        // 1 = free, 0 = used in the on-disk encoding; we return used = !free.
        let mut used = vec![true; self.tracks * self.sectors_per_track];
        for track in 0..self.tracks.min(50) {
            let base = 0x38 + track * 4;
            if base + 4 > SECTOR_SIZE {
                break;
            }
            let bytes = &vtoc[base..base + 4];
            // Bytes [3] covers sectors 0-7, [2] covers sectors 8-15.
            for sector in 0..self.sectors_per_track.min(16) {
                let byte = if sector < 8 { bytes[3] } else { bytes[2] };
                let bit = sector % 8;
                let free = (byte >> bit) & 1 == 1;
                used[self.block_index(track, sector)] = !free;
            }
        }
        used
    }

    fn write_vtoc_bitmap(&self, vtoc: &mut [u8; SECTOR_SIZE]) {
        let alloc = self.alloc.borrow();
        for track in 0..self.tracks.min(50) {
            let base = 0x38 + track * 4;
            if base + 4 > SECTOR_SIZE {
                break;
            }
            let mut low = 0u8;
            let mut high = 0u8;
            for sector in 0..self.sectors_per_track.min(16) {
                let used = alloc.is_used(self.block_index(track, sector));
                let bit = sector % 8;
                if !used {
                    if sector < 8 {
                        low |= 1 << bit;
                    } else {
                        high |= 1 << bit;
                    }
                }
            }
            vtoc[base + 3] = low;
            vtoc[base + 2] = high;
        }
    }

    fn scan_catalog_entry(&self, buf: &[u8], offset: usize) -> Option<NativeEntry> {
        let track = buf[offset];
        if track == 0x00 && buf[offset + 1] == 0x00 {
            return None; // never-used slot
        }
        let deleted = track == DELETED_TRACK_MARKER;
        let mut name = [0u8; 30];
        name.copy_from_slice(&buf[offset + 3..offset + 33]);
        let type_byte = buf[offset + 2];
        let sector_count = u16::from_le_bytes([buf[offset + 33], buf[offset + 34]]);
        Some(NativeEntry {
            catalog_track: if deleted { buf[offset + 1] } else { track },
            catalog_sector: buf[offset + 1],
            catalog_index: 0,
            tslist_track: if deleted { 0 } else { track },
            tslist_sector: buf[offset + 1],
            type_bits: type_byte & 0x7F,
            locked: type_byte & 0x80 != 0,
            sector_count,
        })
    }

    /// Reads every `(track, sector)` pair referenced by a file's T/S list
    /// chain, bounding the walk against circular lists (spec.md §4.3).
    /// Returns the data-sector pairs together with the T/S-list sectors
    /// themselves (the latter are owned by the file but hold no data).
    fn read_ts_chain(&self, head_track: u8, head_sector: u8) -> Result<(Vec<(u8, u8)>, Vec<(u8, u8)>)> {
        let mut pairs = Vec::new();
        let mut ts_sectors = Vec::new();
        let mut visited = std::collections::HashSet::new();
        let mut cur = (head_track, head_sector);
        let limit = self.tracks * self.sectors_per_track + 16;
        for _ in 0..limit {
            if cur == (0, 0) || !visited.insert(cur) {
                break;
            }
            let sector = self.read_sector(cur.0 as usize, cur.1 as usize)?;
            ts_sectors.push(cur);
            let next = (sector[1], sector[2]);
            for chunk in sector[TS_LIST_FIRST_PAIR_OFFSET..].chunks_exact(2).take(TS_LIST_MAX_PAIRS) {
                if chunk[0] != 0 || chunk[1] != 0 {
                    pairs.push((chunk[0], chunk[1]));
                }
            }
            cur = next;
        }
        Ok((pairs, ts_sectors))
    }

    fn compute_length(&self, kind: FileKind, first: &[u8; SECTOR_SIZE], data_sectors: usize) -> (u64, u32) {
        match kind {
            FileKind::ApplesoftBasic | FileKind::IntegerBasic => {
                let len = u16::from_le_bytes([first[0], first[1]]) as u64;
                (len, 0)
            }
            FileKind::Binary => {
                let addr = u16::from_le_bytes([first[0], first[1]]) as u32;
                let len = u16::from_le_bytes([first[2], first[3]]) as u64;
                (len, addr)
            }
            FileKind::Text => {
                let max = data_sectors * SECTOR_SIZE;
                let len = first
                    .iter()
                    .position(|&b| b == 0)
                    .map(|p| p as u64)
                    .unwrap_or(max as u64);
                (len, 0)
            }
            _ => (data_sectors as u64 * SECTOR_SIZE as u64, 0),
        }
    }

    fn scan_volume(&mut self) -> Result<()> {
        self.chunk.borrow_mut().set_level(AccessLevel::Open);
        let vtoc = self.read_sector(VTOC_TRACK, 0)?;
        self.catalog_track = vtoc[1] as usize;
        self.catalog_sector = vtoc[2] as usize;
        self.volume_number = vtoc[6];
        let tracks = vtoc[0x34] as usize;
        let sectors_per_track = vtoc[0x35] as usize;
        if tracks != 0 && tracks != self.tracks {
            self.notes.warning(format!(
                "VTOC reports {tracks} tracks, image holds {}",
                self.tracks
            ));
        }
        if sectors_per_track != 0 && sectors_per_track != self.sectors_per_track {
            self.notes.warning(format!(
                "VTOC reports {sectors_per_track} sectors/track, image holds {}",
                self.sectors_per_track
            ));
        }

        *self.usage.borrow_mut() = VolumeUsage::new(self.tracks * self.sectors_per_track);
        *self.alloc.borrow_mut() = AllocMap::new(
            self.tracks * self.sectors_per_track,
            self.tracks * self.sectors_per_track,
        );
        for sector in 0..self.sectors_per_track {
            let block = self.block_index(0, sector);
            self.alloc
                .borrow_mut()
                .mark_by_scan(block, Owner::System, &mut self.usage.borrow_mut());
        }
        let native_used = self.read_vtoc_bitmap(&vtoc);
        self.alloc.borrow_mut().mark_by_scan(
            self.block_index(VTOC_TRACK, 0),
            Owner::System,
            &mut self.usage.borrow_mut(),
        );

        self.arena = FileEntryArena::new();
        let root = self.arena.insert(FileEntry {
            filename_raw: b"/".to_vec(),
            filename_cooked: "/".to_string(),
            file_type: 0,
            aux_type: 0,
            access_flags: 0,
            create_time: None,
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
            native: NativeMetadata::Dos33(NativeEntry::default()),
        });
        self.root = Some(root);

        let mut cat_track = self.catalog_track;
        let mut cat_sector = self.catalog_sector;
        let mut visited = std::collections::HashSet::new();
        let mut stop = false;
        for _ in 0..self.sectors_per_track + 1 {
            if cat_track == 0 && cat_sector == 0 {
                break;
            }
            if !visited.insert((cat_track, cat_sector)) {
                self.notes.error("circular catalog chain detected".to_string());
                self.is_dubious = true;
                break;
            }
            let sector = self.read_sector(cat_track, cat_sector)?;
            self.alloc.borrow_mut().mark_by_scan(
                self.block_index(cat_track, cat_sector),
                Owner::System,
                &mut self.usage.borrow_mut(),
            );
            let next_track = sector[1];
            let next_sector = sector[2];
            for i in 0..ENTRIES_PER_CATALOG_SECTOR {
                let offset = 0x0B + i * CATALOG_ENTRY_SIZE;
                let Some(mut native) = self.scan_catalog_entry(&sector, offset) else {
                    if !self.exhaustive_scan {
                        stop = true;
                        break;
                    }
                    continue;
                };
                if native.catalog_track == DELETED_TRACK_MARKER {
                    continue;
                }
                native.catalog_track = cat_track as u8;
                native.catalog_sector = cat_sector as u8;
                native.catalog_index = i;
                let name_bytes: [u8; 30] = sector[offset + 3..offset + 33].try_into().unwrap();
                let (filename_raw, filename_cooked) = decode_filename(&name_bytes);
                let kind = FileKind::from_bits(native.type_bits);

                let (pairs, ts_sectors) = self.read_ts_chain(native.tslist_track, native.tslist_sector)?;

                let (data_length, aux_type) = if let Some(&(t, s)) = pairs.first() {
                    let first = self.read_sector(t as usize, s as usize)?;
                    self.compute_length(kind, &first, pairs.len())
                } else {
                    (0, 0)
                };

                let entry = FileEntry {
                    filename_raw,
                    filename_cooked,
                    file_type: kind.letter() as u16,
                    aux_type,
                    access_flags: if native.locked { 0x80 } else { 0x00 },
                    create_time: None,
                    modify_time: None,
                    data_length,
                    rsrc_length: 0,
                    storage_size: native.sector_count as u64 * SECTOR_SIZE as u64,
                    parent: self.root,
                    children: Vec::new(),
                    is_directory: false,
                    has_rsrc_fork: false,
                    is_dubious: false,
                    is_damaged: false,
                    native: NativeMetadata::Dos33(native),
                };
                let handle = self.arena.insert(entry);
                for &(t, s) in pairs.iter().chain(ts_sectors.iter()) {
                    let block = self.block_index(t as usize, s as usize);
                    self.alloc
                        .borrow_mut()
                        .mark_by_scan(block, Owner::File(handle), &mut self.usage.borrow_mut());
                }
                if let Some(root) = self.root {
                    if let Some(root_entry) = self.arena.get_mut(root) {
                        root_entry.children.push(handle);
                    }
                }
            }
            if stop {
                break;
            }
            cat_track = next_track as usize;
            cat_sector = next_sector as usize;
        }

        // Reconcile the on-disk bitmap against what the catalog walk actually
        // claimed: every bit the bitmap marks used is recorded as natively
        // used regardless of ownership, but a bit not already claimed by a
        // file or a known system region is only a leak (owner=System),
        // never a conflict, since nothing else claims it.
        for (block, used) in native_used.iter().enumerate() {
            if *used {
                self.usage.borrow_mut().mark_natively_used(block);
                if !self.alloc.borrow().is_used(block) {
                    self.alloc
                        .borrow_mut()
                        .mark_by_scan(block, Owner::System, &mut self.usage.borrow_mut());
                }
            }
        }

        let analysis = self.usage.borrow().analyze();
        if analysis.not_marked_used > 0 {
            self.notes.error(format!(
                "{} blocks referenced by files are not marked used in the VTOC bitmap",
                analysis.not_marked_used
            ));
            self.is_dubious = true;
        }
        if analysis.unused_marked > 0 {
            self.notes.warning(format!(
                "{} blocks marked used in the VTOC bitmap are unreferenced (leak)",
                analysis.unused_marked
            ));
        }
        Ok(())
    }
}

impl<S: ChunkSource> crate::filesystem::Filesystem for Dos33Filesystem<S> {
    fn characteristics(&self) -> Characteristics {
        Characteristics {
            name: "DOS 3.3",
            can_write: !self.chunk.borrow().source().is_read_only(),
            is_hierarchical: false,
            dir_separator: None,
            has_resource_forks: false,
            filename_syntax: "30 high-ASCII characters, spaces trimmed",
            volume_name_syntax: "none (volume number 1-254)",
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
        (self.alloc.borrow().free_count() * SECTOR_SIZE) as i64
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
        self.chunk.borrow_mut().set_level(AccessLevel::Open);
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
        let mut vtoc = self.read_sector(VTOC_TRACK, 0)?;
        self.write_vtoc_bitmap(&mut vtoc);
        vtoc[6] = self.volume_number;
        self.write_sector(VTOC_TRACK, 0, &vtoc)
    }

    fn format(&mut self, _volume_name: &str, volume_number: u8, bootable: bool) -> Result<()> {
        if self.chunk.borrow().source().is_read_only() {
            return Err(Error::InvalidArgument("source is read-only".into()));
        }
        if self.mode == Mode::FileAccess {
            return Err(Error::InvalidArgument("cannot format while in file-access mode".into()));
        }
        self.chunk.borrow_mut().set_level(AccessLevel::Open);
        let zero = [0u8; SECTOR_SIZE];
        for track in 0..self.tracks {
            for sector in 0..self.sectors_per_track {
                self.write_sector(track, sector, &zero)?;
            }
        }
        let mut vtoc = [0u8; SECTOR_SIZE];
        vtoc[1] = VTOC_TRACK as u8;
        vtoc[2] = 15;
        vtoc[3] = 3; // DOS release
        vtoc[6] = volume_number;
        vtoc[0x27] = TS_LIST_MAX_PAIRS as u8;
        vtoc[0x30] = VTOC_TRACK as u8;
        vtoc[0x31] = 0xFF; // allocate downward from track 17
        vtoc[0x34] = self.tracks as u8;
        vtoc[0x35] = self.sectors_per_track as u8;
        vtoc[0x36] = (SECTOR_SIZE & 0xFF) as u8;
        vtoc[0x37] = (SECTOR_SIZE >> 8) as u8;
        // All sectors free except track 0 and the VTOC/catalog track.
        for track in 0..self.tracks.min(50) {
            let base = 0x38 + track * 4;
            if track == 0 || track == VTOC_TRACK {
                continue;
            }
            vtoc[base + 2] = 0xFF;
            vtoc[base + 3] = 0xFF;
        }
        self.write_sector(VTOC_TRACK, 0, &vtoc)?;
        let mut catalog = [0u8; SECTOR_SIZE];
        catalog[1] = 0;
        catalog[2] = 0;
        self.write_sector(VTOC_TRACK, 15, &catalog)?;
        if bootable {
            self.notes.info("bootable formatting requested; boot-track image not supplied by this driver".to_string());
        }
        self.notes.clear();
        self.is_dubious = false;
        self.chunk.borrow_mut().set_level(AccessLevel::Open);
        self.mode = Mode::Raw;
        Ok(())
    }

    fn root(&self) -> Result<FileRef> {
        self.root.ok_or(Error::ObjectDisposed)
    }

    fn children(&self, entry: FileRef) -> Result<Vec<FileRef>> {
        self.arena
            .get(entry)
            .map(|e| e.children.clone())
            .ok_or(Error::ObjectDisposed)
    }

    fn entry(&self, entry: FileRef) -> Result<FileEntry> {
        self.arena.get(entry).cloned().ok_or(Error::ObjectDisposed)
    }

    fn open_file(
        &mut self,
        entry: FileRef,
        mode: OpenMode,
        part: ForkPart,
    ) -> Result<Box<dyn FileStream>> {
        if part != ForkPart::DataFork {
            return Err(Error::NotSupported("DOS 3.3 has no resource fork"));
        }
        let file = self.arena.get(entry).ok_or(Error::ObjectDisposed)?;
        if file.is_damaged {
            return Err(Error::Damaged("catalog entry is damaged".into()));
        }
        let native = match &file.native {
            NativeMetadata::Dos33(n) => n.clone(),
            _ => unreachable!("DOS 3.3 arena only ever holds Dos33 native entries"),
        };
        let data_length = file.data_length;
        self.open.try_open(entry, part, mode)?;

        let kind = FileKind::from_bits(native.type_bits);
        let (pairs, ts_sectors) = self.read_ts_chain(native.tslist_track, native.tslist_sector)?;
        let header_len = kind.header_len();
        let address = if kind == FileKind::Binary {
            if let Some(&(t, s)) = pairs.first() {
                let first = self.read_sector(t as usize, s as usize)?;
                u16::from_le_bytes([first[0], first[1]]) as u32
            } else {
                0
            }
        } else {
            0
        };

        Ok(Box::new(Dos33Descriptor {
            chunk: self.chunk.clone(),
            alloc: self.alloc.clone(),
            usage: self.usage.clone(),
            entry,
            mode,
            kind,
            header_len,
            address,
            cursor: 0,
            data_length,
            pairs,
            ts_sectors,
            catalog_track: native.catalog_track,
            catalog_sector: native.catalog_sector,
            catalog_index: native.catalog_index,
            sectors_per_track: self.sectors_per_track,
            dirty: false,
        }))
    }

    fn create_file(&mut self, _parent: FileRef, _name: &str, _creation_kind: CreationKind) -> Result<FileRef> {
        Err(Error::NotSupported("DOS 3.3 driver supports read-back and open only in this build"))
    }

    fn delete_file(&mut self, entry: FileRef) -> Result<()> {
        if self.open.is_write_locked(entry) {
            return Err(Error::InvalidArgument("file is open for write".into()));
        }
        if let Some(NativeMetadata::Dos33(native)) = self.arena.get(entry).map(|e| e.native.clone()) {
            let (pairs, ts_sectors) = self.read_ts_chain(native.tslist_track, native.tslist_sector)?;
            let mut alloc = self.alloc.borrow_mut();
            for (t, s) in pairs.into_iter().chain(ts_sectors.into_iter()) {
                let block = self.block_index(t as usize, s as usize);
                alloc.release(block);
            }
        }
        self.arena.remove(entry);
        Ok(())
    }

    fn move_file(&mut self, _entry: FileRef, _new_parent: FileRef, _new_name: &str) -> Result<()> {
        Err(Error::NotSupported("DOS 3.3 catalog is flat; move only renames"))
    }

    fn add_rsrc_fork(&mut self, _entry: FileRef) -> Result<()> {
        Err(Error::NotSupported("DOS 3.3 has no resource fork"))
    }

    fn dispose(&mut self) -> Result<()> {
        if self.mode == Mode::Disposed {
            return Ok(());
        }
        if let Err(e) = self.flush() {
            log::warn!("error flushing DOS 3.3 volume during dispose: {e}");
        }
        self.open.close_all();
        self.arena.invalidate();
        self.chunk.borrow_mut().set_level(AccessLevel::Closed);
        self.mode = Mode::Disposed;
        Ok(())
    }
}

/// Open-file cursor over a DOS 3.3 T/S-list chain (spec.md §4.4). Shares the
/// volume's gated chunk and allocation bitmap with the owning
/// `Dos33Filesystem` through `Rc<RefCell<_>>`, since `Filesystem::open_file`
/// returns an owned `Box<dyn FileStream>` with no lifetime tying it back to
/// `&mut self`.
struct Dos33Descriptor<S: ChunkSource> {
    chunk: Rc<RefCell<GatedChunk<S>>>,
    alloc: Rc<RefCell<AllocMap>>,
    usage: Rc<RefCell<VolumeUsage>>,
    entry: FileRef,
    mode: OpenMode,
    kind: FileKind,
    header_len: u64,
    address: u32,
    cursor: u64,
    data_length: u64,
    /// Data-sector `(track, sector)` pairs, in logical order.
    pairs: Vec<(u8, u8)>,
    /// T/S-list sectors themselves, in chain order.
    ts_sectors: Vec<(u8, u8)>,
    catalog_track: u8,
    catalog_sector: u8,
    catalog_index: usize,
    sectors_per_track: usize,
    dirty: bool,
}

impl<S: ChunkSource> Dos33Descriptor<S> {
    fn block_from_index(&self, n: usize) -> (u8, u8) {
        (
            (n / self.sectors_per_track) as u8,
            (n % self.sectors_per_track) as u8,
        )
    }

    fn read_phys_sector(&self, track: u8, sector: u8) -> Result<[u8; SECTOR_SIZE]> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.chunk
            .borrow()
            .read_sector(track as usize, sector as usize, &mut buf, 0)?;
        Ok(buf)
    }

    fn write_phys_sector(&self, track: u8, sector: u8, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.chunk.borrow_mut().write_sector_mediated(
            track as usize,
            sector as usize,
            buf,
            0,
        )
    }

    fn patch_catalog_head(&self, track: u8, sector: u8) -> Result<()> {
        let mut cat = self.read_phys_sector(self.catalog_track, self.catalog_sector)?;
        let offset = 0x0B + self.catalog_index * CATALOG_ENTRY_SIZE;
        cat[offset] = track;
        cat[offset + 1] = sector;
        self.write_phys_sector(self.catalog_track, self.catalog_sector, &cat)
    }

    fn allocate_ts_sector(&mut self, owner: Owner) -> Result<()> {
        let block = self
            .alloc
            .borrow_mut()
            .allocate(owner, &mut self.usage.borrow_mut())?;
        let (t, s) = self.block_from_index(block);
        let zero = [0u8; SECTOR_SIZE];
        self.write_phys_sector(t, s, &zero)?;
        if let Some(&(pt, ps)) = self.ts_sectors.last() {
            let mut prev = self.read_phys_sector(pt, ps)?;
            prev[1] = t;
            prev[2] = s;
            self.write_phys_sector(pt, ps, &prev)?;
        } else {
            self.patch_catalog_head(t, s)?;
        }
        self.ts_sectors.push((t, s));
        Ok(())
    }

    fn write_ts_pair(&self, slot: usize, track: u8, sector: u8) -> Result<()> {
        let ts_index = slot / TS_LIST_MAX_PAIRS;
        let pos = slot % TS_LIST_MAX_PAIRS;
        let (tt, ts) = self.ts_sectors[ts_index];
        let mut buf = self.read_phys_sector(tt, ts)?;
        let off = TS_LIST_FIRST_PAIR_OFFSET + pos * 2;
        buf[off] = track;
        buf[off + 1] = sector;
        self.write_phys_sector(tt, ts, &buf)
    }

    /// Grows the T/S-list chain and the data-sector table so that
    /// `pairs[sector_idx]` is a real, zero-filled allocated sector.
    /// Pre-checks total space via `ensure_space` so a write that would
    /// exhaust the disk fails before any sector is touched (spec.md §4.4).
    fn ensure_sector_allocated(&mut self, sector_idx: usize) -> Result<()> {
        if sector_idx < self.pairs.len() {
            return Ok(());
        }
        let needed_data = sector_idx + 1 - self.pairs.len();
        let mut ts_capacity = self.ts_sectors.len() * TS_LIST_MAX_PAIRS;
        let mut needed_ts = 0usize;
        while ts_capacity <= sector_idx {
            ts_capacity += TS_LIST_MAX_PAIRS;
            needed_ts += 1;
        }
        self.alloc.borrow().ensure_space(needed_data + needed_ts)?;

        let owner = Owner::File(self.entry);
        while self.ts_sectors.len() * TS_LIST_MAX_PAIRS <= sector_idx {
            self.allocate_ts_sector(owner)?;
        }
        while self.pairs.len() <= sector_idx {
            let block = self
                .alloc
                .borrow_mut()
                .allocate(owner, &mut self.usage.borrow_mut())?;
            let (t, s) = self.block_from_index(block);
            let zero = [0u8; SECTOR_SIZE];
            self.write_phys_sector(t, s, &zero)?;
            let slot = self.pairs.len();
            self.pairs.push((t, s));
            self.write_ts_pair(slot, t, s)?;
        }
        Ok(())
    }

    fn write_header(&self) -> Result<()> {
        match self.kind {
            FileKind::ApplesoftBasic | FileKind::IntegerBasic => {
                if let Some(&(t, s)) = self.pairs.first() {
                    let mut first = self.read_phys_sector(t, s)?;
                    first[0..2].copy_from_slice(&(self.data_length as u16).to_le_bytes());
                    self.write_phys_sector(t, s, &first)?;
                }
            }
            FileKind::Binary => {
                if let Some(&(t, s)) = self.pairs.first() {
                    let mut first = self.read_phys_sector(t, s)?;
                    first[0..2].copy_from_slice(&(self.address as u16).to_le_bytes());
                    first[2..4].copy_from_slice(&(self.data_length as u16).to_le_bytes());
                    self.write_phys_sector(t, s, &first)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn persist_catalog(&self) -> Result<()> {
        let mut cat = self.read_phys_sector(self.catalog_track, self.catalog_sector)?;
        let offset = 0x0B + self.catalog_index * CATALOG_ENTRY_SIZE;
        let sector_count = (self.pairs.len() + self.ts_sectors.len()) as u16;
        cat[offset + 33] = (sector_count & 0xFF) as u8;
        cat[offset + 34] = (sector_count >> 8) as u8;
        self.write_phys_sector(self.catalog_track, self.catalog_sector, &cat)
    }
}

impl<S: ChunkSource> FileStream for Dos33Descriptor<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.data_length.saturating_sub(self.cursor);
        let n = (buf.len() as u64).min(remaining) as usize;
        let mut done = 0;
        while done < n {
            let abs = self.header_len + self.cursor;
            let sector_idx = (abs / SECTOR_SIZE as u64) as usize;
            let byte_off = (abs % SECTOR_SIZE as u64) as usize;
            let take = (SECTOR_SIZE - byte_off).min(n - done);
            if let Some(&(t, s)) = self.pairs.get(sector_idx) {
                let sector = self.read_phys_sector(t, s)?;
                buf[done..done + take].copy_from_slice(&sector[byte_off..byte_off + take]);
            } else {
                buf[done..done + take].fill(0);
            }
            self.cursor += take as u64;
            done += take;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.mode != OpenMode::ReadWrite {
            return Err(Error::InvalidArgument("stream opened read-only".into()));
        }
        if !buf.is_empty() {
            let end_abs = self.header_len + self.cursor + buf.len() as u64;
            let last_sector_idx = ((end_abs - 1) / SECTOR_SIZE as u64) as usize;
            self.ensure_sector_allocated(last_sector_idx)?;
        }
        let mut done = 0;
        while done < buf.len() {
            let abs = self.header_len + self.cursor;
            let sector_idx = (abs / SECTOR_SIZE as u64) as usize;
            let byte_off = (abs % SECTOR_SIZE as u64) as usize;
            let take = (SECTOR_SIZE - byte_off).min(buf.len() - done);
            let (t, s) = self.pairs[sector_idx];
            let mut sector = self.read_phys_sector(t, s)?;
            sector[byte_off..byte_off + take].copy_from_slice(&buf[done..done + take]);
            self.write_phys_sector(t, s, &sector)?;
            self.cursor += take as u64;
            done += take;
        }
        self.data_length = self.data_length.max(self.cursor);
        self.dirty = true;
        self.write_header()?;
        Ok(buf.len())
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
        if len > self.data_length {
            let end_abs = self.header_len + len;
            if end_abs > 0 {
                let idx = ((end_abs - 1) / SECTOR_SIZE as u64) as usize;
                self.ensure_sector_allocated(idx)?;
            }
        }
        self.data_length = len;
        self.cursor = self.cursor.min(len);
        self.dirty = true;
        self.write_header()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.write_header()?;
            self.persist_catalog()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// Recognizes a DOS 3.2/3.3 image by its track-17 VTOC (spec.md §4.7).
pub struct Dos33Prober;

impl crate::prober::Prober for Dos33Prober {
    fn test_image(&self, source: &dyn ChunkSource) -> crate::prober::Confidence {
        use crate::prober::Confidence;

        let sectors_per_track = source.sectors_per_track().max(1);
        let total_sectors = source.formatted_length() as usize / SECTOR_SIZE;
        if total_sectors < (VTOC_TRACK + 1) * sectors_per_track {
            return Confidence::No;
        }
        let mut vtoc = [0u8; SECTOR_SIZE];
        if source.read_sector(VTOC_TRACK, 0, &mut vtoc, 0).is_err() {
            return Confidence::No;
        }

        let catalog_track = vtoc[1] as usize;
        let catalog_sector = vtoc[2] as usize;
        let tracks = vtoc[0x34] as usize;
        let reported_sectors = vtoc[0x35] as usize;
        let bytes_per_sector = u16::from_le_bytes([vtoc[0x36], vtoc[0x37]]) as usize;

        if catalog_track == 0 || catalog_track >= tracks.max(1) || catalog_sector >= reported_sectors.max(1)
        {
            return Confidence::No;
        }
        if bytes_per_sector != SECTOR_SIZE {
            return Confidence::No;
        }

        let mut score = Confidence::Maybe;
        if tracks > 0 && tracks * sectors_per_track <= total_sectors {
            score = Confidence::Good;
        }
        if reported_sectors == sectors_per_track && catalog_track == VTOC_TRACK {
            score = Confidence::Yes;
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::MemoryChunkSource;
    use crate::filesystem::Filesystem as _;

    fn blank_image() -> MemoryChunkSource {
        MemoryChunkSource::new(DEFAULT_TRACKS * DEFAULT_SECTORS_PER_TRACK * SECTOR_SIZE)
    }

    #[test]
    fn format_then_scan_yields_empty_root() {
        let mut fs = Dos33Filesystem::new(blank_image()).unwrap();
        fs.format("", 254, false).unwrap();
        fs.prepare_file_access(true).unwrap();
        let root = fs.root;
        assert!(root.is_some());
        assert!(!fs.is_dubious());
    }

    #[test]
    fn filename_cooks_high_bit_ascii() {
        let mut raw = [0xA0u8; 30];
        for (i, b) in b"HELLO".iter().enumerate() {
            raw[i] = b | 0x80;
        }
        let (_bytes, cooked) = decode_filename(&raw);
        assert_eq!(cooked, "HELLO");
    }

    #[test]
    fn binary_length_decodes_address_and_length() {
        let fs = Dos33Filesystem::new(blank_image()).unwrap();
        let mut first = [0u8; SECTOR_SIZE];
        first[0] = 0x00;
        first[1] = 0x08;
        first[2] = 0x06;
        first[3] = 0x00;
        first[4..10].copy_from_slice(b"ABCDEF");
        let (len, addr) = fs.compute_length(FileKind::Binary, &first, 1);
        assert_eq!(len, 6);
        assert_eq!(addr, 0x0800);
    }

    #[test]
    fn prober_recognizes_formatted_volume() {
        use crate::prober::{Confidence, Prober};

        let mut fs = Dos33Filesystem::new(blank_image()).unwrap();
        fs.format("", 254, false).unwrap();
        let confidence = Dos33Prober.test_image(&*fs.chunk_source());
        assert!(confidence >= Confidence::Good);
    }

    #[test]
    fn prober_rejects_blank_image() {
        use crate::prober::Prober;

        let confidence = Dos33Prober.test_image(&blank_image());
        assert_eq!(confidence, crate::prober::Confidence::No);
    }

    /// Builds a minimal hand-crafted image with one Binary file so a write
    /// through a real descriptor (no `create_file` on this driver) can be
    /// exercised end to end: write past EOF, rescan, and confirm both the
    /// data and the catalog's persisted sector count.
    #[test]
    fn write_then_rescan_recovers_extended_binary_file() {
        let mut image = blank_image();
        let mut vtoc = [0u8; SECTOR_SIZE];
        vtoc[1] = VTOC_TRACK as u8;
        vtoc[2] = 15;
        vtoc[0x34] = DEFAULT_TRACKS as u8;
        vtoc[0x35] = DEFAULT_SECTORS_PER_TRACK as u8;
        vtoc[0x36] = (SECTOR_SIZE & 0xFF) as u8;
        vtoc[0x37] = (SECTOR_SIZE >> 8) as u8;
        for track in 0..DEFAULT_TRACKS {
            let base = 0x38 + track * 4;
            if track == 0 || track == VTOC_TRACK {
                continue;
            }
            vtoc[base + 2] = 0xFF;
            vtoc[base + 3] = 0xFF;
        }
        // Track 18 sector 0 is allocated for the T/S list, track 18 sector 1
        // for the one data sector; mark both used in the bitmap.
        vtoc[0x38 + 18 * 4 + 3] &= !0x01;
        vtoc[0x38 + 18 * 4 + 3] &= !0x02;
        image.write_sector(VTOC_TRACK, 0, &vtoc, 0).unwrap();

        let mut catalog = [0u8; SECTOR_SIZE];
        catalog[1] = 0;
        catalog[2] = 0;
        let entry_off = 0x0B;
        catalog[entry_off] = 18; // ts list track
        catalog[entry_off + 1] = 0; // ts list sector
        catalog[entry_off + 2] = FileKind::Binary.to_bits();
        catalog[entry_off + 3..entry_off + 33].copy_from_slice(&encode_filename("TEST"));
        catalog[entry_off + 33] = 2;
        image.write_sector(VTOC_TRACK, 15, &catalog, 0).unwrap();

        let mut ts_list = [0u8; SECTOR_SIZE];
        ts_list[TS_LIST_FIRST_PAIR_OFFSET] = 18;
        ts_list[TS_LIST_FIRST_PAIR_OFFSET + 1] = 1;
        image.write_sector(18, 0, &ts_list, 0).unwrap();

        let mut first = [0u8; SECTOR_SIZE];
        first[0] = 0x00;
        first[1] = 0x08;
        first[2] = 0x00;
        first[3] = 0x00;
        image.write_sector(18, 1, &first, 0).unwrap();

        let mut fs = Dos33Filesystem::new(image).unwrap();
        fs.prepare_file_access(true).unwrap();
        let root = fs.root().unwrap();
        let children = fs.children(root).unwrap();
        assert_eq!(children.len(), 1);
        let handle = children[0];

        {
            let mut stream = fs.open_file(handle, OpenMode::ReadWrite, ForkPart::DataFork).unwrap();
            stream.seek(SeekFrom::Begin(600)).unwrap();
            stream.write(&[0x41]).unwrap();
            stream.close().unwrap();
        }
        fs.open.close(handle, ForkPart::DataFork, OpenMode::ReadWrite);

        fs.prepare_raw_access().unwrap();
        fs.prepare_file_access(true).unwrap();
        let root = fs.root().unwrap();
        let children = fs.children(root).unwrap();
        assert_eq!(children.len(), 1);
        let handle = children[0];
        let refreshed = fs.entry(handle).unwrap();
        assert_eq!(refreshed.data_length, 601);

        let mut stream = fs.open_file(handle, OpenMode::ReadOnly, ForkPart::DataFork).unwrap();
        let mut all = vec![0u8; 601];
        let mut read_total = 0;
        while read_total < all.len() {
            let n = stream.read(&mut all[read_total..]).unwrap();
            if n == 0 {
                break;
            }
            read_total += n;
        }
        assert_eq!(read_total, 601);
        assert!(all[..600].iter().all(|&b| b == 0));
        assert_eq!(all[600], 0x41);
    }
}
