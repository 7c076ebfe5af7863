#![forbid(unsafe_code)]
//! On-disk structures for HFS (Plus), as described in Apple Technote TN1150.
//!
//! All multi-byte fields are big-endian, matching the original 68k/PowerPC
//! byte order. Structures derive [`deku`]'s `DekuRead`/`DekuWrite` so they can
//! be parsed directly out of a 512-byte block buffer and re-serialized when a
//! driver needs to flush a modified header, B*-tree node, or catalog record.

use deku::prelude::*;

/// Number of seconds since January 1, 1904, GMT.
///
/// Described in TN1150 [HFS Plus Dates](https://developer.apple.com/library/archive/technotes/tn/tn1150.html#HFSPlusDates).
pub type HfsDate = u32;

/// Catalog Node ID, a stable 32-bit identity for a file or folder.
///
/// Described in TN1150 [Catalog File](https://developer.apple.com/library/archive/technotes/tn/tn1150.html#CatalogFile).
pub type CatalogNodeId = u32;

/// Well-known CNIDs reserved by the format.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialCnid {
    RootParent = 1,
    RootFolder = 2,
    ExtentsFile = 3,
    CatalogFile = 4,
    BadBlockFile = 5,
    AllocationFile = 6,
    StartupFile = 7,
    AttributesFile = 8,
    RepairCatalogFile = 14,
    BogusExtentFile = 15,
    FirstUserCatalogNode = 16,
}

/// Volume signature stored at the start of the volume header.
pub const VOLUME_SIGNATURE_HFS_PLUS: u16 = 0x482B; // "H+"
pub const VOLUME_SIGNATURE_HFSX: u16 = 0x4858; // "HX"

/// Identifies the start and length, in allocation blocks, of an extent.
///
/// Described in TN1150 [Fork Data Structure](https://developer.apple.com/library/archive/technotes/tn/tn1150.html#ForkDataStructure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl ExtentDescriptor {
    pub const SIZE: usize = 8;

    pub fn is_unused(&self) -> bool {
        self.start_block == 0 && self.block_count == 0
    }
}

/// First eight extent descriptors of a fork; remaining extents live in the
/// extents overflow file.
pub type ExtentRecord = [ExtentDescriptor; 8];

/// Size and location of a fork (data or resource).
///
/// Described in TN1150 [Fork Data Structure](https://developer.apple.com/library/archive/technotes/tn/tn1150.html#ForkDataStructure).
#[derive(Debug, Clone, Copy, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: ExtentRecord,
}

impl ForkData {
    pub const SIZE: usize = 8 + 4 + 4 + 8 * ExtentDescriptor::SIZE;
}

/// Volume Header, stored 1024 bytes from the start of the volume, and
/// mirrored 512 bytes from the end.
///
/// Described in TN1150 [Volume Header](https://developer.apple.com/library/archive/technotes/tn/tn1150.html#VolumeHeader).
#[derive(Debug, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct VolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,

    pub create_date: HfsDate,
    pub modify_date: HfsDate,
    pub backup_date: HfsDate,
    pub checked_date: HfsDate,

    pub file_count: u32,
    pub folder_count: u32,

    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,

    pub next_allocation: u32,
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    pub next_catalog_id: CatalogNodeId,

    pub write_count: u32,
    pub encodings_bitmap: u64,

    pub finder_info: [u32; 8],

    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
}

impl VolumeHeader {
    pub const SIZE: usize = 512;
    pub const OFFSET: u64 = 1024;

    pub fn is_signature_valid(&self) -> bool {
        matches!(self.signature, VOLUME_SIGNATURE_HFS_PLUS | VOLUME_SIGNATURE_HFSX)
    }
}

/// Known volume attribute bits. Unknown bits must be zero.
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum VolumeAttributeBit {
    HardwareLock = 7,
    Unmounted = 8,
    SparedBlocks = 9,
    NoCacheRequired = 10,
    BootVolumeInconsistent = 11,
    CatalogNodeIdsReused = 12,
    Journaled = 13,
    SoftwareLock = 15,
}

/// Owner/group permissions and type-specific info for a catalog record.
///
/// Described in TN1150 [HFS Plus Permissions](https://developer.apple.com/library/archive/technotes/tn/tn1150.html#HFSPlusPermissions).
#[derive(Debug, Clone, Copy, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct BsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    /// Hard-link reference count, indirect-node link count, or raw device
    /// number depending on context. Represented as a plain field (rather
    /// than TN1150's C union) to avoid unsafe code.
    pub special: u32,
}

impl BsdInfo {
    pub const SIZE: usize = 16;
}

/// B*-tree node descriptor, the 14-byte header at the start of every node.
#[derive(Debug, Clone, Copy, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct BtNodeDescriptor {
    pub forward_link: u32,
    pub backward_link: u32,
    pub kind: i8,
    pub height: u8,
    pub num_records: u16,
    pub reserved: u16,
}

impl BtNodeDescriptor {
    pub const SIZE: usize = 14;
}

#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtNodeKind {
    Leaf = -1,
    Index = 0,
    Header = 1,
    Map = 2,
}

impl BtNodeKind {
    pub fn from_raw(kind: i8) -> Option<Self> {
        match kind {
            -1 => Some(Self::Leaf),
            0 => Some(Self::Index),
            1 => Some(Self::Header),
            2 => Some(Self::Map),
            _ => None,
        }
    }
}

/// Header record, the fixed-size statistics block at the start of node 0.
#[derive(Debug, Clone, Copy, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct BtHeaderRecord {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub reserved1: u16,
    pub clump_size: u32,
    pub btree_type: u8,
    pub key_compare_type: u8,
    pub attributes: u32,
    pub reserved3: [u32; 16],
}

impl BtHeaderRecord {
    pub const SIZE: usize = 106;
}

/// 128 reserved bytes following the header record.
pub const BT_USER_DATA_SIZE: usize = 128;

#[repr(u32)]
pub enum BtHeaderAttribute {
    BadCloseMask = 0x0000_0001,
    BigKeysMask = 0x0000_0002,
    VariableIndexKeysMask = 0x0000_0004,
}

pub const HFS_PLUS_CATALOG_MIN_NODE_SIZE: u32 = 4096;
pub const HFS_PLUS_ATTR_MIN_NODE_SIZE: u32 = 4096;

/// Catalog record types, stored as the first two bytes of a catalog leaf
/// record's data.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big", type = "u16")]
pub enum CatalogRecordKind {
    #[deku(id = "0x0001")]
    Folder,
    #[deku(id = "0x0002")]
    File,
    #[deku(id = "0x0003")]
    FolderThread,
    #[deku(id = "0x0004")]
    FileThread,
}

/// Folder (directory) flags, as used in [`CatalogFolder::flags`].
#[repr(u16)]
pub enum CatalogFolderFlag {
    IsMountPoint = 0x0001,
    HasAttributes = 0x0004,
    Locked = 0x2000,
    HasThread = 0x4000,
}

/// File flags, as used in [`CatalogFile::flags`].
#[repr(u16)]
pub enum CatalogFileFlag {
    Locked = 0x0001,
    ThreadExists = 0x0002,
    HasAttributes = 0x0004,
}

/// Catalog folder (directory) leaf record.
#[derive(Debug, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct CatalogFolder {
    pub flags: u16,
    pub valence: u32,
    pub folder_id: CatalogNodeId,
    pub create_date: HfsDate,
    pub content_mod_date: HfsDate,
    pub attribute_mod_date: HfsDate,
    pub access_date: HfsDate,
    pub backup_date: HfsDate,
    pub bsd_info: BsdInfo,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: u32,
    pub reserved: u32,
}

/// Catalog file leaf record.
#[derive(Debug, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct CatalogFile {
    pub flags: u16,
    pub reserved1: u32,
    pub file_id: CatalogNodeId,
    pub create_date: HfsDate,
    pub content_mod_date: HfsDate,
    pub attribute_mod_date: HfsDate,
    pub access_date: HfsDate,
    pub backup_date: HfsDate,
    pub bsd_info: BsdInfo,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: u32,
    pub reserved2: u32,
    pub data_fork: ForkData,
    pub rsrc_fork: ForkData,
}

/// Folder/file thread record, maps a CNID back to its parent and name.
#[derive(Debug, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct CatalogThread {
    pub reserved: i16,
    pub parent_id: CatalogNodeId,
    #[deku(update = "self.node_name.len() as u16")]
    pub name_len: u16,
    #[deku(count = "name_len")]
    pub node_name: Vec<u16>,
}

/// Catalog key: `(parent CNID, name)`, sorted by HFS+ binary Unicode order.
#[derive(Debug, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct CatalogKey {
    #[deku(update = "self.computed_key_length()")]
    pub key_length: u16,
    pub parent_id: CatalogNodeId,
    #[deku(update = "self.node_name.len() as u16")]
    pub name_len: u16,
    #[deku(count = "name_len")]
    pub node_name: Vec<u16>,
}

impl CatalogKey {
    pub const MINIMUM_LENGTH: u16 = 6;
    pub const MAXIMUM_LENGTH: u16 = 516;

    pub fn new(parent_id: CatalogNodeId, node_name: Vec<u16>) -> Self {
        let mut key = Self {
            key_length: 0,
            parent_id,
            name_len: node_name.len() as u16,
            node_name,
        };
        key.key_length = key.computed_key_length();
        key
    }

    fn computed_key_length(&self) -> u16 {
        4 + 2 + self.node_name.len() as u16 * 2
    }
}

/// Extents overflow fork identifier: 0 = data fork, 0xFF = resource fork.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkKind {
    Data = 0x00,
    Resource = 0xFF,
}

/// Extents overflow key: `(fork, CNID, starting allocation block)`.
#[derive(Debug, Clone, Copy, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct ExtentKey {
    pub key_length: u8,
    pub fork_kind: u8,
    pub file_id: CatalogNodeId,
    pub start_block: u32,
}

impl ExtentKey {
    pub const LENGTH: u8 = 9;

    pub fn new(fork_kind: ForkKind, file_id: CatalogNodeId, start_block: u32) -> Self {
        Self {
            key_length: Self::LENGTH,
            fork_kind: fork_kind as u8,
            file_id,
            start_block,
        }
    }
}
