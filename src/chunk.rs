//! [`ChunkSource`]: the abstract block/sector device every driver is built
//! on top of. Concrete container codecs (nibble images, `.do`/`.po` sector
//! ordering, compressed wrappers) are external collaborators per spec.md
//! §1; this module only defines the trait boundary plus a minimal in-memory
//! implementation used by the test suite.

use crate::error::{Error, Result};

/// Tags the sector-interleave skew used by the image container, so a
/// filesystem driver that natively expects one skew can detect when it's
/// looking at the other (DOS-order sectors backing a ProDOS volume, etc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOrder {
    /// `.do`/DSK order: sectors addressed the way DOS 3.3 expects.
    Dos,
    /// `.po` order: sectors addressed the way ProDOS expects.
    ProDos,
    /// CP/M order, consumers generally treat this like `Dos` with remapping.
    Cpm,
    /// Order is unknown or not meaningful for this container (e.g. pure
    /// block devices like HFS volumes have no track/sector concept).
    Unknown,
}

/// A fixed-geometry byte store addressable by block number or by
/// `(track, sector)`. Implementations own the actual bytes (a file, a
/// memory buffer, a nibble-decoded track image, ...); this crate never
/// constructs one itself outside of tests.
pub trait ChunkSource {
    /// Total length of the formatted image, in bytes.
    fn formatted_length(&self) -> u64;

    /// Whether `read_block`/`write_block` are meaningful for this source.
    fn has_blocks(&self) -> bool;

    /// Whether `read_sector`/`write_sector` are meaningful for this source.
    fn has_sectors(&self) -> bool;

    /// Sector-interleave skew the container applies, if any.
    fn file_order(&self) -> FileOrder;

    fn is_read_only(&self) -> bool;

    fn block_size(&self) -> usize {
        512
    }

    fn sector_size(&self) -> usize {
        256
    }

    fn sectors_per_track(&self) -> usize {
        16
    }

    fn read_block(&self, block: usize, buf: &mut [u8], offset: usize) -> Result<()>;
    fn write_block(&mut self, block: usize, buf: &[u8], offset: usize) -> Result<()>;

    fn read_sector(&self, track: usize, sector: usize, buf: &mut [u8], offset: usize) -> Result<()>;
    fn write_sector(&mut self, track: usize, sector: usize, buf: &[u8], offset: usize) -> Result<()>;

    /// Reads a sector, applying CP/M's half-block (128-byte physical
    /// record) swap: CP/M logical sectors on a 5.25" Apple II disk map to
    /// the second half of one DOS sector and the first half of another, a
    /// skew distinct from plain track/sector interleave.
    fn read_cpm_half_sector(&self, track: usize, half_sector: usize, buf: &mut [u8]) -> Result<()> {
        let dos_sector = half_sector / 2;
        let offset = (half_sector % 2) * (self.sector_size() / 2);
        self.read_sector(track, dos_sector, buf, offset)
    }

    fn write_cpm_half_sector(&mut self, track: usize, half_sector: usize, buf: &[u8]) -> Result<()> {
        let dos_sector = half_sector / 2;
        let offset = (half_sector % 2) * (self.sector_size() / 2);
        self.write_sector(track, dos_sector, buf, offset)
    }
}

/// A plain in-memory [`ChunkSource`], used by tests and as a reference
/// implementation for drivers to format from scratch.
pub struct MemoryChunkSource {
    data: Vec<u8>,
    block_size: usize,
    sector_size: usize,
    sectors_per_track: usize,
    read_only: bool,
    file_order: FileOrder,
}

impl MemoryChunkSource {
    pub fn new(total_len: usize) -> Self {
        Self {
            data: vec![0u8; total_len],
            block_size: 512,
            sector_size: 256,
            sectors_per_track: 16,
            read_only: false,
            file_order: FileOrder::Unknown,
        }
    }

    pub fn with_file_order(mut self, order: FileOrder) -> Self {
        self.file_order = order;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_geometry(mut self, sector_size: usize, sectors_per_track: usize) -> Self {
        self.sector_size = sector_size;
        self.sectors_per_track = sectors_per_track;
        self
    }

    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn sector_offset(&self, track: usize, sector: usize) -> usize {
        (track * self.sectors_per_track + sector) * self.sector_size
    }
}

impl ChunkSource for MemoryChunkSource {
    fn formatted_length(&self) -> u64 {
        self.data.len() as u64
    }

    fn has_blocks(&self) -> bool {
        true
    }

    fn has_sectors(&self) -> bool {
        true
    }

    fn file_order(&self) -> FileOrder {
        self.file_order
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sectors_per_track(&self) -> usize {
        self.sectors_per_track
    }

    fn read_block(&self, block: usize, buf: &mut [u8], offset: usize) -> Result<()> {
        let start = block * self.block_size + offset;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(Error::InvalidArgument(format!(
                "block {block} out of range"
            )));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_block(&mut self, block: usize, buf: &[u8], offset: usize) -> Result<()> {
        if self.read_only {
            return Err(Error::InvalidArgument("chunk source is read-only".into()));
        }
        let start = block * self.block_size + offset;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(Error::InvalidArgument(format!(
                "block {block} out of range"
            )));
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn read_sector(&self, track: usize, sector: usize, buf: &mut [u8], offset: usize) -> Result<()> {
        let start = self.sector_offset(track, sector) + offset;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(Error::InvalidArgument(format!(
                "track {track} sector {sector} out of range"
            )));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_sector(&mut self, track: usize, sector: usize, buf: &[u8], offset: usize) -> Result<()> {
        if self.read_only {
            return Err(Error::InvalidArgument("chunk source is read-only".into()));
        }
        let start = self.sector_offset(track, sector) + offset;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(Error::InvalidArgument(format!(
                "track {track} sector {sector} out of range"
            )));
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trip() {
        let mut src = MemoryChunkSource::new(512 * 4);
        let payload = [0xAAu8; 512];
        src.write_block(1, &payload, 0).unwrap();
        let mut buf = [0u8; 512];
        src.read_block(1, &mut buf, 0).unwrap();
        assert_eq!(buf, payload);
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut src = MemoryChunkSource::new(512).with_read_only(true);
        assert!(src.write_block(0, &[0u8; 512], 0).is_err());
    }
}
