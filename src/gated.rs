//! [`GatedChunk`]: the access-mediation wrapper that is the sole mechanism
//! preventing raw writes from bypassing the file driver while descriptors
//! are open (spec.md §4.1, §9 "Gated raw access").

use crate::chunk::ChunkSource;
use crate::error::{Error, Result};

/// Access level enforced by a [`GatedChunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    /// Every operation fails with [`Error::ObjectDisposed`].
    Closed,
    /// Raw read and write permitted; used while the filesystem is in raw
    /// mode and no driver-mediated file access is possible.
    Open,
    /// Raw read permitted, raw write denied; used while the filesystem is
    /// in file-access mode so mutation can only happen through the driver.
    ReadOnly,
}

/// Wraps a [`ChunkSource`] and enforces `level` on every passthrough
/// operation. A write attempted through a `ReadOnly`-gated chunk while a
/// driver believes it is in file-access mode is a programmer error, not a
/// user error: such a write would silently corrupt the driver's in-memory
/// shadow of the volume, so it panics rather than returning an `Err`.
pub struct GatedChunk<S> {
    source: S,
    level: AccessLevel,
}

impl<S: ChunkSource> GatedChunk<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            level: AccessLevel::Closed,
        }
    }

    pub fn level(&self) -> AccessLevel {
        self.level
    }

    pub fn set_level(&mut self, level: AccessLevel) {
        self.level = level;
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn ensure_readable(&self) -> Result<()> {
        match self.level {
            AccessLevel::Closed => Err(Error::ObjectDisposed),
            AccessLevel::Open | AccessLevel::ReadOnly => Ok(()),
        }
    }

    /// Panics if a raw write is attempted while gated to `ReadOnly` or
    /// `Closed`; this indicates the driver itself reached past its own
    /// gate, which is always a bug in this crate rather than caller misuse.
    fn ensure_writable(&self) {
        match self.level {
            AccessLevel::Open => {}
            AccessLevel::ReadOnly => {
                panic!("attempted raw write while GatedChunk is ReadOnly (file-access mode)")
            }
            AccessLevel::Closed => panic!("attempted raw write while GatedChunk is Closed"),
        }
    }

    pub fn read_block(&self, block: usize, buf: &mut [u8], offset: usize) -> Result<()> {
        self.ensure_readable()?;
        self.source.read_block(block, buf, offset)
    }

    pub fn write_block(&mut self, block: usize, buf: &[u8], offset: usize) -> Result<()> {
        self.ensure_writable();
        self.source.write_block(block, buf, offset)
    }

    pub fn read_sector(&self, track: usize, sector: usize, buf: &mut [u8], offset: usize) -> Result<()> {
        self.ensure_readable()?;
        self.source.read_sector(track, sector, buf, offset)
    }

    pub fn write_sector(&mut self, track: usize, sector: usize, buf: &[u8], offset: usize) -> Result<()> {
        self.ensure_writable();
        self.source.write_sector(track, sector, buf, offset)
    }

    pub fn read_cpm_half_sector(&self, track: usize, half_sector: usize, buf: &mut [u8]) -> Result<()> {
        self.ensure_readable()?;
        self.source.read_cpm_half_sector(track, half_sector, buf)
    }

    pub fn write_cpm_half_sector(&mut self, track: usize, half_sector: usize, buf: &[u8]) -> Result<()> {
        self.ensure_writable();
        self.source.write_cpm_half_sector(track, half_sector, buf)
    }

    pub fn into_inner(self) -> S {
        self.source
    }

    /// Driver-mediated write: the sanctioned counterpart to
    /// `write_block`/`write_sector`'s raw-bypass panic. A driver in
    /// `FileAccess` mode still needs to persist directory/bitmap/descriptor
    /// data through this exact wrapper; that is not the "caller reached
    /// past the file API" case `ensure_writable` guards against, so it is
    /// allowed at `Open` and `ReadOnly` alike and only refused (with an
    /// error, not a panic) once the chunk is `Closed`.
    pub fn write_block_mediated(&mut self, block: usize, buf: &[u8], offset: usize) -> Result<()> {
        self.ensure_readable()?;
        self.source.write_block(block, buf, offset)
    }

    pub fn write_sector_mediated(
        &mut self,
        track: usize,
        sector: usize,
        buf: &[u8],
        offset: usize,
    ) -> Result<()> {
        self.ensure_readable()?;
        self.source.write_sector(track, sector, buf, offset)
    }

    pub fn write_cpm_half_sector_mediated(
        &mut self,
        track: usize,
        half_sector: usize,
        buf: &[u8],
    ) -> Result<()> {
        self.ensure_readable()?;
        self.source.write_cpm_half_sector(track, half_sector, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::MemoryChunkSource;

    #[test]
    fn closed_rejects_reads() {
        let gated = GatedChunk::new(MemoryChunkSource::new(512));
        let mut buf = [0u8; 512];
        assert!(matches!(
            gated.read_block(0, &mut buf, 0),
            Err(Error::ObjectDisposed)
        ));
    }

    #[test]
    #[should_panic]
    fn read_only_panics_on_write() {
        let mut gated = GatedChunk::new(MemoryChunkSource::new(512));
        gated.set_level(AccessLevel::ReadOnly);
        let _ = gated.write_block(0, &[0u8; 512], 0);
    }

    #[test]
    fn read_only_allows_mediated_write() {
        let mut gated = GatedChunk::new(MemoryChunkSource::new(512));
        gated.set_level(AccessLevel::Open);
        gated.write_block(0, &[1u8; 512], 0).unwrap();
        gated.set_level(AccessLevel::ReadOnly);
        gated.write_block_mediated(0, &[2u8; 512], 0).unwrap();
        let mut buf = [0u8; 512];
        gated.read_block(0, &mut buf, 0).unwrap();
        assert_eq!(buf, [2u8; 512]);
    }

    #[test]
    fn closed_rejects_mediated_write() {
        let mut gated = GatedChunk::new(MemoryChunkSource::new(512));
        assert!(matches!(
            gated.write_block_mediated(0, &[0u8; 512], 0),
            Err(Error::ObjectDisposed)
        ));
    }

    #[test]
    fn open_allows_read_and_write() {
        let mut gated = GatedChunk::new(MemoryChunkSource::new(512));
        gated.set_level(AccessLevel::Open);
        gated.write_block(0, &[7u8; 512], 0).unwrap();
        let mut buf = [0u8; 512];
        gated.read_block(0, &mut buf, 0).unwrap();
        assert_eq!(buf, [7u8; 512]);
    }
}
