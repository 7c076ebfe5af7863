//! The `Filesystem` orchestrator contract (spec.md §4.6, §6) and the
//! open-file bookkeeping shared by every driver (spec.md §5).
//!
//! Each driver implements [`Filesystem`] as a concrete struct (not a
//! generic), per spec.md §9's "Polymorphic drivers" note: rather than a
//! class hierarchy, every driver is a tagged variant behind this one trait,
//! dispatched by the application through a `Box<dyn Filesystem>` (or used
//! directly when the caller already knows the format).

use crate::entry::FileRef;
use crate::error::{Error, Result};
use crate::notes::Notes;
use std::collections::HashMap;

/// Mode a [`Filesystem`] is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Raw,
    FileAccess,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForkPart {
    DataFork,
    RsrcFork,
    RawData,
}

/// Seek origin for a [`FileStream`]. `DataHole`/`DataStart` let a caller
/// skip to the next/previous sparse boundary; drivers without sparse
/// storage collapse both to `End`/`Start` respectively (spec.md §4.4).
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Begin(u64),
    Current(i64),
    End(i64),
    DataHole,
    DataStart,
}

/// Format-level characteristics reported by a driver, independent of any
/// particular volume instance.
#[derive(Debug, Clone)]
pub struct Characteristics {
    pub name: &'static str,
    pub can_write: bool,
    pub is_hierarchical: bool,
    pub dir_separator: Option<char>,
    pub has_resource_forks: bool,
    pub filename_syntax: &'static str,
    pub volume_name_syntax: &'static str,
    pub timestamp_range: Option<(i64, i64)>,
}

/// What kind of new directory entry `create_file` should produce. Each
/// driver only recognizes the variants meaningful to it; others fail with
/// [`Error::NotSupported`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationKind {
    SequentialFile,
    RandomAccessFile,
    BinaryFile,
    Directory,
}

/// A seekable byte stream over one fork of an open file.
pub trait FileStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;
    fn set_length(&mut self, len: u64) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Tracks which forks of which files are currently open, and by which
/// access mode, enforcing spec.md §5's conflict rules uniformly across
/// drivers:
///
/// - at most one writer per fork,
/// - unlimited concurrent readers of the same fork,
/// - a write lock on any fork blocks delete/move of the whole file,
/// - opening the resource fork while a different writer holds the data
///   fork (or vice versa) is fine — they're different forks.
#[derive(Debug, Default)]
pub struct OpenTracker {
    // (entry, fork) -> (reader_count, writer_present)
    open: HashMap<(FileRef, ForkPart), (usize, bool)>,
}

impl OpenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_open(&mut self, entry: FileRef, part: ForkPart, mode: OpenMode) -> Result<()> {
        let slot = self.open.entry((entry, part)).or_insert((0, false));
        match mode {
            OpenMode::ReadOnly => {
                if slot.1 {
                    // A writer already owns this fork; readers are still
                    // allowed to observe it. Only writer/writer races are
                    // denied here; snapshot consistency for reader/writer
                    // races is left to the driver's buffering.
                }
                slot.0 += 1;
                Ok(())
            }
            OpenMode::ReadWrite => {
                if slot.1 {
                    return Err(Error::InvalidArgument(format!(
                        "{entry} fork already open for write"
                    )));
                }
                slot.1 = true;
                Ok(())
            }
        }
    }

    pub fn close(&mut self, entry: FileRef, part: ForkPart, mode: OpenMode) {
        if let Some(slot) = self.open.get_mut(&(entry, part)) {
            match mode {
                OpenMode::ReadOnly => slot.0 = slot.0.saturating_sub(1),
                OpenMode::ReadWrite => slot.1 = false,
            }
            if *slot == (0, false) {
                self.open.remove(&(entry, part));
            }
        }
    }

    /// True if any fork of `entry` is currently open for write, which
    /// blocks `delete_file`/`move_file` for that entry.
    pub fn is_write_locked(&self, entry: FileRef) -> bool {
        self.open
            .iter()
            .any(|((e, _), (_, writer))| *e == entry && *writer)
    }

    pub fn any_open(&self) -> bool {
        !self.open.is_empty()
    }

    /// Idempotent cleanup used from `close_all`/finalizer paths: clears all
    /// bookkeeping without touching underlying storage. Safe to call
    /// repeatedly.
    pub fn close_all(&mut self) {
        self.open.clear();
    }
}

/// The per-driver orchestrator contract (spec.md §4.6, §6).
pub trait Filesystem {
    fn characteristics(&self) -> Characteristics;
    fn mode(&self) -> Mode;
    fn is_read_only(&self) -> bool;
    fn is_dubious(&self) -> bool;
    /// Bytes free, or `-1` if not currently in `FileAccess` mode.
    fn free_space(&self) -> i64;
    fn notes(&self) -> &Notes;

    fn prepare_file_access(&mut self, deep_scan: bool) -> Result<()>;
    fn prepare_raw_access(&mut self) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn format(&mut self, volume_name: &str, volume_number: u8, bootable: bool) -> Result<()>;

    fn root(&self) -> Result<FileRef>;
    fn children(&self, entry: FileRef) -> Result<Vec<FileRef>>;
    /// Resolves a handle to the attributes it currently carries (spec.md
    /// §6's `get_vol_dir_entry`/iteration surface). Fails with
    /// `ObjectDisposed` once the handle's arena slot has been invalidated
    /// or removed.
    fn entry(&self, entry: FileRef) -> Result<crate::entry::FileEntry>;

    fn open_file(
        &mut self,
        entry: FileRef,
        mode: OpenMode,
        part: ForkPart,
    ) -> Result<Box<dyn FileStream>>;
    fn create_file(
        &mut self,
        parent: FileRef,
        name: &str,
        creation_kind: CreationKind,
    ) -> Result<FileRef>;
    fn delete_file(&mut self, entry: FileRef) -> Result<()>;
    fn move_file(&mut self, entry: FileRef, new_parent: FileRef, new_name: &str) -> Result<()>;
    fn add_rsrc_fork(&mut self, entry: FileRef) -> Result<()>;

    /// Idempotent; safe to call repeatedly, including from a finalizer-like
    /// path. Logs and swallows I/O errors during cleanup so disposal always
    /// completes (spec.md §5, §7).
    fn dispose(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_writer_enforced() {
        let mut tracker = OpenTracker::new();
        let a = FileRef(1);
        tracker.try_open(a, ForkPart::DataFork, OpenMode::ReadWrite).unwrap();
        assert!(tracker
            .try_open(a, ForkPart::DataFork, OpenMode::ReadWrite)
            .is_err());
    }

    #[test]
    fn multiple_readers_allowed() {
        let mut tracker = OpenTracker::new();
        let a = FileRef(1);
        tracker.try_open(a, ForkPart::DataFork, OpenMode::ReadOnly).unwrap();
        tracker.try_open(a, ForkPart::DataFork, OpenMode::ReadOnly).unwrap();
        assert!(tracker.any_open());
    }

    #[test]
    fn different_forks_independent() {
        let mut tracker = OpenTracker::new();
        let a = FileRef(1);
        tracker.try_open(a, ForkPart::DataFork, OpenMode::ReadWrite).unwrap();
        assert!(tracker
            .try_open(a, ForkPart::RsrcFork, OpenMode::ReadWrite)
            .is_ok());
    }

    #[test]
    fn write_lock_blocks_delete_semantics() {
        let mut tracker = OpenTracker::new();
        let a = FileRef(1);
        tracker.try_open(a, ForkPart::DataFork, OpenMode::ReadWrite).unwrap();
        assert!(tracker.is_write_locked(a));
        tracker.close(a, ForkPart::DataFork, OpenMode::ReadWrite);
        assert!(!tracker.is_write_locked(a));
    }

    #[test]
    fn close_all_is_idempotent() {
        let mut tracker = OpenTracker::new();
        tracker.close_all();
        tracker.close_all();
        assert!(!tracker.any_open());
    }
}
