//! [`FileEntry`]: the in-memory mirror of a directory/catalog entry, and the
//! arena that owns every entry for a [`crate::filesystem::Filesystem`].
//!
//! FileEntry ↔ parent and Filesystem ↔ FileEntry naturally form reference
//! cycles. Per spec.md §9 ("Cyclic references"), these are resolved as an
//! arena + index: the `Filesystem` owns a `Vec<Option<FileEntry>>` slotmap,
//! entries carry `FileRef` slot indices for parent/children, and
//! invalidating the slotmap (mode transition to Raw) harmlessly strands any
//! outstanding handle.

use std::fmt;

/// Opaque handle into a [`FileEntryArena`]. Resolved by the owning
/// [`crate::filesystem::Filesystem`]; never dereferenced directly by
/// application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileRef(pub(crate) usize);

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileRef({})", self.0)
    }
}

/// Driver-neutral attributes every [`FileEntry`] carries, per spec.md §3.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Raw, on-disk filename bytes.
    pub filename_raw: Vec<u8>,
    /// Decoded display form; control/high-bit bytes map to Unicode
    /// control-picture glyphs (spec.md §9 "Filename character handling").
    pub filename_cooked: String,
    pub file_type: u16,
    pub aux_type: u32,
    pub access_flags: u8,
    pub create_time: Option<i64>,
    pub modify_time: Option<i64>,
    pub data_length: u64,
    pub rsrc_length: u64,
    pub storage_size: u64,
    pub parent: Option<FileRef>,
    pub children: Vec<FileRef>,
    pub is_directory: bool,
    pub has_rsrc_fork: bool,
    pub is_dubious: bool,
    pub is_damaged: bool,
    /// Driver-specific payload (extent pointers, key block, storage type,
    /// CNID, ...). Each driver downcasts via its own wrapper type; the
    /// arena itself is driver-neutral.
    pub native: NativeMetadata,
}

/// Per-driver native metadata, tagged so a single arena can hold entries
/// from exactly one driver kind at a time (a `Filesystem` only ever
/// instantiates one driver).
#[derive(Debug, Clone)]
pub enum NativeMetadata {
    Dos33(crate::dos33::NativeEntry),
    ProDos(crate::prodos::NativeEntry),
    Pascal(crate::pascal::NativeEntry),
    Cpm(crate::cpm::NativeEntry),
    Hfs(crate::hfs::NativeEntry),
    Mfs(crate::mfs::NativeEntry),
}

impl FileEntry {
    /// True while backed by a live arena slot. Entries returned from a
    /// disposed/reset arena are never handed back to callers (the arena
    /// simply no longer resolves their `FileRef`), so this is always `true`
    /// for any `FileEntry` a caller can currently observe; kept as an
    /// explicit field-free helper matching spec.md §3's invariant wording.
    pub fn is_valid(&self) -> bool {
        true
    }
}

/// Owns every [`FileEntry`] for one [`crate::filesystem::Filesystem`]
/// instance. Slots are never reused within a single `FileAccess` session so
/// that existing `FileRef`s stay meaningful until the next
/// `prepare_file_access` rebuilds the arena from scratch.
#[derive(Debug, Default)]
pub struct FileEntryArena {
    slots: Vec<Option<FileEntry>>,
}

impl FileEntryArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: FileEntry) -> FileRef {
        self.slots.push(Some(entry));
        FileRef(self.slots.len() - 1)
    }

    pub fn get(&self, r: FileRef) -> Option<&FileEntry> {
        self.slots.get(r.0).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, r: FileRef) -> Option<&mut FileEntry> {
        self.slots.get_mut(r.0).and_then(|s| s.as_mut())
    }

    /// Removes an entry's slot outright (used by `delete_file`); children
    /// already detached from the tree by the caller remain dangling, which
    /// is safe since their own `FileRef`s simply stop resolving.
    pub fn remove(&mut self, r: FileRef) -> Option<FileEntry> {
        self.slots.get_mut(r.0).and_then(|s| s.take())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invalidates every outstanding `FileRef` by clearing the arena. Called
    /// on `prepare_raw_access`; any application-held `FileRef` simply stops
    /// resolving (`get`/`get_mut` return `None`) rather than dangling
    /// unsafely.
    pub fn invalidate(&mut self) {
        self.slots.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (FileRef, &FileEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|e| (FileRef(i), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_entry(name: &str) -> FileEntry {
        FileEntry {
            filename_raw: name.as_bytes().to_vec(),
            filename_cooked: name.to_string(),
            file_type: 0,
            aux_type: 0,
            access_flags: 0xC3,
            create_time: None,
            modify_time: None,
            data_length: 0,
            rsrc_length: 0,
            storage_size: 0,
            parent: None,
            children: Vec::new(),
            is_directory: false,
            has_rsrc_fork: false,
            is_dubious: false,
            is_damaged: false,
            native: NativeMetadata::ProDos(crate::prodos::NativeEntry::default()),
        }
    }

    #[test]
    fn invalidate_strands_handles() {
        let mut arena = FileEntryArena::new();
        let r = arena.insert(dummy_entry("HELLO"));
        assert!(arena.get(r).is_some());
        arena.invalidate();
        assert!(arena.get(r).is_none());
    }

    #[test]
    fn remove_strands_only_that_handle() {
        let mut arena = FileEntryArena::new();
        let a = arena.insert(dummy_entry("A"));
        let b = arena.insert(dummy_entry("B"));
        arena.remove(a);
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
    }
}
