// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for memfs

use std::time::SystemTime;

/// Stable inode identifier. Doubles as the `fileKey` attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Opaque handle identifier (file channels and directory streams)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

/// Opaque lock identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

/// File timestamps
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileTimes {
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
}

impl FileTimes {
    pub fn all(at: SystemTime) -> Self {
        Self {
            created: at,
            modified: at,
            accessed: at,
        }
    }
}

/// DOS attribute bits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DosFlags {
    pub hidden: bool,
    pub readonly: bool,
    pub system: bool,
    pub archive: bool,
}

/// Basic file attributes
#[derive(Clone, Debug)]
pub struct Attributes {
    pub file_type: FileType,
    pub size: u64,
    pub times: FileTimes,
    pub file_key: NodeId,
    pub nlink: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub owner: String,
    pub group: String,
    pub dos: DosFlags,
}

impl Attributes {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

/// Directory entry information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub file_type: FileType,
}

/// File open options
#[derive(Clone, Debug)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
    pub delete_on_close: bool,
    /// Content and metadata written synchronously
    pub sync: bool,
    /// Content written synchronously, metadata deferred
    pub dsync: bool,
    pub follow_links: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: false,
            write: false,
            append: false,
            create: false,
            create_new: false,
            truncate: false,
            delete_on_close: false,
            sync: false,
            dsync: false,
            follow_links: true,
        }
    }
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Read/write, creating the file when missing
    pub fn read_write_create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Self::default()
        }
    }

    /// Write-only, creating or truncating
    pub fn write_truncate() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Self::default()
        }
    }

    pub(crate) fn writes(&self) -> bool {
        self.write || self.append
    }

    pub(crate) fn reads(&self) -> bool {
        self.read || !self.writes()
    }
}

/// Lock kind for byte-range locking
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Byte range lock request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockRange {
    pub offset: u64,
    pub len: u64,
    pub kind: LockKind,
}

impl LockRange {
    pub fn new(offset: u64, len: u64, kind: LockKind) -> Self {
        Self { offset, len, kind }
    }

    /// The whole file, including anything written later
    pub fn whole(kind: LockKind) -> Self {
        Self::new(0, u64::MAX, kind)
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }

    pub fn overlaps(&self, other: &LockRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// A granted byte-range lock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileLock {
    pub id: LockId,
    pub handle: HandleId,
    pub range: LockRange,
}

/// Store view: space accounting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreInfo {
    pub total_space: u64,
    pub usable_space: u64,
    pub unallocated_space: u64,
    pub used_space: u64,
}

/// Filesystem statistics
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsStats {
    pub nodes: u64,
    pub open_handles: u32,
    pub open_streams: u32,
    pub held_locks: u32,
    pub used_bytes: u64,
}
