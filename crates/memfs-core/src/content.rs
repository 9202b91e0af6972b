// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Growable file content and per-handle cursors

use crate::error::{FsError, FsResult};
use crate::quota::DiskQuota;
use crate::types::{LockId, NodeId, OpenOptions};

/// Byte content of a regular file
#[derive(Clone, Debug, Default)]
pub(crate) struct FileContent {
    data: Vec<u8>,
}

impl FileContent {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Copies bytes at `offset`; `None` once `offset` is at or past the end.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Option<usize> {
        if buf.is_empty() {
            return Some(0);
        }
        if offset >= self.size() {
            return None;
        }
        let start = offset as usize;
        let end = std::cmp::min(start + buf.len(), self.data.len());
        buf[..end - start].copy_from_slice(&self.data[start..end]);
        Some(end - start)
    }

    /// Writes at `offset`, zero-filling any gap. Quota is claimed before the
    /// buffer is touched so a rejected write changes nothing. An end past
    /// what the store could ever hold is `OutOfSpace`.
    pub fn write_at(&mut self, offset: u64, data: &[u8], quota: &mut DiskQuota) -> FsResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::OutOfSpace)?;
        let (Ok(start), Ok(end_index)) = (usize::try_from(offset), usize::try_from(end)) else {
            return Err(FsError::OutOfSpace);
        };
        let growth = end.saturating_sub(self.size());
        quota.grow(growth)?;

        if end_index > self.data.len() {
            if self.data.try_reserve(end_index - self.data.len()).is_err() {
                quota.release(growth);
                return Err(FsError::OutOfSpace);
            }
            self.data.resize(end_index, 0);
        }
        self.data[start..end_index].copy_from_slice(data);
        Ok(data.len())
    }

    /// Shrinks to `size`; never grows. Returns whether anything changed.
    pub fn truncate(&mut self, size: u64, quota: &mut DiskQuota) -> bool {
        if size >= self.size() {
            return false;
        }
        quota.release(self.size() - size);
        self.data.truncate(size as usize);
        true
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Replaces the content wholesale (copy), claiming or releasing the
    /// size difference
    pub fn replace(&mut self, data: Vec<u8>, quota: &mut DiskQuota) -> FsResult<()> {
        let (new, old) = (data.len() as u64, self.size());
        if new > old {
            quota.grow(new - old)?;
        } else {
            quota.release(old - new);
        }
        self.data = data;
        Ok(())
    }
}

/// Where a handle's file was reached from; watch events for writes through
/// the handle are reported against this directory entry.
#[derive(Clone, Debug)]
pub(crate) struct Origin {
    pub dir: NodeId,
    pub name: String,
}

/// Open file channel state
#[derive(Debug)]
pub(crate) struct FileCursor {
    pub position: u64,
    pub options: OpenOptions,
    pub origin: Option<Origin>,
    pub locks: Vec<LockId>,
    /// Windows delete-on-close: entry removed when the last such handle closes
    pub delete_on_close: bool,
}

impl FileCursor {
    pub fn new(options: OpenOptions, origin: Option<Origin>) -> Self {
        Self {
            position: 0,
            options,
            origin,
            locks: Vec::new(),
            delete_on_close: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_past_end_zero_fills() {
        let mut quota = DiskQuota::new(1024);
        let mut content = FileContent::default();
        content.write_at(4, b"xy", &mut quota).expect("write");
        assert_eq!(content.bytes(), &[0, 0, 0, 0, b'x', b'y']);
        assert_eq!(quota.used(), 6);
    }

    #[test]
    fn read_signals_eof() {
        let mut quota = DiskQuota::new(1024);
        let mut content = FileContent::default();
        content.write_at(0, b"abc", &mut quota).expect("write");
        let mut buf = [0u8; 8];
        assert_eq!(content.read_at(1, &mut buf), Some(2));
        assert_eq!(&buf[..2], b"bc");
        assert_eq!(content.read_at(3, &mut buf), None);
        assert_eq!(content.read_at(3, &mut []), Some(0));
    }

    #[test]
    fn truncate_only_shrinks() {
        let mut quota = DiskQuota::new(1024);
        let mut content = FileContent::default();
        content.write_at(0, b"hello", &mut quota).expect("write");
        assert!(!content.truncate(10, &mut quota));
        assert!(content.truncate(2, &mut quota));
        assert_eq!(content.bytes(), b"he");
        assert_eq!(quota.used(), 2);
    }

    #[test]
    fn rejected_write_leaves_content_alone() {
        let mut quota = DiskQuota::new(4);
        let mut content = FileContent::default();
        content.write_at(0, b"abc", &mut quota).expect("write");
        assert!(matches!(
            content.write_at(2, b"xyz", &mut quota),
            Err(FsError::OutOfSpace)
        ));
        assert_eq!(content.bytes(), b"abc");
        assert_eq!(quota.used(), 3);
    }

    #[test]
    fn write_ending_past_u64_is_out_of_space() {
        let mut quota = DiskQuota::new(u64::MAX);
        let mut content = FileContent::default();
        content.write_at(0, b"0123456789", &mut quota).expect("write");
        for offset in [u64::MAX - 4, u64::MAX - 1, 1 << 63] {
            assert!(matches!(
                content.write_at(offset, b"xyzzy", &mut quota),
                Err(FsError::OutOfSpace)
            ));
        }
        assert_eq!(content.bytes(), b"0123456789");
        assert_eq!(quota.used(), 10);
    }
}
