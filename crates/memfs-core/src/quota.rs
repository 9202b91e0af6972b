// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Global used/total byte accounting

use crate::error::{FsError, FsResult};

#[derive(Clone, Debug)]
pub(crate) struct DiskQuota {
    total: u64,
    used: u64,
}

impl DiskQuota {
    pub fn new(total: u64) -> Self {
        Self { total, used: 0 }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn usable(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }

    /// Claims `bytes` more. Growth beyond the limit fails and leaves the
    /// counter untouched.
    pub fn grow(&mut self, bytes: u64) -> FsResult<()> {
        if bytes > self.usable() {
            tracing::debug!(requested = bytes, usable = self.usable(), "quota exceeded");
            return Err(FsError::OutOfSpace);
        }
        self.used += bytes;
        Ok(())
    }

    pub fn release(&mut self, bytes: u64) {
        self.used = self.used.saturating_sub(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_up_to_exact_limit() {
        let mut quota = DiskQuota::new(100);
        quota.grow(60).expect("grow");
        quota.grow(40).expect("exact fill");
        assert_eq!(quota.usable(), 0);
        assert!(matches!(quota.grow(1), Err(FsError::OutOfSpace)));
        assert!(matches!(quota.grow(u64::MAX), Err(FsError::OutOfSpace)));
        assert_eq!(quota.used(), 100);
    }

    #[test]
    fn release_saturates() {
        let mut quota = DiskQuota::new(10);
        quota.grow(8).expect("grow");
        quota.release(5);
        assert_eq!(quota.used(), 3);
        quota.release(100);
        assert_eq!(quota.used(), 0);
    }
}
