// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Advisory byte-range locks

use std::collections::HashMap;

use crate::types::{FileLock, HandleId, LockId, LockKind, LockRange, NodeId};

/// Result of checking a lock request against held locks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LockCheck {
    Grantable,
    /// The requesting handle already holds an overlapping lock
    SameHandleOverlap,
    /// Another handle holds an incompatible overlapping lock
    Conflict,
}

/// Lock manager for tracking byte-range locks per node
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    locks: HashMap<NodeId, Vec<FileLock>>,
    owners: HashMap<LockId, NodeId>,
    next_id: u64,
}

impl LockTable {
    pub fn check(&self, node: NodeId, handle: HandleId, range: &LockRange) -> LockCheck {
        let Some(held) = self.locks.get(&node) else {
            return LockCheck::Grantable;
        };
        let mut result = LockCheck::Grantable;
        for lock in held.iter().filter(|lock| lock.range.overlaps(range)) {
            if lock.handle == handle {
                // Same handle: always refused, even for compatible shared ranges
                return LockCheck::SameHandleOverlap;
            }
            if lock.range.kind == LockKind::Exclusive || range.kind == LockKind::Exclusive {
                result = LockCheck::Conflict;
            }
        }
        result
    }

    pub fn insert(&mut self, node: NodeId, handle: HandleId, range: LockRange) -> FileLock {
        self.next_id += 1;
        let lock = FileLock {
            id: LockId(self.next_id),
            handle,
            range,
        };
        self.locks.entry(node).or_default().push(lock);
        self.owners.insert(lock.id, node);
        lock
    }

    /// Returns the released lock, or `None` if it was no longer held
    pub fn release(&mut self, id: LockId) -> Option<FileLock> {
        let node = self.owners.remove(&id)?;
        let held = self.locks.get_mut(&node)?;
        let index = held.iter().position(|lock| lock.id == id)?;
        let lock = held.remove(index);
        if held.is_empty() {
            self.locks.remove(&node);
        }
        Some(lock)
    }

    /// Drops every lock owned by `handle`, leaving other handles' locks alone
    pub fn release_handle(&mut self, node: NodeId, handle: HandleId) -> Vec<LockId> {
        let Some(held) = self.locks.get_mut(&node) else {
            return Vec::new();
        };
        let mut released = Vec::new();
        held.retain(|lock| {
            if lock.handle == handle {
                released.push(lock.id);
                false
            } else {
                true
            }
        });
        if held.is_empty() {
            self.locks.remove(&node);
        }
        for id in &released {
            self.owners.remove(id);
        }
        released
    }

    pub fn is_held(&self, id: LockId) -> bool {
        self.owners.contains_key(&id)
    }

    pub fn held_count(&self) -> usize {
        self.owners.len()
    }
}
