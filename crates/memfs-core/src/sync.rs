// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Dirty/fsync tracking

use crate::error::FsResult;
use crate::node::NodeStore;
use crate::types::{NodeId, OpenOptions};

/// Unflushed state of one node.
///
/// Directories only ever use the content half: it flips when a child is
/// added or removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct DirtyState {
    pub content: bool,
    pub metadata: bool,
}

impl DirtyState {
    pub fn is_dirty(&self) -> bool {
        self.content || self.metadata
    }

    pub fn force(&mut self, metadata_only: bool) {
        self.metadata = false;
        if !metadata_only {
            self.content = false;
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Write-through behavior of a handle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncMode {
    /// Nothing is written through
    None,
    /// Content and metadata are written through
    Sync,
    /// Metadata is written through, content stays dirty
    DSync,
}

impl SyncMode {
    pub fn of(options: &OpenOptions) -> Self {
        if options.sync {
            SyncMode::Sync
        } else if options.dsync {
            SyncMode::DSync
        } else {
            SyncMode::None
        }
    }

    /// Record a change made through a handle in this mode
    pub fn apply(self, dirty: &mut DirtyState, content: bool, metadata: bool) {
        match self {
            SyncMode::Sync => {}
            SyncMode::DSync => dirty.content |= content,
            SyncMode::None => {
                dirty.content |= content;
                dirty.metadata |= metadata;
            }
        }
    }
}

/// Depth-first walk from `start` (whose path is `names`), in listing order.
/// Returns the path of the first dirty node, if any. Symlinks are checked
/// themselves and never followed.
pub(crate) fn first_unsynced(
    nodes: &NodeStore,
    start: NodeId,
    names: Vec<String>,
) -> FsResult<Option<Vec<String>>> {
    let mut stack = vec![(start, names)];
    while let Some((id, path)) = stack.pop() {
        let node = nodes.live(id)?;
        if node.dirty.is_dirty() {
            return Ok(Some(path));
        }
        if let Some(entries) = node.entries() {
            let children: Vec<_> = entries.iter().collect();
            for (name, child) in children.into_iter().rev() {
                let mut child_path = path.clone();
                child_path.push(name.to_string());
                stack.push((child, child_path));
            }
        }
    }
    Ok(None)
}
