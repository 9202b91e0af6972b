// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inode arena

use std::collections::HashMap;
use std::time::SystemTime;

use crate::config::{CaseSensitivity, SecurityPolicy};
use crate::content::FileContent;
use crate::dir::DirTable;
use crate::error::{FsError, FsResult};
use crate::sync::DirtyState;
use crate::types::{Attributes, DosFlags, FileTimes, FileType, NodeId};

/// Filesystem node types
#[derive(Clone, Debug)]
pub(crate) enum NodeKind {
    File { content: FileContent },
    Directory { entries: DirTable },
    Symlink { target: String },
}

/// Filesystem node
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub times: FileTimes,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub owner: String,
    pub group: String,
    pub dos: DosFlags,
    pub rdev: u64,
    /// Number of directory entries naming this node
    pub nlink: u32,
    /// File channels and directory streams open on this node
    pub open_handles: u32,
    /// Directories only; the root has none
    pub parent: Option<NodeId>,
    pub dirty: DirtyState,
    /// Windows delete-on-close pending; new opens are refused
    pub pending_delete: bool,
    pub delete_on_close_handles: u32,
}

impl Node {
    pub fn file_type(&self) -> FileType {
        match self.kind {
            NodeKind::File { .. } => FileType::File,
            NodeKind::Directory { .. } => FileType::Directory,
            NodeKind::Symlink { .. } => FileType::Symlink,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File { content } => content.size(),
            NodeKind::Directory { .. } => 0,
            NodeKind::Symlink { target } => target.len() as u64,
        }
    }

    pub fn entries(&self) -> Option<&DirTable> {
        match &self.kind {
            NodeKind::Directory { entries } => Some(entries),
            _ => None,
        }
    }

    pub fn entries_mut(&mut self) -> Option<&mut DirTable> {
        match &mut self.kind {
            NodeKind::Directory { entries } => Some(entries),
            _ => None,
        }
    }

    pub fn content(&self) -> Option<&FileContent> {
        match &self.kind {
            NodeKind::File { content } => Some(content),
            _ => None,
        }
    }

    /// `st_mode` including the file type bits
    pub fn full_mode(&self) -> u32 {
        let type_bits = match self.kind {
            NodeKind::File { .. } => libc::S_IFREG,
            NodeKind::Directory { .. } => libc::S_IFDIR,
            NodeKind::Symlink { .. } => libc::S_IFLNK,
        };
        type_bits as u32 | (self.mode & 0o7777)
    }

    pub fn attributes(&self) -> Attributes {
        Attributes {
            file_type: self.file_type(),
            size: self.size(),
            times: self.times,
            file_key: self.id,
            nlink: self.nlink,
            mode: self.full_mode(),
            uid: self.uid,
            gid: self.gid,
            owner: self.owner.clone(),
            group: self.group.clone(),
            dos: self.dos,
        }
    }
}

/// Owns every node; everything else refers to nodes by [`NodeId`].
#[derive(Debug)]
pub(crate) struct NodeStore {
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
    root: NodeId,
    case: CaseSensitivity,
}

impl NodeStore {
    pub fn new(case: CaseSensitivity, security: &SecurityPolicy, now: SystemTime) -> Self {
        let mut store = Self {
            nodes: HashMap::new(),
            next_id: 1,
            root: NodeId(0),
            case,
        };
        let kind = NodeKind::Directory {
            entries: DirTable::new(case),
        };
        let root = store.allocate(kind, 0o755, security, now);
        if let Some(node) = store.nodes.get_mut(&root) {
            // the root is never named by an entry but is always live
            node.nlink = 1;
        }
        store.root = root;
        store
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    fn allocate(
        &mut self,
        kind: NodeKind,
        mode: u32,
        security: &SecurityPolicy,
        now: SystemTime,
    ) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let node = Node {
            id,
            kind,
            times: FileTimes::all(now),
            mode,
            uid: security.default_uid,
            gid: security.default_gid,
            owner: security.default_owner.clone(),
            group: security.default_group.clone(),
            dos: DosFlags::default(),
            rdev: 0,
            nlink: 0,
            open_handles: 0,
            parent: None,
            dirty: DirtyState::default(),
            pending_delete: false,
            delete_on_close_handles: 0,
        };
        self.nodes.insert(id, node);
        id
    }

    pub fn create_file(&mut self, security: &SecurityPolicy, now: SystemTime) -> NodeId {
        let kind = NodeKind::File {
            content: FileContent::default(),
        };
        self.allocate(kind, 0o644, security, now)
    }

    pub fn create_directory(
        &mut self,
        parent: NodeId,
        security: &SecurityPolicy,
        now: SystemTime,
    ) -> NodeId {
        let kind = NodeKind::Directory {
            entries: DirTable::new(self.case),
        };
        let id = self.allocate(kind, 0o755, security, now);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(parent);
        }
        id
    }

    pub fn create_symlink(
        &mut self,
        target: &str,
        security: &SecurityPolicy,
        now: SystemTime,
    ) -> NodeId {
        let kind = NodeKind::Symlink {
            target: target.to_string(),
        };
        self.allocate(kind, 0o777, security, now)
    }

    pub fn get(&self, id: NodeId) -> FsResult<&Node> {
        self.nodes.get(&id).ok_or(FsError::NotFound)
    }

    pub fn get_mut(&mut self, id: NodeId) -> FsResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(FsError::NotFound)
    }

    /// Node that the engine itself believes must exist
    pub fn live(&self, id: NodeId) -> FsResult<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| FsError::Internal(format!("dangling node id {}", id.0)))
    }

    pub fn live_mut(&mut self, id: NodeId) -> FsResult<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| FsError::Internal(format!("dangling node id {}", id.0)))
    }

    pub fn dir(&self, id: NodeId) -> FsResult<&DirTable> {
        self.get(id)?.entries().ok_or(FsError::NotADirectory)
    }

    pub fn dir_mut(&mut self, id: NodeId) -> FsResult<&mut DirTable> {
        self.get_mut(id)?.entries_mut().ok_or(FsError::NotADirectory)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.nodes.remove(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// True when `ancestor` is `id` or one of its parent directories
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node_id) = current {
            if node_id == ancestor {
                return true;
            }
            current = self.nodes.get(&node_id).and_then(|node| node.parent);
        }
        false
    }
}
