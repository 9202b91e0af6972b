// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Virtual filesystem implementation for memfs

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Condvar, Mutex};

use crate::attrs::{self, AttrValue};
use crate::clock::{Clock, SystemClock};
use crate::config::{DeleteOnClose, FsConfig, ModifyCount, ProfileTraits};
use crate::content::{FileContent, FileCursor, Origin};
use crate::error::{FsError, FsResult};
use crate::fault::{FaultInjector, FaultOp, FaultPolicy};
use crate::glob::PathMatcher;
use crate::lock::{LockCheck, LockTable};
use crate::node::{Node, NodeKind, NodeStore};
use crate::path::{render_names, FsPath};
use crate::quota::DiskQuota;
use crate::registry::{LeakReport, OpenResource, ResourceKey, ResourceRegistry};
use crate::resolve::{resolve, ResolvedPath};
use crate::sync::{first_unsynced, SyncMode};
use crate::types::{
    Attributes, DirEntry, FileLock, FileTimes, FsStats, HandleId, LockKind, LockRange, NodeId,
    OpenOptions, StoreInfo,
};
use crate::watch::{WatchEventKind, WatchKey, WatchService};

/// Handle types
#[derive(Debug)]
pub(crate) enum HandleType {
    File(FileCursor),
    Directory {
        position: usize,
        entries: Vec<DirEntry>,
    },
}

/// Open handle (file channel or directory stream)
#[derive(Debug)]
pub(crate) struct Handle {
    pub node_id: NodeId,
    pub kind: HandleType,
}

/// Open handles plus the id allocator. Ids are never reused, which is how a
/// closed handle is told apart from one that never existed.
#[derive(Debug)]
struct HandleTable {
    handles: HashMap<HandleId, Handle>,
    next_id: u64,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            handles: HashMap::new(),
            next_id: 1,
        }
    }

    fn insert(&mut self, handle: Handle) -> HandleId {
        let id = HandleId(self.next_id);
        self.next_id += 1;
        self.handles.insert(id, handle);
        id
    }

    fn was_allocated(&self, id: HandleId) -> bool {
        id.0 > 0 && id.0 < self.next_id
    }

    fn cursor_mut(&mut self, id: HandleId) -> FsResult<(NodeId, &mut FileCursor)> {
        let allocated = self.was_allocated(id);
        match self.handles.get_mut(&id) {
            Some(Handle {
                node_id,
                kind: HandleType::File(cursor),
            }) => Ok((*node_id, cursor)),
            Some(_) => Err(FsError::InvalidArgument),
            None if allocated => Err(FsError::ClosedChannel),
            None => Err(FsError::InvalidArgument),
        }
    }

    fn stream_mut(&mut self, id: HandleId) -> FsResult<(&mut usize, &[DirEntry])> {
        let allocated = self.was_allocated(id);
        match self.handles.get_mut(&id) {
            Some(Handle {
                kind: HandleType::Directory { position, entries },
                ..
            }) => Ok((position, entries.as_slice())),
            Some(_) => Err(FsError::InvalidArgument),
            None if allocated => Err(FsError::ClosedDirectoryStream),
            None => Err(FsError::InvalidArgument),
        }
    }

    fn count(&self, directory: bool) -> u32 {
        self.handles
            .values()
            .filter(|handle| matches!(handle.kind, HandleType::Directory { .. }) == directory)
            .count() as u32
    }
}

/// Everything guarded by the filesystem lock
#[derive(Debug)]
struct FsState {
    nodes: NodeStore,
    handles: HandleTable,
    locks: LockTable,
    quota: DiskQuota,
    watches: HashMap<NodeId, Vec<WatchKey>>,
    next_watch_service: u64,
}

impl FsState {
    /// Enqueues an event on every live key watching `dir`.
    fn notify(&mut self, dir: NodeId, kind: WatchEventKind, name: &str, count: u32) {
        let Some(keys) = self.watches.get_mut(&dir) else {
            return;
        };
        keys.retain(WatchKey::is_valid);
        for key in keys.iter() {
            key.push(kind, name, count);
        }
        if keys.is_empty() {
            self.watches.remove(&dir);
        }
    }

    /// Forgets cancelled keys and keys of closed services everywhere.
    fn prune_watches(&mut self) {
        self.watches.retain(|_, keys| {
            keys.retain(WatchKey::is_valid);
            !keys.is_empty()
        });
    }

    /// MODIFY through the entry a handle was opened by, if that entry still
    /// names the node.
    fn notify_modify(&mut self, origin: Option<&Origin>, node: NodeId, count: u32) {
        let Some(origin) = origin else {
            return;
        };
        let stored = match self.nodes.dir(origin.dir) {
            Ok(table) => match table.lookup(&origin.name) {
                Some((name, id)) if id == node => name.to_string(),
                _ => return,
            },
            Err(_) => return,
        };
        self.notify(origin.dir, WatchEventKind::Modify, &stored, count);
    }

    /// A child was added or removed: the directory alone goes dirty.
    fn touch_dir(&mut self, dir: NodeId, now: SystemTime) -> FsResult<()> {
        let node = self.nodes.live_mut(dir)?;
        node.times.modified = now;
        node.dirty.content = true;
        Ok(())
    }

    fn link_entry(&mut self, parent: NodeId, name: &str, id: NodeId, now: SystemTime) -> FsResult<()> {
        self.nodes.dir_mut(parent)?.insert(name, id)?;
        self.nodes.live_mut(id)?.nlink += 1;
        self.touch_dir(parent, now)?;
        self.notify(parent, WatchEventKind::Create, name, 1);
        Ok(())
    }

    /// Removes the entry and drops one link; the node itself goes once it is
    /// neither linked nor open.
    fn unlink_entry(&mut self, parent: NodeId, name: &str, now: SystemTime) -> FsResult<NodeId> {
        let (stored, id) = self.nodes.dir_mut(parent)?.remove(name)?;
        let node = self.nodes.live_mut(id)?;
        node.nlink = node.nlink.saturating_sub(1);
        let gone_dir = node.is_dir() && node.nlink == 0;
        self.touch_dir(parent, now)?;
        self.notify(parent, WatchEventKind::Delete, &stored, 1);
        if gone_dir {
            if let Some(keys) = self.watches.remove(&id) {
                for key in keys {
                    key.directory_removed();
                }
            }
        }
        self.maybe_destroy(id)?;
        Ok(id)
    }

    /// Detaches and releases the content of a file that unlinking would
    /// destroy. Files that outlive the unlink keep their content.
    fn take_doomed_content(&mut self, id: NodeId) -> FsResult<Option<FileContent>> {
        let node = self.nodes.live_mut(id)?;
        if node.nlink != 1 || node.open_handles > 0 {
            return Ok(None);
        }
        let NodeKind::File { content } = &mut node.kind else {
            return Ok(None);
        };
        let content = std::mem::take(content);
        self.quota.release(content.size());
        Ok(Some(content))
    }

    /// Puts back content detached by `take_doomed_content` after a failed
    /// replacement.
    fn restore_content(&mut self, id: Option<NodeId>, content: Option<FileContent>) -> FsResult<()> {
        let (Some(id), Some(content)) = (id, content) else {
            return Ok(());
        };
        self.quota.grow(content.size())?;
        if let NodeKind::File { content: slot } = &mut self.nodes.live_mut(id)?.kind {
            *slot = content;
        }
        Ok(())
    }

    fn maybe_destroy(&mut self, id: NodeId) -> FsResult<()> {
        let node = self.nodes.live(id)?;
        if node.nlink > 0 || node.open_handles > 0 || id == self.nodes.root() {
            return Ok(());
        }
        if let Some(node) = self.nodes.remove(id) {
            if let NodeKind::File { content } = &node.kind {
                self.quota.release(content.size());
            }
            tracing::trace!(node = id.as_u64(), "node destroyed");
        }
        Ok(())
    }
}

/// Where a new entry goes, or the error explaining why it cannot.
fn creation_slot(resolved: &ResolvedPath) -> FsResult<(NodeId, String)> {
    if resolved.target.is_some() {
        return Err(FsError::AlreadyExists);
    }
    match (&resolved.parent, &resolved.final_name) {
        (Some(parent), Some(name)) if resolved.has_valid_parent => Ok((*parent, name.clone())),
        _ => Err(resolved.existing().err().unwrap_or(FsError::NotFound)),
    }
}

/// The main filesystem core implementation
pub struct FsCore {
    config: FsConfig,
    traits: ProfileTraits,
    clock: Arc<dyn Clock>,
    state: Mutex<FsState>,
    /// Signalled whenever a byte-range lock is released
    lock_released: Condvar,
    registry: Arc<ResourceRegistry>,
    faults: FaultInjector,
}

impl std::fmt::Debug for FsCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsCore")
            .field("profile", &self.config.profile)
            .field("total_space", &self.config.total_space)
            .finish_non_exhaustive()
    }
}

impl FsCore {
    /// Create a new FsCore instance with the given configuration
    pub fn new(config: FsConfig) -> FsResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Same as [`FsCore::new`] with an explicit time source
    pub fn with_clock(config: FsConfig, clock: Arc<dyn Clock>) -> FsResult<Self> {
        if config.max_symlink_hops == 0 {
            return Err(FsError::InvalidArgument);
        }
        let traits = config.traits();
        let state = FsState {
            nodes: NodeStore::new(traits.case_sensitivity, &config.security, clock.now()),
            handles: HandleTable::new(),
            locks: LockTable::default(),
            quota: DiskQuota::new(config.total_space),
            watches: HashMap::new(),
            next_watch_service: 1,
        };
        tracing::debug!(profile = ?config.profile, total_space = config.total_space, "filesystem created");
        Ok(Self {
            registry: Arc::new(ResourceRegistry::new(config.capture_stack_traces)),
            faults: FaultInjector::new(config.faults.clone()),
            traits,
            clock,
            state: Mutex::new(state),
            lock_released: Condvar::new(),
            config,
        })
    }

    /// Configuration the filesystem was built from
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Behavior of the emulated platform
    pub fn traits(&self) -> &ProfileTraits {
        &self.traits
    }

    fn now(&self) -> SystemTime {
        self.clock.now()
    }

    fn parse(&self, path: &str) -> FsResult<FsPath> {
        FsPath::parse(&self.traits, path)
    }

    fn resolve_in(&self, state: &FsState, path: &FsPath, follow: bool) -> FsResult<ResolvedPath> {
        resolve(
            &state.nodes,
            &self.traits,
            path,
            follow,
            self.config.max_symlink_hops,
        )
    }

    fn modify_count(&self) -> u32 {
        match self.traits.modify_count {
            ModifyCount::PerOperation => 1,
            ModifyCount::PerChange => 2,
        }
    }

    fn check_access(&self, node: &Node, reads: bool, writes: bool) -> FsResult<()> {
        if writes && node.dos.readonly {
            return Err(FsError::AccessDenied);
        }
        if self.config.security.enforce_permissions
            && ((reads && node.mode & 0o400 == 0) || (writes && node.mode & 0o200 == 0))
        {
            return Err(FsError::AccessDenied);
        }
        Ok(())
    }

    /// Resolve a path against the current tree
    pub fn resolve(&self, path: &str, follow_links: bool) -> FsResult<ResolvedPath> {
        let path = self.parse(path)?;
        let state = self.state.lock();
        self.resolve_in(&state, &path, follow_links)
    }

    // Structural operations

    /// Creates an empty directory. The parent must already exist.
    pub fn create_directory(&self, path: &str) -> FsResult<()> {
        let fs_path = self.parse(path)?;
        let mut state = self.state.lock();
        let resolved = self.resolve_in(&state, &fs_path, false)?;
        let (parent, name) = creation_slot(&resolved)?;
        let now = self.now();
        let id = state
            .nodes
            .create_directory(parent, &self.config.security, now);
        if let Err(err) = state.link_entry(parent, &name, id, now) {
            state.nodes.remove(id);
            return Err(err);
        }
        tracing::debug!(path, "directory created");
        Ok(())
    }

    /// Creates an empty regular file
    pub fn create_file(&self, path: &str) -> FsResult<()> {
        let options = OpenOptions {
            write: true,
            create_new: true,
            ..OpenOptions::default()
        };
        let handle = self.open(path, &options)?;
        self.close(handle)
    }

    /// Creates a symbolic link at `path`; `target` is stored unresolved.
    pub fn create_symlink(&self, path: &str, target: &str) -> FsResult<()> {
        if !self.config.security.allow_symlinks {
            return Err(FsError::AccessDenied);
        }
        if target.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        // names in the target must be storable, the target itself need not exist
        self.parse(target)?;
        let fs_path = self.parse(path)?;
        let mut state = self.state.lock();
        let resolved = self.resolve_in(&state, &fs_path, false)?;
        let (parent, name) = creation_slot(&resolved)?;
        let now = self.now();
        let id = state
            .nodes
            .create_symlink(target, &self.config.security, now);
        state.nodes.live_mut(id)?.dirty.metadata = true;
        if let Err(err) = state.link_entry(parent, &name, id, now) {
            state.nodes.remove(id);
            return Err(err);
        }
        tracing::debug!(path, target, "symlink created");
        Ok(())
    }

    /// Hard link `path` to the node `existing` resolves to
    pub fn create_link(&self, path: &str, existing: &str) -> FsResult<()> {
        let link_path = self.parse(path)?;
        let existing_path = self.parse(existing)?;
        let mut state = self.state.lock();
        let source = self.resolve_in(&state, &existing_path, true)?.existing()?;
        if state.nodes.live(source)?.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let resolved = self.resolve_in(&state, &link_path, false)?;
        let (parent, name) = creation_slot(&resolved)?;
        state.link_entry(parent, &name, source, self.now())?;
        tracing::debug!(path, existing, "hard link created");
        Ok(())
    }

    /// Removes a file, symlink or empty directory
    pub fn delete(&self, path: &str) -> FsResult<()> {
        let fs_path = self.parse(path)?;
        let mut state = self.state.lock();
        let resolved = self.resolve_in(&state, &fs_path, false)?;
        let id = resolved.existing()?;
        let (Some(parent), Some(name)) = (resolved.parent, resolved.final_name.clone()) else {
            return Err(FsError::AccessDenied);
        };
        let node = state.nodes.live(id)?;
        if node.entries().is_some_and(|entries| !entries.is_empty()) {
            return Err(FsError::DirectoryNotEmpty);
        }
        if !self.traits.delete_open_files && node.open_handles > 0 {
            return Err(FsError::AccessDenied);
        }
        state.unlink_entry(parent, &name, self.now())?;
        tracing::debug!(path, "deleted");
        Ok(())
    }

    /// Moves `source` to `target`. With `replace`, an existing target of a
    /// compatible type is deleted first.
    pub fn rename(&self, source: &str, target: &str, replace: bool) -> FsResult<()> {
        let source_path = self.parse(source)?;
        let target_path = self.parse(target)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let src = self.resolve_in(state, &source_path, false)?;
        let src_id = src.existing()?;
        let (Some(src_parent), Some(src_name)) = (src.parent, src.final_name.clone()) else {
            return Err(FsError::AccessDenied);
        };
        let dst = self.resolve_in(state, &target_path, false)?;
        if dst.target.is_some() && dst.parent.is_none() {
            return Err(FsError::AccessDenied);
        }
        let (Some(dst_parent), Some(dst_name)) = (dst.parent, dst.final_name.clone()) else {
            return Err(dst.existing().err().unwrap_or(FsError::NotFound));
        };
        if !dst.has_valid_parent {
            return Err(dst.existing().err().unwrap_or(FsError::NotFound));
        }
        let now = self.now();

        if dst.target == Some(src_id) {
            // same inode: only a case-only rename of one entry changes anything
            let requested = target_path.file_name().unwrap_or(dst_name.as_str());
            if src_parent == dst_parent && src_name != requested {
                state.nodes.dir_mut(src_parent)?.respell(&src_name, requested)?;
                state.touch_dir(src_parent, now)?;
                state.notify(src_parent, WatchEventKind::Delete, &src_name, 1);
                state.notify(src_parent, WatchEventKind::Create, requested, 1);
            }
            return Ok(());
        }

        let src_is_dir = state.nodes.live(src_id)?.is_dir();
        if src_is_dir && state.nodes.is_ancestor(src_id, dst_parent) {
            return Err(FsError::InvalidArgument);
        }
        if let Some(existing) = dst.target {
            if !replace {
                return Err(FsError::AlreadyExists);
            }
            let node = state.nodes.live(existing)?;
            match (src_is_dir, node.entries()) {
                (true, None) => return Err(FsError::NotADirectory),
                (false, Some(_)) => return Err(FsError::IsADirectory),
                (true, Some(entries)) if !entries.is_empty() => {
                    return Err(FsError::DirectoryNotEmpty)
                }
                _ => {}
            }
            if !self.traits.delete_open_files && node.open_handles > 0 {
                return Err(FsError::AccessDenied);
            }
            state.unlink_entry(dst_parent, &dst_name, now)?;
        }

        let (old_name, _) = state.nodes.dir_mut(src_parent)?.remove(&src_name)?;
        state.nodes.dir_mut(dst_parent)?.insert(&dst_name, src_id)?;
        if src_is_dir {
            state.nodes.live_mut(src_id)?.parent = Some(dst_parent);
        }
        state.touch_dir(src_parent, now)?;
        state.touch_dir(dst_parent, now)?;
        state.notify(src_parent, WatchEventKind::Delete, &old_name, 1);
        state.notify(dst_parent, WatchEventKind::Create, &dst_name, 1);

        for handle in state.handles.handles.values_mut() {
            if let HandleType::File(cursor) = &mut handle.kind {
                if let Some(origin) = cursor.origin.as_mut() {
                    if origin.dir == src_parent && origin.name == old_name {
                        origin.dir = dst_parent;
                        origin.name = dst_name.clone();
                    }
                }
            }
        }
        tracing::debug!(source, target, "renamed");
        Ok(())
    }

    /// Copies a file's content (or creates an empty directory for a
    /// directory source) at `target`.
    pub fn copy(&self, source: &str, target: &str, replace: bool) -> FsResult<()> {
        let source_path = self.parse(source)?;
        let target_path = self.parse(target)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let src_id = self.resolve_in(state, &source_path, true)?.existing()?;
        let dst = self.resolve_in(state, &target_path, false)?;
        if dst.target == Some(src_id) {
            return Ok(());
        }
        if let Some(existing) = dst.target {
            if !replace {
                return Err(FsError::AlreadyExists);
            }
            if existing == state.nodes.root() {
                return Err(FsError::AccessDenied);
            }
            let node = state.nodes.live(existing)?;
            if node.entries().is_some_and(|entries| !entries.is_empty()) {
                return Err(FsError::DirectoryNotEmpty);
            }
            if !self.traits.delete_open_files && node.open_handles > 0 {
                return Err(FsError::AccessDenied);
            }
        }
        let (Some(parent), Some(name)) = (dst.parent, dst.final_name.clone()) else {
            return Err(dst.existing().err().unwrap_or(FsError::NotFound));
        };
        if !dst.has_valid_parent {
            return Err(dst.existing().err().unwrap_or(FsError::NotFound));
        }
        self.faults.check(FaultOp::Create)?;

        let now = self.now();
        let source_node = state.nodes.live(src_id)?;
        let mode = source_node.mode;
        let data = source_node.content().map(|content| content.bytes().to_vec());
        // A replaced file that dies with its last link gives its space to the copy.
        let reclaimed = match dst.target {
            Some(existing) => state.take_doomed_content(existing)?,
            None => None,
        };
        let id = match data {
            Some(data) => {
                let id = state.nodes.create_file(&self.config.security, now);
                let mut content = FileContent::default();
                if let Err(err) = content.replace(data, &mut state.quota) {
                    state.nodes.remove(id);
                    state.restore_content(dst.target, reclaimed)?;
                    return Err(err);
                }
                state.nodes.live_mut(id)?.kind = NodeKind::File { content };
                id
            }
            None => state
                .nodes
                .create_directory(parent, &self.config.security, now),
        };
        {
            let node = state.nodes.live_mut(id)?;
            node.mode = mode;
            node.dirty.content = true;
            node.dirty.metadata = true;
        }
        if dst.target.is_some() {
            if let Err(err) = state.unlink_entry(parent, &name, now) {
                state.maybe_destroy(id)?;
                state.restore_content(dst.target, reclaimed)?;
                return Err(err);
            }
        }
        if let Err(err) = state.link_entry(parent, &name, id, now) {
            state.maybe_destroy(id)?;
            return Err(err);
        }
        tracing::debug!(source, target, "copied");
        Ok(())
    }

    /// Target text of a symbolic link
    pub fn read_link(&self, path: &str) -> FsResult<String> {
        let fs_path = self.parse(path)?;
        let state = self.state.lock();
        let id = self.resolve_in(&state, &fs_path, false)?.existing()?;
        match &state.nodes.live(id)?.kind {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(FsError::NotLink),
        }
    }

    /// Whether `path` resolves, following links
    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path, true)
            .map(|resolved| resolved.target.is_some())
            .unwrap_or(false)
    }

    /// Canonical path with every symlink followed
    pub fn real_path(&self, path: &str) -> FsResult<String> {
        let resolved = self.resolve(path, true)?;
        resolved.existing()?;
        Ok(resolved.render(&self.traits))
    }

    /// Snapshot of a directory's entries in creation order
    pub fn list_directory(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let fs_path = self.parse(path)?;
        let state = self.state.lock();
        let id = self.resolve_in(&state, &fs_path, true)?.existing()?;
        Self::snapshot_entries(&state.nodes, id, None)
    }

    fn snapshot_entries(
        nodes: &NodeStore,
        dir: NodeId,
        matcher: Option<&PathMatcher>,
    ) -> FsResult<Vec<DirEntry>> {
        let table = nodes.dir(dir)?;
        let mut entries = Vec::with_capacity(table.len());
        for (name, child) in table.iter() {
            if matcher.is_some_and(|matcher| !matcher.matches(name)) {
                continue;
            }
            entries.push(DirEntry {
                name: name.to_string(),
                file_type: nodes.live(child)?.file_type(),
            });
        }
        Ok(entries)
    }

    // Channels

    /// Opens (or creates, per `options`) a file and returns its handle
    pub fn open(&self, path: &str, options: &OpenOptions) -> FsResult<HandleId> {
        let fs_path = self.parse(path)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let resolved = self.resolve_in(state, &fs_path, options.follow_links)?;
        let writes = options.writes();
        let now = self.now();
        let sync_mode = SyncMode::of(options);

        let node_id = match resolved.target {
            Some(id) => {
                if options.create_new && (writes || !self.traits.lenient_create_new) {
                    return Err(FsError::AlreadyExists);
                }
                let node = state.nodes.live(id)?;
                if resolved.symlink_terminal {
                    return Err(FsError::TooManyLinks);
                }
                if node.is_dir() && writes {
                    return Err(FsError::IsADirectory);
                }
                if node.pending_delete {
                    return Err(FsError::AccessDenied);
                }
                self.check_access(node, options.reads(), writes)?;
                id
            }
            None => {
                if !(writes && (options.create || options.create_new)) {
                    return Err(resolved.existing().err().unwrap_or(FsError::NotFound));
                }
                let (parent, name) = creation_slot(&resolved)?;
                self.faults.check(FaultOp::Create)?;
                let id = state.nodes.create_file(&self.config.security, now);
                sync_mode.apply(&mut state.nodes.live_mut(id)?.dirty, true, true);
                if let Err(err) = state.link_entry(parent, &name, id, now) {
                    state.nodes.remove(id);
                    return Err(err);
                }
                tracing::debug!(path, "file created");
                id
            }
        };

        if options.delete_on_close && state.nodes.live(node_id)?.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let origin = match (resolved.parent, resolved.final_name.clone()) {
            (Some(dir), Some(name)) => Some(Origin { dir, name }),
            _ => None,
        };

        if options.truncate && writes {
            let node = state.nodes.live_mut(node_id)?;
            if let NodeKind::File { content } = &mut node.kind {
                if content.truncate(0, &mut state.quota) {
                    node.times.modified = now;
                    sync_mode.apply(&mut node.dirty, true, true);
                    let count = self.modify_count();
                    state.notify_modify(origin.as_ref(), node_id, count);
                }
            }
        }

        let mut cursor = FileCursor::new(options.clone(), origin);
        state.nodes.live_mut(node_id)?.open_handles += 1;

        if options.delete_on_close {
            match self.traits.delete_on_close {
                DeleteOnClose::UnlinkOnOpen => {
                    if let Some(origin) = cursor.origin.take() {
                        if let Err(err) = state.unlink_entry(origin.dir, &origin.name, now) {
                            let node = state.nodes.live_mut(node_id)?;
                            node.open_handles -= 1;
                            return Err(err);
                        }
                    }
                }
                DeleteOnClose::RemoveOnLastClose => {
                    let node = state.nodes.live_mut(node_id)?;
                    node.pending_delete = true;
                    node.delete_on_close_handles += 1;
                    cursor.delete_on_close = true;
                }
            }
        }

        let handle_id = state.handles.insert(Handle {
            node_id,
            kind: HandleType::File(cursor),
        });
        self.registry
            .register(ResourceKey::Channel(handle_id), format!("channel on {path}"));
        tracing::debug!(path, handle = handle_id.0, "opened");
        Ok(handle_id)
    }

    /// Whether `handle_id` still names an open handle
    pub fn is_open(&self, handle_id: HandleId) -> bool {
        self.state.lock().handles.handles.contains_key(&handle_id)
    }

    /// Reads at the cursor and advances it. `None` signals end of file.
    pub fn read(&self, handle_id: HandleId, buf: &mut [u8]) -> FsResult<Option<usize>> {
        self.read_impl(handle_id, None, buf)
    }

    /// Reads at `offset` without moving the cursor
    pub fn read_at(&self, handle_id: HandleId, offset: u64, buf: &mut [u8]) -> FsResult<Option<usize>> {
        self.read_impl(handle_id, Some(offset), buf)
    }

    fn read_impl(&self, handle_id: HandleId, at: Option<u64>, buf: &mut [u8]) -> FsResult<Option<usize>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (node_id, cursor) = state.handles.cursor_mut(handle_id)?;
        if !cursor.options.reads() {
            return Err(FsError::NonReadable);
        }
        self.faults.check(FaultOp::Read)?;
        let node = state.nodes.live_mut(node_id)?;
        let NodeKind::File { content } = &node.kind else {
            return Err(FsError::IsADirectory);
        };
        let offset = at.unwrap_or(cursor.position);
        let read = content.read_at(offset, buf);
        if let Some(count) = read {
            if at.is_none() {
                cursor.position = offset + count as u64;
            }
        }
        node.times.accessed = self.now();
        Ok(read)
    }

    /// Writes at the cursor (or at the end for append handles) and advances it
    pub fn write(&self, handle_id: HandleId, data: &[u8]) -> FsResult<usize> {
        self.write_impl(handle_id, None, data)
    }

    /// Writes at `offset` without moving the cursor
    pub fn write_at(&self, handle_id: HandleId, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.write_impl(handle_id, Some(offset), data)
    }

    fn write_impl(&self, handle_id: HandleId, at: Option<u64>, data: &[u8]) -> FsResult<usize> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (node_id, cursor) = state.handles.cursor_mut(handle_id)?;
        if !cursor.options.writes() {
            return Err(FsError::NonWritable);
        }
        self.faults.check(FaultOp::Write)?;
        let node = state.nodes.live_mut(node_id)?;
        let NodeKind::File { content } = &mut node.kind else {
            return Err(FsError::IsADirectory);
        };
        let offset = match at {
            Some(offset) => offset,
            None if cursor.options.append => content.size(),
            None => cursor.position,
        };
        let written = content.write_at(offset, data, &mut state.quota)?;
        if at.is_none() {
            cursor.position = offset + written as u64;
        }
        if written == 0 {
            return Ok(0);
        }
        node.times.modified = self.now();
        SyncMode::of(&cursor.options).apply(&mut node.dirty, true, true);
        let origin = cursor.origin.clone();
        state.notify_modify(origin.as_ref(), node_id, self.modify_count());
        tracing::trace!(handle = handle_id.0, offset, written, "write");
        Ok(written)
    }

    /// Current byte position of a file handle
    pub fn position(&self, handle_id: HandleId) -> FsResult<u64> {
        let mut state = self.state.lock();
        let (_, cursor) = state.handles.cursor_mut(handle_id)?;
        Ok(cursor.position)
    }

    /// Moves a file handle; positions past the end are allowed
    pub fn set_position(&self, handle_id: HandleId, position: u64) -> FsResult<()> {
        let mut state = self.state.lock();
        let (_, cursor) = state.handles.cursor_mut(handle_id)?;
        cursor.position = position;
        Ok(())
    }

    /// Size of the file behind a handle
    pub fn size(&self, handle_id: HandleId) -> FsResult<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (node_id, _) = state.handles.cursor_mut(handle_id)?;
        Ok(state.nodes.live(node_id)?.size())
    }

    /// Shrinks the file to `size`; a larger size is a no-op. The cursor is
    /// pulled back to the new end if it was past it.
    pub fn truncate(&self, handle_id: HandleId, size: u64) -> FsResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (node_id, cursor) = state.handles.cursor_mut(handle_id)?;
        if !cursor.options.writes() {
            return Err(FsError::NonWritable);
        }
        self.faults.check(FaultOp::Truncate)?;
        let node = state.nodes.live_mut(node_id)?;
        let NodeKind::File { content } = &mut node.kind else {
            return Err(FsError::IsADirectory);
        };
        let changed = content.truncate(size, &mut state.quota);
        cursor.position = cursor.position.min(size);
        if changed {
            node.times.modified = self.now();
            SyncMode::of(&cursor.options).apply(&mut node.dirty, true, true);
            let origin = cursor.origin.clone();
            state.notify_modify(origin.as_ref(), node_id, self.modify_count());
        }
        Ok(())
    }

    /// fsync (`metadata_only == false`) or fdatasync-style flush
    pub fn force(&self, handle_id: HandleId, metadata_only: bool) -> FsResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (node_id, _) = state.handles.cursor_mut(handle_id)?;
        self.faults.check(FaultOp::Force)?;
        state.nodes.live_mut(node_id)?.dirty.force(metadata_only);
        Ok(())
    }

    fn try_lock_in(&self, state: &mut FsState, handle_id: HandleId, range: LockRange) -> FsResult<Option<FileLock>> {
        let (node_id, cursor) = state.handles.cursor_mut(handle_id)?;
        match range.kind {
            LockKind::Shared if !cursor.options.reads() => return Err(FsError::NonReadable),
            LockKind::Exclusive if !cursor.options.writes() => return Err(FsError::NonWritable),
            _ => {}
        }
        match state.locks.check(node_id, handle_id, &range) {
            LockCheck::SameHandleOverlap => Err(FsError::OverlappingLock),
            LockCheck::Conflict => Ok(None),
            LockCheck::Grantable => {
                let lock = state.locks.insert(node_id, handle_id, range);
                cursor.locks.push(lock.id);
                self.registry.register(
                    ResourceKey::Lock(lock.id),
                    format!(
                        "{:?} lock [{}, {}) held by channel #{}",
                        range.kind,
                        range.offset,
                        range.end(),
                        handle_id.0
                    ),
                );
                Ok(Some(lock))
            }
        }
    }

    /// Acquires a byte-range lock without waiting; `None` when another
    /// handle holds a conflicting lock.
    pub fn try_lock(&self, handle_id: HandleId, range: LockRange) -> FsResult<Option<FileLock>> {
        let mut state = self.state.lock();
        self.try_lock_in(&mut state, handle_id, range)
    }

    /// Acquires a byte-range lock, waiting while another handle holds a
    /// conflicting one. Closing the handle ends the wait with `ClosedChannel`.
    pub fn lock(&self, handle_id: HandleId, range: LockRange) -> FsResult<FileLock> {
        let mut state = self.state.lock();
        loop {
            if let Some(lock) = self.try_lock_in(&mut state, handle_id, range)? {
                return Ok(lock);
            }
            tracing::trace!(handle = handle_id.0, offset = range.offset, "waiting for lock");
            self.lock_released.wait(&mut state);
        }
    }

    /// Releasing a lock that is no longer held is a no-op
    pub fn release_lock(&self, lock: &FileLock) -> FsResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.locks.is_held(lock.id) {
            return Ok(());
        }
        let (_, cursor) = state.handles.cursor_mut(lock.handle)?;
        if state.locks.release(lock.id).is_some() {
            cursor.locks.retain(|id| *id != lock.id);
            self.registry.remove(ResourceKey::Lock(lock.id));
            self.lock_released.notify_all();
        }
        Ok(())
    }

    /// Whether `lock` is still held
    pub fn is_lock_valid(&self, lock: &FileLock) -> bool {
        self.state.lock().locks.is_held(lock.id)
    }

    /// Closes a channel or directory stream. Closing twice is a no-op.
    pub fn close(&self, handle_id: HandleId) -> FsResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(handle) = state.handles.handles.remove(&handle_id) else {
            return Ok(());
        };
        let node_id = handle.node_id;
        let now = self.now();
        match handle.kind {
            HandleType::File(cursor) => {
                for id in state.locks.release_handle(node_id, handle_id) {
                    self.registry.remove(ResourceKey::Lock(id));
                }
                self.lock_released.notify_all();
                self.registry.remove(ResourceKey::Channel(handle_id));

                let node = state.nodes.live_mut(node_id)?;
                node.open_handles = node.open_handles.saturating_sub(1);
                if cursor.delete_on_close {
                    node.delete_on_close_handles = node.delete_on_close_handles.saturating_sub(1);
                    if node.delete_on_close_handles == 0 {
                        node.pending_delete = false;
                        if let Some(origin) = &cursor.origin {
                            let still_named = state
                                .nodes
                                .dir(origin.dir)
                                .ok()
                                .and_then(|table| table.lookup(&origin.name))
                                .is_some_and(|(_, id)| id == node_id);
                            if still_named {
                                state.unlink_entry(origin.dir, &origin.name, now)?;
                            }
                        }
                    }
                }
            }
            HandleType::Directory { .. } => {
                self.registry.remove(ResourceKey::DirectoryStream(handle_id));
                let node = state.nodes.live_mut(node_id)?;
                node.open_handles = node.open_handles.saturating_sub(1);
            }
        }
        if state.nodes.contains(node_id) {
            state.maybe_destroy(node_id)?;
        }
        tracing::debug!(handle = handle_id.0, "closed");
        Ok(())
    }

    // Directory streams

    /// Opens a single-pass stream over a directory, optionally filtered by a
    /// glob on entry names.
    pub fn open_directory(&self, path: &str, glob: Option<&str>) -> FsResult<HandleId> {
        let matcher = glob
            .map(|pattern| PathMatcher::glob(&self.traits, pattern))
            .transpose()?;
        let fs_path = self.parse(path)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let id = self.resolve_in(state, &fs_path, true)?.existing()?;
        let entries = Self::snapshot_entries(&state.nodes, id, matcher.as_ref())?;
        state.nodes.live_mut(id)?.open_handles += 1;
        let handle_id = state.handles.insert(Handle {
            node_id: id,
            kind: HandleType::Directory {
                position: 0,
                entries,
            },
        });
        self.registry.register(
            ResourceKey::DirectoryStream(handle_id),
            format!("directory stream on {path}"),
        );
        Ok(handle_id)
    }

    /// Next entry of a directory stream, `None` once exhausted
    pub fn next_entry(&self, handle_id: HandleId) -> FsResult<Option<DirEntry>> {
        let mut state = self.state.lock();
        let (position, entries) = state.handles.stream_mut(handle_id)?;
        let entry = entries.get(*position).cloned();
        if entry.is_some() {
            *position += 1;
        }
        Ok(entry)
    }

    /// Closes a directory stream
    pub fn close_directory(&self, handle_id: HandleId) -> FsResult<()> {
        {
            let state = self.state.lock();
            if let Some(handle) = state.handles.handles.get(&handle_id) {
                if !matches!(handle.kind, HandleType::Directory { .. }) {
                    return Err(FsError::InvalidArgument);
                }
            }
        }
        self.close(handle_id)
    }

    // Attributes

    /// Basic attributes of `path`
    pub fn getattr(&self, path: &str, follow_links: bool) -> FsResult<Attributes> {
        let fs_path = self.parse(path)?;
        let state = self.state.lock();
        let id = self.resolve_in(&state, &fs_path, follow_links)?.existing()?;
        Ok(state.nodes.live(id)?.attributes())
    }

    /// Bulk read, `view:*` or `view:a,b`
    pub fn read_attributes(
        &self,
        path: &str,
        spec: &str,
        follow_links: bool,
    ) -> FsResult<BTreeMap<String, AttrValue>> {
        let fs_path = self.parse(path)?;
        let state = self.state.lock();
        let id = self.resolve_in(&state, &fs_path, follow_links)?.existing()?;
        attrs::read(&self.traits, state.nodes.live(id)?, spec)
    }

    /// Reads one attribute named `[view:]name`
    pub fn get_attribute(&self, path: &str, spec: &str, follow_links: bool) -> FsResult<AttrValue> {
        let fs_path = self.parse(path)?;
        let state = self.state.lock();
        let id = self.resolve_in(&state, &fs_path, follow_links)?.existing()?;
        attrs::get(&self.traits, state.nodes.live(id)?, spec)
    }

    /// Writes one attribute named `[view:]name`
    pub fn set_attribute(
        &self,
        path: &str,
        spec: &str,
        value: AttrValue,
        follow_links: bool,
    ) -> FsResult<()> {
        self.update_metadata(path, follow_links, |traits, node| {
            attrs::set(traits, node, spec, value)
        })
    }

    /// Sets the timestamps given in `times`; the rest are left as they are.
    pub fn set_times(&self, path: &str, times: FileTimes) -> FsResult<()> {
        self.update_metadata(path, true, |_, node| {
            node.times = times;
            Ok(())
        })
    }

    fn update_metadata(
        &self,
        path: &str,
        follow_links: bool,
        update: impl FnOnce(&ProfileTraits, &mut Node) -> FsResult<()>,
    ) -> FsResult<()> {
        let fs_path = self.parse(path)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let resolved = self.resolve_in(state, &fs_path, follow_links)?;
        let id = resolved.existing()?;
        let node = state.nodes.live_mut(id)?;
        update(&self.traits, &mut *node)?;
        node.dirty.metadata = true;
        let origin = match (resolved.parent, resolved.final_name) {
            (Some(dir), Some(name)) => Some(Origin { dir, name }),
            _ => None,
        };
        state.notify_modify(origin.as_ref(), id, 1);
        Ok(())
    }

    // Watch service

    /// A new watch service tied to this filesystem
    pub fn new_watch_service(&self) -> WatchService {
        let mut state = self.state.lock();
        let id = state.next_watch_service;
        state.next_watch_service += 1;
        self.registry
            .register(ResourceKey::WatchService(id), format!("watch service #{id}"));
        WatchService::new(id, Arc::clone(&self.registry))
    }

    /// Registers the directory at `path` with `service`
    pub fn register_watch(
        &self,
        service: &WatchService,
        path: &str,
        kinds: &[WatchEventKind],
    ) -> FsResult<WatchKey> {
        if service.is_closed() {
            return Err(FsError::ClosedWatcher);
        }
        if kinds.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let fs_path = self.parse(path)?;
        let mut state = self.state.lock();
        let resolved = self.resolve_in(&state, &fs_path, true)?;
        let id = resolved.existing()?;
        if !state.nodes.live(id)?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let key = WatchKey::new(service, resolved.render(&self.traits), kinds);
        state.prune_watches();
        state.watches.entry(id).or_default().push(key.clone());
        tracing::debug!(path, key = key.id(), service = service.id(), "watch registered");
        Ok(key)
    }

    // Sync tracking

    /// Whether `path` has changes not yet synced
    pub fn is_dirty(&self, path: &str) -> FsResult<bool> {
        let fs_path = self.parse(path)?;
        let state = self.state.lock();
        let id = self.resolve_in(&state, &fs_path, false)?.existing()?;
        Ok(state.nodes.live(id)?.dirty.is_dirty())
    }

    /// Flushes one node
    pub fn sync_path(&self, path: &str) -> FsResult<()> {
        let fs_path = self.parse(path)?;
        let mut state = self.state.lock();
        let id = self.resolve_in(&state, &fs_path, false)?.existing()?;
        state.nodes.live_mut(id)?.dirty.clear();
        Ok(())
    }

    /// Flushes every node, linked or not
    pub fn sync_all(&self) {
        let mut state = self.state.lock();
        let ids: Vec<NodeId> = state.nodes.iter().map(|node| node.id).collect();
        for id in ids {
            if let Ok(node) = state.nodes.get_mut(id) {
                node.dirty.clear();
            }
        }
    }

    /// Fails with `NotSynced` if `path` has unsynced changes
    pub fn assert_synced(&self, path: &str) -> FsResult<()> {
        if self.is_dirty(path)? {
            return Err(FsError::NotSynced(self.display_path(path)));
        }
        Ok(())
    }

    /// Fails with the first unsynced path below (and including) `path`
    pub fn assert_tree_synced(&self, path: &str) -> FsResult<()> {
        let fs_path = self.parse(path)?;
        let state = self.state.lock();
        let resolved = self.resolve_in(&state, &fs_path, false)?;
        let id = resolved.existing()?;
        match first_unsynced(&state.nodes, id, resolved.steps.clone())? {
            Some(names) => Err(FsError::NotSynced(render_names(&self.traits, true, &names))),
            None => Ok(()),
        }
    }

    fn display_path(&self, path: &str) -> String {
        self.resolve(path, false)
            .map(|resolved| resolved.render(&self.traits))
            .unwrap_or_else(|_| path.to_string())
    }

    /// Verifies link counts, liveness and quota accounting
    pub fn check_invariants(&self) -> FsResult<()> {
        let state = self.state.lock();
        let root = state.nodes.root();
        let mut references: HashMap<NodeId, u32> = HashMap::new();
        let mut used = 0u64;
        for node in state.nodes.iter() {
            if let Some(entries) = node.entries() {
                for (name, child) in entries.iter() {
                    if !state.nodes.contains(child) {
                        return Err(FsError::Internal(format!(
                            "entry {name} in node {} names a missing node",
                            node.id.as_u64()
                        )));
                    }
                    *references.entry(child).or_default() += 1;
                }
            }
            if let Some(content) = node.content() {
                used += content.size();
            }
        }
        for node in state.nodes.iter() {
            let expected = references.get(&node.id).copied().unwrap_or(0) + u32::from(node.id == root);
            if node.nlink != expected {
                return Err(FsError::Internal(format!(
                    "node {} has link count {} but {} entries",
                    node.id.as_u64(),
                    node.nlink,
                    expected
                )));
            }
            if expected == 0 && node.open_handles == 0 {
                return Err(FsError::Internal(format!(
                    "node {} is neither linked nor open",
                    node.id.as_u64()
                )));
            }
        }
        if used != state.quota.used() {
            return Err(FsError::Internal(format!(
                "quota counts {} bytes, content holds {used}",
                state.quota.used()
            )));
        }
        Ok(())
    }

    // Store view, statistics, diagnostics

    /// Space accounting of the backing store
    pub fn store(&self) -> StoreInfo {
        let state = self.state.lock();
        StoreInfo {
            total_space: state.quota.total(),
            usable_space: state.quota.usable(),
            unallocated_space: state.quota.usable(),
            used_space: state.quota.used(),
        }
    }

    /// Point-in-time counters of the store
    pub fn stats(&self) -> FsStats {
        let state = self.state.lock();
        FsStats {
            nodes: state.nodes.len() as u64,
            open_handles: state.handles.count(false),
            open_streams: state.handles.count(true),
            held_locks: state.locks.held_count() as u32,
            used_bytes: state.quota.used(),
        }
    }

    /// Replaces the fault injection policy
    pub fn set_fault_policy(&self, policy: FaultPolicy) {
        self.faults.set_policy(policy);
    }

    /// Current fault injection policy
    pub fn fault_policy(&self) -> FaultPolicy {
        self.faults.policy()
    }

    /// Resources that have not been released yet
    pub fn open_resources(&self) -> Vec<OpenResource> {
        self.registry.snapshot()
    }

    /// Fails with a report listing anything still open
    pub fn check_no_open_resources(&self) -> Result<(), LeakReport> {
        self.registry.check_empty()
    }
}
