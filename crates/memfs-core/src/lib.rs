// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! memfs core: an in-memory filesystem emulating Unix, Windows and Mac
//! semantics for deterministic tests.
//!
//! [`FsCore`] owns the inode graph and every open handle behind a single
//! lock. Paths are resolved by [`resolve`], content lives in per-file
//! buffers accounted against a global quota, and changes are reported to
//! [`WatchService`]s.

pub mod async_channel;
pub mod attrs;
pub mod clock;
pub mod config;
pub mod error;
pub mod fault;
pub mod glob;
pub mod path;
pub mod registry;
pub mod resolve;
pub mod types;
pub mod vfs;
pub mod watch;

mod content;
mod dir;
mod lock;
mod node;
mod quota;
mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use async_channel::AsyncFileChannel;
pub use attrs::{parse_permissions, permissions_to_string, AttrValue};
pub use clock::{Clock, SystemClock};
pub use config::{
    CaseSensitivity, DeleteOnClose, FsConfig, ModifyCount, Profile, ProfileTraits, SecurityPolicy,
    WatchPolicy,
};
pub use error::{FsError, FsResult};
pub use fault::{FaultError, FaultOp, FaultPolicy, FaultRule};
pub use glob::PathMatcher;
pub use path::FsPath;
pub use registry::{LeakReport, OpenResource, ResourceKey};
pub use resolve::ResolvedPath;
pub use types::{
    Attributes, DirEntry, DosFlags, FileLock, FileTimes, FileType, FsStats, HandleId, LockId,
    LockKind, LockRange, NodeId, OpenOptions, StoreInfo,
};
pub use vfs::FsCore;
pub use watch::{WatchEvent, WatchEventKind, WatchKey, WatchService};
