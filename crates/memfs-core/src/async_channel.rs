// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Asynchronous file channels.
//!
//! Every operation runs on the runtime's blocking pool against the shared
//! [`FsCore`]; its result, success or failure, arrives through the returned
//! future or the supplied callback.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{FsError, FsResult};
use crate::types::{FileLock, HandleId, LockRange, OpenOptions};
use crate::vfs::FsCore;

pub struct AsyncFileChannel {
    core: Arc<FsCore>,
    handle: HandleId,
    runtime: Handle,
}

impl std::fmt::Debug for AsyncFileChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFileChannel")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl AsyncFileChannel {
    /// Opens `path` using the ambient tokio runtime for completions
    pub fn open(core: Arc<FsCore>, path: &str, options: &OpenOptions) -> FsResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|err| FsError::Internal(format!("no tokio runtime: {err}")))?;
        Self::open_with_runtime(core, path, options, runtime)
    }

    pub fn open_with_runtime(
        core: Arc<FsCore>,
        path: &str,
        options: &OpenOptions,
        runtime: Handle,
    ) -> FsResult<Self> {
        let handle = core.open(path, options)?;
        Ok(Self {
            core,
            handle,
            runtime,
        })
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open(self.handle)
    }

    /// Closes the underlying handle; operations submitted afterwards
    /// complete with `ClosedChannel`.
    pub fn close(&self) -> FsResult<()> {
        self.core.close(self.handle)
    }

    fn spawn<T, F>(&self, op: F) -> JoinHandle<FsResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&FsCore, HandleId) -> FsResult<T> + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        let handle = self.handle;
        self.runtime.spawn_blocking(move || op(&core, handle))
    }

    async fn submit<T, F>(&self, op: F) -> FsResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&FsCore, HandleId) -> FsResult<T> + Send + 'static,
    {
        self.spawn(op)
            .await
            .map_err(|err| FsError::Internal(format!("channel worker failed: {err}")))?
    }

    /// Reads up to `len` bytes at `position`; `None` at end of file
    pub async fn read(&self, position: u64, len: usize) -> FsResult<Option<Vec<u8>>> {
        self.submit(move |core, handle| read_at(core, handle, position, len))
            .await
    }

    pub async fn write(&self, position: u64, data: Vec<u8>) -> FsResult<usize> {
        self.submit(move |core, handle| core.write_at(handle, position, &data))
            .await
    }

    pub async fn size(&self) -> FsResult<u64> {
        self.submit(|core, handle| core.size(handle)).await
    }

    pub async fn truncate(&self, size: u64) -> FsResult<()> {
        self.submit(move |core, handle| core.truncate(handle, size))
            .await
    }

    pub async fn force(&self, metadata_only: bool) -> FsResult<()> {
        self.submit(move |core, handle| core.force(handle, metadata_only))
            .await
    }

    /// Waits on a worker thread until the lock is granted
    pub async fn lock(&self, range: LockRange) -> FsResult<FileLock> {
        self.submit(move |core, handle| core.lock(handle, range))
            .await
    }

    pub async fn try_lock(&self, range: LockRange) -> FsResult<Option<FileLock>> {
        self.submit(move |core, handle| core.try_lock(handle, range))
            .await
    }

    /// Callback flavor of [`AsyncFileChannel::read`]
    pub fn read_with<C>(&self, position: u64, len: usize, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(FsResult<Option<Vec<u8>>>) + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        let handle = self.handle;
        self.runtime
            .spawn_blocking(move || callback(read_at(&core, handle, position, len)))
    }

    /// Callback flavor of [`AsyncFileChannel::write`]
    pub fn write_with<C>(&self, position: u64, data: Vec<u8>, callback: C) -> JoinHandle<()>
    where
        C: FnOnce(FsResult<usize>) + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        let handle = self.handle;
        self.runtime
            .spawn_blocking(move || callback(core.write_at(handle, position, &data)))
    }
}

fn read_at(core: &FsCore, handle: HandleId, position: u64, len: usize) -> FsResult<Option<Vec<u8>>> {
    let mut buf = vec![0u8; len];
    Ok(core.read_at(handle, position, &mut buf)?.map(|count| {
        buf.truncate(count);
        buf
    }))
}
