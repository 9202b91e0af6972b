// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory change notification.
//!
//! A [`WatchService`] hands out [`WatchKey`]s, one per registered directory.
//! The filesystem pushes events into keys while holding its state lock; a key
//! that goes from idle to signalled is queued on its service, where `poll` and
//! `take` pick it up. Lock order is filesystem state, then key, then service.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{FsError, FsResult};
use crate::registry::{ResourceKey, ResourceRegistry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Create,
    Delete,
    Modify,
}

/// A pending event, possibly standing for several coalesced changes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub name: String,
    pub count: u32,
}

#[derive(Debug, Default)]
struct KeyState {
    events: Vec<WatchEvent>,
    /// Queued on the service, or handed out and not yet reset
    signalled: bool,
    cancelled: bool,
    directory_gone: bool,
}

#[derive(Debug)]
struct KeyInner {
    id: u64,
    path: String,
    kinds: Vec<WatchEventKind>,
    service: Weak<ServiceInner>,
    state: Mutex<KeyState>,
}

/// Registration of one directory with a watch service
#[derive(Clone, Debug)]
pub struct WatchKey {
    inner: Arc<KeyInner>,
}

impl PartialEq for WatchKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WatchKey {}

impl WatchKey {
    pub(crate) fn new(
        service: &WatchService,
        path: String,
        kinds: &[WatchEventKind],
    ) -> Self {
        let id = service.inner.next_key.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(KeyInner {
                id,
                path,
                kinds: kinds.to_vec(),
                service: Arc::downgrade(&service.inner),
                state: Mutex::new(KeyState::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Path the directory was registered under
    pub fn watchable(&self) -> &str {
        &self.inner.path
    }

    fn service(&self) -> Option<Arc<ServiceInner>> {
        self.inner.service.upgrade()
    }

    pub fn is_valid(&self) -> bool {
        let state = self.inner.state.lock();
        !state.cancelled
            && !state.directory_gone
            && self.service().is_some_and(|service| !service.closed.load(Ordering::Acquire))
    }

    /// Drains the pending events. A cancelled key yields nothing.
    pub fn poll_events(&self) -> Vec<WatchEvent> {
        let mut state = self.inner.state.lock();
        if state.cancelled {
            return Vec::new();
        }
        std::mem::take(&mut state.events)
    }

    /// Re-arms the key. Returns false, and disables the key for good, when
    /// it was cancelled or its directory no longer exists.
    pub fn reset(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.cancelled {
            return false;
        }
        if state.directory_gone {
            state.cancelled = true;
            state.events.clear();
            tracing::debug!(key = self.inner.id, path = %self.inner.path, "watch key disabled, directory gone");
            return false;
        }
        let Some(service) = self.service() else {
            return false;
        };
        if service.closed.load(Ordering::Acquire) {
            return false;
        }
        if state.events.is_empty() {
            state.signalled = false;
        } else {
            state.signalled = true;
            service.enqueue(self.clone());
        }
        true
    }

    /// Idempotent. Wakes a waiter so it can observe the cancellation.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        state.events.clear();
        if !state.signalled {
            state.signalled = true;
            if let Some(service) = self.service() {
                service.enqueue(self.clone());
            }
        }
    }

    pub(crate) fn accepts(&self, kind: WatchEventKind) -> bool {
        self.inner.kinds.contains(&kind)
    }

    /// Records an event, merging it into an unconsumed one of the same kind
    /// and name.
    pub(crate) fn push(&self, kind: WatchEventKind, name: &str, count: u32) {
        if !self.accepts(kind) {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.cancelled || state.directory_gone {
            return;
        }
        match state
            .events
            .iter_mut()
            .find(|event| event.kind == kind && event.name == name)
        {
            Some(event) => event.count = event.count.saturating_add(count),
            None => state.events.push(WatchEvent {
                kind,
                name: name.to_string(),
                count,
            }),
        }
        if !state.signalled {
            state.signalled = true;
            if let Some(service) = self.service() {
                service.enqueue(self.clone());
            }
        }
    }

    /// The watched directory was destroyed
    pub(crate) fn directory_removed(&self) {
        let mut state = self.inner.state.lock();
        if state.cancelled || state.directory_gone {
            return;
        }
        state.directory_gone = true;
        if !state.signalled {
            state.signalled = true;
            if let Some(service) = self.service() {
                service.enqueue(self.clone());
            }
        }
    }
}

#[derive(Debug)]
struct ServiceInner {
    id: u64,
    ready: Mutex<VecDeque<WatchKey>>,
    signal: Condvar,
    closed: AtomicBool,
    next_key: AtomicU64,
    registry: Arc<ResourceRegistry>,
}

impl ServiceInner {
    fn enqueue(&self, key: WatchKey) {
        let mut ready = self.ready.lock();
        ready.push_back(key);
        self.signal.notify_one();
    }
}

/// Consumer side of watch notifications
#[derive(Clone, Debug)]
pub struct WatchService {
    inner: Arc<ServiceInner>,
}

impl WatchService {
    pub(crate) fn new(id: u64, registry: Arc<ResourceRegistry>) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                id,
                ready: Mutex::new(VecDeque::new()),
                signal: Condvar::new(),
                closed: AtomicBool::new(false),
                next_key: AtomicU64::new(1),
                registry,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> FsResult<()> {
        if self.is_closed() {
            return Err(FsError::ClosedWatcher);
        }
        Ok(())
    }

    /// Next signalled key without waiting
    pub fn poll(&self) -> FsResult<Option<WatchKey>> {
        self.ensure_open()?;
        Ok(self.inner.ready.lock().pop_front())
    }

    /// Next signalled key, waiting up to `timeout`
    pub fn poll_timeout(&self, timeout: Duration) -> FsResult<Option<WatchKey>> {
        let deadline = Instant::now() + timeout;
        let mut ready = self.inner.ready.lock();
        loop {
            self.ensure_open()?;
            if let Some(key) = ready.pop_front() {
                return Ok(Some(key));
            }
            if self.inner.signal.wait_until(&mut ready, deadline).timed_out() {
                self.ensure_open()?;
                return Ok(ready.pop_front());
            }
        }
    }

    /// Next signalled key, waiting as long as it takes
    pub fn take(&self) -> FsResult<WatchKey> {
        let mut ready = self.inner.ready.lock();
        loop {
            self.ensure_open()?;
            if let Some(key) = ready.pop_front() {
                return Ok(key);
            }
            self.inner.signal.wait(&mut ready);
        }
    }

    /// Invalidates every key and wakes all waiters. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut ready = self.inner.ready.lock();
        ready.clear();
        self.inner.signal.notify_all();
        drop(ready);
        self.inner
            .registry
            .remove(ResourceKey::WatchService(self.inner.id));
        tracing::debug!(service = self.inner.id, "watch service closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn service() -> WatchService {
        WatchService::new(1, Arc::new(ResourceRegistry::new(false)))
    }

    fn key(service: &WatchService) -> WatchKey {
        WatchKey::new(
            service,
            "/watched".into(),
            &[WatchEventKind::Create, WatchEventKind::Delete, WatchEventKind::Modify],
        )
    }

    #[test]
    fn repeated_events_coalesce_until_consumed() {
        let service = service();
        let key = key(&service);
        key.push(WatchEventKind::Modify, "a", 1);
        key.push(WatchEventKind::Modify, "a", 1);
        key.push(WatchEventKind::Create, "a", 1);

        let signalled = service.poll().expect("open").expect("signalled");
        assert_eq!(signalled, key);
        let events = key.poll_events();
        assert_eq!(
            events,
            vec![
                WatchEvent {
                    kind: WatchEventKind::Modify,
                    name: "a".into(),
                    count: 2
                },
                WatchEvent {
                    kind: WatchEventKind::Create,
                    name: "a".into(),
                    count: 1
                },
            ]
        );
        assert!(key.poll_events().is_empty());
        assert!(key.reset());
        assert!(service.poll().expect("open").is_none());
    }

    #[test]
    fn key_is_queued_once_until_reset() {
        let service = service();
        let key = key(&service);
        key.push(WatchEventKind::Create, "a", 1);
        key.push(WatchEventKind::Create, "b", 1);
        assert!(service.poll().expect("open").is_some());
        assert!(service.poll().expect("open").is_none());

        key.push(WatchEventKind::Delete, "a", 1);
        assert!(key.reset());
        // pending events re-queue the key on reset
        assert_eq!(service.poll().expect("open"), Some(key.clone()));
        assert_eq!(key.poll_events().len(), 3);
    }

    #[test]
    fn unregistered_kinds_are_ignored() {
        let service = service();
        let key = WatchKey::new(&service, "/w".into(), &[WatchEventKind::Delete]);
        key.push(WatchEventKind::Create, "a", 1);
        assert!(service.poll().expect("open").is_none());
        assert!(key.poll_events().is_empty());
    }

    #[test]
    fn take_wakes_on_event_from_another_thread() {
        let service = service();
        let key = key(&service);
        let producer = {
            let key = key.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                key.push(WatchEventKind::Create, "late", 1);
            })
        };
        let taken = service.take().expect("take");
        assert_eq!(taken.poll_events()[0].name, "late");
        producer.join().expect("producer");
    }

    #[test]
    fn poll_timeout_expires_empty() {
        let service = service();
        let _key = key(&service);
        let started = Instant::now();
        assert!(service
            .poll_timeout(Duration::from_millis(30))
            .expect("open")
            .is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cancel_is_idempotent_and_wakes_waiter() {
        let service = service();
        let key = key(&service);
        key.cancel();
        key.cancel();
        let woken = service
            .poll_timeout(Duration::from_secs(1))
            .expect("open")
            .expect("cancelled key is signalled");
        assert!(!woken.is_valid());
        key.push(WatchEventKind::Create, "ignored", 1);
        assert!(woken.poll_events().is_empty());
        assert!(!woken.reset());
    }

    #[test]
    fn reset_fails_once_directory_is_gone() {
        let service = service();
        let key = key(&service);
        key.directory_removed();
        assert!(!key.is_valid());
        assert!(service.poll().expect("open").is_some());
        assert!(!key.reset());
        assert!(!key.reset());
    }

    #[test]
    fn closed_service_rejects_waiters() {
        let service = service();
        let key = key(&service);
        let waiter = {
            let service = service.clone();
            thread::spawn(move || service.take())
        };
        thread::sleep(Duration::from_millis(20));
        service.close();
        assert!(matches!(
            waiter.join().expect("waiter"),
            Err(FsError::ClosedWatcher)
        ));
        assert!(matches!(service.poll(), Err(FsError::ClosedWatcher)));
        assert!(!key.is_valid());
        assert!(!key.reset());
    }
}
