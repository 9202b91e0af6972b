// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open-resource registry used for leak detection

use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{HandleId, LockId};

/// Identity of a tracked resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKey {
    Channel(HandleId),
    DirectoryStream(HandleId),
    Lock(LockId),
    WatchService(u64),
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Channel(id) => write!(f, "channel #{}", id.0),
            ResourceKey::DirectoryStream(id) => write!(f, "directory stream #{}", id.0),
            ResourceKey::Lock(id) => write!(f, "lock #{}", id.0),
            ResourceKey::WatchService(id) => write!(f, "watch service #{id}"),
        }
    }
}

/// A resource that has been opened and not yet released
#[derive(Clone, Debug)]
pub struct OpenResource {
    pub key: ResourceKey,
    pub description: String,
    /// Allocation site, when stack trace capture is enabled
    pub backtrace: Option<Arc<Backtrace>>,
}

impl fmt::Display for OpenResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.description)?;
        if let Some(trace) = &self.backtrace {
            write!(f, "\nopened at:\n{trace}")?;
        }
        Ok(())
    }
}

/// Resources still open when the caller expected none
#[derive(Debug, thiserror::Error)]
#[error("{} resource(s) still open:\n{}", .resources.len(), render(.resources))]
pub struct LeakReport {
    pub resources: Vec<OpenResource>,
}

fn render(resources: &[OpenResource]) -> String {
    resources
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tracks every open channel, directory stream, lock and watch service.
///
/// Keeps its own mutex and never calls out while holding it, so it can be
/// used from under any other lock.
#[derive(Debug)]
pub struct ResourceRegistry {
    capture_stack_traces: bool,
    open: Mutex<BTreeMap<ResourceKey, OpenResource>>,
}

impl ResourceRegistry {
    pub fn new(capture_stack_traces: bool) -> Self {
        Self {
            capture_stack_traces,
            open: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, key: ResourceKey, description: impl Into<String>) {
        let backtrace = self
            .capture_stack_traces
            .then(|| Arc::new(Backtrace::force_capture()));
        let resource = OpenResource {
            key,
            description: description.into(),
            backtrace,
        };
        self.open.lock().insert(key, resource);
    }

    pub fn remove(&self, key: ResourceKey) -> bool {
        self.open.lock().remove(&key).is_some()
    }

    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<OpenResource> {
        self.open.lock().values().cloned().collect()
    }

    pub fn check_empty(&self) -> Result<(), LeakReport> {
        let resources = self.snapshot();
        if resources.is_empty() {
            return Ok(());
        }
        tracing::warn!(leaked = resources.len(), "open resources remain");
        Err(LeakReport { resources })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_until_removed() {
        let registry = ResourceRegistry::new(false);
        registry.register(ResourceKey::Channel(HandleId(1)), "channel on /a");
        registry.register(ResourceKey::Lock(LockId(3)), "lock on /a");
        assert_eq!(registry.len(), 2);

        let report = registry.check_empty().expect_err("leaks");
        assert_eq!(report.resources.len(), 2);
        let message = report.to_string();
        assert!(message.contains("channel #1: channel on /a"));
        assert!(message.contains("lock #3"));

        assert!(registry.remove(ResourceKey::Channel(HandleId(1))));
        assert!(!registry.remove(ResourceKey::Channel(HandleId(1))));
        assert!(registry.remove(ResourceKey::Lock(LockId(3))));
        registry.check_empty().expect("nothing open");
    }

    #[test]
    fn captures_allocation_site_when_enabled() {
        let registry = ResourceRegistry::new(true);
        registry.register(ResourceKey::WatchService(7), "watch service");
        let open = registry.snapshot();
        assert!(open[0].backtrace.is_some());

        let quiet = ResourceRegistry::new(false);
        quiet.register(ResourceKey::WatchService(7), "watch service");
        assert!(quiet.snapshot()[0].backtrace.is_none());
    }
}
