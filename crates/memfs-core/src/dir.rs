// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-directory name table

use std::collections::HashMap;

use crate::config::CaseSensitivity;
use crate::error::{FsError, FsResult};
use crate::types::NodeId;

#[derive(Clone, Debug)]
struct Entry {
    name: String,
    node: NodeId,
}

/// Child name → node mapping of one directory.
///
/// Entries are unique under the profile's comparison rule, keep the spelling
/// they were inserted with and list in insertion order.
#[derive(Clone, Debug)]
pub(crate) struct DirTable {
    case: CaseSensitivity,
    entries: HashMap<String, Entry>,
    order: Vec<String>,
}

impl DirTable {
    pub fn new(case: CaseSensitivity) -> Self {
        Self {
            case,
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn key(&self, name: &str) -> String {
        match self.case {
            CaseSensitivity::Sensitive => name.to_string(),
            CaseSensitivity::InsensitivePreserving => name.to_lowercase(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored spelling and node for `name`
    pub fn lookup(&self, name: &str) -> Option<(&str, NodeId)> {
        self.entries
            .get(&self.key(name))
            .map(|entry| (entry.name.as_str(), entry.node))
    }

    pub fn insert(&mut self, name: &str, node: NodeId) -> FsResult<()> {
        let key = self.key(name);
        if self.entries.contains_key(&key) {
            return Err(FsError::AlreadyExists);
        }
        self.entries.insert(
            key.clone(),
            Entry {
                name: name.to_string(),
                node,
            },
        );
        self.order.push(key);
        Ok(())
    }

    /// Removes the entry, returning its stored spelling and node
    pub fn remove(&mut self, name: &str) -> FsResult<(String, NodeId)> {
        let key = self.key(name);
        let entry = self.entries.remove(&key).ok_or(FsError::NotFound)?;
        self.order.retain(|k| *k != key);
        Ok((entry.name, entry.node))
    }

    /// Changes the preserved spelling of an existing entry in place
    pub fn respell(&mut self, name: &str, new_name: &str) -> FsResult<()> {
        let key = self.key(name);
        if key != self.key(new_name) {
            return Err(FsError::InvalidArgument);
        }
        let entry = self.entries.get_mut(&key).ok_or(FsError::NotFound)?;
        entry.name = new_name.to_string();
        Ok(())
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeId)> + '_ {
        self.order.iter().filter_map(move |key| {
            self.entries
                .get(key)
                .map(|entry| (entry.name.as_str(), entry.node))
        })
    }
}
