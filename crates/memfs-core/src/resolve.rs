// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path resolution against the inode graph

use std::collections::VecDeque;

use crate::config::ProfileTraits;
use crate::error::{FsError, FsResult};
use crate::node::{NodeKind, NodeStore};
use crate::path::{render_names, FsPath};
use crate::types::NodeId;

/// Outcome of walking a path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Canonical names from the root to the target (or to the parent when
    /// the final component does not exist), with symlinks substituted
    pub steps: Vec<String>,
    pub target: Option<NodeId>,
    /// Directory holding the final component; `None` for the root
    pub parent: Option<NodeId>,
    /// Final component as stored, or as requested when missing
    pub final_name: Option<String>,
    /// Every non-terminal component resolved to a directory
    pub has_valid_parent: bool,
    /// Resolution stopped because a non-terminal component was not a directory
    pub parent_not_directory: bool,
    /// The target is a symlink that was not followed
    pub symlink_terminal: bool,
}

impl ResolvedPath {
    fn unresolved(chain: &[(NodeId, String)], parent_not_directory: bool) -> Self {
        Self {
            steps: chain.iter().map(|(_, name)| name.clone()).collect(),
            target: None,
            parent: None,
            final_name: None,
            has_valid_parent: false,
            parent_not_directory,
            symlink_terminal: false,
        }
    }

    /// The target, or the error an operation on a missing target reports
    pub fn existing(&self) -> FsResult<NodeId> {
        match self.target {
            Some(id) => Ok(id),
            None if self.parent_not_directory => Err(FsError::NotADirectory),
            None => Err(FsError::NotFound),
        }
    }

    pub fn render(&self, traits: &ProfileTraits) -> String {
        render_names(traits, true, &self.steps)
    }
}

/// Walks `path` from the root.
///
/// Non-terminal symlinks are always substituted; the terminal one only when
/// `follow_final` is set. `..` pops the chain of directories actually
/// traversed, so it lands on the real parent of a symlink's target.
pub(crate) fn resolve(
    nodes: &NodeStore,
    traits: &ProfileTraits,
    path: &FsPath,
    follow_final: bool,
    max_hops: u32,
) -> FsResult<ResolvedPath> {
    let root = nodes.root();
    let mut chain: Vec<(NodeId, String)> = Vec::new();
    let mut pending: VecDeque<String> = path.names.iter().cloned().collect();
    let mut hops = 0u32;

    while let Some(name) = pending.pop_front() {
        let is_last = pending.is_empty();
        match name.as_str() {
            "." => continue,
            ".." => {
                chain.pop();
                continue;
            }
            _ => {}
        }

        let current = chain.last().map(|(id, _)| *id).unwrap_or(root);
        let Some((stored, child)) = nodes.dir(current)?.lookup(&name) else {
            if !is_last {
                return Ok(ResolvedPath::unresolved(&chain, false));
            }
            let mut resolved = ResolvedPath::unresolved(&chain, false);
            resolved.parent = Some(current);
            resolved.final_name = Some(name);
            resolved.has_valid_parent = true;
            return Ok(resolved);
        };
        let stored = stored.to_string();

        match &nodes.live(child)?.kind {
            NodeKind::Symlink { target } if !is_last || follow_final => {
                hops += 1;
                if hops > max_hops {
                    tracing::debug!(path = %path.render(traits), hops, "symlink hop limit reached");
                    return Err(FsError::TooManyLinks);
                }
                let target = FsPath::parse(traits, target)?;
                if target.absolute {
                    chain.clear();
                }
                for step in target.names.into_iter().rev() {
                    pending.push_front(step);
                }
            }
            NodeKind::Directory { .. } => chain.push((child, stored)),
            kind if is_last => {
                let symlink_terminal = matches!(kind, NodeKind::Symlink { .. });
                let mut steps: Vec<String> = chain.iter().map(|(_, n)| n.clone()).collect();
                steps.push(stored.clone());
                return Ok(ResolvedPath {
                    steps,
                    target: Some(child),
                    parent: Some(current),
                    final_name: Some(stored),
                    has_valid_parent: true,
                    parent_not_directory: false,
                    symlink_terminal,
                });
            }
            _ => return Ok(ResolvedPath::unresolved(&chain, true)),
        }
    }

    let steps: Vec<String> = chain.iter().map(|(_, name)| name.clone()).collect();
    Ok(match chain.len() {
        0 => ResolvedPath {
            steps,
            target: Some(root),
            parent: None,
            final_name: None,
            has_valid_parent: true,
            parent_not_directory: false,
            symlink_terminal: false,
        },
        len => ResolvedPath {
            steps,
            target: Some(chain[len - 1].0),
            parent: Some(if len >= 2 { chain[len - 2].0 } else { root }),
            final_name: Some(chain[len - 1].1.clone()),
            has_valid_parent: true,
            parent_not_directory: false,
            symlink_terminal: false,
        },
    })
}
