// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault injection policy + runtime controller for channel operations

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;

use crate::FsError;

/// Channel operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    Read,
    Write,
    Truncate,
    Force,
    Create,
}

/// Synthetic failure kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultError {
    Eio,
    Enospc,
}

impl FaultError {
    fn to_error(self) -> FsError {
        match self {
            FaultError::Eio => FsError::Io(io::Error::from_raw_os_error(libc::EIO)),
            FaultError::Enospc => FsError::OutOfSpace,
        }
    }
}

/// One rule: which op fails, with what, and how often.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaultRule {
    pub op: FaultOp,
    pub error: FaultError,
    /// Leading invocations to let through before failing
    #[serde(default)]
    pub start_after: u64,
    #[serde(default)]
    pub max_faults: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn failing(op: FaultOp, error: FaultError) -> Self {
        Self {
            enabled: true,
            rules: vec![FaultRule {
                op,
                error,
                start_after: 0,
                max_faults: None,
            }],
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct RuleCounters {
    hits: u64,
    invocations: u64,
}

#[derive(Debug, Default)]
struct FaultState {
    policy: FaultPolicy,
    counters: Vec<RuleCounters>,
}

/// Tracks the active policy and per-rule hit counts.
#[derive(Debug, Default)]
pub struct FaultInjector {
    state: Mutex<FaultState>,
}

impl FaultInjector {
    pub fn new(policy: FaultPolicy) -> Self {
        let injector = Self::default();
        injector.set_policy(policy);
        injector
    }

    pub fn policy(&self) -> FaultPolicy {
        self.state.lock().policy.clone()
    }

    pub fn set_policy(&self, policy: FaultPolicy) {
        let mut guard = self.state.lock();
        guard.counters = vec![RuleCounters::default(); policy.rules.len()];
        guard.policy = policy;
    }

    pub fn check(&self, op: FaultOp) -> Result<(), FsError> {
        let mut guard = self.state.lock();
        if !guard.policy.enabled {
            return Ok(());
        }
        let FaultState { policy, counters } = &mut *guard;
        for (rule, counter) in policy.rules.iter().zip(counters.iter_mut()) {
            if rule.op != op {
                continue;
            }
            counter.invocations = counter.invocations.saturating_add(1);
            if counter.invocations <= rule.start_after {
                continue;
            }
            if rule.max_faults.is_some_and(|max| counter.hits >= max) {
                continue;
            }
            counter.hits = counter.hits.saturating_add(1);
            tracing::debug!(?op, error = ?rule.error, "injecting fault");
            return Err(rule.error.to_error());
        }
        Ok(())
    }
}
