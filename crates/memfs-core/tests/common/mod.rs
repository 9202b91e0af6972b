// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared helpers for memfs-core integration tests

#![allow(dead_code)]

use std::sync::Once;

use memfs_core::{FsConfig, FsCore, OpenOptions, Profile};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn fs(profile: Profile) -> FsCore {
    init_logging();
    FsCore::new(FsConfig::for_profile(profile)).expect("create filesystem")
}

pub fn fs_with_space(total_space: u64) -> FsCore {
    init_logging();
    FsCore::new(FsConfig::default().with_total_space(total_space)).expect("create filesystem")
}

/// Creates or truncates `path` and writes `data` to it
pub fn write_file(fs: &FsCore, path: &str, data: &[u8]) {
    let handle = fs.open(path, &OpenOptions::write_truncate()).expect("open for write");
    assert_eq!(fs.write(handle, data).expect("write"), data.len());
    fs.close(handle).expect("close");
}

pub fn read_file(fs: &FsCore, path: &str) -> Vec<u8> {
    let handle = fs.open(path, &OpenOptions::read_only()).expect("open for read");
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    while let Some(count) = fs.read(handle, &mut buf).expect("read") {
        out.extend_from_slice(&buf[..count]);
    }
    fs.close(handle).expect("close");
    out
}
