// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::{fs, read_file};
use memfs_core::{FsError, OpenOptions, Profile};

#[test]
fn threads_writing_separate_files() {
    let fs = Arc::new(fs(Profile::Unix));
    fs.create_directory("/work").expect("mkdir");

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                let path = format!("/work/file{i}");
                let handle = fs
                    .open(&path, &OpenOptions::read_write_create())
                    .expect("open");
                for _ in 0..100 {
                    fs.write(handle, &[i as u8; 10]).expect("write");
                }
                fs.close(handle).expect("close");
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("join");
    }

    assert_eq!(fs.list_directory("/work").expect("list").len(), 8);
    for i in 0..8u8 {
        let data = read_file(&fs, &format!("/work/file{i}"));
        assert_eq!(data.len(), 1000);
        assert!(data.iter().all(|byte| *byte == i));
    }
    assert_eq!(fs.store().used_space, 8000);
    fs.check_invariants().expect("invariants");
    fs.check_no_open_resources().expect("no leaks");
}

#[test]
fn racing_exclusive_creates_have_one_winner() {
    let fs = Arc::new(fs(Profile::Unix));
    let barrier = Arc::new(Barrier::new(6));
    let racers: Vec<_> = (0..6)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                fs.create_file("/lockfile")
            })
        })
        .collect();

    let mut created = 0;
    for racer in racers {
        match racer.join().expect("join") {
            Ok(()) => created += 1,
            Err(FsError::AlreadyExists) => {}
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(fs.list_directory("/").expect("list").len(), 1);
    fs.check_invariants().expect("invariants");
}

#[test]
fn concurrent_namespace_churn_keeps_invariants() {
    let fs = Arc::new(fs(Profile::Unix));
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                let dir = format!("/d{i}");
                fs.create_directory(&dir).expect("mkdir");
                for round in 0..50 {
                    let path = format!("{dir}/f{round}");
                    fs.create_file(&path).expect("create");
                    fs.rename(&path, &format!("{dir}/g{round}"), false)
                        .expect("rename");
                    if round % 2 == 0 {
                        fs.delete(&format!("{dir}/g{round}")).expect("delete");
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("join");
    }
    for i in 0..4 {
        assert_eq!(fs.list_directory(&format!("/d{i}")).expect("list").len(), 25);
    }
    fs.check_invariants().expect("invariants");
}
