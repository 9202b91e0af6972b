// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{fs, write_file};
use memfs_core::{FsConfig, FsCore, FsError, ModifyCount, OpenOptions, Profile, WatchEventKind};

const ALL: &[WatchEventKind] = &[
    WatchEventKind::Create,
    WatchEventKind::Delete,
    WatchEventKind::Modify,
];

#[test]
fn each_created_child_is_reported_once() {
    let fs = fs(Profile::Unix);
    fs.create_directory("/watched").expect("mkdir");
    let service = fs.new_watch_service();
    let key = fs
        .register_watch(&service, "/watched", &[WatchEventKind::Create])
        .expect("register");
    assert_eq!(key.watchable(), "/watched");

    for name in ["a", "b", "c"] {
        fs.create_file(&format!("/watched/{name}")).expect("create");
    }
    fs.create_file("/elsewhere").expect("create outside");

    let signalled = service.poll().expect("poll").expect("key signalled");
    assert_eq!(signalled, key);
    let events = signalled.poll_events();
    let names: Vec<&str> = events.iter().map(|event| event.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert!(events
        .iter()
        .all(|event| event.kind == WatchEventKind::Create && event.count == 1));

    assert!(signalled.poll_events().is_empty());
    assert!(service.poll().expect("poll").is_none());
    assert!(signalled.reset());
    assert!(service.poll().expect("poll").is_none());
    service.close();
}

#[test]
fn writes_coalesce_into_one_modify_event() {
    let fs = fs(Profile::Unix);
    fs.create_directory("/d").expect("mkdir");
    fs.create_file("/d/f").expect("create");
    let service = fs.new_watch_service();
    let key = fs
        .register_watch(&service, "/d", &[WatchEventKind::Modify])
        .expect("register");

    let handle = fs.open("/d/f", &OpenOptions::read_write_create()).expect("open");
    fs.write(handle, b"one").expect("write");
    fs.write(handle, b"two").expect("write");
    fs.close(handle).expect("close");

    let events = service.poll().expect("poll").expect("signalled").poll_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, WatchEventKind::Modify);
    assert_eq!(events[0].name, "f");
    assert_eq!(events[0].count, 2);
    key.cancel();
    service.close();
}

#[test]
fn mac_counts_content_and_metadata_changes_separately() {
    let fs = fs(Profile::Mac);
    fs.create_directory("/d").expect("mkdir");
    fs.create_file("/d/f").expect("create");
    let service = fs.new_watch_service();
    fs.register_watch(&service, "/d", &[WatchEventKind::Modify])
        .expect("register");

    write_file(&fs, "/d/f", b"x");
    let events = service.poll().expect("poll").expect("signalled").poll_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].count, 2);
    service.close();
}

#[test]
fn modify_count_can_be_overridden() {
    let mut config = FsConfig::for_profile(Profile::Unix);
    config.watch.modify_count = Some(ModifyCount::PerChange);
    let fs = FsCore::new(config).expect("fs");
    fs.create_file("/f").expect("create");
    let service = fs.new_watch_service();
    fs.register_watch(&service, "/", &[WatchEventKind::Modify])
        .expect("register");
    write_file(&fs, "/f", b"x");
    let events = service.poll().expect("poll").expect("signalled").poll_events();
    assert_eq!(events[0].count, 2);
    service.close();
}

#[test]
fn writes_through_another_link_are_invisible() {
    let fs = fs(Profile::Unix);
    fs.create_directory("/watched").expect("mkdir");
    fs.create_directory("/other").expect("mkdir");
    write_file(&fs, "/watched/f", b"x");
    fs.create_link("/other/alias", "/watched/f").expect("link");

    let service = fs.new_watch_service();
    fs.register_watch(&service, "/watched", &[WatchEventKind::Modify])
        .expect("register");
    write_file(&fs, "/other/alias", b"changed");
    assert!(service.poll().expect("poll").is_none());

    write_file(&fs, "/watched/f", b"again");
    assert!(service.poll().expect("poll").is_some());
    service.close();
}

#[test]
fn take_blocks_until_an_event_arrives() {
    let fs = Arc::new(fs(Profile::Unix));
    fs.create_directory("/inbox").expect("mkdir");
    let service = fs.new_watch_service();
    let key = fs.register_watch(&service, "/inbox", ALL).expect("register");

    let consumer = {
        let service = service.clone();
        thread::spawn(move || service.take())
    };
    thread::sleep(Duration::from_millis(20));
    fs.create_file("/inbox/msg").expect("create");

    let signalled = consumer.join().expect("join").expect("take");
    assert_eq!(signalled, key);
    assert_eq!(signalled.poll_events()[0].name, "msg");
    service.close();
}

#[test]
fn poll_timeout_expires_without_events() {
    let fs = fs(Profile::Unix);
    let service = fs.new_watch_service();
    fs.register_watch(&service, "/", ALL).expect("register");
    let key = service
        .poll_timeout(Duration::from_millis(10))
        .expect("poll");
    assert!(key.is_none());
    service.close();
}

#[test]
fn deleting_the_watched_directory_invalidates_the_key() {
    let fs = fs(Profile::Unix);
    fs.create_directory("/gone").expect("mkdir");
    let service = fs.new_watch_service();
    let key = fs
        .register_watch(&service, "/gone", ALL)
        .expect("register");
    fs.delete("/gone").expect("delete");

    let signalled = service.poll().expect("poll").expect("signalled");
    assert_eq!(signalled, key);
    assert!(!key.reset());
    assert!(!key.is_valid());
    assert!(!key.reset());
    service.close();
}

#[test]
fn cancel_and_close_lifecycle() {
    let fs = fs(Profile::Unix);
    fs.create_directory("/d").expect("mkdir");
    let service = fs.new_watch_service();
    let key = fs.register_watch(&service, "/d", ALL).expect("register");

    key.cancel();
    key.cancel();
    assert!(!key.is_valid());
    assert!(!key.reset());
    fs.create_file("/d/ignored").expect("create");
    assert!(key.poll_events().is_empty());

    assert_eq!(fs.open_resources().len(), 1);
    service.close();
    service.close();
    fs.check_no_open_resources().expect("service released");
    assert!(matches!(service.poll(), Err(FsError::ClosedWatcher)));
    assert!(matches!(service.take(), Err(FsError::ClosedWatcher)));
    assert!(matches!(
        fs.register_watch(&service, "/d", ALL),
        Err(FsError::ClosedWatcher)
    ));
}

#[test]
fn registration_is_validated() {
    let fs = fs(Profile::Unix);
    fs.create_file("/file").expect("create");
    let service = fs.new_watch_service();
    assert!(matches!(
        fs.register_watch(&service, "/file", ALL),
        Err(FsError::NotADirectory)
    ));
    assert!(matches!(
        fs.register_watch(&service, "/missing", ALL),
        Err(FsError::NotFound)
    ));
    assert!(matches!(
        fs.register_watch(&service, "/", &[]),
        Err(FsError::InvalidArgument)
    ));
    service.close();
}
