//! Races between independent connections on one database file.
//!
//! Each thread opens its own `Storage`, the way separate processes would.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;

use idlink::{SqliteUsersConnector, Storage, StorageOptions, UserUpdate, UsersConnector};

const WORKERS: usize = 8;

fn shared_db() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idlink.db");
    // create the schema up front so workers only ever open an existing file
    Storage::open(&path, &StorageOptions::default()).unwrap();
    (dir, path)
}

fn open(path: &Path) -> SqliteUsersConnector {
    SqliteUsersConnector::new(Storage::open(path, &StorageOptions::default()).unwrap())
}

/// Run `work` on `WORKERS` threads released together, collecting results.
fn race<T: Send + 'static>(
    path: &Path,
    work: impl Fn(usize, &SqliteUsersConnector) -> T + Send + Sync + 'static,
) -> Vec<T> {
    let barrier = Arc::new(Barrier::new(WORKERS));
    let work = Arc::new(work);
    let handles: Vec<_> = (0..WORKERS)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let work = Arc::clone(&work);
            let path = path.to_path_buf();
            thread::spawn(move || {
                let connector = open(&path);
                barrier.wait();
                (*work)(i, &connector)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn concurrent_add_user_converges_on_one_uid() {
    let (_dir, path) = shared_db();
    let uids = race(&path, |i, c| {
        c.add_user(Some(&format!("worker-{i}")), "git", "Tyler Durden <tyler@mayhem.net>")
            .unwrap()
    });

    let distinct: HashSet<_> = uids.iter().copied().collect();
    assert_eq!(distinct.len(), 1, "uids: {uids:?}");

    let c = open(&path);
    let users = c.list_users().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].uid, uids[0]);
}

#[test]
fn concurrent_add_user_with_same_identifier_converges() {
    let (_dir, path) = shared_db();
    let uids = race(&path, |_, c| c.add_user(Some("soap"), "IPv9", "0578cc6.8db024").unwrap());

    let distinct: HashSet<_> = uids.iter().copied().collect();
    assert_eq!(distinct.len(), 1, "uids: {uids:?}");
    assert_eq!(open(&path).list_users().unwrap().len(), 1);
}

#[test]
fn concurrent_updates_of_different_types_all_land() {
    let (_dir, path) = shared_db();
    let uid = open(&path).add_user(Some("soap"), "IPv9", "0578cc6.8db024").unwrap();

    race(&path, move |i, c| {
        let update = UserUpdate::new().attribute(format!("attr-{i}"), format!("value-{i}"));
        c.update_user(uid, &update).unwrap();
    });

    let view = open(&path).get_user(uid).unwrap().unwrap();
    assert_eq!(view.attributes.len(), WORKERS + 1);
    assert_eq!(view.identifier.as_deref(), Some("soap"));
    for i in 0..WORKERS {
        let expected = format!("value-{i}");
        assert_eq!(view.attr(&format!("attr-{i}")), Some(expected.as_str()));
    }
}

#[test]
fn concurrent_upserts_of_one_type_leave_one_value() {
    let (_dir, path) = shared_db();
    let uid = open(&path).add_user(Some("soap"), "IPv9", "0578cc6.8db024").unwrap();

    race(&path, move |i, c| {
        let update = UserUpdate::new().attribute("IPv4", format!("10.0.0.{i}"));
        c.update_user(uid, &update).unwrap();
    });

    let view = open(&path).get_user(uid).unwrap().unwrap();
    let value = view.attr("IPv4").unwrap();
    assert!(value.starts_with("10.0.0."), "got {value}");
    assert_eq!(view.attributes.len(), 2);
}

#[test]
fn remove_races_with_update_without_errors() {
    let (_dir, path) = shared_db();
    let uid = open(&path).add_user(Some("soap"), "IPv9", "0578cc6.8db024").unwrap();

    race(&path, move |i, c| {
        if i % 2 == 0 {
            c.remove_user(uid).unwrap();
        } else {
            let update = UserUpdate::new().attribute("irc", format!("soap{i}"));
            c.update_user(uid, &update).unwrap();
        }
    });

    let c = open(&path);
    assert!(c.get_user(uid).unwrap().is_none());
    assert!(c.list_users().unwrap().is_empty());
}
