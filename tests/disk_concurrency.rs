//! Concurrent writers against one disk store: the tempfile-and-rename
//! discipline must keep every block whole.

use std::sync::Arc;

use libernet::hash::Identifier;
use libernet::store::{BlockStore, DiskStore};
use libernet::url;

use tempfile::tempdir;

#[test]
fn parallel_writers_never_tear_blocks() {
    let root = tempdir().unwrap();
    let store = Arc::new(DiskStore::open(root.path()));

    let handles: Vec<_> = (0..8)
        .map(|worker: u32| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for round in 0..50u32 {
                    let payload = format!("worker {worker} round {round}").into_bytes();
                    let address = url::for_data_block(&Identifier::of(&payload), false);
                    store.put(&address, &payload).unwrap();
                    let read = store.get(&address).unwrap().unwrap();
                    assert_eq!(read, payload);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn racing_writers_to_the_same_address_leave_a_whole_block() {
    let root = tempdir().unwrap();
    let store = Arc::new(DiskStore::open(root.path()));

    // same payload, same address, many writers: overwrites are idempotent
    let payload = b"contended block contents".to_vec();
    let address = url::for_data_block(&Identifier::of(&payload), false);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let payload = payload.clone();
            let address = address.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    store.put(&address, &payload).unwrap();

                    if let Some(read) = store.get(&address).unwrap() {
                        assert_eq!(read, payload, "torn read");
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.get(&address).unwrap().unwrap(), payload);
}
