//! Multi-machine discovery: independent histories written to separate
//! stores must merge into one coherent configuration once the stores'
//! blocks are combined.

use std::collections::BTreeMap;
use std::fs;

use libernet::backup::{self, BackupContext, BackupRecord, SourceState};
use libernet::bundle::BundleOptions;
use libernet::message::Center;
use libernet::store::{DiskStore, MemoryStore};
use libernet::timestamp;

use tempfile::tempdir;

fn context(machine: &str) -> BackupContext {
    BackupContext {
        user: "John".to_string(),
        passphrase: "Setec Astronomy".to_string(),
        machine: machine.to_string(),
        months: 3,
        days: 1.0,
        assume_yes: true,
        assume_no: false,
    }
}

fn fresh_record(context: &BackupContext, path: &str, state: Option<SourceState>) -> BackupRecord {
    let mut record = BackupRecord {
        kind: Some("backup".to_string()),
        timestamp: Some(timestamp::now()),
        user: Some(context.user.clone()),
        passphrase: Some(context.passphrase.clone()),
        ..BackupRecord::default()
    };
    record
        .backup
        .entry(context.machine.clone())
        .or_default()
        .insert(path.to_string(), state);
    record
}

#[test]
fn merged_stores_reveal_both_histories() {
    // 1. Two machines back up to two independent stores
    let laptop = context("laptop");
    let desktop = context("desktop");

    let store_one = MemoryStore::new();
    let mut record_one = fresh_record(&laptop, "/home/john/documents", None);
    backup::save(&mut record_one, &laptop, &store_one).unwrap();

    let store_two = MemoryStore::new();
    let mut record_two = fresh_record(&desktop, "/var/data", None);
    backup::save(&mut record_two, &desktop, &store_two).unwrap();

    // 2. Merge the stores' bytes into a third
    let combined = MemoryStore::new();
    store_one.copy_into(&combined).unwrap();
    store_two.copy_into(&combined).unwrap();

    // 3. Discovery from the combined store sees both records
    let found = backup::discover(&laptop, &combined).unwrap();
    assert_eq!(found.len(), 2);

    // 4. The merge presents their union
    let merged = backup::merge_records(&found);
    assert!(merged.backup["laptop"].contains_key("/home/john/documents"));
    assert!(merged.backup["desktop"].contains_key("/var/data"));
    assert_eq!(merged.previous.len(), 2);
    assert_eq!(merged.user.as_deref(), Some("John"));

    // 5. Saving the union retires both ancestors
    let mut merged = merged;
    backup::save(&mut merged, &laptop, &combined).unwrap();
    let after = backup::discover(&laptop, &combined).unwrap();
    assert_eq!(after.len(), 1);
    let survivor = after.values().next().unwrap();
    assert!(survivor.backup.contains_key("laptop"));
    assert!(survivor.backup.contains_key("desktop"));
}

#[test]
fn repeated_saves_stay_discoverable() {
    // Property: within one month, each save supersedes the last and
    // discovery converges on the newest configuration.
    let store = MemoryStore::new();
    let context = context("localhost");

    let mut record = fresh_record(&context, "/srv/one", None);
    backup::save(&mut record, &context, &store).unwrap();

    for round in 0..3 {
        let found = backup::discover(&context, &store).unwrap();
        assert_eq!(found.len(), 1, "round {round}");
        let mut merged = backup::merge_records(&found);
        merged
            .backup
            .entry("localhost".to_string())
            .or_default()
            .insert(format!("/srv/extra_{round}"), None);
        backup::save(&mut merged, &context, &store).unwrap();
    }

    let final_found = backup::discover(&context, &store).unwrap();
    assert_eq!(final_found.len(), 1);
    let final_record = final_found.values().next().unwrap();
    let paths = &final_record.backup["localhost"];
    assert!(paths.contains_key("/srv/one"));
    assert!(paths.contains_key("/srv/extra_0"));
    assert!(paths.contains_key("/srv/extra_2"));
}

#[test]
fn full_backup_cycle_against_a_disk_store() {
    // 1. A real source directory and a real store
    let storage = tempdir().unwrap();
    let source = tempdir().unwrap();
    fs::write(source.path().join("notes.txt"), b"remember the milk").unwrap();
    fs::create_dir(source.path().join("projects")).unwrap();
    fs::write(source.path().join("projects/plan.txt"), b"steps: 1, 2, 3").unwrap();

    let store = DiskStore::open(storage.path());
    let context = context("localhost");

    // 2. First contact creates a fresh configuration
    let mut record = backup::load_settings(&context, &store, None).unwrap();
    assert!(record.backup.is_empty());

    backup::add_sources(&mut record, &context, &[source.path().to_path_buf()]).unwrap();
    let center = Center::new();
    let changed = backup::run_backup(
        &mut record,
        &context,
        &store,
        Some(&center),
        &BundleOptions::default(),
    )
    .unwrap();
    assert!(changed);
    backup::save(&mut record, &context, &store).unwrap();
    center.shutdown();

    // 3. A later session discovers the saved configuration and restores
    let found = backup::discover(&context, &store).unwrap();
    assert_eq!(found.len(), 1);
    let merged = backup::merge_records(&found);

    let canonical = fs::canonicalize(source.path()).unwrap();
    let state = merged.backup["localhost"][&canonical.to_string_lossy().into_owned()]
        .as_ref()
        .expect("source should have been backed up");

    let target = tempdir().unwrap();
    let missing =
        libernet::bundle::restore(&state.url, target.path(), &store, None).unwrap();
    assert!(missing.is_none());
    assert_eq!(
        fs::read(target.path().join("notes.txt")).unwrap(),
        b"remember the milk"
    );
    assert_eq!(
        fs::read(target.path().join("projects/plan.txt")).unwrap(),
        b"steps: 1, 2, 3"
    );
}

#[test]
fn alien_blocks_near_the_target_are_tolerated() {
    // A block that happens to live near the month target must not derail
    // discovery.
    let store = MemoryStore::new();
    let context = context("localhost");

    // legitimate record
    let mut record = fresh_record(&context, "/srv/data", None);
    backup::save(&mut record, &context, &store).unwrap();

    // an unrelated plain block
    libernet::block::store(
        b"just some stranger's bytes",
        &store,
        &libernet::block::Encryption::None,
        None,
        12,
    )
    .unwrap();

    // an unrelated record under a different passphrase
    let mut stranger_context = context.clone();
    stranger_context.passphrase = "different words".to_string();
    let mut stranger = fresh_record(&stranger_context, "/other", None);
    backup::save(&mut stranger, &stranger_context, &store).unwrap();

    let found = backup::discover(&context, &store).unwrap();
    assert_eq!(found.len(), 1);
    let paths: BTreeMap<_, _> = found.values().next().unwrap().backup["localhost"].clone();
    assert!(paths.contains_key("/srv/data"));
}
