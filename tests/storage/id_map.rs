//! Tests for the identifier map of SqliteLogStore.

use offline_editing::storage::{ChangeLogBackend, IdentifierMap, SqliteLogStore};

fn make_store() -> SqliteLogStore {
    SqliteLogStore::open_in_memory().expect("open in-memory log")
}

#[test]
fn lookup_works_in_both_directions() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();
    store.record_mapping(h, 1, 10).unwrap();
    store.record_mapping(h, 2, 11).unwrap();

    assert_eq!(store.remote_id_for(h, 1).unwrap(), Some(10));
    assert_eq!(store.local_id_for(h, 11).unwrap(), Some(2));
}

#[test]
fn misses_return_none() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();
    store.record_mapping(h, 1, 10).unwrap();

    assert_eq!(store.remote_id_for(h, 2).unwrap(), None);
    assert_eq!(store.local_id_for(h, 1).unwrap(), None);
}

#[test]
fn recording_again_replaces_the_mapping() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();
    store.record_mapping(h, 1, 10).unwrap();
    store.record_mapping(h, 1, 42).unwrap();

    assert_eq!(store.remote_id_for(h, 1).unwrap(), Some(42));
    assert_eq!(store.local_id_for(h, 10).unwrap(), None);
    assert_eq!(store.mapping_count(h).unwrap(), 1);
}

#[test]
fn record_mappings_writes_every_pair() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();
    store
        .record_mappings(h, &[(1, 100), (2, 101), (3, 102)])
        .unwrap();

    assert_eq!(store.mapping_count(h).unwrap(), 3);
    assert_eq!(store.remote_id_for(h, 3).unwrap(), Some(102));
}

#[test]
fn remove_mapping_reports_whether_one_existed() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();
    store.record_mapping(h, 1, 10).unwrap();

    assert!(store.remove_mapping(h, 1).unwrap());
    assert!(!store.remove_mapping(h, 1).unwrap());
    assert_eq!(store.remote_id_for(h, 1).unwrap(), None);
}

#[test]
fn mappings_are_scoped_by_dataset() {
    let store = make_store();
    let roads = store.get_or_create_dataset_handle("roads").unwrap();
    let parcels = store.get_or_create_dataset_handle("parcels").unwrap();
    store.record_mapping(roads, 1, 10).unwrap();
    store.record_mapping(parcels, 1, 20).unwrap();

    assert_eq!(store.remote_id_for(roads, 1).unwrap(), Some(10));
    assert_eq!(store.remote_id_for(parcels, 1).unwrap(), Some(20));
    assert_eq!(store.local_id_for(parcels, 10).unwrap(), None);
    assert_eq!(store.mapping_count(roads).unwrap(), 1);
}
