//! Tests for SqliteLogStore: handles, commit counters, log rows, purge and
//! transactions.

use offline_editing::error::{OfflineError, StorageError};
use offline_editing::storage::{ChangeLogBackend, IdentifierMap, SqliteLogStore};
use offline_editing::types::{Field, FieldType, Geometry, PendingChanges};

// ============================================================================
// Test helpers
// ============================================================================

fn make_store() -> SqliteLogStore {
    SqliteLogStore::open_in_memory().expect("open in-memory log")
}

fn point(x: i32, y: i32) -> Geometry {
    Geometry::from_wkt(format!("POINT ({x} {y})"))
}

// ============================================================================
// Dataset handles
// ============================================================================

#[test]
fn handles_start_at_zero_and_are_reused() {
    let store = make_store();
    assert_eq!(store.dataset_handle("roads").unwrap(), None);

    let roads = store.get_or_create_dataset_handle("roads").unwrap();
    let parcels = store.get_or_create_dataset_handle("parcels").unwrap();
    assert_eq!(roads, 0);
    assert_eq!(parcels, 1);

    assert_eq!(store.get_or_create_dataset_handle("roads").unwrap(), roads);
    assert_eq!(store.dataset_handle("parcels").unwrap(), Some(parcels));
}

#[test]
fn datasets_are_listed_in_handle_order() {
    let store = make_store();
    store.get_or_create_dataset_handle("roads").unwrap();
    store.get_or_create_dataset_handle("parcels").unwrap();

    let datasets = store.datasets().unwrap();
    assert_eq!(
        datasets,
        vec![(0, "roads".to_string()), (1, "parcels".to_string())]
    );
}

// ============================================================================
// Commit counters
// ============================================================================

#[test]
fn commit_counter_is_kept_per_dataset() {
    let store = make_store();
    let roads = store.get_or_create_dataset_handle("roads").unwrap();
    let parcels = store.get_or_create_dataset_handle("parcels").unwrap();

    assert_eq!(store.commit_no(roads).unwrap(), 0);
    assert_eq!(store.increase_commit_no(roads).unwrap(), 1);
    assert_eq!(store.increase_commit_no(roads).unwrap(), 2);
    assert_eq!(store.commit_no(parcels).unwrap(), 0);

    store.reset_commit_no(roads).unwrap();
    assert_eq!(store.commit_no(roads).unwrap(), 0);
}

#[test]
fn handle_counter_is_not_affected_by_commit_counters() {
    let store = make_store();
    let roads = store.get_or_create_dataset_handle("roads").unwrap();
    store.increase_commit_no(roads).unwrap();
    store.increase_commit_no(roads).unwrap();

    assert_eq!(store.get_or_create_dataset_handle("rivers").unwrap(), 1);
}

// ============================================================================
// Log rows
// ============================================================================

#[test]
fn attribute_additions_are_filtered_by_commit() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();

    let surface = Field::new("surface", FieldType::Text)
        .with_length(32)
        .with_comment("paving material");
    let lanes = Field::new("lane_widths", FieldType::List(Box::new(FieldType::Real)));
    store.log_attribute_addition(h, 0, &surface).unwrap();
    store.log_attribute_addition(h, 1, &lanes).unwrap();

    let commit0 = store.attribute_additions(h, 0).unwrap();
    assert_eq!(commit0.len(), 1);
    assert_eq!(commit0[0].commit, 0);
    assert_eq!(commit0[0].field.name, "surface");
    assert_eq!(commit0[0].field.length, 32);
    assert_eq!(commit0[0].field.comment, "paving material");

    let commit1 = store.attribute_additions(h, 1).unwrap();
    assert_eq!(
        commit1[0].field.field_type,
        FieldType::List(Box::new(FieldType::Real))
    );
    assert!(store.attribute_additions(h, 2).unwrap().is_empty());
}

#[test]
fn feature_rows_keep_insertion_order() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();

    for fid in [7, 3, 5] {
        store.log_feature_addition(h, fid).unwrap();
    }
    store.log_feature_removal(h, 9).unwrap();
    store.log_feature_removal(h, 2).unwrap();

    assert_eq!(store.feature_additions(h).unwrap(), vec![7, 3, 5]);
    assert_eq!(store.feature_removals(h).unwrap(), vec![9, 2]);
    assert!(store.is_added_feature(h, 3).unwrap());
    assert!(!store.is_added_feature(h, 9).unwrap());
}

#[test]
fn remove_feature_addition_reports_whether_one_existed() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();
    store.log_feature_addition(h, 4).unwrap();

    assert!(store.remove_feature_addition(h, 4).unwrap());
    assert!(!store.remove_feature_addition(h, 4).unwrap());
    assert!(store.feature_additions(h).unwrap().is_empty());
}

#[test]
fn value_changes_keep_null_and_text() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();
    store
        .log_attribute_value_change(h, 0, 1, 2, Some("[\"a\",\"b\"]"))
        .unwrap();
    store.log_attribute_value_change(h, 0, 1, 3, None).unwrap();
    store.log_attribute_value_change(h, 1, 1, 2, Some("x")).unwrap();

    let changes = store.attribute_value_changes(h, 0).unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].fid, 1);
    assert_eq!(changes[0].field_index, 2);
    assert_eq!(changes[0].value.as_deref(), Some("[\"a\",\"b\"]"));
    assert_eq!(changes[1].value, None);

    assert_eq!(store.attribute_value_changes(h, 1).unwrap().len(), 1);
}

#[test]
fn geometry_changes_are_filtered_by_commit() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();
    store.log_geometry_change(h, 0, 1, &point(1, 1)).unwrap();
    store.log_geometry_change(h, 0, 2, &point(2, 2)).unwrap();
    store.log_geometry_change(h, 3, 1, &point(3, 3)).unwrap();

    let commit0 = store.geometry_changes(h, 0).unwrap();
    assert_eq!(commit0.len(), 2);
    assert_eq!(commit0[1].geometry, point(2, 2));
    assert_eq!(store.geometry_changes(h, 3).unwrap()[0].fid, 1);
}

#[test]
fn rows_are_scoped_by_dataset() {
    let store = make_store();
    let roads = store.get_or_create_dataset_handle("roads").unwrap();
    let parcels = store.get_or_create_dataset_handle("parcels").unwrap();
    store.log_feature_addition(roads, 1).unwrap();
    store.log_feature_removal(parcels, 1).unwrap();

    assert_eq!(store.feature_additions(parcels).unwrap(), Vec::<i64>::new());
    assert_eq!(store.feature_removals(roads).unwrap(), Vec::<i64>::new());
}

#[test]
fn pending_changes_counts_every_kind() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();
    assert!(store.pending_changes(h).unwrap().is_empty());

    store
        .log_attribute_addition(h, 0, &Field::new("surface", FieldType::Text))
        .unwrap();
    store.log_attribute_value_change(h, 0, 1, 0, Some("gravel")).unwrap();
    store.log_geometry_change(h, 0, 1, &point(0, 0)).unwrap();
    store.log_feature_addition(h, 8).unwrap();
    store.log_feature_removal(h, 2).unwrap();
    store.increase_commit_no(h).unwrap();

    assert_eq!(
        store.pending_changes(h).unwrap(),
        PendingChanges {
            commits: 1,
            added_fields: 1,
            added_features: 1,
            removed_features: 1,
            value_changes: 1,
            geometry_changes: 1,
        }
    );
}

// ============================================================================
// Purge
// ============================================================================

#[test]
fn purge_commit_keeps_other_commits_and_feature_rows() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();
    store.log_attribute_value_change(h, 0, 1, 0, Some("a")).unwrap();
    store.log_attribute_value_change(h, 1, 1, 0, Some("b")).unwrap();
    store.log_geometry_change(h, 0, 1, &point(0, 0)).unwrap();
    store
        .log_attribute_addition(h, 0, &Field::new("surface", FieldType::Text))
        .unwrap();
    store.log_feature_addition(h, 5).unwrap();

    store.purge(h, Some(0)).unwrap();

    assert!(store.attribute_value_changes(h, 0).unwrap().is_empty());
    assert!(store.geometry_changes(h, 0).unwrap().is_empty());
    assert!(store.attribute_additions(h, 0).unwrap().is_empty());
    assert_eq!(store.attribute_value_changes(h, 1).unwrap().len(), 1);
    assert_eq!(store.feature_additions(h).unwrap(), vec![5]);
}

#[test]
fn purge_all_clears_dataset_but_not_mappings_or_other_datasets() {
    let store = make_store();
    let roads = store.get_or_create_dataset_handle("roads").unwrap();
    let parcels = store.get_or_create_dataset_handle("parcels").unwrap();
    store.log_feature_addition(roads, 5).unwrap();
    store.log_feature_removal(roads, 6).unwrap();
    store.log_attribute_value_change(roads, 2, 1, 0, Some("a")).unwrap();
    store.log_feature_addition(parcels, 5).unwrap();
    store.record_mapping(roads, 1, 100).unwrap();

    store.purge(roads, None).unwrap();

    let pending = store.pending_changes(roads).unwrap();
    assert!(pending.is_empty());
    assert_eq!(store.feature_additions(parcels).unwrap(), vec![5]);
    assert_eq!(store.remote_id_for(roads, 1).unwrap(), Some(100));
}

// ============================================================================
// Transactions
// ============================================================================

#[test]
fn failed_transaction_rolls_back_every_row() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();

    let result: Result<(), OfflineError> = store.transaction(|s| {
        s.log_feature_addition(h, 1)?;
        s.log_feature_addition(h, 2)?;
        Err(StorageError::Transaction {
            message: "abort".to_string(),
            source: None,
        }
        .into())
    });

    assert!(result.is_err());
    assert!(store.feature_additions(h).unwrap().is_empty());
}

#[test]
fn nested_failure_rolls_back_only_the_inner_batch() {
    let store = make_store();
    let h = store.get_or_create_dataset_handle("roads").unwrap();

    store
        .transaction(|s| {
            s.log_feature_addition(h, 1)?;
            let inner: Result<(), OfflineError> = s.transaction(|s| {
                s.log_feature_addition(h, 2)?;
                Err(StorageError::Transaction {
                    message: "abort".to_string(),
                    source: None,
                }
                .into())
            });
            assert!(inner.is_err());
            s.log_feature_addition(h, 3)
        })
        .unwrap();

    assert_eq!(store.feature_additions(h).unwrap(), vec![1, 3]);
}

#[test]
fn transaction_returns_closure_value() {
    let store = make_store();
    let handle = store
        .transaction(|s| s.get_or_create_dataset_handle("roads"))
        .unwrap();
    assert_eq!(store.dataset_handle("roads").unwrap(), Some(handle));
}

// ============================================================================
// File-backed store
// ============================================================================

#[test]
fn log_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline_log.sqlite");

    {
        let store = SqliteLogStore::open(&path).unwrap();
        let h = store.get_or_create_dataset_handle("roads").unwrap();
        store.log_feature_addition(h, 12).unwrap();
        store.log_attribute_value_change(h, 0, 3, 1, Some("7")).unwrap();
        store.increase_commit_no(h).unwrap();
        store.record_mapping(h, 3, 300).unwrap();
    }

    let store = SqliteLogStore::open(&path).unwrap();
    let h = store.dataset_handle("roads").unwrap().expect("handle persisted");
    assert_eq!(store.feature_additions(h).unwrap(), vec![12]);
    assert_eq!(store.commit_no(h).unwrap(), 1);
    assert_eq!(store.attribute_value_changes(h, 0).unwrap()[0].fid, 3);
    assert_eq!(store.remote_id_for(h, 3).unwrap(), Some(300));
    assert_eq!(store.get_or_create_dataset_handle("parcels").unwrap(), 1);
}

#[test]
fn open_fails_in_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no").join("such").join("log.sqlite");
    assert!(SqliteLogStore::open(&path).is_err());
}

#[test]
fn open_fails_on_non_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.sqlite");
    std::fs::write(&path, vec![b'x'; 8192]).unwrap();
    assert!(SqliteLogStore::open(&path).is_err());
}

#[test]
fn unknown_type_tag_is_reported_as_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline_log.sqlite");
    let store = SqliteLogStore::open(&path).unwrap();
    let h = store.get_or_create_dataset_handle("roads").unwrap();

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute(
        "INSERT INTO log_added_attrs (layer_id, commit_no, name, type, length, precision, comment) \
         VALUES (?1, 0, 'shape', 'blob', 0, 0, '')",
        [h],
    )
    .unwrap();
    drop(raw);

    let err = store.attribute_additions(h, 0).unwrap_err();
    match err {
        OfflineError::Storage(StorageError::Corruption { table, column, .. }) => {
            assert_eq!(table, "log_added_attrs");
            assert_eq!(column, "type");
        }
        other => panic!("expected corruption, got {other:?}"),
    }
}

#[test]
fn negative_field_index_is_reported_as_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline_log.sqlite");
    let store = SqliteLogStore::open(&path).unwrap();
    let h = store.get_or_create_dataset_handle("roads").unwrap();

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute(
        "INSERT INTO log_feature_updates (layer_id, commit_no, fid, attr, value) \
         VALUES (?1, 0, 7, -1, 'x')",
        [h],
    )
    .unwrap();
    drop(raw);

    let err = store.attribute_value_changes(h, 0).unwrap_err();
    match err {
        OfflineError::Storage(StorageError::Corruption { table, column, .. }) => {
            assert_eq!(table, "log_feature_updates");
            assert_eq!(column, "attr");
        }
        other => panic!("expected corruption, got {other:?}"),
    }
}
