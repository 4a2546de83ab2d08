//! Tests for ChangeRecorder: what each committed edit leaves in the log.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use offline_editing::dataset::{Dataset, MemoryDataset};
use offline_editing::recorder::{
    ChangeRecorder, RecorderError, RecorderErrorCallback, RecorderOptions,
};
use offline_editing::storage::{ChangeLogBackend, SqliteLogStore};
use offline_editing::types::{DatasetHandle, Field, FieldType, Geometry};

// ============================================================================
// Test helpers
// ============================================================================

fn parcel_fields() -> Vec<Field> {
    vec![
        Field::new("name", FieldType::Text),
        Field::new("score", FieldType::Integer),
        Field::new("tags", FieldType::StringList),
    ]
}

fn point(x: i32, y: i32) -> Geometry {
    Geometry::from_wkt(format!("POINT ({x} {y})"))
}

/// Recording in-memory log plus a dataset with features 1 and 2.
fn setup() -> (Arc<SqliteLogStore>, ChangeRecorder<SqliteLogStore>, MemoryDataset) {
    let store = Arc::new(SqliteLogStore::open_in_memory().expect("open log"));
    let recorder = ChangeRecorder::new(Arc::clone(&store), RecorderOptions::default());
    let dataset = MemoryDataset::new("parcels", parcel_fields());
    dataset.seed_feature(Some(point(0, 0)), vec![json!("north"), json!(1)]);
    dataset.seed_feature(Some(point(1, 1)), vec![json!("south"), json!(2)]);
    assert!(recorder.start_recording(&dataset));
    (store, recorder, dataset)
}

fn handle(store: &SqliteLogStore) -> DatasetHandle {
    store
        .dataset_handle("parcels")
        .unwrap()
        .expect("dataset was logged")
}

// ============================================================================
// Feature additions and removals
// ============================================================================

#[test]
fn added_features_are_logged_with_assigned_ids() {
    let (store, _recorder, mut dataset) = setup();

    dataset.begin_edit().unwrap();
    dataset
        .add_feature(Some(point(5, 5)), vec![json!("east")])
        .unwrap();
    dataset.add_feature(None, vec![json!("west")]).unwrap();
    let commit = dataset.commit_edit().unwrap();

    assert_eq!(commit.added_ids, vec![3, 4]);
    assert_eq!(store.feature_additions(handle(&store)).unwrap(), vec![3, 4]);
}

#[test]
fn removing_a_pending_addition_retires_it() {
    let (store, _recorder, mut dataset) = setup();

    dataset.begin_edit().unwrap();
    dataset.add_feature(None, vec![json!("temp")]).unwrap();
    dataset.commit_edit().unwrap();

    dataset.begin_edit().unwrap();
    assert!(dataset.delete_feature(3).unwrap());
    dataset.commit_edit().unwrap();

    let h = handle(&store);
    assert!(store.feature_additions(h).unwrap().is_empty());
    assert!(store.feature_removals(h).unwrap().is_empty());
}

#[test]
fn removing_an_existing_feature_logs_a_removal() {
    let (store, _recorder, mut dataset) = setup();

    dataset.begin_edit().unwrap();
    dataset.delete_feature(1).unwrap();
    dataset.commit_edit().unwrap();

    assert_eq!(store.feature_removals(handle(&store)).unwrap(), vec![1]);
}

// ============================================================================
// Value, geometry and schema changes
// ============================================================================

#[test]
fn value_changes_are_logged_as_text() {
    let (store, _recorder, mut dataset) = setup();

    dataset.begin_edit().unwrap();
    dataset.change_attribute_value(1, 0, json!(null)).unwrap();
    dataset.change_attribute_value(1, 1, json!(5)).unwrap();
    dataset
        .change_attribute_value(2, 2, json!(["x", "y"]))
        .unwrap();
    dataset.commit_edit().unwrap();

    let changes = store.attribute_value_changes(handle(&store), 0).unwrap();
    let rows: Vec<_> = changes
        .iter()
        .map(|c| (c.fid, c.field_index, c.value.clone()))
        .collect();
    assert_eq!(
        rows,
        vec![
            (1, 0, None),
            (1, 1, Some("5".to_string())),
            (2, 2, Some("[\"x\",\"y\"]".to_string())),
        ]
    );
}

#[test]
fn geometry_changes_are_logged_as_wkt() {
    let (store, _recorder, mut dataset) = setup();

    dataset.begin_edit().unwrap();
    dataset.change_geometry(2, point(9, 9)).unwrap();
    dataset.commit_edit().unwrap();

    let changes = store.geometry_changes(handle(&store), 0).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].fid, 2);
    assert_eq!(changes[0].geometry.as_wkt(), "POINT (9 9)");
}

#[test]
fn edits_of_pending_additions_are_not_logged() {
    let (store, _recorder, mut dataset) = setup();

    dataset.begin_edit().unwrap();
    dataset.add_feature(None, vec![json!("new")]).unwrap();
    dataset.commit_edit().unwrap();

    dataset.begin_edit().unwrap();
    dataset.change_attribute_value(3, 1, json!(9)).unwrap();
    dataset.change_geometry(3, point(4, 4)).unwrap();
    dataset.commit_edit().unwrap();

    let h = handle(&store);
    let pending = store.pending_changes(h).unwrap();
    assert_eq!(pending.added_features, 1);
    assert_eq!(pending.value_changes, 0);
    assert_eq!(pending.geometry_changes, 0);
    assert_eq!(dataset.feature(3).unwrap().attribute(1), &json!(9));
}

#[test]
fn added_fields_are_logged() {
    let (store, _recorder, mut dataset) = setup();

    dataset.begin_edit().unwrap();
    dataset
        .add_field(Field::new("owner", FieldType::Text).with_length(40))
        .unwrap();
    dataset.commit_edit().unwrap();

    let additions = store.attribute_additions(handle(&store), 0).unwrap();
    assert_eq!(additions.len(), 1);
    assert_eq!(additions[0].field.name, "owner");
    assert_eq!(additions[0].field.field_type, FieldType::Text);
    assert_eq!(additions[0].field.length, 40);
}

// ============================================================================
// Attach / detach
// ============================================================================

#[test]
fn attach_and_detach_report_state() {
    let (_store, recorder, dataset) = setup();

    assert!(recorder.is_recording("parcels"));
    assert!(!recorder.start_recording(&dataset));
    assert!(recorder.stop_recording(&dataset));
    assert!(!recorder.stop_recording(&dataset));
    assert!(!recorder.is_recording("parcels"));
}

#[test]
fn edits_after_stop_are_not_logged() {
    let (store, recorder, mut dataset) = setup();
    recorder.stop_recording(&dataset);

    dataset.begin_edit().unwrap();
    dataset.delete_feature(1).unwrap();
    dataset.commit_edit().unwrap();

    assert_eq!(store.dataset_handle("parcels").unwrap(), None);
}

#[test]
fn failed_log_write_reaches_error_callback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline_log.sqlite");
    let store = Arc::new(SqliteLogStore::open(&path).unwrap());

    let failures: Arc<Mutex<Vec<RecorderError>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    let on_error: Arc<RecorderErrorCallback> = Arc::new(move |e: &RecorderError| {
        sink.lock().push(e.clone());
    });
    let recorder = ChangeRecorder::new(
        Arc::clone(&store),
        RecorderOptions {
            on_error: Some(on_error),
        },
    );

    let mut dataset = MemoryDataset::new("parcels", parcel_fields());
    dataset.seed_feature(None, vec![json!("north")]);
    recorder.start_recording(&dataset);

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute_batch("DROP TABLE log_feature_updates").unwrap();
    drop(raw);

    dataset.begin_edit().unwrap();
    dataset.change_attribute_value(1, 1, json!(3)).unwrap();
    dataset.commit_edit().unwrap();

    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].dataset, "parcels");
    assert!(failures[0].error.contains("log_feature_updates"), "{}", failures[0].error);
}
