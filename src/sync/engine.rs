//! ReplayEngine: replays a dataset's change log onto its remote source.
//!
//! One synchronization per dataset runs as a single remote edit session:
//!
//! 1. open the remote dataset and begin an edit session;
//! 2. for each commit number in order, add fields, then change attribute
//!    values, then change geometries;
//! 3. insert pending feature additions with their current local state;
//! 4. delete pending feature removals;
//! 5. commit the remote session;
//! 6. pair new remote ids with local ids, record the mappings, purge the log
//!    and reset the commit counter, all in one log transaction.
//!
//! Any failure before step 5 completes discards the remote session and leaves
//! the log untouched, so the whole pass can be retried. Once the remote commit
//! succeeds the log is purged no matter how step 6 ends: replaying it again
//! would insert the additions a second time.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::codec::{convert_value, decode_value};
use crate::dataset::{Dataset, DatasetProvider, EditCommit};
use crate::error::{DatasetError, SyncError};
use crate::storage::LogStore;
use crate::types::{CommitNo, DatasetHandle, FeatureId, Field, PendingChanges};

use super::types::*;

type SyncResult<T> = std::result::Result<T, SyncError>;

/// Local field index -> remote field index, matched by field name.
fn attribute_lookup(local: &[Field], remote: &[Field]) -> HashMap<usize, usize> {
    let by_name: HashMap<&str, usize> = remote
        .iter()
        .enumerate()
        .map(|(i, f)| (f.name.as_str(), i))
        .collect();
    local
        .iter()
        .enumerate()
        .filter_map(|(i, f)| by_name.get(f.name.as_str()).map(|&r| (i, r)))
        .collect()
}

/// What the remote session did, handed from the replay to the id map update.
struct ReplayOutcome {
    commit: EditCommit,
    /// Local ids of the inserted features, in insertion order
    added_local: Vec<FeatureId>,
    /// Local ids whose remote counterpart was deleted
    removed_local: Vec<FeatureId>,
}

// ============================================================================
// ReplayEngine
// ============================================================================

pub struct ReplayEngine<B: LogStore> {
    store: Arc<B>,
    provider: Arc<dyn DatasetProvider>,
    on_progress: Option<Arc<ProgressCallback>>,
    on_warning: Option<Arc<WarningCallback>>,
    /// Last known replay state per dataset name
    states: Mutex<HashMap<String, ReplayState>>,
}

impl<B: LogStore> ReplayEngine<B> {
    pub fn new(store: Arc<B>, provider: Arc<dyn DatasetProvider>, options: SyncOptions) -> Self {
        Self {
            store,
            provider,
            on_progress: options.on_progress,
            on_warning: options.on_warning,
            states: Mutex::new(HashMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Replay the change log of `local` onto the dataset at `remote_locator`.
    pub fn synchronize(&self, local: &dyn Dataset, remote_locator: &str) -> SyncResult<SyncReport> {
        let dataset = local.name().to_string();
        let mut report = SyncReport::new(dataset.clone());
        tracing::info!(dataset = %dataset, remote = %remote_locator, "synchronizing");

        match self.run(local, remote_locator, &mut report) {
            Ok(()) => {
                self.set_state(&dataset, ReplayState::Idle);
                tracing::info!(
                    dataset = %dataset,
                    commits = report.commits,
                    added = report.features_added,
                    removed = report.features_removed,
                    warnings = report.warnings.len(),
                    "synchronized"
                );
                Ok(report)
            }
            Err(e) => {
                self.set_state(&dataset, ReplayState::Failed);
                tracing::error!(dataset = %dataset, error = %e, "synchronization failed");
                Err(e)
            }
        }
    }

    /// Synchronize several datasets sequentially. A failing dataset does not
    /// stop the others; every dataset gets its own result.
    pub fn synchronize_all(
        &self,
        targets: &[(&dyn Dataset, &str)],
    ) -> Vec<(String, SyncResult<SyncReport>)> {
        let total = targets.len();
        targets
            .iter()
            .enumerate()
            .map(|(i, &(local, locator))| {
                self.dataset_started(i + 1, total, local.name());
                (local.name().to_string(), self.synchronize(local, locator))
            })
            .collect()
    }

    /// Announce dataset `index` (1-based) of a multi-dataset pass.
    pub fn dataset_started(&self, index: usize, total: usize, dataset: &str) {
        self.report_progress(ProgressEvent::DatasetStarted {
            index,
            total,
            dataset: dataset.to_string(),
        });
    }

    /// Last replay state of `dataset` (`Idle` if it never synchronized).
    pub fn state(&self, dataset: &str) -> ReplayState {
        self.states
            .lock()
            .get(dataset)
            .cloned()
            .unwrap_or(ReplayState::Idle)
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    fn run(&self, local: &dyn Dataset, locator: &str, report: &mut SyncReport) -> SyncResult<()> {
        let dataset = local.name().to_string();
        self.set_state(&dataset, ReplayState::OpeningRemote);

        let mut remote = self
            .provider
            .open_remote(locator)
            .map_err(|e| SyncError::RemoteUnavailable {
                locator: locator.to_string(),
                message: e.message,
            })?;
        if !remote.is_valid() {
            return Err(SyncError::RemoteUnavailable {
                locator: locator.to_string(),
                message: "dataset is not valid".to_string(),
            });
        }

        let Some(handle) = self.store.dataset_handle(&dataset)? else {
            tracing::debug!(dataset = %dataset, "no change log entry, nothing to replay");
            return Ok(());
        };
        let pending = self.store.pending_changes(handle)?;
        report.commits = pending.commits;
        if pending.is_empty() {
            if pending.commits > 0 {
                self.store.reset_commit_no(handle)?;
            }
            tracing::debug!(dataset = %dataset, "change log empty, nothing to replay");
            return Ok(());
        }

        // Remote ids present before the session; new rows are the ones missing here.
        let baseline: BTreeSet<FeatureId> = if pending.added_features > 0 {
            remote
                .feature_ids()
                .map_err(|e| edit_failed(&dataset, "feature scan", e))?
                .into_iter()
                .collect()
        } else {
            BTreeSet::new()
        };

        remote
            .begin_edit()
            .map_err(|e| edit_failed(&dataset, "edit session start", e))?;

        let outcome = match self.replay(local, remote.as_mut(), handle, &pending, report) {
            Ok(outcome) => outcome,
            Err(e) => {
                remote.discard_edit();
                return Err(e);
            }
        };

        // Committed remotely: every path below purges the log.
        self.set_state(&dataset, ReplayState::UpdatingIdMap);
        let paired = self.pair_added_ids(remote.as_ref(), &dataset, &baseline, &outcome);
        let pairs: &[(FeatureId, FeatureId)] = match &paired {
            Ok(pairs) => pairs,
            Err(_) => &[],
        };

        let batch = self.store.transaction(|store| {
            store.record_mappings(handle, pairs)?;
            for &local_id in &outcome.removed_local {
                store.remove_mapping(handle, local_id)?;
            }
            store.purge(handle, None)?;
            store.reset_commit_no(handle)
        });
        if let Err(e) = batch {
            tracing::warn!(dataset = %dataset, error = %e, "id map update failed after remote commit, purging log");
            self.store.transaction(|store| {
                store.purge(handle, None)?;
                store.reset_commit_no(handle)
            })?;
            self.set_state(&dataset, ReplayState::Purged);
            return Err(SyncError::IdMapUpdateFailed {
                dataset,
                message: e.to_string(),
            });
        }
        self.set_state(&dataset, ReplayState::Purged);

        match paired {
            Ok(pairs) => {
                report.mappings_added = pairs.len();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    dataset = %dataset,
                    added = outcome.added_local.len(),
                    "additions committed remotely without id mappings"
                );
                Err(e)
            }
        }
    }

    fn replay(
        &self,
        local: &dyn Dataset,
        remote: &mut dyn Dataset,
        handle: DatasetHandle,
        pending: &PendingChanges,
        report: &mut SyncReport,
    ) -> SyncResult<ReplayOutcome> {
        let dataset = report.dataset.clone();

        // An unfinished local commit still carries rows at the current number.
        for commit in 0..=pending.commits {
            self.set_state(&dataset, ReplayState::ReplayingSchema { commit });
            self.apply_attribute_additions(remote, handle, commit, report)?;
            self.apply_value_changes(local, remote, handle, commit, report)?;
            self.apply_geometry_changes(remote, handle, commit, report)?;
        }

        self.set_state(&dataset, ReplayState::ReplayingAdds);
        let added_local = self.apply_feature_additions(local, remote, handle, report)?;

        self.set_state(&dataset, ReplayState::ReplayingRemoves);
        let removed_local = self.apply_feature_removals(remote, handle, report)?;

        self.set_state(&dataset, ReplayState::Committing);
        let commit = remote
            .commit_edit()
            .map_err(|e| SyncError::RemoteCommitFailed {
                dataset: dataset.clone(),
                message: e.message,
            })?;

        Ok(ReplayOutcome {
            commit,
            added_local,
            removed_local,
        })
    }

    fn apply_attribute_additions(
        &self,
        remote: &mut dyn Dataset,
        handle: DatasetHandle,
        commit: CommitNo,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let additions = self.store.attribute_additions(handle, commit)?;
        if additions.is_empty() {
            return Ok(());
        }
        let dataset = report.dataset.clone();
        self.phase_started(&dataset, ProgressMode::AddFields, additions.len());

        for (i, addition) in additions.into_iter().enumerate() {
            let mut field = addition.field;
            if remote.fields().iter().any(|f| f.name == field.name) {
                tracing::debug!(dataset = %dataset, field = %field.name, "field already exists remotely");
            } else {
                let outcome = match remote.native_type_for(&field.field_type) {
                    Some(native) => {
                        field.type_name = Some(native);
                        remote.add_field(field.clone()).map_err(|e| e.message)
                    }
                    None => Err(format!("type {} is not supported", field.field_type)),
                };
                match outcome {
                    Ok(()) => report.fields_added += 1,
                    Err(reason) => self.warn(
                        report,
                        SyncWarning::SchemaFieldRejected {
                            dataset: dataset.clone(),
                            field: field.name.clone(),
                            field_type: field.field_type.clone(),
                            reason,
                        },
                    ),
                }
            }
            self.step_completed(&dataset, ProgressMode::AddFields, i + 1);
        }
        Ok(())
    }

    fn apply_value_changes(
        &self,
        local: &dyn Dataset,
        remote: &mut dyn Dataset,
        handle: DatasetHandle,
        commit: CommitNo,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let changes = self.store.attribute_value_changes(handle, commit)?;
        if changes.is_empty() {
            return Ok(());
        }
        let dataset = report.dataset.clone();
        self.phase_started(&dataset, ProgressMode::UpdateFeatures, changes.len());

        let local_fields = local.fields();
        let remote_fields = remote.fields();
        let lookup = attribute_lookup(&local_fields, &remote_fields);

        for (i, change) in changes.into_iter().enumerate() {
            self.step_completed(&dataset, ProgressMode::UpdateFeatures, i + 1);
            if self.store.is_added_feature(handle, change.fid)? {
                continue;
            }
            let Some(remote_fid) = self.store.remote_id_for(handle, change.fid)? else {
                self.mapping_miss(report, change.fid, "attribute change");
                continue;
            };
            let Some(&remote_index) = lookup.get(&change.field_index) else {
                let local_field = local_fields
                    .get(change.field_index)
                    .map(|f| f.name.clone())
                    .unwrap_or_else(|| format!("#{}", change.field_index));
                self.warn(
                    report,
                    SyncWarning::UnmappedAttribute {
                        dataset: dataset.clone(),
                        local_field,
                    },
                );
                continue;
            };
            let value = decode_value(
                change.value.as_deref(),
                &remote_fields[remote_index].field_type,
            );
            let found = remote
                .change_attribute_value(remote_fid, remote_index, value)
                .map_err(|e| edit_failed(&dataset, "attribute change", e))?;
            if found {
                report.values_changed += 1;
            } else {
                self.mapping_miss(report, change.fid, "attribute change");
            }
        }
        Ok(())
    }

    fn apply_geometry_changes(
        &self,
        remote: &mut dyn Dataset,
        handle: DatasetHandle,
        commit: CommitNo,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let changes = self.store.geometry_changes(handle, commit)?;
        if changes.is_empty() {
            return Ok(());
        }
        let dataset = report.dataset.clone();
        self.phase_started(&dataset, ProgressMode::UpdateGeometries, changes.len());

        for (i, change) in changes.into_iter().enumerate() {
            self.step_completed(&dataset, ProgressMode::UpdateGeometries, i + 1);
            if self.store.is_added_feature(handle, change.fid)? {
                continue;
            }
            let Some(remote_fid) = self.store.remote_id_for(handle, change.fid)? else {
                self.mapping_miss(report, change.fid, "geometry change");
                continue;
            };
            let found = remote
                .change_geometry(remote_fid, change.geometry)
                .map_err(|e| edit_failed(&dataset, "geometry change", e))?;
            if found {
                report.geometries_changed += 1;
            } else {
                self.mapping_miss(report, change.fid, "geometry change");
            }
        }
        Ok(())
    }

    /// Insert every pending addition with its current local state. Returns
    /// the local ids in insertion order.
    fn apply_feature_additions(
        &self,
        local: &dyn Dataset,
        remote: &mut dyn Dataset,
        handle: DatasetHandle,
        report: &mut SyncReport,
    ) -> SyncResult<Vec<FeatureId>> {
        let logged = self.store.feature_additions(handle)?;
        if logged.is_empty() {
            return Ok(Vec::new());
        }
        let dataset = report.dataset.clone();

        let features = local
            .get_features(&logged)
            .map_err(|e| SyncError::LocalReadFailed {
                dataset: dataset.clone(),
                message: e.message,
            })?;
        if features.len() != logged.len() {
            return Err(SyncError::IdentifierMismatch {
                dataset,
                expected: logged.len(),
                found: features.len(),
            });
        }

        self.phase_started(&dataset, ProgressMode::AddFeatures, features.len());
        let remote_fields = remote.fields();
        let lookup = attribute_lookup(&local.fields(), &remote_fields);

        let mut added = Vec::with_capacity(features.len());
        for (i, feature) in features.into_iter().enumerate() {
            let mut attributes = vec![Value::Null; remote_fields.len()];
            for (local_index, value) in feature.attributes.into_iter().enumerate() {
                if let Some(&remote_index) = lookup.get(&local_index) {
                    attributes[remote_index] =
                        convert_value(value, &remote_fields[remote_index].field_type);
                }
            }
            for (remote_index, slot) in attributes.iter_mut().enumerate() {
                if slot.is_null() {
                    if let Some(default) = remote.default_value(remote_index) {
                        *slot = default;
                    }
                }
            }

            remote
                .add_feature(feature.geometry, attributes)
                .map_err(|e| edit_failed(&dataset, "feature insert", e))?;
            added.push(feature.id);
            report.features_added += 1;
            self.step_completed(&dataset, ProgressMode::AddFeatures, i + 1);
        }
        Ok(added)
    }

    /// Delete the remote counterparts of pending removals. Returns the local
    /// ids whose mapping is now stale.
    fn apply_feature_removals(
        &self,
        remote: &mut dyn Dataset,
        handle: DatasetHandle,
        report: &mut SyncReport,
    ) -> SyncResult<Vec<FeatureId>> {
        let removals = self.store.feature_removals(handle)?;
        if removals.is_empty() {
            return Ok(Vec::new());
        }
        let dataset = report.dataset.clone();
        self.phase_started(&dataset, ProgressMode::RemoveFeatures, removals.len());

        let mut removed = Vec::new();
        for (i, local_id) in removals.into_iter().enumerate() {
            self.step_completed(&dataset, ProgressMode::RemoveFeatures, i + 1);
            let Some(remote_fid) = self.store.remote_id_for(handle, local_id)? else {
                self.mapping_miss(report, local_id, "feature delete");
                continue;
            };
            let found = remote
                .delete_feature(remote_fid)
                .map_err(|e| edit_failed(&dataset, "feature delete", e))?;
            if found {
                report.features_removed += 1;
            } else {
                tracing::debug!(dataset = %dataset, local_id, remote_fid, "remote feature already gone");
            }
            removed.push(local_id);
        }
        Ok(removed)
    }

    /// Pair new remote ids with the inserted local ids. Uses the ids echoed
    /// by the commit when present, otherwise the remote ids absent from
    /// `baseline` in ascending order. New rows beyond our additions belong to
    /// other writers and stay unmapped.
    fn pair_added_ids(
        &self,
        remote: &dyn Dataset,
        dataset: &str,
        baseline: &BTreeSet<FeatureId>,
        outcome: &ReplayOutcome,
    ) -> SyncResult<Vec<(FeatureId, FeatureId)>> {
        let expected = outcome.added_local.len();
        if expected == 0 {
            return Ok(Vec::new());
        }

        let remote_ids = if outcome.commit.added_ids.is_empty() {
            let ids = remote
                .feature_ids()
                .map_err(|e| edit_failed(dataset, "feature scan", e))?;
            self.phase_started(dataset, ProgressMode::ProcessFeatures, ids.len());
            let mut fresh = Vec::new();
            for (i, remote_id) in ids.into_iter().enumerate() {
                if !baseline.contains(&remote_id) {
                    fresh.push(remote_id);
                }
                self.step_completed(dataset, ProgressMode::ProcessFeatures, i + 1);
            }
            fresh.sort_unstable();
            if fresh.len() > expected {
                tracing::debug!(
                    dataset,
                    foreign = fresh.len() - expected,
                    "remote gained rows from other writers"
                );
                fresh.truncate(expected);
            }
            fresh
        } else {
            outcome.commit.added_ids.clone()
        };

        if remote_ids.len() != expected {
            return Err(SyncError::IdentifierMismatch {
                dataset: dataset.to_string(),
                expected,
                found: remote_ids.len(),
            });
        }
        Ok(outcome
            .added_local
            .iter()
            .copied()
            .zip(remote_ids)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    fn set_state(&self, dataset: &str, state: ReplayState) {
        self.states.lock().insert(dataset.to_string(), state.clone());
        self.report_progress(ProgressEvent::StateChanged {
            dataset: dataset.to_string(),
            state,
        });
    }

    fn phase_started(&self, dataset: &str, mode: ProgressMode, total_steps: usize) {
        self.report_progress(ProgressEvent::PhaseStarted {
            dataset: dataset.to_string(),
            mode,
            total_steps,
        });
    }

    fn step_completed(&self, dataset: &str, mode: ProgressMode, step: usize) {
        self.report_progress(ProgressEvent::StepCompleted {
            dataset: dataset.to_string(),
            mode,
            step,
        });
    }

    fn report_progress(&self, event: ProgressEvent) {
        if let Some(ref on_progress) = self.on_progress {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                on_progress(&event);
            }));
        }
    }

    fn mapping_miss(&self, report: &mut SyncReport, local_id: FeatureId, operation: &'static str) {
        tracing::debug!(dataset = %report.dataset, local_id, operation, "no remote counterpart, skipped");
        let warning = SyncWarning::MappingMiss {
            dataset: report.dataset.clone(),
            local_id,
            operation,
        };
        self.emit_warning(&warning);
        report.warnings.push(warning);
    }

    fn warn(&self, report: &mut SyncReport, warning: SyncWarning) {
        tracing::warn!(dataset = %report.dataset, warning = ?warning, "replay warning");
        self.emit_warning(&warning);
        report.warnings.push(warning);
    }

    fn emit_warning(&self, warning: &SyncWarning) {
        if let Some(ref on_warning) = self.on_warning {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                on_warning(warning);
            }));
        }
    }
}

fn edit_failed(dataset: &str, operation: &'static str, e: DatasetError) -> SyncError {
    SyncError::RemoteEditFailed {
        dataset: dataset.to_string(),
        operation,
        message: e.message,
    }
}
