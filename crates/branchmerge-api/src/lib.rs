use std::path::PathBuf;

use anyhow::Result;
use branchmerge_core::{Branch, BranchId, BranchOrder, BranchTransaction, MergeError, MergeRequest};
use branchmerge_store_sqlite::{SchemaStatus, SeedSummary, SqliteStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Process-facing API over one database path. Opens the store per call and
/// migrates before touching data; the store handle is injected by path rather
/// than held as ambient global state.
#[derive(Debug, Clone)]
pub struct BranchMergeApi {
    db_path: PathBuf,
}

impl BranchMergeApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Seed the demo dataset; re-running skips rows that already exist.
    ///
    /// # Errors
    /// Returns an error when seeding fails.
    pub fn seed_demo(&self) -> Result<SeedSummary> {
        let mut store = self.open_migrated_store()?;
        store.seed_demo_data()
    }

    /// List every branch. No filtering; safe to call at any time.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn list_branches(&self) -> Result<Vec<Branch>> {
        let store = self.open_migrated_store()?;
        store.list_branches()
    }

    /// Look up one branch; `None` is a valid, non-error outcome.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn get_branch(&self, id: &BranchId) -> Result<Option<Branch>> {
        let store = self.open_migrated_store()?;
        store.find_branch(id)
    }

    /// List dependent transactions for one branch.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn list_transactions(&self, branch_id: &BranchId) -> Result<Vec<BranchTransaction>> {
        let store = self.open_migrated_store()?;
        store.list_transactions(branch_id)
    }

    /// List dependent orders for one branch.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn list_orders(&self, branch_id: &BranchId) -> Result<Vec<BranchOrder>> {
        let store = self.open_migrated_store()?;
        store.list_orders(branch_id)
    }

    /// Consolidate duplicate branches into the canonical branch.
    ///
    /// # Errors
    /// Returns the engine's typed validation errors, or
    /// [`MergeError::ConsolidationFailed`] when the store cannot be opened,
    /// migrated, or committed.
    pub fn merge_branches(&self, request: &MergeRequest) -> Result<Branch, MergeError> {
        let mut store = self
            .open_migrated_store()
            .map_err(|err| MergeError::ConsolidationFailed(format!("{err:#}")))?;
        store.merge_branches(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("branchmerge-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn ids(values: &[&str]) -> Vec<BranchId> {
        values.iter().copied().map(BranchId::from).collect()
    }

    #[test]
    fn seed_list_and_lookup_round_trip() {
        let db_path = unique_temp_db_path();
        let api = BranchMergeApi::new(db_path.clone());

        let summary = match api.seed_demo() {
            Ok(summary) => summary,
            Err(err) => panic!("seeding should succeed: {err}"),
        };
        assert_eq!(summary.inserted_branches, 6);

        let branches = match api.list_branches() {
            Ok(branches) => branches,
            Err(err) => panic!("listing should succeed: {err}"),
        };
        assert_eq!(branches.len(), 6);

        let loaded = match api.get_branch(&BranchId::from("demo-branch-4")) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => panic!("seeded branch should be found"),
            Err(err) => panic!("lookup should succeed: {err}"),
        };
        assert_eq!(loaded.name, "Teahouse Grand");

        match api.get_branch(&BranchId::from("missing-id")) {
            Ok(None) => {}
            Ok(Some(found)) => panic!("unexpected branch {}", found.id),
            Err(err) => panic!("lookup should succeed: {err}"),
        }

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn merge_consumes_duplicates_and_moves_history() {
        let db_path = unique_temp_db_path();
        let api = BranchMergeApi::new(db_path.clone());
        if let Err(err) = api.seed_demo() {
            panic!("seeding should succeed: {err}");
        }

        let request = MergeRequest {
            canonical_id: BranchId::from("demo-branch-1"),
            duplicate_ids: ids(&["demo-branch-2", "demo-branch-3"]),
        };
        let canonical = match api.merge_branches(&request) {
            Ok(branch) => branch,
            Err(err) => panic!("merge should succeed: {err}"),
        };
        assert_eq!(canonical.id.as_str(), "demo-branch-1");
        assert_eq!(canonical.name, "Coffee Shop Central");

        let transactions = match api.list_transactions(&BranchId::from("demo-branch-1")) {
            Ok(records) => records,
            Err(err) => panic!("listing should succeed: {err}"),
        };
        assert_eq!(transactions.len(), 3);

        // The same id set is consumed; a second merge must not silently succeed.
        let err = match api.merge_branches(&request) {
            Ok(branch) => panic!("re-merge should fail, got branch {}", branch.id),
            Err(err) => err,
        };
        assert_eq!(err, MergeError::DuplicatesNotFound(ids(&["demo-branch-2", "demo-branch-3"])));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn migrate_dry_run_reports_pending_versions() {
        let db_path = unique_temp_db_path();
        let api = BranchMergeApi::new(db_path.clone());

        let planned = match api.migrate(true) {
            Ok(result) => result,
            Err(err) => panic!("dry-run migrate should succeed: {err}"),
        };
        assert!(planned.dry_run);
        assert_eq!(planned.current_version, 0);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(planned.after_version, None);

        let applied = match api.migrate(false) {
            Ok(result) => result,
            Err(err) => panic!("migrate should succeed: {err}"),
        };
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
    }
}
