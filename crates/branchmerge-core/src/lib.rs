use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Opaque, externally-assigned branch identifier. Stable for the lifetime of
/// the row; consolidation never renumbers or recreates it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct BranchId(pub String);

impl BranchId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for BranchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BranchId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One discovered physical branch of a merchant.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Branch {
    pub id: BranchId,
    #[serde(with = "time::serde::rfc3339")]
    pub date_added_utc: OffsetDateTime,
    pub name: String,
    pub source_url: Option<String>,
    pub address: Option<String>,
    pub merchant_id: Option<String>,
}

impl Branch {
    /// Validate creation-time invariants before a row is persisted.
    ///
    /// # Errors
    /// Returns [`MergeError::InvalidRequest`] when the id or name is blank.
    pub fn validate(&self) -> Result<(), MergeError> {
        if self.id.is_blank() {
            return Err(MergeError::InvalidRequest("branch id must be non-empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(MergeError::InvalidRequest("branch name must be non-empty".to_string()));
        }
        Ok(())
    }
}

/// A payment captured at a branch. Carries a foreign reference that must
/// survive consolidation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BranchTransaction {
    pub transaction_id: String,
    pub branch_id: BranchId,
    pub amount_cents: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

/// An order placed against a branch. Carries a foreign reference that must
/// survive consolidation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BranchOrder {
    pub order_id: String,
    pub branch_id: BranchId,
    pub reference: String,
    #[serde(with = "time::serde::rfc3339")]
    pub placed_at: OffsetDateTime,
}

/// Transient merge input: one surviving canonical id plus the ids to absorb.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeRequest {
    pub canonical_id: BranchId,
    pub duplicate_ids: Vec<BranchId>,
}

impl MergeRequest {
    /// Structural validation only; existence checks run inside the unit of work.
    ///
    /// # Errors
    /// Returns [`MergeError::InvalidRequest`] for an empty duplicate set or any
    /// blank id, and [`MergeError::SelfMergeNotAllowed`] when the canonical id
    /// appears among the duplicates.
    pub fn validate(&self) -> Result<(), MergeError> {
        if self.duplicate_ids.is_empty() {
            return Err(MergeError::InvalidRequest(
                "at least one duplicate branch id must be provided".to_string(),
            ));
        }
        if self.canonical_id.is_blank() {
            return Err(MergeError::InvalidRequest(
                "canonical branch id must be non-empty".to_string(),
            ));
        }
        if self.duplicate_ids.iter().any(BranchId::is_blank) {
            return Err(MergeError::InvalidRequest(
                "duplicate branch ids must be non-empty".to_string(),
            ));
        }
        if self.duplicate_ids.contains(&self.canonical_id) {
            return Err(MergeError::SelfMergeNotAllowed);
        }
        Ok(())
    }
}

fn join_ids(ids: &[BranchId]) -> String {
    ids.iter().map(BranchId::as_str).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MergeError {
    #[error("invalid merge request: {0}")]
    InvalidRequest(String),
    #[error("cannot merge canonical branch with itself")]
    SelfMergeNotAllowed,
    #[error("canonical branch with id {0} not found")]
    CanonicalNotFound(BranchId),
    #[error("branches not found: {}", join_ids(.0))]
    DuplicatesNotFound(Vec<BranchId>),
    #[error("consolidation failed: {0}")]
    ConsolidationFailed(String),
}

impl MergeError {
    /// Stable snake_case label used on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::SelfMergeNotAllowed => "self_merge_not_allowed",
            Self::CanonicalNotFound(_) => "canonical_not_found",
            Self::DuplicatesNotFound(_) => "duplicates_not_found",
            Self::ConsolidationFailed(_) => "consolidation_failed",
        }
    }

    /// A rolled-back merge is safe to retry from scratch; validation errors are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConsolidationFailed(_))
    }

    #[must_use]
    pub fn missing_ids(&self) -> Option<&[BranchId]> {
        match self {
            Self::DuplicatesNotFound(ids) => Some(ids),
            _ => None,
        }
    }
}

/// Store operations the engine needs, scoped to one atomic unit of work.
/// Implementations map their own storage failures into
/// [`MergeError::ConsolidationFailed`]; the owner of the unit of work commits
/// only after [`consolidate`] returns `Ok`.
pub trait MergeUnitOfWork {
    /// Point lookup; absent is a valid outcome, not a failure.
    fn find_branch(&mut self, id: &BranchId) -> Result<Option<Branch>, MergeError>;

    /// Returns only the branches that exist; the engine diffs against the
    /// requested set.
    fn find_branches(&mut self, ids: &[BranchId]) -> Result<Vec<Branch>, MergeError>;

    /// Re-point every dependent record referencing any `from` id to `to`.
    /// Returns the number of rows updated across all dependent-record types.
    fn reassign_references(
        &mut self,
        from: &[BranchId],
        to: &BranchId,
    ) -> Result<usize, MergeError>;

    /// Delete the branch rows for `ids`. Returns the number of rows deleted.
    fn delete_branches(&mut self, ids: &[BranchId]) -> Result<usize, MergeError>;
}

/// Order-preserving, deduplicated list of requested ids with no matching row.
#[must_use]
pub fn missing_ids(requested: &[BranchId], found: &[Branch]) -> Vec<BranchId> {
    let found_ids: BTreeSet<&BranchId> = found.iter().map(|branch| &branch.id).collect();
    let mut seen: BTreeSet<&BranchId> = BTreeSet::new();
    requested
        .iter()
        .filter(|id| !found_ids.contains(*id) && seen.insert(*id))
        .cloned()
        .collect()
}

/// Consolidate duplicate branches into the canonical branch.
///
/// Validates the request (first failing check wins, no effects before all
/// pass), then reassigns dependent records and deletes the duplicates inside
/// the supplied unit of work. The canonical row is never modified; the value
/// returned is the row as read during validation.
///
/// # Errors
/// Returns the first failing validation error, or
/// [`MergeError::ConsolidationFailed`] when the unit of work reports a
/// storage failure. The caller must not commit the unit of work on error.
pub fn consolidate(
    uow: &mut dyn MergeUnitOfWork,
    request: &MergeRequest,
) -> Result<Branch, MergeError> {
    request.validate()?;

    let canonical = uow
        .find_branch(&request.canonical_id)?
        .ok_or_else(|| MergeError::CanonicalNotFound(request.canonical_id.clone()))?;

    let found = uow.find_branches(&request.duplicate_ids)?;
    let missing = missing_ids(&request.duplicate_ids, &found);
    if !missing.is_empty() {
        return Err(MergeError::DuplicatesNotFound(missing));
    }

    uow.reassign_references(&request.duplicate_ids, &request.canonical_id)?;
    uow.delete_branches(&request.duplicate_ids)?;

    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::Duration;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_672_567_200)
    }

    fn mk_branch(id: &str, name: &str) -> Branch {
        Branch {
            id: BranchId::from(id),
            date_added_utc: fixture_time(),
            name: name.to_string(),
            source_url: None,
            address: Some("1 Test St".to_string()),
            merchant_id: Some("merchant-A".to_string()),
        }
    }

    fn ids(values: &[&str]) -> Vec<BranchId> {
        values.iter().copied().map(BranchId::from).collect()
    }

    #[derive(Debug, Default)]
    struct FakeUnitOfWork {
        branches: Vec<Branch>,
        transactions: Vec<BranchTransaction>,
        fail_on_delete: bool,
        reassign_calls: usize,
        delete_calls: usize,
    }

    impl MergeUnitOfWork for FakeUnitOfWork {
        fn find_branch(&mut self, id: &BranchId) -> Result<Option<Branch>, MergeError> {
            Ok(self.branches.iter().find(|branch| &branch.id == id).cloned())
        }

        fn find_branches(&mut self, ids: &[BranchId]) -> Result<Vec<Branch>, MergeError> {
            Ok(self
                .branches
                .iter()
                .filter(|branch| ids.contains(&branch.id))
                .cloned()
                .collect())
        }

        fn reassign_references(
            &mut self,
            from: &[BranchId],
            to: &BranchId,
        ) -> Result<usize, MergeError> {
            self.reassign_calls += 1;
            let mut reassigned = 0;
            for record in &mut self.transactions {
                if from.contains(&record.branch_id) {
                    record.branch_id = to.clone();
                    reassigned += 1;
                }
            }
            Ok(reassigned)
        }

        fn delete_branches(&mut self, ids: &[BranchId]) -> Result<usize, MergeError> {
            self.delete_calls += 1;
            if self.fail_on_delete {
                return Err(MergeError::ConsolidationFailed(
                    "simulated storage failure".to_string(),
                ));
            }
            let before = self.branches.len();
            self.branches.retain(|branch| !ids.contains(&branch.id));
            Ok(before - self.branches.len())
        }
    }

    fn uow_with_demo_rows() -> FakeUnitOfWork {
        FakeUnitOfWork {
            branches: vec![
                mk_branch("branch-1", "Coffee Shop Central"),
                mk_branch("branch-2", "Coffee Shop North"),
                mk_branch("branch-3", "Coffee Shop Express"),
            ],
            transactions: vec![BranchTransaction {
                transaction_id: "txn-1".to_string(),
                branch_id: BranchId::from("branch-2"),
                amount_cents: 1250,
                occurred_at: fixture_time(),
            }],
            ..FakeUnitOfWork::default()
        }
    }

    #[test]
    fn empty_duplicate_set_is_rejected_before_any_lookup() {
        let mut uow = uow_with_demo_rows();
        let request =
            MergeRequest { canonical_id: BranchId::from("branch-1"), duplicate_ids: vec![] };

        let err = match consolidate(&mut uow, &request) {
            Ok(branch) => panic!("expected InvalidRequest, got branch {}", branch.id),
            Err(err) => err,
        };
        assert!(matches!(err, MergeError::InvalidRequest(_)));
        assert_eq!(uow.reassign_calls, 0);
        assert_eq!(uow.delete_calls, 0);
    }

    #[test]
    fn blank_ids_are_rejected_as_invalid_request() {
        let mut uow = uow_with_demo_rows();
        let request = MergeRequest {
            canonical_id: BranchId::from("branch-1"),
            duplicate_ids: ids(&["branch-2", "  "]),
        };

        assert!(matches!(consolidate(&mut uow, &request), Err(MergeError::InvalidRequest(_))));
    }

    #[test]
    fn self_merge_is_rejected_and_nothing_is_touched() {
        let mut uow = uow_with_demo_rows();
        let request = MergeRequest {
            canonical_id: BranchId::from("branch-1"),
            duplicate_ids: ids(&["branch-1", "branch-2"]),
        };

        assert_eq!(consolidate(&mut uow, &request), Err(MergeError::SelfMergeNotAllowed));
        assert_eq!(uow.branches.len(), 3);
        assert_eq!(uow.reassign_calls, 0);
    }

    #[test]
    fn self_merge_outranks_missing_duplicates() {
        // Check order: a request that is both a self-merge and references a
        // ghost id must fail on the self-merge check.
        let mut uow = uow_with_demo_rows();
        let request = MergeRequest {
            canonical_id: BranchId::from("branch-1"),
            duplicate_ids: ids(&["ghost", "branch-1"]),
        };

        assert_eq!(consolidate(&mut uow, &request), Err(MergeError::SelfMergeNotAllowed));
    }

    #[test]
    fn missing_canonical_is_reported_by_id() {
        let mut uow = uow_with_demo_rows();
        let request = MergeRequest {
            canonical_id: BranchId::from("missing-id"),
            duplicate_ids: ids(&["branch-2"]),
        };

        let err = match consolidate(&mut uow, &request) {
            Ok(branch) => panic!("expected CanonicalNotFound, got branch {}", branch.id),
            Err(err) => err,
        };
        assert_eq!(err, MergeError::CanonicalNotFound(BranchId::from("missing-id")));
        assert!(err.to_string().contains("missing-id"));
        assert_eq!(uow.branches.len(), 3);
    }

    #[test]
    fn missing_duplicates_are_enumerated_exactly() {
        let mut uow = uow_with_demo_rows();
        let request = MergeRequest {
            canonical_id: BranchId::from("branch-1"),
            duplicate_ids: ids(&["ghost-b", "branch-2", "ghost-a", "ghost-b"]),
        };

        let err = match consolidate(&mut uow, &request) {
            Ok(branch) => panic!("expected DuplicatesNotFound, got branch {}", branch.id),
            Err(err) => err,
        };
        // Order-preserving and deduplicated; branch-2 exists so it is absent.
        assert_eq!(err, MergeError::DuplicatesNotFound(ids(&["ghost-b", "ghost-a"])));
        assert!(uow.branches.iter().any(|branch| branch.id.as_str() == "branch-2"));
        assert_eq!(uow.reassign_calls, 0);
    }

    #[test]
    fn successful_merge_reassigns_then_deletes_and_returns_canonical_unchanged() {
        let mut uow = uow_with_demo_rows();
        let canonical_before = mk_branch("branch-1", "Coffee Shop Central");
        let request = MergeRequest {
            canonical_id: BranchId::from("branch-1"),
            duplicate_ids: ids(&["branch-2", "branch-3"]),
        };

        let canonical = match consolidate(&mut uow, &request) {
            Ok(branch) => branch,
            Err(err) => panic!("merge should succeed: {err}"),
        };

        assert_eq!(canonical, canonical_before);
        assert_eq!(uow.branches.len(), 1);
        assert_eq!(uow.branches[0].id.as_str(), "branch-1");
        assert!(uow
            .transactions
            .iter()
            .all(|record| record.branch_id.as_str() == "branch-1"));
        assert_eq!(uow.reassign_calls, 1);
        assert_eq!(uow.delete_calls, 1);
    }

    #[test]
    fn storage_failure_during_deletion_surfaces_consolidation_failed() {
        let mut uow = uow_with_demo_rows();
        uow.fail_on_delete = true;
        let request = MergeRequest {
            canonical_id: BranchId::from("branch-1"),
            duplicate_ids: ids(&["branch-2"]),
        };

        let err = match consolidate(&mut uow, &request) {
            Ok(branch) => panic!("expected ConsolidationFailed, got branch {}", branch.id),
            Err(err) => err,
        };
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "consolidation_failed");
    }

    #[test]
    fn merge_request_round_trips_through_json() {
        let request = MergeRequest {
            canonical_id: BranchId::from("branch-1"),
            duplicate_ids: ids(&["branch-2", "branch-3"]),
        };

        let json = match serde_json::to_string(&request) {
            Ok(json) => json,
            Err(err) => panic!("serialization should succeed: {err}"),
        };
        assert!(json.contains("\"canonical_id\":\"branch-1\""));

        let parsed: MergeRequest = match serde_json::from_str(&json) {
            Ok(parsed) => parsed,
            Err(err) => panic!("deserialization should succeed: {err}"),
        };
        assert_eq!(parsed, request);
    }

    #[test]
    fn branch_validate_rejects_blank_name() {
        let mut branch = mk_branch("branch-1", "Coffee Shop Central");
        branch.name = "  ".to_string();
        assert!(matches!(branch.validate(), Err(MergeError::InvalidRequest(_))));
    }

    proptest! {
        #[test]
        fn missing_ids_is_an_ordered_deduplicated_subset(
            requested in proptest::collection::vec("[a-d]{1,2}", 0..8),
            present in proptest::collection::vec("[a-d]{1,2}", 0..8),
        ) {
            let requested: Vec<BranchId> =
                requested.iter().map(|id| BranchId::from(id.as_str())).collect();
            let found: Vec<Branch> =
                present.iter().map(|id| mk_branch(id, "Fixture")).collect();

            let missing = missing_ids(&requested, &found);

            // Every missing id was requested and has no matching row.
            for id in &missing {
                prop_assert!(requested.contains(id));
                prop_assert!(!found.iter().any(|branch| &branch.id == id));
            }
            // No requested-and-absent id is dropped.
            for id in &requested {
                if !found.iter().any(|branch| &branch.id == id) {
                    prop_assert!(missing.contains(id));
                }
            }
            // Deduplicated, preserving first-occurrence order.
            let unique: BTreeSet<&BranchId> = missing.iter().collect();
            prop_assert_eq!(unique.len(), missing.len());
            let mut cursor = 0;
            for id in &requested {
                if cursor < missing.len() && &missing[cursor] == id {
                    cursor += 1;
                }
            }
            prop_assert_eq!(cursor, missing.len());
        }
    }
}
