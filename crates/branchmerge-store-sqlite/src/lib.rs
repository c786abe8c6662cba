use std::path::Path;

use anyhow::{anyhow, Context, Result};
use branchmerge_core::{
    consolidate, Branch, BranchId, BranchOrder, BranchTransaction, MergeError, MergeRequest,
    MergeUnitOfWork,
};
use rusqlite::{params, params_from_iter, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

/// Tables carrying a `branch_id` foreign reference. Every merge reassigns
/// all of them before deleting the duplicate branch rows.
const DEPENDENT_TABLES: [&str; 2] = ["branch_transactions", "branch_orders"];

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS merchant_branches (
  id TEXT PRIMARY KEY,
  date_added_utc TEXT NOT NULL,
  name TEXT NOT NULL CHECK (length(trim(name)) > 0),
  source_url TEXT,
  address TEXT,
  merchant_id TEXT
);

CREATE TABLE IF NOT EXISTS branch_transactions (
  transaction_id TEXT PRIMARY KEY,
  branch_id TEXT NOT NULL,
  amount_cents INTEGER NOT NULL,
  occurred_at TEXT NOT NULL,
  FOREIGN KEY (branch_id) REFERENCES merchant_branches(id)
);

CREATE TABLE IF NOT EXISTS branch_orders (
  order_id TEXT PRIMARY KEY,
  branch_id TEXT NOT NULL,
  reference TEXT NOT NULL,
  placed_at TEXT NOT NULL,
  FOREIGN KEY (branch_id) REFERENCES merchant_branches(id)
);

CREATE INDEX IF NOT EXISTS idx_branch_transactions_branch ON branch_transactions(branch_id);
CREATE INDEX IF NOT EXISTS idx_branch_orders_branch ON branch_orders(branch_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedSummary {
    pub inserted_branches: usize,
    pub inserted_transactions: usize,
    pub inserted_orders: usize,
}

impl SqliteStore {
    /// Open a SQLite-backed entity store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist one branch row. Branch rows come from ingestion or seeding;
    /// consolidation never creates them.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert fails.
    pub fn insert_branch(&mut self, branch: &Branch) -> Result<()> {
        branch.validate().map_err(|err| anyhow!("branch validation failed: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO merchant_branches(id, date_added_utc, name, source_url, address, merchant_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    branch.id.as_str(),
                    rfc3339(branch.date_added_utc)?,
                    branch.name,
                    branch.source_url,
                    branch.address,
                    branch.merchant_id,
                ],
            )
            .context("failed to insert branch")?;
        Ok(())
    }

    /// Persist one dependent transaction row. Fails when the referenced
    /// branch does not exist.
    ///
    /// # Errors
    /// Returns an error when the insert or the foreign-key check fails.
    pub fn insert_transaction(&mut self, record: &BranchTransaction) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO branch_transactions(transaction_id, branch_id, amount_cents, occurred_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.transaction_id,
                    record.branch_id.as_str(),
                    record.amount_cents,
                    rfc3339(record.occurred_at)?,
                ],
            )
            .context("failed to insert branch transaction")?;
        Ok(())
    }

    /// Persist one dependent order row. Fails when the referenced branch
    /// does not exist.
    ///
    /// # Errors
    /// Returns an error when the insert or the foreign-key check fails.
    pub fn insert_order(&mut self, record: &BranchOrder) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO branch_orders(order_id, branch_id, reference, placed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.order_id,
                    record.branch_id.as_str(),
                    record.reference,
                    rfc3339(record.placed_at)?,
                ],
            )
            .context("failed to insert branch order")?;
        Ok(())
    }

    /// Load all branch rows in a stable order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_branches(&self) -> Result<Vec<Branch>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, date_added_utc, name, source_url, address, merchant_id
             FROM merchant_branches
             ORDER BY date_added_utc ASC, id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut branches = Vec::new();
        while let Some(row) = rows.next()? {
            branches.push(read_branch_row(row)?);
        }
        Ok(branches)
    }

    /// Point lookup; absent is a valid, non-error outcome.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn find_branch(&self, id: &BranchId) -> Result<Option<Branch>> {
        branch_by_id(&self.conn, id)
    }

    /// Load only the branches whose ids exist; callers diff against the
    /// requested set.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn find_branches(&self, ids: &[BranchId]) -> Result<Vec<Branch>> {
        branches_by_ids(&self.conn, ids)
    }

    /// Load dependent transactions for one branch.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_transactions(&self, branch_id: &BranchId) -> Result<Vec<BranchTransaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT transaction_id, branch_id, amount_cents, occurred_at
             FROM branch_transactions
             WHERE branch_id = ?1
             ORDER BY occurred_at ASC, transaction_id ASC",
        )?;

        let mut rows = stmt.query(params![branch_id.as_str()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(BranchTransaction {
                transaction_id: row.get(0)?,
                branch_id: BranchId::new(row.get::<_, String>(1)?),
                amount_cents: row.get(2)?,
                occurred_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
            });
        }
        Ok(records)
    }

    /// Load dependent orders for one branch.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_orders(&self, branch_id: &BranchId) -> Result<Vec<BranchOrder>> {
        let mut stmt = self.conn.prepare(
            "SELECT order_id, branch_id, reference, placed_at
             FROM branch_orders
             WHERE branch_id = ?1
             ORDER BY placed_at ASC, order_id ASC",
        )?;

        let mut rows = stmt.query(params![branch_id.as_str()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(BranchOrder {
                order_id: row.get(0)?,
                branch_id: BranchId::new(row.get::<_, String>(1)?),
                reference: row.get(2)?,
                placed_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
            });
        }
        Ok(records)
    }

    /// Consolidate duplicate branches into the canonical branch inside one
    /// IMMEDIATE transaction. The write lock is taken before the validation
    /// reads, so a racing merge cannot pass its existence checks on rows a
    /// concurrent commit is deleting. Any failure rolls back completely.
    ///
    /// # Errors
    /// Returns the engine's validation errors unchanged, or
    /// [`MergeError::ConsolidationFailed`] when the transaction cannot start,
    /// a statement fails, or the commit fails.
    pub fn merge_branches(&mut self, request: &MergeRequest) -> Result<Branch, MergeError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| {
                MergeError::ConsolidationFailed(format!("failed to start merge transaction: {err}"))
            })?;

        let (canonical, reassigned, deleted) = {
            let mut uow = SqliteUnitOfWork { tx: &tx, reassigned: 0, deleted: 0 };
            match consolidate(&mut uow, request) {
                Ok(branch) => (branch, uow.reassigned, uow.deleted),
                Err(err) => {
                    tracing::warn!(kind = err.kind(), error = %err, "branch merge rolled back");
                    return Err(err);
                }
            }
        };

        tx.commit().map_err(|err| {
            MergeError::ConsolidationFailed(format!("failed to commit merge transaction: {err}"))
        })?;

        tracing::info!(
            canonical_id = %canonical.id,
            duplicates = request.duplicate_ids.len(),
            reassigned,
            deleted,
            "branch merge committed"
        );
        Ok(canonical)
    }

    /// Seed the demo dataset: six branches plus a handful of dependent rows
    /// so a demo merge exercises reassignment. Re-running is a no-op for rows
    /// that already exist.
    ///
    /// # Errors
    /// Returns an error when seeding rows cannot be built or written.
    pub fn seed_demo_data(&mut self) -> Result<SeedSummary> {
        let branches = demo_branches()?;
        let transactions = demo_transactions()?;
        let orders = demo_orders()?;

        let tx = self.conn.transaction().context("failed to start seed transaction")?;
        let mut summary = SeedSummary::default();

        for branch in &branches {
            summary.inserted_branches += tx
                .execute(
                    "INSERT OR IGNORE INTO merchant_branches(id, date_added_utc, name, source_url, address, merchant_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        branch.id.as_str(),
                        rfc3339(branch.date_added_utc)?,
                        branch.name,
                        branch.source_url,
                        branch.address,
                        branch.merchant_id,
                    ],
                )
                .context("failed to seed demo branch")?;
        }

        for record in &transactions {
            summary.inserted_transactions += tx
                .execute(
                    "INSERT OR IGNORE INTO branch_transactions(transaction_id, branch_id, amount_cents, occurred_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        record.transaction_id,
                        record.branch_id.as_str(),
                        record.amount_cents,
                        rfc3339(record.occurred_at)?,
                    ],
                )
                .context("failed to seed demo transaction")?;
        }

        for record in &orders {
            summary.inserted_orders += tx
                .execute(
                    "INSERT OR IGNORE INTO branch_orders(order_id, branch_id, reference, placed_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        record.order_id,
                        record.branch_id.as_str(),
                        record.reference,
                        rfc3339(record.placed_at)?,
                    ],
                )
                .context("failed to seed demo order")?;
        }

        tx.commit().context("failed to commit seed transaction")?;
        tracing::info!(
            branches = summary.inserted_branches,
            transactions = summary.inserted_transactions,
            orders = summary.inserted_orders,
            "demo data seeded"
        );
        Ok(summary)
    }
}

struct SqliteUnitOfWork<'a> {
    tx: &'a rusqlite::Transaction<'a>,
    reassigned: usize,
    deleted: usize,
}

impl MergeUnitOfWork for SqliteUnitOfWork<'_> {
    fn find_branch(&mut self, id: &BranchId) -> Result<Option<Branch>, MergeError> {
        branch_by_id(self.tx, id).map_err(storage_failure)
    }

    fn find_branches(&mut self, ids: &[BranchId]) -> Result<Vec<Branch>, MergeError> {
        branches_by_ids(self.tx, ids).map_err(storage_failure)
    }

    fn reassign_references(
        &mut self,
        from: &[BranchId],
        to: &BranchId,
    ) -> Result<usize, MergeError> {
        let mut reassigned = 0_usize;
        for table in DEPENDENT_TABLES {
            let sql = format!(
                "UPDATE {table} SET branch_id = ? WHERE branch_id IN ({})",
                placeholders(from.len())
            );
            let bound = std::iter::once(to.as_str()).chain(from.iter().map(BranchId::as_str));
            reassigned += self
                .tx
                .execute(&sql, params_from_iter(bound))
                .with_context(|| format!("failed to reassign branch references in {table}"))
                .map_err(storage_failure)?;
        }
        self.reassigned = reassigned;
        Ok(reassigned)
    }

    fn delete_branches(&mut self, ids: &[BranchId]) -> Result<usize, MergeError> {
        let sql =
            format!("DELETE FROM merchant_branches WHERE id IN ({})", placeholders(ids.len()));
        let deleted = self
            .tx
            .execute(&sql, params_from_iter(ids.iter().map(BranchId::as_str)))
            .context("failed to delete duplicate branches")
            .map_err(storage_failure)?;
        self.deleted = deleted;
        Ok(deleted)
    }
}

fn storage_failure(err: anyhow::Error) -> MergeError {
    MergeError::ConsolidationFailed(format!("{err:#}"))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn read_branch_row(row: &rusqlite::Row<'_>) -> Result<Branch> {
    Ok(Branch {
        id: BranchId::new(row.get::<_, String>(0)?),
        date_added_utc: parse_rfc3339(&row.get::<_, String>(1)?)?,
        name: row.get(2)?,
        source_url: row.get(3)?,
        address: row.get(4)?,
        merchant_id: row.get(5)?,
    })
}

fn branch_by_id(conn: &Connection, id: &BranchId) -> Result<Option<Branch>> {
    let mut stmt = conn.prepare(
        "SELECT id, date_added_utc, name, source_url, address, merchant_id
         FROM merchant_branches
         WHERE id = ?1",
    )?;

    let mut rows = stmt.query(params![id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(read_branch_row(row)?)),
        None => Ok(None),
    }
}

fn branches_by_ids(conn: &Connection, ids: &[BranchId]) -> Result<Vec<Branch>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT id, date_added_utc, name, source_url, address, merchant_id
         FROM merchant_branches
         WHERE id IN ({})",
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;

    let mut rows = stmt.query(params_from_iter(ids.iter().map(BranchId::as_str)))?;
    let mut branches = Vec::new();
    while let Some(row) = rows.next()? {
        branches.push(read_branch_row(row)?);
    }
    Ok(branches)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn demo_branches() -> Result<Vec<Branch>> {
    Ok(vec![
        Branch {
            id: BranchId::from("demo-branch-1"),
            date_added_utc: parse_rfc3339("2023-01-01T10:00:00Z")?,
            name: "Coffee Shop Central".to_string(),
            source_url: Some("https://example.com/coffee-central".to_string()),
            address: Some("123 Coffee Ave, Downtown".to_string()),
            merchant_id: Some("merchant-A".to_string()),
        },
        Branch {
            id: BranchId::from("demo-branch-2"),
            date_added_utc: parse_rfc3339("2023-01-05T11:00:00Z")?,
            name: "Coffee Shop North".to_string(),
            source_url: None,
            address: Some("456 North St, Suburbia".to_string()),
            merchant_id: Some("merchant-A".to_string()),
        },
        Branch {
            id: BranchId::from("demo-branch-3"),
            date_added_utc: parse_rfc3339("2023-01-10T09:30:00Z")?,
            name: "Coffee Shop Express".to_string(),
            source_url: Some("https://example.com/coffee-express".to_string()),
            address: Some("789 Express Ln, Mall".to_string()),
            merchant_id: Some("merchant-A".to_string()),
        },
        Branch {
            id: BranchId::from("demo-branch-4"),
            date_added_utc: parse_rfc3339("2023-02-01T14:00:00Z")?,
            name: "Teahouse Grand".to_string(),
            source_url: None,
            address: Some("101 Tea Blvd, Arts District".to_string()),
            merchant_id: Some("merchant-B".to_string()),
        },
        Branch {
            id: BranchId::from("demo-branch-5"),
            date_added_utc: parse_rfc3339("2023-02-05T15:00:00Z")?,
            name: "Teahouse Mini".to_string(),
            source_url: Some("https://example.com/tea-mini".to_string()),
            address: Some("202 Mini St, Old Town".to_string()),
            merchant_id: Some("merchant-B".to_string()),
        },
        Branch {
            id: BranchId::from("demo-branch-6"),
            date_added_utc: parse_rfc3339("2023-03-01T08:00:00Z")?,
            name: "Snack Joint HQ".to_string(),
            source_url: None,
            address: Some("303 Snack Rd, Industrial Park".to_string()),
            merchant_id: Some("merchant-C".to_string()),
        },
    ])
}

fn demo_transactions() -> Result<Vec<BranchTransaction>> {
    Ok(vec![
        BranchTransaction {
            transaction_id: "demo-txn-1".to_string(),
            branch_id: BranchId::from("demo-branch-1"),
            amount_cents: 2200,
            occurred_at: parse_rfc3339("2023-01-03T10:05:00Z")?,
        },
        BranchTransaction {
            transaction_id: "demo-txn-2".to_string(),
            branch_id: BranchId::from("demo-branch-2"),
            amount_cents: 1250,
            occurred_at: parse_rfc3339("2023-01-06T09:15:00Z")?,
        },
        BranchTransaction {
            transaction_id: "demo-txn-3".to_string(),
            branch_id: BranchId::from("demo-branch-3"),
            amount_cents: 860,
            occurred_at: parse_rfc3339("2023-01-12T12:40:00Z")?,
        },
    ])
}

fn demo_orders() -> Result<Vec<BranchOrder>> {
    Ok(vec![
        BranchOrder {
            order_id: "demo-order-1".to_string(),
            branch_id: BranchId::from("demo-branch-2"),
            reference: "ORD-1042".to_string(),
            placed_at: parse_rfc3339("2023-01-07T16:20:00Z")?,
        },
        BranchOrder {
            order_id: "demo-order-2".to_string(),
            branch_id: BranchId::from("demo-branch-5"),
            reference: "ORD-2108".to_string(),
            placed_at: parse_rfc3339("2023-02-06T11:30:00Z")?,
        },
    ])
}
