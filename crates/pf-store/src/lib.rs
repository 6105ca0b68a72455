//! Durable single source of truth (SSOT) for the pilotfish core.
//!
//! One SQLite file holds everything that crosses a component boundary:
//! dedup markers, the ingest cursor, order intents/results, safety state,
//! the append-only audit log, operator baselines, and the `system_state`
//! key/value surface. All composite writes execute inside a single
//! transaction; readers observe committed state only.
//!
//! # Concurrency
//!
//! The pool is capped at one connection, so every write is serialized at the
//! pool layer. WAL journaling keeps the file readable by external operator
//! tooling while the process runs.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

mod event_log;
mod orders;
mod safety_audit;

pub use event_log::RecordOutcome;
pub use orders::LocalPositions;

/// Schema version this build expects to find (or create) on disk.
pub const EXPECTED_SCHEMA_VERSION: i64 = 1;

/// Well-known `system_state` keys surfaced to operators.
pub mod keys {
    pub const SAFETY_MODE: &str = "safety_mode";
    pub const SAFETY_REASON_CODE: &str = "safety_reason_code";
    pub const SAFETY_REASON_MESSAGE: &str = "safety_reason_message";
    pub const LAST_PROCESSED_TIMESTAMP_MS: &str = "last_processed_timestamp_ms";
    pub const LAST_PROCESSED_EVENT_KEY: &str = "last_processed_event_key";
    pub const LAST_INGEST_SUCCESS_MS: &str = "last_ingest_success_ms";
    pub const CONFIG_HASH: &str = "config_hash";
    pub const CONFIG_VERSION: &str = "config_version";
    pub const CONTRACT_VERSION: &str = "contract_version";
    pub const SCHEMA_VERSION: &str = "schema_version";
    pub const MAINTENANCE_SKIP_APPLIED_MS: &str = "maintenance_skip_applied_ms";
    pub const LAST_HEARTBEAT_MS: &str = "last_heartbeat_ms";
}

// ---------------------------------------------------------------------------
// Schema gate
// ---------------------------------------------------------------------------

/// Outcome of the schema-version check performed at open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaCheck {
    /// Fresh database — schema created at the expected version.
    Fresh,
    /// Existing database already at the expected version.
    Current,
    /// Existing database migrated up to the expected version.
    Migrated { from: i64 },
    /// A lower non-zero version remained after migrations: the caller must
    /// HALT with `SCHEMA_VERSION_MISMATCH`. The store stays readable.
    HaltRequired { found: i64 },
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the SSOT. Cheap to clone; all clones share one pool.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the store at `url` and run the schema gate.
    ///
    /// `url` is a SQLite URL: `sqlite://path/to/file.db` or `sqlite::memory:`.
    ///
    /// # Errors
    /// A persisted schema version *higher* than [`EXPECTED_SCHEMA_VERSION`]
    /// is a fatal startup error — newer-schema databases must never be
    /// opened by older code.
    pub async fn open(url: &str) -> Result<(Self, SchemaCheck)> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid store url: {url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open store")?;

        let store = Self { pool };
        let check = store.schema_gate().await?;
        Ok((store, check))
    }

    /// Run embedded migrations and reconcile the persisted schema version.
    async fn schema_gate(&self) -> Result<SchemaCheck> {
        let persisted = self.persisted_schema_version().await?;

        if persisted > EXPECTED_SCHEMA_VERSION {
            bail!(
                "SCHEMA_VERSION_MISMATCH: store schema v{persisted} is newer than expected v{}; refusing to open",
                EXPECTED_SCHEMA_VERSION
            );
        }

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("store migrations failed")?;

        let after = self.applied_schema_version().await?;
        self.set_system_state(keys::SCHEMA_VERSION, &after.to_string())
            .await?;

        if after < EXPECTED_SCHEMA_VERSION && persisted != 0 {
            return Ok(SchemaCheck::HaltRequired { found: after });
        }
        if after != EXPECTED_SCHEMA_VERSION {
            bail!(
                "SCHEMA_VERSION_MISMATCH: migrations stopped at v{after}, expected v{}",
                EXPECTED_SCHEMA_VERSION
            );
        }

        Ok(match persisted {
            0 => SchemaCheck::Fresh,
            v if v == EXPECTED_SCHEMA_VERSION => SchemaCheck::Current,
            v => SchemaCheck::Migrated { from: v },
        })
    }

    /// Schema version recorded by a previous process, 0 if none.
    async fn persisted_schema_version(&self) -> Result<i64> {
        let has_table: Option<(String,)> = sqlx::query_as(
            "select name from sqlite_master where type = 'table' and name = 'system_state'",
        )
        .fetch_optional(&self.pool)
        .await
        .context("schema probe failed")?;

        if has_table.is_none() {
            return Ok(0);
        }

        let v = self.get_system_state(keys::SCHEMA_VERSION).await?;
        Ok(v.and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    /// Highest migration version actually applied.
    async fn applied_schema_version(&self) -> Result<i64> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("select max(version) from _sqlx_migrations where success = 1")
                .fetch_optional(&self.pool)
                .await
                .context("migration version query failed")?;
        Ok(row.and_then(|(v,)| v).unwrap_or(0))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flush and close the pool. Pending writes drain before this returns.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -----------------------------------------------------------------------
    // system_state
    // -----------------------------------------------------------------------

    pub async fn get_system_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("select value from system_state where key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("system_state read failed: {key}"))?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_system_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "insert into system_state (key, value) values (?, ?)
             on conflict(key) do update set value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("system_state write failed: {key}"))?;
        Ok(())
    }
}
