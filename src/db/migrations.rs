//! Ledger database setup: connection pool, pragmas and the idempotent schema.

use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use tracing::{debug, info};

/// Stamped into `PRAGMA user_version` once `schema.sql` has been applied.
pub const SCHEMA_VERSION: i64 = 2;

/// Every table the ledger reads or writes.
pub const LEDGER_TABLES: [&str; 12] = [
    "trade_events",
    "settlement_events",
    "market_resolutions",
    "condition_meta",
    "proxy_wallets",
    "mapping_snapshots",
    "token_mappings",
    "calibration_runs",
    "positions",
    "fold_watermarks",
    "ledger_effects",
    "ledger_errors",
];

const MEMORY_PATH: &str = ":memory:";

/// Open (creating if needed) the ledger database at `db_path` and apply the schema.
///
/// `:memory:` opens a private in-memory database on a single connection, since every
/// additional connection would see an empty database.
///
/// # Errors
/// Returns an error if the parent directory cannot be created, the connection fails or a
/// schema statement is rejected.
pub async fn init_db(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    let (url, max_connections) = if db_path == MEMORY_PATH {
        ("sqlite::memory:".to_string(), 1)
    } else {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        (format!("sqlite:{}?mode=rwc", db_path), 5)
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .after_connect(|conn, _meta| Box::pin(async move { configure_connection(conn).await }))
        .connect(&url)
        .await?;

    run_migrations(&pool).await?;

    info!(path = db_path, schema_version = SCHEMA_VERSION, "Ledger database ready");
    Ok(pool)
}

/// Apply `schema.sql` in one transaction and stamp the schema version.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    let statements = include_str!("schema.sql")
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let mut applied = 0usize;
    for statement in statements {
        sqlx::query(statement).execute(&mut *tx).await?;
        applied += 1;
    }
    // PRAGMA does not take bind parameters
    sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    debug!(statements = applied, "Schema applied");
    Ok(())
}

/// Per-connection pragmas. Foreign keys guard `token_mappings → mapping_snapshots`; WAL lets
/// reads proceed while a fold commit is in flight.
async fn configure_connection(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await?;

    let journal_mode: String = sqlx::query("PRAGMA journal_mode = WAL")
        .fetch_one(&mut *conn)
        .await?
        .get(0);

    for pragma in ["PRAGMA busy_timeout = 5000", "PRAGMA synchronous = NORMAL"] {
        sqlx::query(pragma).execute(&mut *conn).await?;
    }

    debug!(journal_mode = %journal_mode, "Connection configured");
    Ok(())
}
