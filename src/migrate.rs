//! Versioned schema migrations.
//!
//! Each [`Migration`] carries an `up` and a `down` script. Applied versions
//! are recorded in `schema_migrations`; every migration runs inside its own
//! transaction together with its bookkeeping row, so a failed migration
//! leaves no trace.
//!
//! | Version | Creates |
//! |---------|---------|
//! | 1 | `servers`, `tools`, `dependencies`, `contributors` |
//! | 2 | `processing_logs` |
//! | 3 | lookup indexes for sweeps and statistics |
//! | 4 | `servers(updated_at)` index for pruning |

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: &'static [&'static str],
    pub down: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "catalog entities",
        up: &[
            r#"
            CREATE TABLE servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                primary_url TEXT NOT NULL UNIQUE,
                host_type TEXT NOT NULL,
                description TEXT,
                health_score INTEGER NOT NULL DEFAULT 0
                    CHECK (health_score BETWEEN 0 AND 100),
                risk_level TEXT NOT NULL DEFAULT 'UNKNOWN',
                risk_findings TEXT NOT NULL DEFAULT '[]',
                risk_analyzed INTEGER NOT NULL DEFAULT 0,
                verified INTEGER NOT NULL DEFAULT 0,
                stars INTEGER,
                forks INTEGER,
                open_issues INTEGER,
                has_readme INTEGER NOT NULL DEFAULT 0,
                has_license INTEGER NOT NULL DEFAULT 0,
                has_tests INTEGER NOT NULL DEFAULT 0,
                last_activity_at INTEGER,
                content_hash TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_harvested_at INTEGER
            )
            "#,
            r#"
            CREATE TABLE tools (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                input_schema TEXT NOT NULL DEFAULT '{}'
            )
            "#,
            r#"
            CREATE TABLE dependencies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                version_constraint TEXT,
                dependency_type TEXT NOT NULL
                    CHECK (dependency_type IN ('runtime', 'dev', 'peer'))
            )
            "#,
            r#"
            CREATE TABLE contributors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                login TEXT NOT NULL,
                contributions INTEGER NOT NULL DEFAULT 0
            )
            "#,
        ],
        down: &[
            "DROP TABLE IF EXISTS contributors",
            "DROP TABLE IF EXISTS dependencies",
            "DROP TABLE IF EXISTS tools",
            "DROP TABLE IF EXISTS servers",
        ],
    },
    Migration {
        version: 2,
        name: "processing checkpoints",
        up: &[r#"
            CREATE TABLE processing_logs (
                url TEXT PRIMARY KEY,
                host_type TEXT NOT NULL,
                status TEXT NOT NULL
                    CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                started_at INTEGER,
                completed_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#],
        down: &["DROP TABLE IF EXISTS processing_logs"],
    },
    Migration {
        version: 3,
        name: "sweep indexes",
        up: &[
            "CREATE INDEX IF NOT EXISTS idx_servers_host_type ON servers(host_type)",
            "CREATE INDEX IF NOT EXISTS idx_servers_last_harvested ON servers(last_harvested_at)",
            "CREATE INDEX IF NOT EXISTS idx_tools_server_id ON tools(server_id)",
            "CREATE INDEX IF NOT EXISTS idx_dependencies_server_id ON dependencies(server_id)",
            "CREATE INDEX IF NOT EXISTS idx_contributors_server_id ON contributors(server_id)",
            "CREATE INDEX IF NOT EXISTS idx_processing_logs_status ON processing_logs(status, updated_at)",
        ],
        down: &[
            "DROP INDEX IF EXISTS idx_processing_logs_status",
            "DROP INDEX IF EXISTS idx_contributors_server_id",
            "DROP INDEX IF EXISTS idx_dependencies_server_id",
            "DROP INDEX IF EXISTS idx_tools_server_id",
            "DROP INDEX IF EXISTS idx_servers_last_harvested",
            "DROP INDEX IF EXISTS idx_servers_host_type",
        ],
    },
    Migration {
        version: 4,
        name: "prune index",
        up: &["CREATE INDEX IF NOT EXISTS idx_servers_updated_at ON servers(updated_at)"],
        down: &["DROP INDEX IF EXISTS idx_servers_updated_at"],
    },
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let applied = apply_pending(&pool).await?;
    if applied.is_empty() {
        tracing::info!("schema is up to date");
    } else {
        tracing::info!(versions = ?applied, "applied migrations");
    }
    pool.close().await;
    Ok(())
}

async fn ensure_bookkeeping(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Highest applied version, 0 on a fresh database.
pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    ensure_bookkeeping(pool).await?;
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

/// Apply every migration newer than the current version, in order.
///
/// Returns the versions applied by this call.
pub async fn apply_pending(pool: &SqlitePool) -> Result<Vec<i64>> {
    let current = current_version(pool).await?;
    let mut applied = Vec::new();

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let mut tx = pool.begin().await?;
        for statement in migration.up {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .with_context(|| {
                    format!(
                        "migration {} ({}) failed",
                        migration.version, migration.name
                    )
                })?;
        }
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!(version = migration.version, name = migration.name, "migration applied");
        applied.push(migration.version);
    }

    Ok(applied)
}

/// Run `down` scripts in reverse until only versions `<= target` remain.
///
/// Returns the versions rolled back by this call.
pub async fn rollback_to(pool: &SqlitePool, target: i64) -> Result<Vec<i64>> {
    let current = current_version(pool).await?;
    let mut rolled_back = Vec::new();

    for migration in MIGRATIONS
        .iter()
        .rev()
        .filter(|m| m.version > target && m.version <= current)
    {
        let mut tx = pool.begin().await?;
        for statement in migration.down {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .with_context(|| {
                    format!(
                        "rollback of migration {} ({}) failed",
                        migration.version, migration.name
                    )
                })?;
        }
        sqlx::query("DELETE FROM schema_migrations WHERE version = ?")
            .bind(migration.version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(version = migration.version, name = migration.name, "migration rolled back");
        rolled_back.push(migration.version);
    }

    Ok(rolled_back)
}
