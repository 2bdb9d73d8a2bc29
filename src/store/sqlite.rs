//! SQLite-backed [`CatalogStore`] implementation.
//!
//! Servers are upserted with `INSERT … ON CONFLICT(primary_url) DO UPDATE
//! … RETURNING`, and their child rows are replaced by an explicit delete
//! then insert inside the same transaction. Checkpoint claims are a single
//! conditional upsert, so two processes racing on one URL cannot both win.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::PersistenceError;
use crate::health;
use crate::models::{
    from_ts, to_ts, CatalogStats, CheckpointStatus, Contributor, Dependency, HostType,
    ProcessingLog, RiskLevel, Server, ServerFilter, ServerPatch, Tool,
};

use super::{CatalogStore, ClaimOutcome, ClaimRequest, StaleEntry};

const SERVER_COLUMNS: &str = "id, name, primary_url, host_type, description, health_score, \
    risk_level, risk_findings, risk_analyzed, verified, stars, forks, open_issues, has_readme, \
    has_license, has_tests, last_activity_at, content_hash, created_at, updated_at, \
    last_harvested_at";

const LOG_COLUMNS: &str =
    "url, host_type, status, attempts, last_error, started_at, completed_at, created_at, updated_at";

/// Shared by `list_servers` and `list_server_ids`; binds `?1`..`?7`.
const FILTER_CLAUSE: &str = r#"
    WHERE (?1 IS NULL OR host_type = ?1)
      AND (?2 IS NULL OR risk_level = ?2)
      AND (?3 IS NULL OR verified = ?3)
      AND (?4 IS NULL OR health_score >= ?4)
      AND (?5 IS NULL OR instr(lower(name), lower(?5)) > 0)
    ORDER BY name, id
    LIMIT ?6 OFFSET ?7
"#;

/// SQLite implementation of the [`CatalogStore`] trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_children(&self, server: &mut Server) -> Result<(), PersistenceError> {
        let rows = sqlx::query(
            "SELECT name, description, input_schema FROM tools WHERE server_id = ? ORDER BY position",
        )
        .bind(&server.id)
        .fetch_all(&self.pool)
        .await?;
        server.tools = rows
            .iter()
            .map(|row| -> Result<Tool, PersistenceError> {
                let schema: String = row.try_get("input_schema")?;
                Ok(Tool {
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    input_schema: serde_json::from_str(&schema)?,
                })
            })
            .collect::<Result<_, _>>()?;

        let rows = sqlx::query(
            "SELECT name, version_constraint, dependency_type FROM dependencies \
             WHERE server_id = ? ORDER BY position",
        )
        .bind(&server.id)
        .fetch_all(&self.pool)
        .await?;
        server.dependencies = rows
            .iter()
            .map(|row| -> Result<Dependency, PersistenceError> {
                let kind: String = row.try_get("dependency_type")?;
                Ok(Dependency {
                    name: row.try_get("name")?,
                    version_constraint: row.try_get("version_constraint")?,
                    dependency_type: parse_stored(&kind)?,
                })
            })
            .collect::<Result<_, _>>()?;

        let rows = sqlx::query(
            "SELECT login, contributions FROM contributors WHERE server_id = ? ORDER BY position",
        )
        .bind(&server.id)
        .fetch_all(&self.pool)
        .await?;
        server.contributors = rows
            .iter()
            .map(|row| -> Result<Contributor, PersistenceError> {
                Ok(Contributor {
                    login: row.try_get("login")?,
                    contributions: row.try_get("contributions")?,
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(())
    }

    async fn fetch_server(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<Server>, PersistenceError> {
        let sql = format!("SELECT {} FROM servers WHERE {} = ?", SERVER_COLUMNS, column);
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let mut server = row_to_server(&row)?;
                self.load_children(&mut server).await?;
                Ok(Some(server))
            }
            None => Ok(None),
        }
    }

    async fn filtered_rows(
        &self,
        columns: &str,
        filter: &ServerFilter,
    ) -> Result<Vec<SqliteRow>, PersistenceError> {
        let sql = format!("SELECT {} FROM servers {}", columns, FILTER_CLAUSE);
        let rows = sqlx::query(&sql)
            .bind(filter.host_type.map(|h| h.as_str()))
            .bind(filter.risk_level.map(|r| r.as_str()))
            .bind(filter.verified)
            .bind(filter.min_health_score)
            .bind(filter.name_contains.as_deref())
            .bind(filter.limit.unwrap_or(-1))
            .bind(filter.offset.unwrap_or(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

fn parse_stored<T: FromStr<Err = String>>(value: &str) -> Result<T, PersistenceError> {
    value.parse().map_err(PersistenceError::Corrupt)
}

fn row_to_server(row: &SqliteRow) -> Result<Server, PersistenceError> {
    let host_type: String = row.try_get("host_type")?;
    let risk_level: String = row.try_get("risk_level")?;
    let findings: String = row.try_get("risk_findings")?;
    let last_activity: Option<i64> = row.try_get("last_activity_at")?;
    let last_harvested: Option<i64> = row.try_get("last_harvested_at")?;

    Ok(Server {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        primary_url: row.try_get("primary_url")?,
        host_type: parse_stored(&host_type)?,
        description: row.try_get("description")?,
        health_score: row.try_get("health_score")?,
        risk_level: parse_stored(&risk_level)?,
        risk_findings: serde_json::from_str(&findings)?,
        risk_analyzed: row.try_get("risk_analyzed")?,
        verified: row.try_get("verified")?,
        stars: row.try_get("stars")?,
        forks: row.try_get("forks")?,
        open_issues: row.try_get("open_issues")?,
        has_readme: row.try_get("has_readme")?,
        has_license: row.try_get("has_license")?,
        has_tests: row.try_get("has_tests")?,
        last_activity_at: last_activity.map(from_ts),
        content_hash: row.try_get("content_hash")?,
        created_at: from_ts(row.try_get("created_at")?),
        updated_at: from_ts(row.try_get("updated_at")?),
        last_harvested_at: last_harvested.map(from_ts),
        tools: Vec::new(),
        dependencies: Vec::new(),
        contributors: Vec::new(),
    })
}

fn row_to_log(row: &SqliteRow) -> Result<ProcessingLog, PersistenceError> {
    let host_type: String = row.try_get("host_type")?;
    let status: String = row.try_get("status")?;
    let started_at: Option<i64> = row.try_get("started_at")?;
    let completed_at: Option<i64> = row.try_get("completed_at")?;

    Ok(ProcessingLog {
        url: row.try_get("url")?,
        host_type: parse_stored(&host_type)?,
        status: parse_stored(&status)?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        started_at: started_at.map(from_ts),
        completed_at: completed_at.map(from_ts),
        created_at: from_ts(row.try_get("created_at")?),
        updated_at: from_ts(row.try_get("updated_at")?),
    })
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn upsert_server(
        &self,
        server: &Server,
        now: DateTime<Utc>,
    ) -> Result<Server, PersistenceError> {
        let content_hash = server.compute_content_hash();
        let findings = serde_json::to_string(&server.risk_findings)?;
        let health_score = health::clamp(server.health_score);
        let ts = to_ts(now);

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO servers (id, name, primary_url, host_type, description, health_score,
                                 risk_level, risk_findings, risk_analyzed, verified, stars, forks,
                                 open_issues, has_readme, has_license, has_tests,
                                 last_activity_at, content_hash, created_at, updated_at,
                                 last_harvested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(primary_url) DO UPDATE SET
                name = excluded.name,
                host_type = excluded.host_type,
                description = excluded.description,
                health_score = excluded.health_score,
                risk_level = excluded.risk_level,
                risk_findings = excluded.risk_findings,
                risk_analyzed = excluded.risk_analyzed,
                stars = excluded.stars,
                forks = excluded.forks,
                open_issues = excluded.open_issues,
                has_readme = excluded.has_readme,
                has_license = excluded.has_license,
                has_tests = excluded.has_tests,
                last_activity_at = excluded.last_activity_at,
                updated_at = CASE
                    WHEN servers.content_hash = excluded.content_hash THEN servers.updated_at
                    ELSE excluded.updated_at
                END,
                content_hash = excluded.content_hash,
                last_harvested_at = excluded.last_harvested_at
            RETURNING id, verified, created_at, updated_at
            "#,
        )
        .bind(&server.id)
        .bind(&server.name)
        .bind(&server.primary_url)
        .bind(server.host_type.as_str())
        .bind(&server.description)
        .bind(health_score)
        .bind(server.risk_level.as_str())
        .bind(&findings)
        .bind(server.risk_analyzed)
        .bind(server.verified)
        .bind(server.stars)
        .bind(server.forks)
        .bind(server.open_issues)
        .bind(server.has_readme)
        .bind(server.has_license)
        .bind(server.has_tests)
        .bind(server.last_activity_at.map(to_ts))
        .bind(&content_hash)
        .bind(ts)
        .bind(ts)
        .bind(ts)
        .fetch_one(&mut *tx)
        .await?;

        let server_id: String = row.try_get("id")?;

        // Replace children: explicit delete, then insert, same transaction.
        for table in ["tools", "dependencies", "contributors"] {
            sqlx::query(&format!("DELETE FROM {} WHERE server_id = ?", table))
                .bind(&server_id)
                .execute(&mut *tx)
                .await?;
        }

        for (position, tool) in server.tools.iter().enumerate() {
            sqlx::query(
                "INSERT INTO tools (server_id, position, name, description, input_schema) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&server_id)
            .bind(position as i64)
            .bind(&tool.name)
            .bind(&tool.description)
            .bind(serde_json::to_string(&tool.input_schema)?)
            .execute(&mut *tx)
            .await?;
        }

        for (position, dep) in server.dependencies.iter().enumerate() {
            sqlx::query(
                "INSERT INTO dependencies (server_id, position, name, version_constraint, \
                 dependency_type) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&server_id)
            .bind(position as i64)
            .bind(&dep.name)
            .bind(&dep.version_constraint)
            .bind(dep.dependency_type.as_str())
            .execute(&mut *tx)
            .await?;
        }

        for (position, contributor) in server.contributors.iter().enumerate() {
            sqlx::query(
                "INSERT INTO contributors (server_id, position, login, contributions) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&server_id)
            .bind(position as i64)
            .bind(&contributor.login)
            .bind(contributor.contributions)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let mut stored = server.clone();
        stored.id = server_id;
        stored.verified = row.try_get("verified")?;
        stored.created_at = from_ts(row.try_get("created_at")?);
        stored.updated_at = from_ts(row.try_get("updated_at")?);
        stored.content_hash = content_hash;
        stored.health_score = health_score;
        stored.last_harvested_at = Some(from_ts(ts));
        Ok(stored)
    }

    async fn get_server(&self, id: &str) -> Result<Option<Server>, PersistenceError> {
        self.fetch_server("id", id).await
    }

    async fn get_server_by_url(&self, url: &str) -> Result<Option<Server>, PersistenceError> {
        self.fetch_server("primary_url", url).await
    }

    async fn list_servers(&self, filter: &ServerFilter) -> Result<Vec<Server>, PersistenceError> {
        let rows = self.filtered_rows(SERVER_COLUMNS, filter).await?;
        let mut servers = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut server = row_to_server(row)?;
            self.load_children(&mut server).await?;
            servers.push(server);
        }
        Ok(servers)
    }

    async fn list_server_ids(
        &self,
        filter: &ServerFilter,
    ) -> Result<Vec<String>, PersistenceError> {
        let rows = self.filtered_rows("id", filter).await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(PersistenceError::from))
            .collect()
    }

    async fn update_server(
        &self,
        id: &str,
        patch: &ServerPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Server>, PersistenceError> {
        let Some(mut server) = self.get_server(id).await? else {
            return Ok(None);
        };
        if !patch.apply(&mut server) {
            return Ok(Some(server));
        }
        server.content_hash = server.compute_content_hash();
        server.updated_at = from_ts(to_ts(now));

        let result = sqlx::query(
            "UPDATE servers SET name = ?, description = ?, verified = ?, content_hash = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(&server.name)
        .bind(&server.description)
        .bind(server.verified)
        .bind(&server.content_hash)
        .bind(to_ts(now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(server))
    }

    async fn set_derived(
        &self,
        id: &str,
        health_score: i64,
        risk_level: RiskLevel,
    ) -> Result<bool, PersistenceError> {
        let result = sqlx::query("UPDATE servers SET health_score = ?, risk_level = ? WHERE id = ?")
            .bind(health::clamp(health_score))
            .bind(risk_level.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_server(&self, id: &str) -> Result<bool, PersistenceError> {
        let result = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stale_servers(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StaleEntry>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT id, primary_url, host_type FROM servers \
             WHERE last_harvested_at IS NULL OR last_harvested_at < ? \
             ORDER BY primary_url",
        )
        .bind(to_ts(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StaleEntry, PersistenceError> {
                let host_type: String = row.try_get("host_type")?;
                Ok(StaleEntry {
                    id: row.try_get("id")?,
                    primary_url: row.try_get("primary_url")?,
                    host_type: parse_stored(&host_type)?,
                })
            })
            .collect()
    }

    async fn delete_stale_servers(&self, cutoff: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM servers WHERE updated_at < ?")
            .bind(to_ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn statistics(&self) -> Result<CatalogStats, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(verified), 0) AS verified,
                COALESCE(AVG(health_score), 0.0) AS avg_health
            FROM servers
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let mut stats = CatalogStats {
            total_servers: row.try_get("total")?,
            verified_servers: row.try_get("verified")?,
            average_health_score: row.try_get("avg_health")?,
            ..Default::default()
        };

        for (column, target) in [
            ("host_type", &mut stats.by_host_type),
            ("risk_level", &mut stats.by_risk_level),
        ] {
            let sql = format!(
                "SELECT {col} AS k, COUNT(*) AS n FROM servers GROUP BY {col}",
                col = column
            );
            for row in sqlx::query(&sql).fetch_all(&self.pool).await? {
                target.insert(row.try_get("k")?, row.try_get("n")?);
            }
        }

        stats.total_tools = sqlx::query_scalar("SELECT COUNT(*) FROM tools")
            .fetch_one(&self.pool)
            .await?;
        stats.total_dependencies = sqlx::query_scalar("SELECT COUNT(*) FROM dependencies")
            .fetch_one(&self.pool)
            .await?;
        stats.total_contributors = sqlx::query_scalar("SELECT COUNT(*) FROM contributors")
            .fetch_one(&self.pool)
            .await?;
        // Bus factor 1: the top contributor alone covers half the total.
        stats.single_maintainer_servers = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM (
                SELECT server_id
                FROM contributors
                GROUP BY server_id
                HAVING SUM(MAX(contributions, 0)) > 0
                   AND MAX(MAX(contributions, 0)) * 2 >= SUM(MAX(contributions, 0))
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM processing_logs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            stats
                .checkpoints
                .insert(row.try_get("status")?, row.try_get("n")?);
        }

        Ok(stats)
    }

    async fn get_log(&self, url: &str) -> Result<Option<ProcessingLog>, PersistenceError> {
        let sql = format!("SELECT {} FROM processing_logs WHERE url = ?", LOG_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_log).transpose()
    }

    async fn enqueue(
        &self,
        url: &str,
        host_type: HostType,
        now: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processing_logs (url, host_type, status, attempts, created_at, updated_at)
            VALUES (?, ?, 'pending', 0, ?, ?)
            ON CONFLICT(url) DO NOTHING
            "#,
        )
        .bind(url)
        .bind(host_type.as_str())
        .bind(to_ts(now))
        .bind(to_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim(&self, request: ClaimRequest<'_>) -> Result<ClaimOutcome, PersistenceError> {
        let sql = format!(
            r#"
            INSERT INTO processing_logs (url, host_type, status, attempts, last_error,
                                         started_at, completed_at, created_at, updated_at)
            VALUES (?1, ?2, 'processing', 1, NULL, ?3, NULL, ?3, ?3)
            ON CONFLICT(url) DO UPDATE SET
                status = 'processing',
                host_type = excluded.host_type,
                attempts = processing_logs.attempts + 1,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at
            WHERE processing_logs.status IN ('pending', 'failed')
               OR (processing_logs.status = 'completed' AND ?4)
               OR (processing_logs.status = 'processing'
                   AND (processing_logs.started_at IS NULL OR processing_logs.started_at < ?5))
            RETURNING {}
            "#,
            LOG_COLUMNS
        );
        let claimed = sqlx::query(&sql)
            .bind(request.url)
            .bind(request.host_type.as_str())
            .bind(to_ts(request.now))
            .bind(request.force)
            .bind(to_ts(request.stale_before))
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = claimed {
            return Ok(ClaimOutcome::Claimed(row_to_log(&row)?));
        }

        let existing = self
            .get_log(request.url)
            .await?
            .ok_or_else(|| PersistenceError::NotFound {
                entity: "processing log",
                key: request.url.to_string(),
            })?;
        Ok(match existing.status {
            CheckpointStatus::Completed => ClaimOutcome::Completed(existing),
            _ => ClaimOutcome::Busy(existing),
        })
    }

    async fn mark_completed(
        &self,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessingLog>, PersistenceError> {
        let sql = format!(
            "UPDATE processing_logs SET status = 'completed', last_error = NULL, \
             completed_at = ?1, updated_at = ?1 \
             WHERE url = ?2 AND status = 'processing' RETURNING {}",
            LOG_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(to_ts(now))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_log).transpose()
    }

    async fn mark_failed(
        &self,
        url: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessingLog>, PersistenceError> {
        let sql = format!(
            "UPDATE processing_logs SET status = 'failed', last_error = ?1, updated_at = ?2 \
             WHERE url = ?3 AND status = 'processing' RETURNING {}",
            LOG_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(error)
            .bind(to_ts(now))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_log).transpose()
    }

    async fn list_logs(
        &self,
        status: CheckpointStatus,
        updated_before: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<ProcessingLog>, PersistenceError> {
        let sql = format!(
            "SELECT {} FROM processing_logs \
             WHERE status = ?1 AND (?2 IS NULL OR updated_at < ?2) \
             ORDER BY updated_at, url LIMIT ?3",
            LOG_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(updated_before.map(to_ts))
            .bind(limit.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_log).collect()
    }
}
