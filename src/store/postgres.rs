//! PostgreSQL-backed store.
//!
//! Schema lives in `migrations/` and is embedded with refinery. Unique keys
//! on session and route plus `FOR UPDATE SKIP LOCKED` claims give the
//! compare-and-set guarantees the orchestrator depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Object, Pool, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};

use super::Store;
use crate::error::StoreError;
use crate::model::{AllocationRecord, ContainerRecord, ContainerStatus};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const CONTAINER_COLUMNS: &str =
    "id, route_name, internal_port, external_port, status, created_at";

const ALLOCATION_COLUMNS: &str =
    "session_id, route_name, container_id, allocated_at, last_activity";

pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool for `url` and verify one connection.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let config = Config {
            url: Some(url.to_string()),
            ..Default::default()
        };
        let pool = config.create_pool(Some(Runtime::Tokio1), NoTls)?;
        let store = Self::new(pool);
        store.conn().await?.execute("SELECT 1", &[]).await?;
        Ok(store)
    }

    /// Apply any pending migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let mut client = self.conn().await?;
        let report = embedded::migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!(
                version = migration.version(),
                name = migration.name(),
                "Applied migration"
            );
        }
        Ok(())
    }

    async fn conn(&self) -> Result<Object, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to get connection: {}", e)))
    }
}

fn port_from(row: &Row, column: &str) -> Result<u16, StoreError> {
    let raw: i32 = row.get(column);
    u16::try_from(raw).map_err(|_| StoreError::Corrupt(format!("{} out of range: {}", column, raw)))
}

fn row_to_container(row: &Row) -> Result<ContainerRecord, StoreError> {
    let status: String = row.get("status");
    Ok(ContainerRecord {
        id: row.get("id"),
        route_name: row.get("route_name"),
        internal_port: port_from(row, "internal_port")?,
        external_port: port_from(row, "external_port")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        created_at: row.get("created_at"),
    })
}

fn row_to_allocation(row: &Row) -> AllocationRecord {
    AllocationRecord {
        session_id: row.get("session_id"),
        route_name: row.get("route_name"),
        container_id: row.get("container_id"),
        allocated_at: row.get("allocated_at"),
        last_activity: row.get("last_activity"),
    }
}

/// Unique-key and foreign-key violations become `Constraint`.
fn classify(e: tokio_postgres::Error) -> StoreError {
    match e.code() {
        Some(code) if *code == SqlState::UNIQUE_VIOLATION || *code == SqlState::FOREIGN_KEY_VIOLATION => {
            StoreError::Constraint(
                e.as_db_error()
                    .map(|db| db.message().to_string())
                    .unwrap_or_else(|| e.to_string()),
            )
        }
        _ => StoreError::Postgres(e),
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_container(&self, record: &ContainerRecord) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO containers (id, route_name, internal_port, external_port, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            &[
                &record.id,
                &record.route_name,
                &i32::from(record.internal_port),
                &i32::from(record.external_port),
                &record.status.as_str(),
                &record.created_at,
            ],
        )
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerRecord>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM containers WHERE id = $1", CONTAINER_COLUMNS),
                &[&id],
            )
            .await?;
        row.as_ref().map(row_to_container).transpose()
    }

    async fn get_container_by_route(
        &self,
        route_name: &str,
    ) -> Result<Option<ContainerRecord>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM containers WHERE route_name = $1",
                    CONTAINER_COLUMNS
                ),
                &[&route_name],
            )
            .await?;
        row.as_ref().map(row_to_container).transpose()
    }

    async fn count_containers(&self, status: ContainerStatus) -> Result<usize, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM containers WHERE status = $1",
                &[&status.as_str()],
            )
            .await?;
        let count: i64 = row.get(0);
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn list_containers_by_status(
        &self,
        status: ContainerStatus,
    ) -> Result<Vec<ContainerRecord>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM containers WHERE status = $1 ORDER BY created_at, id",
                    CONTAINER_COLUMNS
                ),
                &[&status.as_str()],
            )
            .await?;
        rows.iter().map(row_to_container).collect()
    }

    async fn transition_container(
        &self,
        id: &str,
        from: ContainerStatus,
        to: ContainerStatus,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE containers SET status = $3 WHERE id = $1 AND status = $2",
                &[&id, &from.as_str(), &to.as_str()],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn claim_available(&self) -> Result<Option<ContainerRecord>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    r#"
                    UPDATE containers SET status = 'allocated'
                    WHERE id = (
                        SELECT id FROM containers
                        WHERE status = 'available'
                        ORDER BY created_at, id
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                    )
                    RETURNING {}
                    "#,
                    CONTAINER_COLUMNS
                ),
                &[],
            )
            .await?;
        row.as_ref().map(row_to_container).transpose()
    }

    async fn begin_termination(&self, id: &str) -> Result<Option<ContainerRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let Some(row) = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM containers WHERE id = $1 FOR UPDATE",
                    CONTAINER_COLUMNS
                ),
                &[&id],
            )
            .await?
        else {
            return Ok(None);
        };
        let before = row_to_container(&row)?;

        tx.execute("DELETE FROM allocations WHERE container_id = $1", &[&id])
            .await?;
        tx.execute(
            "UPDATE containers SET status = 'terminating' WHERE id = $1",
            &[&id],
        )
        .await?;
        tx.commit().await?;

        Ok(Some(before))
    }

    async fn delete_container(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        // allocations go with it through ON DELETE CASCADE
        let deleted = conn
            .execute("DELETE FROM containers WHERE id = $1", &[&id])
            .await?;
        Ok(deleted > 0)
    }

    async fn insert_allocation(&self, allocation: &AllocationRecord) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let inserted = conn
            .execute(
                r#"
                INSERT INTO allocations (session_id, route_name, container_id, allocated_at, last_activity)
                SELECT $1, $2, $3, $4, $5
                WHERE EXISTS (
                    SELECT 1 FROM containers WHERE id = $3 AND status = 'allocated'
                )
                "#,
                &[
                    &allocation.session_id,
                    &allocation.route_name,
                    &allocation.container_id,
                    &allocation.allocated_at,
                    &allocation.last_activity,
                ],
            )
            .await
            .map_err(classify)?;

        if inserted == 0 {
            return Err(StoreError::Constraint(format!(
                "container {} is not allocated",
                allocation.container_id
            )));
        }
        Ok(())
    }

    async fn get_allocation(
        &self,
        session_id: &str,
    ) -> Result<Option<AllocationRecord>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM allocations WHERE session_id = $1",
                    ALLOCATION_COLUMNS
                ),
                &[&session_id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_allocation))
    }

    async fn touch_allocation(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE allocations SET last_activity = GREATEST(last_activity, $2)
                WHERE session_id = $1
                "#,
                &[&session_id, &at],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn list_idle_allocations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AllocationRecord>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM allocations WHERE last_activity < $1 ORDER BY last_activity",
                    ALLOCATION_COLUMNS
                ),
                &[&cutoff],
            )
            .await?;
        Ok(rows.iter().map(row_to_allocation).collect())
    }

    async fn delete_allocation(&self, session_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute("DELETE FROM allocations WHERE session_id = $1", &[&session_id])
            .await?;
        Ok(deleted > 0)
    }
}
