//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via a `row_version` column
//! - Single-active-instance-per-entity enforced under `FOR UPDATE`
//! - Append-only definitions and approvals
//!
//! Expected schema (three logical tables):
//!
//! ```sql
//! CREATE TABLE workflow_definitions (
//!     workflow_id UUID        NOT NULL,
//!     version     INT         NOT NULL,
//!     name        TEXT        NOT NULL,
//!     steps       JSONB       NOT NULL,
//!     created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (workflow_id, version)
//! );
//!
//! CREATE TABLE workflow_instances (
//!     id           UUID        PRIMARY KEY,
//!     workflow_id  UUID        NOT NULL,
//!     version      INT         NOT NULL,
//!     entity_type  TEXT        NOT NULL,
//!     entity_id    TEXT        NOT NULL,
//!     context      JSONB       NOT NULL,
//!     current_step INT         NOT NULL,
//!     status       TEXT        NOT NULL,
//!     initiator_id TEXT        NOT NULL,
//!     diagnostic   TEXT,
//!     row_version  INT         NOT NULL DEFAULT 0,
//!     started_at   TIMESTAMPTZ NOT NULL,
//!     updated_at   TIMESTAMPTZ NOT NULL,
//!     history      JSONB       NOT NULL DEFAULT '[]'
//! );
//! CREATE UNIQUE INDEX workflow_instances_one_active
//!     ON workflow_instances (entity_type, entity_id)
//!     WHERE status IN ('pending', 'under_review');
//!
//! CREATE TABLE workflow_approvals (
//!     id          UUID        PRIMARY KEY,
//!     instance_id UUID        NOT NULL REFERENCES workflow_instances (id),
//!     step_number INT         NOT NULL,
//!     approver_id TEXT        NOT NULL,
//!     delegated_to TEXT,
//!     decision    TEXT        NOT NULL DEFAULT 'pending',
//!     comments    TEXT,
//!     decided_at  TIMESTAMPTZ,
//!     created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! CREATE INDEX workflow_approvals_by_approver
//!     ON workflow_approvals (approver_id) WHERE decision = 'pending';
//! ```

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{
    Approval, Decision, EntityContext, EntityRef, InstanceStatus, TransitionRecord,
    WorkflowDefinition, WorkflowInstance,
};

/// PostgreSQL implementation of WorkflowStore
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use approval_engine::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresWorkflowStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const INSTANCE_COLUMNS: &str = "id, workflow_id, version, entity_type, entity_id, context, \
     current_step, status, initiator_id, diagnostic, row_version, started_at, updated_at, history";

const APPROVAL_COLUMNS: &str =
    "id, instance_id, step_number, approver_id, delegated_to, decision, comments, decided_at, created_at";

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse_status(s: &str) -> Result<InstanceStatus, StoreError> {
    s.parse().map_err(StoreError::Serialization)
}

fn parse_decision(s: &str) -> Result<Decision, StoreError> {
    s.parse().map_err(StoreError::Serialization)
}

fn instance_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowInstance, StoreError> {
    let status: String = row.get("status");
    let context: serde_json::Value = row.get("context");
    let history: serde_json::Value = row.get("history");

    let context: EntityContext =
        serde_json::from_value(context).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let history: Vec<TransitionRecord> =
        serde_json::from_value(history).map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(WorkflowInstance {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        version: row.get("version"),
        entity: EntityRef {
            entity_type: row.get("entity_type"),
            entity_id: row.get("entity_id"),
        },
        context,
        current_step: row.get("current_step"),
        status: parse_status(&status)?,
        initiator_id: row.get("initiator_id"),
        diagnostic: row.get("diagnostic"),
        row_version: row.get("row_version"),
        started_at: row.get("started_at"),
        updated_at: row.get("updated_at"),
        history,
    })
}

fn approval_from_row(row: &sqlx::postgres::PgRow) -> Result<Approval, StoreError> {
    let decision: String = row.get("decision");

    Ok(Approval {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        step_number: row.get("step_number"),
        approver_id: row.get("approver_id"),
        delegated_to: row.get("delegated_to"),
        decision: parse_decision(&decision)?,
        comments: row.get("comments"),
        decided_at: row.get("decided_at"),
        created_at: row.get("created_at"),
    })
}

async fn insert_approval<'e, E>(executor: E, approval: &Approval) -> Result<(), StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO workflow_approvals
            (id, instance_id, step_number, approver_id, delegated_to, decision, comments, decided_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(approval.id)
    .bind(approval.instance_id)
    .bind(approval.step_number)
    .bind(&approval.approver_id)
    .bind(&approval.delegated_to)
    .bind(approval.decision.to_string())
    .bind(&approval.comments)
    .bind(approval.decided_at)
    .bind(approval.created_at)
    .execute(executor)
    .await
    .map_err(db_err)?;

    Ok(())
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, definition), fields(workflow_id = %definition.id, version = definition.version))]
    async fn put_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        let steps = serde_json::to_value(&definition.steps)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (workflow_id, version, name, steps)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(definition.id)
        .bind(definition.version)
        .bind(&definition.name)
        .bind(&steps)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to publish definition: {}", e);
            db_err(e)
        })?;

        debug!("published definition version");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_definition(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<WorkflowDefinition, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, version, name, steps
            FROM workflow_definitions
            WHERE workflow_id = $1 AND version = $2
            "#,
        )
        .bind(workflow_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::DefinitionNotFound {
            workflow_id,
            version: Some(version),
        })?;

        let steps: serde_json::Value = row.get("steps");
        Ok(WorkflowDefinition {
            id: row.get("workflow_id"),
            version: row.get("version"),
            name: row.get("name"),
            steps: serde_json::from_value(steps)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        })
    }

    #[instrument(skip(self))]
    async fn latest_definition(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, version, name, steps
            FROM workflow_definitions
            WHERE workflow_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::DefinitionNotFound {
            workflow_id,
            version: None,
        })?;

        let steps: serde_json::Value = row.get("steps");
        Ok(WorkflowDefinition {
            id: row.get("workflow_id"),
            version: row.get("version"),
            name: row.get("name"),
            steps: serde_json::from_value(steps)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        })
    }

    #[instrument(skip(self, instance, approvals), fields(instance_id = %instance.id, entity = %instance.entity))]
    async fn insert_instance(
        &self,
        instance: &WorkflowInstance,
        approvals: &[Approval],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Serialize concurrent creates for the same entity; the partial
        // unique index is the backstop for writers that race past this.
        let existing = sqlx::query(
            r#"
            SELECT id FROM workflow_instances
            WHERE entity_type = $1 AND entity_id = $2
              AND status IN ('pending', 'under_review')
            FOR UPDATE
            "#,
        )
        .bind(&instance.entity.entity_type)
        .bind(&instance.entity.entity_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(row) = existing {
            return Err(StoreError::DuplicateActiveInstance {
                entity: instance.entity.clone(),
                existing: row.get("id"),
            });
        }

        let context = serde_json::to_value(&instance.context)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let history = serde_json::to_value(&instance.history)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (id, workflow_id, version, entity_type, entity_id, context, current_step,
                 status, initiator_id, diagnostic, row_version, started_at, updated_at, history)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(instance.id)
        .bind(instance.workflow_id)
        .bind(instance.version)
        .bind(&instance.entity.entity_type)
        .bind(&instance.entity.entity_id)
        .bind(&context)
        .bind(instance.current_step)
        .bind(instance.status.to_string())
        .bind(&instance.initiator_id)
        .bind(&instance.diagnostic)
        .bind(instance.row_version)
        .bind(instance.started_at)
        .bind(instance.updated_at)
        .bind(&history)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to insert instance: {}", e);
            db_err(e)
        })?;

        for approval in approvals {
            insert_approval(&mut *tx, approval).await?;
        }

        tx.commit().await.map_err(db_err)?;

        debug!(approvals = approvals.len(), "created instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = $1"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::InstanceNotFound(instance_id))?;

        instance_from_row(&row)
    }

    #[instrument(skip(self, entity), fields(entity = %entity))]
    async fn find_active_for_entity(
        &self,
        entity: &EntityRef,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
             WHERE entity_type = $1 AND entity_id = $2 \
               AND status IN ('pending', 'under_review')"
        ))
        .bind(&entity.entity_type)
        .bind(&entity.entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(instance_from_row).transpose()
    }

    #[instrument(skip(self, entity), fields(entity = %entity))]
    async fn list_instances_for_entity(
        &self,
        entity: &EntityRef,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
             WHERE entity_type = $1 AND entity_id = $2 \
             ORDER BY started_at"
        ))
        .bind(&entity.entity_type)
        .bind(&entity.entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(instance_from_row).collect()
    }

    #[instrument(skip(self, transition), fields(instance_id = %transition.instance_id, expected = transition.expected_version))]
    async fn commit_transition(
        &self,
        transition: InstanceTransition,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let record = serde_json::to_value(&transition.record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let status = transition.status.map(|s| s.to_string());

        // The CAS: the WHERE clause only matches the version the caller
        // read, so a losing writer updates zero rows.
        let row = sqlx::query(&format!(
            r#"
            UPDATE workflow_instances
            SET status = COALESCE($3, status),
                current_step = COALESCE($4, current_step),
                diagnostic = COALESCE($5, diagnostic),
                history = history || $6::jsonb,
                row_version = row_version + 1,
                updated_at = NOW()
            WHERE id = $1 AND row_version = $2
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(transition.instance_id)
        .bind(transition.expected_version)
        .bind(&status)
        .bind(transition.current_step)
        .bind(&transition.diagnostic)
        .bind(serde_json::Value::Array(vec![record]))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            // Zero rows: distinguish a lost race from a missing instance.
            let actual = sqlx::query("SELECT row_version FROM workflow_instances WHERE id = $1")
                .bind(transition.instance_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .ok_or(StoreError::InstanceNotFound(transition.instance_id))?;

            return Err(StoreError::ConcurrencyConflict {
                instance_id: transition.instance_id,
                expected: transition.expected_version,
                actual: actual.get("row_version"),
            });
        };

        let instance = instance_from_row(&row)?;

        if let Some(decide) = &transition.decide {
            let result = sqlx::query(
                r#"
                UPDATE workflow_approvals
                SET decision = $2, comments = $3, decided_at = $4
                WHERE id = $1
                "#,
            )
            .bind(decide.approval_id)
            .bind(decide.decision.to_string())
            .bind(&decide.comments)
            .bind(decide.decided_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::ApprovalNotFound(decide.approval_id));
            }
        }

        if let Some(delegate) = &transition.delegate {
            let result = sqlx::query(
                r#"
                UPDATE workflow_approvals
                SET delegated_to = $2
                WHERE id = $1
                "#,
            )
            .bind(delegate.approval_id)
            .bind(&delegate.delegated_to)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::ApprovalNotFound(delegate.approval_id));
            }
        }

        for approval in &transition.new_approvals {
            insert_approval(&mut *tx, approval).await?;
        }

        tx.commit().await.map_err(db_err)?;

        debug!(new_version = instance.row_version, "committed transition");
        Ok(instance)
    }

    #[instrument(skip(self))]
    async fn get_approval(&self, approval_id: Uuid) -> Result<Approval, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM workflow_approvals WHERE id = $1"
        ))
        .bind(approval_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ApprovalNotFound(approval_id))?;

        approval_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn approvals_for_instance(&self, instance_id: Uuid) -> Result<Vec<Approval>, StoreError> {
        // Verify the instance exists so a bad id is NotFound, not empty.
        let exists = sqlx::query("SELECT 1 FROM workflow_instances WHERE id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StoreError::InstanceNotFound(instance_id));
        }

        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM workflow_approvals \
             WHERE instance_id = $1 ORDER BY step_number, created_at"
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(approval_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn pending_approvals_for_user(&self, user_id: &str) -> Result<Vec<Approval>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT a.{} FROM workflow_approvals a \
             JOIN workflow_instances i ON i.id = a.instance_id \
             WHERE a.decision = 'pending' \
               AND COALESCE(a.delegated_to, a.approver_id) = $1 \
               AND i.status IN ('pending', 'under_review') \
               AND i.current_step = a.step_number \
             ORDER BY a.created_at",
            APPROVAL_COLUMNS.replace(", ", ", a."),
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(approval_from_row).collect()
    }
}
