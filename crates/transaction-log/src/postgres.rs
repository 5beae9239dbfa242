use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    FailureDetail, InstanceHeader, InstanceId, InstanceQuery, Result, Sequence,
    StepExecutionRecord, TransactionLogError, WorkflowInstance, WorkflowStatus,
    store::{TransactionLog, validate_record_for_append},
};

const HEADER_COLUMNS: &str = "instance_id, definition_id, input, status, step_index, \
     cancel_requested, compensation_attempted, failure, remediation, created_at, updated_at";

const RECORD_COLUMNS: &str =
    "sequence, step_name, phase, status, idempotency_key, attempts, payload, error, timestamp";

/// PostgreSQL-backed transaction log.
///
/// Appends run in a transaction holding a row lock on the instance header,
/// so appends for the same instance are strictly ordered while appends for
/// different instances proceed independently.
#[derive(Clone)]
pub struct PostgresTransactionLog {
    pool: PgPool,
}

impl PostgresTransactionLog {
    /// Creates a new PostgreSQL transaction log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn corrupt(message: String) -> TransactionLogError {
        TransactionLogError::Corrupt(message)
    }

    fn row_to_header(row: &PgRow) -> Result<InstanceHeader> {
        let status: String = row.try_get("status")?;
        let step_index: i64 = row.try_get("step_index")?;
        let failure: Option<serde_json::Value> = row.try_get("failure")?;
        let remediation: serde_json::Value = row.try_get("remediation")?;

        Ok(InstanceHeader {
            instance_id: InstanceId::from_uuid(row.try_get::<Uuid, _>("instance_id")?),
            definition_id: row.try_get("definition_id")?,
            input: row.try_get("input")?,
            status: status.parse().map_err(Self::corrupt)?,
            step_index: usize::try_from(step_index)
                .map_err(|e| Self::corrupt(format!("step_index {step_index}: {e}")))?,
            cancel_requested: row.try_get("cancel_requested")?,
            compensation_attempted: row.try_get("compensation_attempted")?,
            failure: failure
                .map(serde_json::from_value::<FailureDetail>)
                .transpose()?,
            remediation: serde_json::from_value(remediation)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_record(row: &PgRow) -> Result<StepExecutionRecord> {
        let phase: String = row.try_get("phase")?;
        let status: String = row.try_get("status")?;
        let attempts: i32 = row.try_get("attempts")?;

        Ok(StepExecutionRecord {
            sequence: Sequence::new(row.try_get("sequence")?),
            step_name: row.try_get("step_name")?,
            phase: phase.parse().map_err(Self::corrupt)?,
            status: status.parse().map_err(Self::corrupt)?,
            idempotency_key: row.try_get("idempotency_key")?,
            attempts: u32::try_from(attempts)
                .map_err(|e| Self::corrupt(format!("attempts {attempts}: {e}")))?,
            payload: row.try_get("payload")?,
            error: row.try_get("error")?,
            timestamp: row.try_get("timestamp")?,
        })
    }

    fn step_index_param(header: &InstanceHeader) -> Result<i64> {
        i64::try_from(header.step_index)
            .map_err(|e| Self::corrupt(format!("step_index {}: {e}", header.step_index)))
    }
}

#[async_trait]
impl TransactionLog for PostgresTransactionLog {
    async fn create_instance(&self, header: InstanceHeader) -> Result<()> {
        let failure = header.failure.as_ref().map(serde_json::to_value).transpose()?;
        let remediation = serde_json::to_value(&header.remediation)?;
        let instance_id = header.instance_id;

        sqlx::query(
            r#"
            INSERT INTO workflow_instances (instance_id, definition_id, input, status, step_index,
                cancel_requested, compensation_attempted, failure, remediation, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(instance_id.as_uuid())
        .bind(&header.definition_id)
        .bind(&header.input)
        .bind(header.status.as_str())
        .bind(Self::step_index_param(&header)?)
        .bind(header.cancel_requested)
        .bind(header.compensation_attempted)
        .bind(failure)
        .bind(remediation)
        .bind(header.created_at)
        .bind(header.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("workflow_instances_pkey")
            {
                return TransactionLogError::InstanceExists(instance_id);
            }
            TransactionLogError::Database(e)
        })?;

        Ok(())
    }

    async fn append_record(
        &self,
        instance_id: InstanceId,
        record: StepExecutionRecord,
    ) -> Result<Sequence> {
        let mut tx = self.pool.begin().await?;

        // Lock the header row: same-instance appends serialize here.
        let exists: Option<Uuid> = sqlx::query_scalar(
            "SELECT instance_id FROM workflow_instances WHERE instance_id = $1 FOR UPDATE",
        )
        .bind(instance_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_none() {
            return Err(TransactionLogError::InstanceNotFound(instance_id));
        }

        let last_row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM step_records WHERE instance_id = $1 \
             ORDER BY sequence DESC LIMIT 1"
        ))
        .bind(instance_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let last = last_row.as_ref().map(Self::row_to_record).transpose()?;

        validate_record_for_append(instance_id, last.as_ref(), &record)?;

        let attempts = i32::try_from(record.attempts)
            .map_err(|e| Self::corrupt(format!("attempts {}: {e}", record.attempts)))?;

        sqlx::query(
            r#"
            INSERT INTO step_records (instance_id, sequence, step_name, phase, status,
                idempotency_key, attempts, payload, error, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(instance_id.as_uuid())
        .bind(record.sequence.as_i64())
        .bind(&record.step_name)
        .bind(record.phase.as_str())
        .bind(record.status.as_str())
        .bind(&record.idempotency_key)
        .bind(attempts)
        .bind(&record.payload)
        .bind(&record.error)
        .bind(record.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_instance_sequence")
            {
                return TransactionLogError::SequenceConflict {
                    instance_id,
                    expected: last
                        .as_ref()
                        .map(|r| r.sequence)
                        .unwrap_or(Sequence::initial())
                        .next(),
                    actual: record.sequence,
                };
            }
            TransactionLogError::Database(e)
        })?;

        tx.commit().await?;
        metrics::counter!("transaction_log_appends_total", "backend" => "postgres").increment(1);
        Ok(record.sequence)
    }

    async fn update_header(&self, header: &InstanceHeader) -> Result<()> {
        let failure = header.failure.as_ref().map(serde_json::to_value).transpose()?;
        let remediation = serde_json::to_value(&header.remediation)?;

        // cancel_requested is OR-ed so a stale header never clears the mark.
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = $2,
                step_index = $3,
                cancel_requested = cancel_requested OR $4,
                compensation_attempted = $5,
                failure = $6,
                remediation = $7,
                updated_at = NOW()
            WHERE instance_id = $1
            "#,
        )
        .bind(header.instance_id.as_uuid())
        .bind(header.status.as_str())
        .bind(Self::step_index_param(header)?)
        .bind(header.cancel_requested)
        .bind(header.compensation_attempted)
        .bind(failure)
        .bind(remediation)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TransactionLogError::InstanceNotFound(header.instance_id));
        }
        Ok(())
    }

    async fn get_header(&self, instance_id: InstanceId) -> Result<Option<InstanceHeader>> {
        let row = sqlx::query(&format!(
            "SELECT {HEADER_COLUMNS} FROM workflow_instances WHERE instance_id = $1"
        ))
        .bind(instance_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_header).transpose()
    }

    async fn load_instance(&self, instance_id: InstanceId) -> Result<Option<WorkflowInstance>> {
        let Some(header) = self.get_header(instance_id).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM step_records WHERE instance_id = $1 \
             ORDER BY sequence ASC"
        ))
        .bind(instance_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(WorkflowInstance::new(header, records)))
    }

    async fn list_instances(&self, query: InstanceQuery) -> Result<Vec<InstanceHeader>> {
        let mut sql = format!("SELECT {HEADER_COLUMNS} FROM workflow_instances WHERE 1=1");
        let mut param_count = 0;

        if query.definition_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND definition_id = ${param_count}"));
        }
        if query.statuses.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${param_count})"));
        }

        sql.push_str(" ORDER BY created_at ASC, instance_id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(definition_id) = query.definition_id {
            sqlx_query = sqlx_query.bind(definition_id);
        }
        if let Some(statuses) = query.statuses {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            sqlx_query = sqlx_query.bind(statuses);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_header).collect()
    }

    async fn request_cancellation(&self, instance_id: InstanceId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET cancel_requested = TRUE, updated_at = NOW()
            WHERE instance_id = $1 AND status IN ('running', 'compensating')
            "#,
        )
        .bind(instance_id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        match self.get_header(instance_id).await? {
            Some(_) => Ok(false),
            None => Err(TransactionLogError::InstanceNotFound(instance_id)),
        }
    }

    async fn purge_instance(&self, instance_id: InstanceId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM workflow_instances WHERE instance_id = $1 FOR UPDATE",
        )
        .bind(instance_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let status: WorkflowStatus = status
            .ok_or(TransactionLogError::InstanceNotFound(instance_id))?
            .parse()
            .map_err(Self::corrupt)?;

        if !status.is_terminal() {
            return Err(TransactionLogError::NotTerminal {
                instance_id,
                status,
            });
        }

        // step_records rows go with the header (ON DELETE CASCADE).
        sqlx::query("DELETE FROM workflow_instances WHERE instance_id = $1")
            .bind(instance_id.as_uuid())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::debug!(%instance_id, "purged workflow instance");
        Ok(())
    }
}
