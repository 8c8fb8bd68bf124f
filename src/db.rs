use crate::{Job, JobId, JobStatus, ProcessProject, ProjectId, Status, PROCESS_PROJECT_JOB};
use anyhow::Error;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Executor;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const JOB_COLUMNS: &str = "id, name, params, status, attempts, max_attempts, error";

#[derive(Clone)]
pub struct DbHandle {
    pub(crate) pool: Arc<PgPool>,
}

impl DbHandle {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        DbHandle::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the tables if needed.
    pub async fn from_pool(pool: PgPool) -> Result<Self, Error> {
        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    pub(crate) async fn complete_job(&self, id: JobId) -> Result<(), Error> {
        sqlx::query(
            "UPDATE jobq \
                SET status = 'COMPLETED', \
                finished_at = now(), \
                duration = extract(epoch from now() - started_at), \
                error = NULL \
            WHERE id = $1",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    pub(crate) async fn fail_job(&self, id: JobId, msg: &str) -> Result<(), Error> {
        sqlx::query(
            "UPDATE jobq \
                SET status = 'FAILED', \
                finished_at = now(), \
                duration = extract(epoch from now() - started_at), \
                error = $1 \
            WHERE id = $2",
        )
        .bind(msg)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Put a failed attempt back in the queue, eligible again after `delay`.
    pub(crate) async fn retry_job(&self, id: JobId, delay: Duration, msg: &str) -> Result<(), Error> {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        sqlx::query(
            "UPDATE jobq \
                SET status = 'QUEUED', \
                run_at = now() + ($1::bigint * interval '1 millisecond'), \
                error = $2 \
            WHERE id = $3",
        )
        .bind(delay_ms)
        .bind(msg)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Jobs left PROCESSING by a previous run are delivered again.
    pub(crate) async fn reset_processing_jobs(&self) -> Result<u64, Error> {
        let result = sqlx::query("UPDATE jobq SET status = 'QUEUED' WHERE status = 'PROCESSING'")
            .execute(&*self.pool)
            .await?;

        debug!("Reset {} processing jobs", result.rows_affected());
        Ok(result.rows_affected())
    }

    /// Atomically move up to `num` due jobs from QUEUED to PROCESSING.
    pub(crate) async fn claim_queued_jobs(&self, num: i64) -> Result<Vec<Job>, Error> {
        debug!("Claiming {} queued jobs", num);
        let sql = format!(
            "UPDATE jobq \
                SET status = 'PROCESSING', \
                attempts = attempts + 1, \
                started_at = now() \
            WHERE id IN ( \
                SELECT id FROM jobq \
                WHERE status = 'QUEUED' AND run_at <= now() \
                ORDER BY run_at ASC, id ASC \
                LIMIT $1 \
                FOR UPDATE SKIP LOCKED \
            ) \
            RETURNING {JOB_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(num)
            .fetch_all(&*self.pool)
            .await?)
    }

    pub(crate) async fn submit_job(
        &self,
        payload: ProcessProject,
        max_attempts: u32,
    ) -> Result<JobId, Error> {
        debug!("Submitting job {:?}", payload);
        let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
        let id = sqlx::query_scalar::<_, JobId>(
            "INSERT INTO jobq \
            (name, params, max_attempts, status) \
            VALUES ($1, $2, $3, 'QUEUED') \
            RETURNING id",
        )
        .bind(PROCESS_PROJECT_JOB)
        .bind(Json(payload))
        .bind(max_attempts)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, Error> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobq WHERE id = $1");
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?)
    }

    /// Current status and presentation token of a project, read together.
    pub async fn project_status_and_token(
        &self,
        project_id: ProjectId,
    ) -> Result<Option<(Status, String)>, Error> {
        Ok(sqlx::query_as::<_, (Status, String)>(
            "SELECT status, presentation_token FROM projects WHERE id = $1",
        )
        .bind(project_id)
        .fetch_optional(&*self.pool)
        .await?)
    }

    /// Keep only the latest `keep` finished rows of each terminal status.
    pub(crate) async fn prune_finished_jobs(&self, keep: i64) -> Result<u64, Error> {
        let mut removed = 0;
        for status in [JobStatus::Completed, JobStatus::Failed] {
            let result = sqlx::query(
                "DELETE FROM jobq \
                WHERE status = $1 AND id NOT IN ( \
                    SELECT id FROM jobq WHERE status = $1 \
                    ORDER BY finished_at DESC NULLS LAST, id DESC \
                    LIMIT $2 \
                )",
            )
            .bind(status)
            .bind(keep)
            .execute(&*self.pool)
            .await?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }
}
