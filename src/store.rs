//! Project status store.
//!
//! Writes are last-write-wins: there is no version token, each call returns
//! the status the row had just before it was overwritten so callers can
//! judge the transition they caused.

use crate::db::DbHandle;
use crate::{ImageCounts, ProjectContext, ProjectId, Status, StatusReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project {0} not found")]
    NotFound(ProjectId),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Set PROCESSING and clear any previous processing error.
    async fn begin_processing(&self, id: ProjectId) -> Result<Status, StoreError>;

    async fn load_context(&self, id: ProjectId) -> Result<ProjectContext, StoreError>;

    /// Write the final description, COMPLETED and the completion time in one update.
    async fn complete(&self, id: ProjectId, description: &str) -> Result<Status, StoreError>;

    async fn fail(&self, id: ProjectId, message: &str) -> Result<Status, StoreError>;

    async fn status_report(&self, id: ProjectId) -> Result<StatusReport, StoreError>;
}

#[derive(sqlx::FromRow)]
struct ContextRow {
    title: String,
    description_original: String,
    status: Status,
    before_count: i64,
    after_count: i64,
}

#[derive(sqlx::FromRow)]
struct ReportRow {
    status: Status,
    presentation_token: String,
    processing_error: Option<String>,
    completed_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl ProjectStore for DbHandle {
    async fn begin_processing(&self, id: ProjectId) -> Result<Status, StoreError> {
        sqlx::query_scalar::<_, Status>(
            "WITH prev AS (SELECT id, status FROM projects WHERE id = $1 FOR UPDATE) \
            UPDATE projects p \
                SET status = 'PROCESSING', \
                processing_error = NULL, \
                updated_at = now() \
            FROM prev \
            WHERE p.id = prev.id \
            RETURNING prev.status",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))
    }

    async fn load_context(&self, id: ProjectId) -> Result<ProjectContext, StoreError> {
        let row = sqlx::query_as::<_, ContextRow>(
            "SELECT p.title, p.description_original, p.status, \
                (SELECT count(*) FROM project_images i WHERE i.project_id = p.id AND i.kind = 'BEFORE') AS before_count, \
                (SELECT count(*) FROM project_images i WHERE i.project_id = p.id AND i.kind = 'AFTER') AS after_count \
            FROM projects p \
            WHERE p.id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        Ok(ProjectContext {
            id,
            title: row.title,
            original_description: row.description_original,
            status: row.status,
            images: ImageCounts {
                before: row.before_count,
                after: row.after_count,
            },
        })
    }

    async fn complete(&self, id: ProjectId, description: &str) -> Result<Status, StoreError> {
        sqlx::query_scalar::<_, Status>(
            "WITH prev AS (SELECT id, status FROM projects WHERE id = $1 FOR UPDATE) \
            UPDATE projects p \
                SET status = 'COMPLETED', \
                description_enhanced = $2, \
                processing_error = NULL, \
                completed_at = now(), \
                updated_at = now() \
            FROM prev \
            WHERE p.id = prev.id \
            RETURNING prev.status",
        )
        .bind(id)
        .bind(description)
        .fetch_optional(&*self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))
    }

    async fn fail(&self, id: ProjectId, message: &str) -> Result<Status, StoreError> {
        sqlx::query_scalar::<_, Status>(
            "WITH prev AS (SELECT id, status FROM projects WHERE id = $1 FOR UPDATE) \
            UPDATE projects p \
                SET status = 'FAILED', \
                processing_error = $2, \
                updated_at = now() \
            FROM prev \
            WHERE p.id = prev.id \
            RETURNING prev.status",
        )
        .bind(id)
        .bind(message)
        .fetch_optional(&*self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))
    }

    async fn status_report(&self, id: ProjectId) -> Result<StatusReport, StoreError> {
        let row = sqlx::query_as::<_, ReportRow>(
            "SELECT status, presentation_token, processing_error, completed_at \
            FROM projects WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        Ok(StatusReport::new(
            id,
            row.status,
            Some(row.presentation_token),
            row.processing_error,
            row.completed_at,
        ))
    }
}
