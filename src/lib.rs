use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;
use uuid::Uuid;

pub mod ai;
pub mod config;
pub mod db;
pub mod poll;
pub mod processor;
pub mod prompt;
pub mod retry;
pub mod server;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub type ProjectId = Uuid;
pub type JobId = i64;

/// Queue name used for project processing jobs.
pub const PROCESS_PROJECT_JOB: &str = "process-project";

/// Payload of a processing job. There is only one job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessProject {
    pub project_id: ProjectId,
}

/// A row of the durable job table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub params: Json<ProcessProject>,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error: Option<String>,
}

impl Job {
    pub fn project_id(&self) -> ProjectId {
        self.params.0.project_id
    }

    /// Attempts made so far, including the one in flight.
    pub fn attempts_made(&self) -> u32 {
        u32::try_from(self.attempts).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize)]
#[sqlx(type_name = "queue_status_enum", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Lifecycle status of a project presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "project_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Draft,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Draft => "DRAFT",
            Status::Processing => "PROCESSING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImageCounts {
    pub before: i64,
    pub after: i64,
}

/// Read-only inputs gathered before the enhancement call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectContext {
    pub id: ProjectId,
    pub title: String,
    pub original_description: String,
    pub status: Status,
    pub images: ImageCounts,
}

/// What a status query returns to a polling caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub project_id: ProjectId,
    pub status: Status,
    pub presentation_token: Option<String>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusReport {
    /// The token and completion time are only exposed once the presentation
    /// is COMPLETED, the error message only while FAILED.
    pub fn new(
        project_id: ProjectId,
        status: Status,
        presentation_token: Option<String>,
        error: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Self {
        StatusReport {
            project_id,
            status,
            presentation_token: presentation_token.filter(|_| status == Status::Completed),
            error: error.filter(|_| status == Status::Failed),
            completed_at: completed_at.filter(|_| status == Status::Completed),
        }
    }

    pub fn presentation_path(&self) -> Option<String> {
        self.presentation_token
            .as_ref()
            .map(|token| format!("/p/{}", token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_only_visible_when_completed() {
        let id = Uuid::new_v4();
        let report = StatusReport::new(id, Status::Processing, Some("tok".into()), None, None);
        assert_eq!(report.presentation_token, None);
        assert_eq!(report.presentation_path(), None);

        let report = StatusReport::new(id, Status::Completed, Some("tok".into()), None, None);
        assert_eq!(report.presentation_path().as_deref(), Some("/p/tok"));
    }

    #[test]
    fn error_only_visible_when_failed() {
        let id = Uuid::new_v4();
        let stale = StatusReport::new(id, Status::Processing, None, Some("old".into()), None);
        assert_eq!(stale.error, None);

        let failed = StatusReport::new(id, Status::Failed, None, Some("boom".into()), None);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn completion_time_only_visible_when_completed() {
        let id = Uuid::new_v4();
        let earlier = Some(Utc::now());

        for status in [Status::Draft, Status::Processing, Status::Failed] {
            let report = StatusReport::new(id, status, None, None, earlier);
            assert_eq!(report.completed_at, None, "status = {status}");
        }

        let completed = StatusReport::new(id, Status::Completed, None, None, earlier);
        assert_eq!(completed.completed_at, earlier);
    }

    #[test]
    fn payload_uses_camel_case() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(ProcessProject { project_id: id }).unwrap();
        assert_eq!(json["projectId"], serde_json::json!(id.to_string()));
    }
}
