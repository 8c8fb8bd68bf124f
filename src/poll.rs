//! Client-side wait for a project to reach a terminal status.

use crate::store::{ProjectStore, StoreError};
use crate::{ProjectId, Status, StatusReport};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: Duration::from_secs(2),
            max_attempts: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed(StatusReport),
    Failed(StatusReport),
    /// Gave up waiting; carries whatever was last observed. The presentation
    /// may still become available.
    Exhausted(StatusReport),
}

impl PollOutcome {
    pub fn report(&self) -> &StatusReport {
        match self {
            PollOutcome::Completed(r) | PollOutcome::Failed(r) | PollOutcome::Exhausted(r) => r,
        }
    }
}

pub async fn wait_for_terminal<S>(
    store: &S,
    project_id: ProjectId,
    config: PollConfig,
) -> Result<PollOutcome, StoreError>
where
    S: ProjectStore + ?Sized,
{
    let mut last = None;
    for attempt in 1..=config.max_attempts {
        sleep(config.interval).await;
        let report = store.status_report(project_id).await?;
        debug!(%project_id, attempt, status = %report.status, "Polled status");
        match report.status {
            Status::Completed => return Ok(PollOutcome::Completed(report)),
            Status::Failed => return Ok(PollOutcome::Failed(report)),
            _ => last = Some(report),
        }
    }

    let report = match last {
        Some(report) => report,
        None => store.status_report(project_id).await?,
    };
    Ok(PollOutcome::Exhausted(report))
}
