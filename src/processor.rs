//! The project processing job.
//!
//! One invocation takes a project from whatever state it is in to a terminal
//! state: PROCESSING is written before any external call, the description is
//! enhanced on a best-effort basis, and exactly one terminal write follows.
//! A retry runs the whole body again from the first step.

use crate::ai::{self, Enhancer};
use crate::store::{ProjectStore, StoreError};
use crate::{ImageCounts, ProjectId, Status};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Local bound on the enhancement call.
pub const DEFAULT_ENHANCE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("project {0} not found")]
    NotFound(ProjectId),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ProcessError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ProcessError::NotFound(id),
            other => ProcessError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub project_id: ProjectId,
    /// False when the original description was kept.
    pub enhanced: bool,
    pub images: ImageCounts,
    pub processing_time: Duration,
}

pub struct Processor {
    store: Arc<dyn ProjectStore>,
    enhancer: Arc<dyn Enhancer>,
    enhance_timeout: Duration,
}

impl Processor {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        enhancer: Arc<dyn Enhancer>,
        enhance_timeout: Duration,
    ) -> Self {
        Processor {
            store,
            enhancer,
            enhance_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn process(&self, project_id: ProjectId) -> Result<ProcessOutcome, ProcessError> {
        info!("Processing project");
        match self.run(project_id).await {
            Ok(outcome) => {
                info!(
                    message = "Project processed",
                    processing_time_ms = outcome.processing_time.as_millis() as u64,
                    before_images = outcome.images.before,
                    after_images = outcome.images.after,
                    enhanced = outcome.enhanced
                );
                Ok(outcome)
            }
            // Nothing to mark: the row does not exist.
            Err(err @ ProcessError::NotFound(_)) => {
                error!(message = "Project not found", error = %err);
                Err(err)
            }
            Err(err) => {
                error!(message = "Error processing project", error = %err);
                match self.store.fail(project_id, &err.to_string()).await {
                    Ok(previous) => check_transition(previous, Status::Failed),
                    Err(fail_err) => {
                        error!(message = "Could not record failure", error = %fail_err)
                    }
                }
                Err(err)
            }
        }
    }

    async fn run(&self, project_id: ProjectId) -> Result<ProcessOutcome, ProcessError> {
        let started = Instant::now();

        let previous = self.store.begin_processing(project_id).await?;
        check_transition(previous, Status::Processing);
        if previous.is_terminal() {
            info!(message = "Re-generating presentation", previous = %previous);
        }

        let context = self.store.load_context(project_id).await?;

        let enhancement = ai::enhance_within(
            self.enhancer.as_ref(),
            self.enhance_timeout,
            &context.original_description,
            &context.title,
            context.images,
        )
        .await;
        let (description, enhanced) = match enhancement {
            Ok(text) => {
                info!("AI enhancement successful");
                (text, true)
            }
            Err(err) => {
                warn!(
                    message = "AI enhancement failed, using original description",
                    error = %err
                );
                (context.original_description, false)
            }
        };

        let previous = self.store.complete(project_id, &description).await?;
        check_transition(previous, Status::Completed);

        Ok(ProcessOutcome {
            project_id,
            enhanced,
            images: context.images,
            processing_time: started.elapsed(),
        })
    }
}

/// Writes are last-write-wins, so an unexpected source state is reported
/// rather than undone.
fn check_transition(previous: Status, next: Status) {
    if let Err(err) = previous.transition(next) {
        warn!(message = "Unexpected status transition", error = %err);
    } else if previous == Status::Processing && next == Status::Processing {
        warn!("Project already processing, concurrent attempts race on the final write");
    }
}
