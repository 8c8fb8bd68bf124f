use crate::processor::Processor;
use crate::{Job, JobId};
use async_channel::Receiver;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug, PartialEq, Eq)]
pub enum WorkMessage {
    JobStarted(JobId),
    JobCompleted(JobId),
    JobFailed {
        job_id: JobId,
        attempts_made: u32,
        max_attempts: u32,
        error: String,
    },
}

/// Pull jobs until cancelled. A job already running is finished first.
pub async fn start(
    cancel_token: CancellationToken,
    recv_from_queue: Receiver<Job>,
    send_to_server: UnboundedSender<WorkMessage>,
    processor: Arc<Processor>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            job = recv_from_queue.recv() => {
                match job {
                    Err(err) => {
                        error!(message = "Error receiving job by worker, exiting", error = ?err);
                        break;
                    },
                    Ok(job) => {
                        if let Err(err) = send_to_server.send(WorkMessage::JobStarted(job.id)) {
                            error!(message = "Server gone, worker exiting", error = ?err);
                            break;
                        }
                        let report = run(&processor, &job).await;
                        if let Err(err) = send_to_server.send(report) {
                            error!(message = "Server gone, worker exiting", error = ?err);
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
}

#[instrument(skip_all, fields(job_id = %job.id, attempt = job.attempts))]
async fn run(processor: &Processor, job: &Job) -> WorkMessage {
    match processor.process(job.project_id()).await {
        Ok(_) => WorkMessage::JobCompleted(job.id),
        Err(err) => WorkMessage::JobFailed {
            job_id: job.id,
            attempts_made: job.attempts_made(),
            max_attempts: u32::try_from(job.max_attempts).unwrap_or(0),
            error: err.to_string(),
        },
    }
}
