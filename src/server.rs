use crate::db::DbHandle;
use crate::processor::Processor;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::StoreError;
use crate::worker::{self, WorkMessage};
use crate::{Job, JobId, ProcessProject, ProjectId};
use anyhow::{anyhow, Error};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug)]
pub enum WorkResponseMessage {
    JobStarted(JobId),
    JobCompleted(JobId),
    JobRetrying(JobId, Duration, String),
    JobFailed(JobId, String),
    DatabaseQueueError(Error),
}

/// Returned as soon as a job is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: JobId,
    pub project_id: ProjectId,
    pub presentation_token: Option<String>,
}

#[derive(Debug)]
pub struct JobRequest {
    pub payload: ProcessProject,
    pub respond_to: oneshot::Sender<Result<JobHandle, Error>>,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub workers: u16,
    pub retry: RetryPolicy,
    /// Finished jobs of each terminal status kept in the table.
    pub keep_finished: i64,
    /// How often due retries are looked for when nothing else happens.
    pub tick: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            workers: 5,
            retry: RetryPolicy::default(),
            keep_finished: 100,
            tick: Duration::from_secs(1),
        }
    }
}

/// Cloneable handle for submitting work to a running server.
#[derive(Clone)]
pub struct QueueClient {
    send_to_server: mpsc::UnboundedSender<JobRequest>,
}

impl QueueClient {
    pub fn new(send_to_server: mpsc::UnboundedSender<JobRequest>) -> Self {
        QueueClient { send_to_server }
    }

    /// Queue processing for a project. Does not wait for the job to run.
    pub async fn enqueue(&self, project_id: ProjectId) -> Result<JobHandle, Error> {
        let (respond_to, response) = oneshot::channel();
        self.send_to_server
            .send(JobRequest {
                payload: ProcessProject { project_id },
                respond_to,
            })
            .map_err(|_| anyhow!("queue server is not running"))?;
        response
            .await
            .map_err(|_| anyhow!("queue server dropped the request"))?
    }
}

fn notify(
    send_to_client: &mpsc::UnboundedSender<WorkResponseMessage>,
    msg: WorkResponseMessage,
) -> bool {
    match send_to_client.send(msg) {
        Ok(()) => true,
        Err(err) => {
            error!(message = "Failed to send response to client", error = ?err);
            false
        }
    }
}

async fn accept(
    handle: &DbHandle,
    payload: ProcessProject,
    retry: &RetryPolicy,
) -> Result<JobHandle, Error> {
    let (status, presentation_token) = handle
        .project_status_and_token(payload.project_id)
        .await?
        .ok_or(StoreError::NotFound(payload.project_id))?;
    if status.is_terminal() {
        info!(message = "Re-generation requested", project_id = %payload.project_id, status = %status);
    }

    let job_id = handle.submit_job(payload, retry.max_attempts).await?;
    info!(message = "Job queued", job_id, project_id = %payload.project_id);

    Ok(JobHandle {
        job_id,
        project_id: payload.project_id,
        presentation_token: Some(presentation_token),
    })
}

/// Record a finished job and trim the table.
async fn settle_completed(
    handle: &DbHandle,
    settings: &QueueSettings,
    job_id: JobId,
) -> Result<WorkResponseMessage, Error> {
    handle.complete_job(job_id).await?;
    handle.prune_finished_jobs(settings.keep_finished).await?;
    Ok(WorkResponseMessage::JobCompleted(job_id))
}

/// Re-queue a failed attempt with backoff, or fail the job for good once its
/// attempts are used up.
async fn settle_failed(
    handle: &DbHandle,
    settings: &QueueSettings,
    job_id: JobId,
    attempts_made: u32,
    max_attempts: u32,
    error: String,
) -> Result<WorkResponseMessage, Error> {
    let policy = RetryPolicy {
        max_attempts,
        ..settings.retry
    };
    match policy.decide(attempts_made) {
        RetryDecision::Retry(delay) => {
            warn!(message = "Job failed, retrying", job_id, attempts_made, delay_ms = delay.as_millis() as u64, error = %error);
            handle.retry_job(job_id, delay, &error).await?;
            Ok(WorkResponseMessage::JobRetrying(job_id, delay, error))
        }
        RetryDecision::GiveUp => {
            error!(message = "Job failed", job_id, attempts_made, error = %error);
            handle.fail_job(job_id, &error).await?;
            handle.prune_finished_jobs(settings.keep_finished).await?;
            Ok(WorkResponseMessage::JobFailed(job_id, error))
        }
    }
}

pub async fn serve(
    cancel_token: CancellationToken,
    handle: DbHandle,
    processor: Arc<Processor>,
    settings: QueueSettings,
    mut recv_from_client: mpsc::UnboundedReceiver<JobRequest>,
    send_to_client: mpsc::UnboundedSender<WorkResponseMessage>,
) -> Result<(), Error> {
    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) =
        async_channel::bounded::<Job>(settings.workers as usize);

    let mut workers = vec![];
    for _ in 0..settings.workers {
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let processor = processor.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, recv_from_queue, send_to_server, processor).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }

    let mut free_workers = settings.workers as i64;

    // Redeliver jobs a previous run left behind
    handle.reset_processing_jobs().await?;

    let mut tick = tokio::time::interval(settings.tick);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if free_workers > 0 {
            match handle.claim_queued_jobs(free_workers).await {
                Ok(jobs_to_process) => {
                    for job in jobs_to_process {
                        send_to_queue.send(job).await?;
                        free_workers -= 1;
                    }
                }
                Err(err) => {
                    if !notify(&send_to_client, WorkResponseMessage::DatabaseQueueError(err)) {
                        cancel_token.cancel();
                        break;
                    }
                }
            }
        }

        // Waiting for something to else to happen to continue...
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            _ = tick.tick() => {},
            chan_msg = recv_from_worker.recv() => {
                let delivered = match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(WorkMessage::JobStarted(job_id)) => {
                        debug!(message = "Starting job", job_id);
                        notify(&send_to_client, WorkResponseMessage::JobStarted(job_id))
                    },
                    Some(WorkMessage::JobCompleted(job_id)) => {
                        debug!(message = "Completed job", job_id);
                        free_workers += 1;
                        match settle_completed(&handle, &settings, job_id).await {
                            Ok(msg) => notify(&send_to_client, msg),
                            Err(err) => notify(&send_to_client, WorkResponseMessage::DatabaseQueueError(err)),
                        }
                    },
                    Some(WorkMessage::JobFailed { job_id, attempts_made, max_attempts, error }) => {
                        free_workers += 1;
                        match settle_failed(&handle, &settings, job_id, attempts_made, max_attempts, error).await {
                            Ok(msg) => notify(&send_to_client, msg),
                            Err(err) => notify(&send_to_client, WorkResponseMessage::DatabaseQueueError(err)),
                        }
                    },
                };
                if !delivered {
                    cancel_token.cancel();
                    break;
                }
            },
            // Handle requests from clients
            chan_msg = recv_from_client.recv() => {
                match chan_msg {
                    None => {
                        debug!("Client channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(JobRequest { payload, respond_to }) => {
                        debug!(message = "Requested job", payload = ?payload);
                        let result = accept(&handle, payload, &settings.retry).await;
                        if let Err(err) = &result {
                            warn!(message = "Job rejected", project_id = %payload.project_id, error = %err);
                        }
                        if respond_to.send(result).is_err() {
                            debug!("Requester went away before the job was acknowledged");
                        }
                    }
                }
            }
        }
    }

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}
