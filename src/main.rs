use anyhow::Error;
use clap::Parser;
use std::env;
use std::sync::Arc;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use renoq::ai::ClaudeClient;
use renoq::config::ConfigContext;
use renoq::db::DbHandle;
use renoq::poll::{self, PollOutcome};
use renoq::processor::Processor;
use renoq::server::{self, QueueClient, WorkResponseMessage};
use renoq::telemetry;

#[instrument(skip_all)]
async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let handle = DbHandle::new(&config.connect_url, config.pool_size).await?;
    let enhancer = ClaudeClient::new(config.claude())?;
    let processor = Arc::new(Processor::new(
        Arc::new(handle.clone()),
        Arc::new(enhancer),
        config.enhance_timeout(),
    ));

    // Channel for sending requests to be processed
    let (send_to_server, recv_from_client) = mpsc::unbounded_channel();

    // Channel for getting response from server
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();

    let server_spawn = {
        let cancel_token = cancel_token.clone();
        let handle = handle.clone();
        let processor = processor.clone();
        let settings = config.queue_settings();
        tokio::spawn(
            async move {
                if let Err(err) = server::serve(
                    cancel_token,
                    handle,
                    processor,
                    settings,
                    recv_from_client,
                    send_to_client,
                )
                .await
                {
                    error!("Error starting server: {}", err);
                }
            }
            .instrument(info_span!("server")),
        )
    };

    let client = QueueClient::new(send_to_server);
    for project_id in config.projects.iter().copied() {
        let job = match client.enqueue(project_id).await {
            Ok(job) => job,
            Err(err) => {
                error!(message = "Could not queue project", %project_id, error = %err);
                continue;
            }
        };
        info!(message = "Processing started", job_id = job.job_id, %project_id);

        let store = processor.store().clone();
        let poll_config = config.poll_config();
        tokio::spawn(
            async move {
                match poll::wait_for_terminal(store.as_ref(), project_id, poll_config).await {
                    Ok(PollOutcome::Completed(report)) => {
                        info!(message = "Presentation ready", path = ?report.presentation_path())
                    }
                    Ok(PollOutcome::Failed(report)) => {
                        error!(message = "Presentation generation failed", error = ?report.error)
                    }
                    Ok(PollOutcome::Exhausted(report)) => {
                        warn!(message = "Still not finished, presentation may appear later", status = %report.status)
                    }
                    Err(err) => error!(message = "Polling failed", error = %err),
                }
            }
            .instrument(info_span!("poll", %project_id)),
        );
    }

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            server_response = recv_from_server.recv() => {
                match server_response {
                    Some(WorkResponseMessage::DatabaseQueueError(err)) => {
                        error!(event = "DatabaseQueueError", error = %err);
                    },
                    Some(msg) => {
                        info!(event = "Message", msg = ?msg);
                    },
                    None => {
                        debug!("Server connection closed unexpectedly, exiting");
                        break;
                    }
                }
            }
        }
    }

    info!("Waiting for server to shutdown...");
    server_spawn.await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "renoq=debug");
    }

    let config = ConfigContext::parse();
    telemetry::init("renoq", config.log_format, config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    info!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
