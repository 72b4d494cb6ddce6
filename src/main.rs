use anyhow::Error;
use clap::Parser;
use std::{env, sync::Arc};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::broadcast::error::RecvError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use postq::config::ConfigContext;
use postq::db::DbHandle;
use postq::promoter::ScheduledSubmissionPromoter;
use postq::queue::PostQueueService;
use postq::scheduler::Scheduler;
use postq::telemetry;
use postq::worker::SimulatedPostManager;
use postq::{ScheduleInfo, SubmissionRequest, SubmissionType};

#[instrument(skip_all)]
async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let db = DbHandle::new(&config.database_url, config.max_connections).await?;

    let (manager, worker_spawn) =
        SimulatedPostManager::spawn(db.clone(), config.post_delay(), cancel_token.clone());
    let queue = Arc::new(PostQueueService::new(
        db.clone(),
        Arc::new(manager),
        Arc::new(db.clone()),
    ));
    let promoter = Arc::new(ScheduledSubmissionPromoter::new(db.clone(), queue.clone()));
    let mut events = queue.subscribe();

    let ticks = Scheduler::with_handlers(&config.scheduler_config(), queue.clone(), promoter)
        .spawn(cancel_token.clone());

    // Simulating client requests
    if config.demo_submissions > 0 {
        let mut submission_ids = Vec::with_capacity(config.demo_submissions.into());
        for n in 0..config.demo_submissions {
            let request = SubmissionRequest {
                submission_type: SubmissionType::File,
                title: format!("Demo submission {n}"),
                is_scheduled: false,
                schedule: ScheduleInfo::default(),
                files: vec![("test.jpg".into(), "image/jpeg".into())],
                websites: vec![
                    (Uuid::new_v4(), "demo-gallery".into()),
                    (Uuid::new_v4(), "demo-social".into()),
                ],
            };
            submission_ids.push(db.create_submission(&request).await?);
        }
        queue.enqueue(&submission_ids).await?;
        debug!("Done seeding demo submissions");
    }

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Queue event loop cancelled");
                break;
            },
            event = events.recv() => {
                match event {
                    Ok(event) => info!(event = "Queue", msg = ?event),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Queue event subscriber lagged"),
                    Err(RecvError::Closed) => {
                        debug!("Queue event channel closed, exiting");
                        break;
                    }
                }
            }
        }
    }

    info!("Waiting for ticks and worker to shutdown...");
    futures::future::join_all(ticks)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;
    worker_spawn.await?;
    db.close().await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "postq=debug,info");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    tokio::spawn(async move {
        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            error!("Failed to install signal handlers, shutting down");
            token.cancel();
            return;
        };
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
