//! Startup wiring: leader gate, health endpoint, and the control plane
//! assembly

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{AppcopError, Result};
use crate::gc::GarbageCollector;
use crate::metrics::Metrics;
use crate::orchestrator::{HttpOrchestrator, Orchestrator};
use crate::score::Scorer;
use crate::sse::SseDispatcher;
use crate::worker::{EventWorker, SharedEventQueue};

/// Poll until the orchestrator reports the configured leader. There is no
/// timeout: a mismatch keeps appcop idle until its supervisor intervenes.
/// The gate runs once at startup; leadership changes afterwards are not
/// re-checked.
pub async fn wait_for_leadership(orchestrator: &dyn Orchestrator, my_leader: &str) {
    let mut ticker = tokio::time::interval(Duration::from_secs(crate::defaults::LEADER_POLL_SECS));

    loop {
        ticker.tick().await;
        match orchestrator.get_leader().await {
            Ok(leader) if leader == my_leader => {
                info!(leader = %leader, "Leader matches, starting subscription");
                return;
            }
            Ok(leader) => debug!(leader = %leader, my_leader, "I am not leader"),
            Err(err) => error!(error = %err, "Error while getting leader"),
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

fn normalize_listen(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    }
}

/// Serve `GET /health` for supervisors.
pub async fn serve_health(listen: &str) -> Result<()> {
    let router = Router::new().route("/health", get(health));
    let listener = tokio::net::TcpListener::bind(normalize_listen(listen)).await?;
    info!(address = %listener.local_addr()?, "Listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Assemble and run the whole control plane. Returns when the event
/// stream dies (error) or on ctrl-c (ok).
pub async fn run(config: Config) -> Result<()> {
    let metrics = Metrics::new(&config.metrics)?;
    metrics.spawn_reporter();

    let orchestrator: Arc<dyn Orchestrator> =
        Arc::new(HttpOrchestrator::new(&config.orchestrator, metrics.clone())?);
    let scorer = Scorer::new(&config.score, orchestrator.clone(), metrics.clone())?;
    let gc = GarbageCollector::new(&config.gc, orchestrator.clone(), metrics.clone());

    wait_for_leadership(orchestrator.as_ref(), &config.web.my_leader).await;

    let (update_tx, _scorer_handle) = scorer.spawn();

    let (event_tx, event_rx) = mpsc::channel(config.web.queue_size);
    let queue: SharedEventQueue = Arc::new(Mutex::new(event_rx));
    let (stop_tx, _) = broadcast::channel(1);

    for id in 0..config.web.workers_count {
        EventWorker::new(id, orchestrator.clone(), metrics.clone()).spawn(
            queue.clone(),
            update_tx.clone(),
            stop_tx.subscribe(),
        );
    }
    // the scorer stops once the workers drop their senders
    drop(update_tx);

    tokio::spawn(gc.run());

    let dispatcher = SseDispatcher::connect(orchestrator.as_ref(), event_tx).await?;
    let dispatcher_handle = dispatcher.spawn(stop_tx.subscribe());

    let listen = config.web.listen.clone();
    tokio::spawn(async move {
        if let Err(err) = serve_health(&listen).await {
            error!(error = %err, "Health endpoint failed");
        }
    });

    tokio::select! {
        joined = dispatcher_handle => {
            let result = joined
                .unwrap_or_else(|err| Err(AppcopError::Io(std::io::Error::other(err))));
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            let _ = stop_tx.send(());
        }
    }

    Ok(())
}
