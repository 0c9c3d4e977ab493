//! Event worker pool
//!
//! A fixed pool of workers drains the bounded event queue, classifies each
//! event, and feeds score updates to the scorer. Individual event failures
//! are counted, never fatal.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::Event;
use crate::metrics::Metrics;
use crate::orchestrator::app::{
    parse_task, TASK_FAILED, TASK_FINISHED, TASK_KILLED, TASK_RUNNING,
};
use crate::orchestrator::Orchestrator;
use crate::score::ScoreUpdate;

/// The bounded event queue, shared by all workers. Whoever holds the lock
/// is the one waiting for the next event; handling happens after release.
pub type SharedEventQueue = Arc<Mutex<mpsc::Receiver<Event>>>;

pub const STATUS_UPDATE_EVENT: &str = "status_update_event";
pub const UNHEALTHY_TASK_KILL_EVENT: &str = "unhealthy_task_kill_event";

/// The orchestrator emits `taskId` in event bodies but `id` in its REST
/// responses; unifying the two lets one task parser handle both.
pub fn replace_task_id_with_id(body: &[u8]) -> Vec<u8> {
    const FROM: &[u8] = b"taskId";
    const TO: &[u8] = b"id";

    let mut out = Vec::with_capacity(body.len());
    let mut index = 0;
    while index < body.len() {
        if body[index..].starts_with(FROM) {
            out.extend_from_slice(TO);
            index += FROM.len();
        } else {
            out.push(body[index]);
            index += 1;
        }
    }
    out
}

/// One worker of the pool
pub struct EventWorker {
    id: usize,
    orchestrator: Arc<dyn Orchestrator>,
    metrics: Metrics,
}

impl EventWorker {
    pub fn new(id: usize, orchestrator: Arc<dyn Orchestrator>, metrics: Metrics) -> Self {
        Self {
            id,
            orchestrator,
            metrics,
        }
    }

    pub fn spawn(
        self,
        queue: SharedEventQueue,
        updates: mpsc::Sender<ScoreUpdate>,
        stop: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        info!(id = self.id, "Starting worker");
        tokio::spawn(self.run(queue, updates, stop))
    }

    async fn run(
        self,
        queue: SharedEventQueue,
        updates: mpsc::Sender<ScoreUpdate>,
        mut stop: broadcast::Receiver<()>,
    ) {
        loop {
            let (event, backlog) = tokio::select! {
                received = next_event(&queue) => match received {
                    Some(received) => received,
                    None => {
                        debug!(id = self.id, "Event queue closed");
                        break;
                    }
                },
                _ = stop.recv() => {
                    info!(id = self.id, "Stopping worker");
                    break;
                }
            };

            self.metrics.mark(&format!("events.handler.{}", self.id));
            self.metrics.update_gauge("events.queue.len", backlog as i64);
            self.metrics.update_gauge(
                "events.queue.delay_us",
                event.timestamp.elapsed().as_micros() as i64,
            );

            let started = Instant::now();
            let result = self.handle_event(&event, &updates).await;
            self.metrics.observe(
                &format!("events.processing.{}", event.event_type),
                started.elapsed(),
            );

            match result {
                Ok(()) => self.metrics.mark("events.processing.succes"),
                Err(err) => {
                    self.metrics.mark("events.processing.error");
                    warn!(id = self.id, error = %err, "Event processing failed");
                }
            }
        }
    }

    async fn handle_event(&self, event: &Event, updates: &mpsc::Sender<ScoreUpdate>) -> Result<()> {
        let body = replace_task_id_with_id(&event.body);

        match event.event_type.as_str() {
            STATUS_UPDATE_EVENT => self.handle_status_event(&body, updates).await,
            UNHEALTHY_TASK_KILL_EVENT => self.handle_unhealthy_kill_event(&body, updates).await,
            other => {
                debug!(event_type = other, "Not handled event type");
                Ok(())
            }
        }
    }

    async fn handle_status_event(
        &self,
        body: &[u8],
        updates: &mpsc::Sender<ScoreUpdate>,
    ) -> Result<()> {
        let task = match parse_task(body) {
            Ok(task) => task,
            Err(err) => {
                warn!(error = %err, "Could not parse event body");
                return Err(err);
            }
        };

        debug!(task_id = %task.id, status = %task.task_status, "Got status event");
        self.metrics
            .mark_app(&task.metric_name(self.orchestrator.app_id_prefix()));

        match task.task_status.as_str() {
            TASK_FINISHED | TASK_FAILED | TASK_KILLED => {
                self.emit_update(&task.app_id, updates).await
            }
            TASK_RUNNING => {
                info!(app_id = %task.app_id, host = %task.host, "Got task running status");
                Ok(())
            }
            other => {
                debug!(task_id = %task.id, status = other, "Not handled task status");
                Ok(())
            }
        }
    }

    async fn handle_unhealthy_kill_event(
        &self,
        body: &[u8],
        updates: &mpsc::Sender<ScoreUpdate>,
    ) -> Result<()> {
        let task = match parse_task(body) {
            Ok(task) => task,
            Err(err) => {
                warn!(error = %err, "Could not parse event body");
                return Err(err);
            }
        };

        debug!(task_id = %task.id, "Got unhealthy task killed event");
        self.emit_update(&task.app_id, updates).await
    }

    async fn emit_update(
        &self,
        app_id: &crate::orchestrator::AppId,
        updates: &mpsc::Sender<ScoreUpdate>,
    ) -> Result<()> {
        let app = self.orchestrator.get_app(app_id).await?;
        updates
            .send(ScoreUpdate { app, delta: 1 })
            .await
            .map_err(|_| crate::error::AppcopError::ChannelClosed("score updates"))?;
        Ok(())
    }
}

async fn next_event(queue: &SharedEventQueue) -> Option<(Event, usize)> {
    let mut receiver = queue.lock().await;
    let event = receiver.recv().await?;
    let backlog = receiver.len();
    Some((event, backlog))
}
