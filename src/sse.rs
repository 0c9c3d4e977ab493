//! SSE dispatcher
//!
//! Holds the single long-lived subscription to the orchestrator's event
//! stream and pushes parsed events onto the bounded queue. The stream is
//! the system's only input, so losing it is fatal; the bounded queue send
//! is the system's only backpressure.

use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AppcopError, Result};
use crate::events::{Event, EventStreamParser, SseEof};
use crate::orchestrator::{backoff_delay, Orchestrator};

/// Attempt budget for the initial subscribe
const SUBSCRIBE_MAX_ATTEMPTS: u32 = 3;

/// Event stream endpoint for an orchestrator location
pub fn subscribe_url(protocol: &str, location: &str) -> String {
    format!("{protocol}://{location}/v2/events")
}

pub struct SseDispatcher {
    response: reqwest::Response,
    queue: mpsc::Sender<Event>,
}

impl SseDispatcher {
    /// Subscribe to the event stream, retrying connect failures with
    /// exponential backoff. A non-200 answer is not retried: the
    /// orchestrator is there but refusing, which is fatal.
    pub async fn connect(
        orchestrator: &dyn Orchestrator,
        queue: mpsc::Sender<Event>,
    ) -> Result<Self> {
        let url = subscribe_url(orchestrator.protocol(), orchestrator.location());
        // the subscription never times out as a whole
        let client = reqwest::Client::builder().build()?;

        let mut attempt = 0;
        let response = loop {
            attempt += 1;

            let mut request = client.get(&url).header(ACCEPT, "text/event-stream");
            if let Some((user, pass)) = orchestrator.auth() {
                request = request.basic_auth(user, Some(pass));
            }

            match request.send().await {
                Ok(response) if response.status() == StatusCode::OK => break response,
                Ok(response) => {
                    return Err(AppcopError::BadStatus {
                        status: response.status().as_u16(),
                        path: "/v2/events".to_string(),
                    });
                }
                Err(err) => {
                    if attempt >= SUBSCRIBE_MAX_ATTEMPTS {
                        return Err(AppcopError::Network(err));
                    }
                    let delay = backoff_delay(attempt);
                    warn!(url = %url, attempt, ?delay, error = %err, "Event stream connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        };

        info!(url = %url, "Subscription success");
        Ok(Self { response, queue })
    }

    pub fn spawn(self, stop: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(stop))
    }

    /// Read the stream until it ends or a stop arrives. Any return with an
    /// error is fatal for the process.
    async fn run(mut self, mut stop: broadcast::Receiver<()>) -> Result<()> {
        let mut parser = EventStreamParser::new();

        loop {
            let chunk = tokio::select! {
                chunk = self.response.chunk() => chunk?,
                _ = stop.recv() => {
                    info!("Stopping event stream dispatcher");
                    return Ok(());
                }
            };

            match chunk {
                Some(bytes) => {
                    for event in parser.feed(&bytes) {
                        debug!(event_type = %event.event_type, "Dispatching event");
                        // blocks while the queue is full
                        if self.queue.send(event).await.is_err() {
                            return Err(AppcopError::ChannelClosed("event queue"));
                        }
                    }
                }
                None => {
                    return match std::mem::take(&mut parser).finish() {
                        SseEof::Dispatched(event) => {
                            // the final event still counts before we die
                            let _ = self.queue.send(event).await;
                            Err(AppcopError::StreamEof)
                        }
                        SseEof::Partial(_) => Err(AppcopError::UnexpectedEof),
                    };
                }
            }
        }
    }
}
