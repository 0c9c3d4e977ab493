//! Orchestrator capability: typed CRUD against the cluster job manager
//!
//! The control plane only ever talks to the [`Orchestrator`] trait;
//! [`HttpOrchestrator`] is the production implementation and
//! [`stub::StubOrchestrator`] the canned one used by tests.

pub mod app;
pub mod group;
pub mod stub;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use app::{App, AppId, HealthCheckResult, Task, TaskId, VersionInfo};
pub use group::{Group, GroupId};

use crate::config::OrchestratorConfig;
use crate::error::{AppcopError, Result};
use crate::metrics::Metrics;

/// Attempt budget for idempotent GETs
const GET_MAX_ATTEMPTS: u32 = 5;

/// First retry delay; doubles per attempt
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Exponential backoff delay before the given retry attempt (1-based).
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    RETRY_BASE_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Operations the control plane needs from the cluster job manager
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Fetch one application, tasks embedded
    async fn get_app(&self, id: &AppId) -> Result<App>;

    /// Fetch all applications
    async fn get_apps(&self) -> Result<Vec<App>>;

    /// Fetch the tasks of one application
    async fn get_tasks(&self, id: &AppId) -> Result<Vec<Task>>;

    /// Current leader as reported by the orchestrator, `host:port`
    async fn get_leader(&self) -> Result<String>;

    /// Scale the application one instance down and stamp the `appcop`
    /// label. The penalty is computed on the local copy before the update
    /// is sent.
    async fn scale_down(&self, app: &App) -> Result<()>;

    /// Delete an application
    async fn delete_app(&self, id: &AppId) -> Result<()>;

    /// Fetch the recursive group tree
    async fn get_groups(&self) -> Result<Vec<Group>>;

    /// Leaf groups holding neither applications nor child groups
    async fn get_empty_leaf_groups(&self) -> Result<Vec<Group>> {
        Ok(group::collect_empty_leaf_groups(&self.get_groups().await?))
    }

    /// Delete a group
    async fn delete_group(&self, id: &GroupId) -> Result<()>;

    /// Basic-auth credentials, when configured
    fn auth(&self) -> Option<(String, String)>;

    /// Orchestrator `host:port`
    fn location(&self) -> &str;

    /// Scheme used to reach the orchestrator
    fn protocol(&self) -> &str;

    /// Prefix stripped from application ids in metric names
    fn app_id_prefix(&self) -> &str;
}

/// Scale request body
#[derive(Debug, Serialize)]
struct ScaleData<'a> {
    instances: u32,
    labels: &'a HashMap<String, String>,
}

/// Deployment info returned from scale and delete requests
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentResponse {
    #[serde(default)]
    #[allow(dead_code)]
    version: String,

    #[serde(default)]
    deployment_id: String,
}

#[derive(Debug, Deserialize)]
struct LeaderResponse {
    leader: String,
}

/// HTTP implementation of the orchestrator capability
pub struct HttpOrchestrator {
    location: String,
    protocol: String,
    auth: Option<(String, String)>,
    app_id_prefix: String,
    client: reqwest::Client,
    metrics: Metrics,
}

impl HttpOrchestrator {
    pub fn new(config: &OrchestratorConfig, metrics: Metrics) -> Result<Self> {
        let auth = if config.username.is_empty() && config.password.is_empty() {
            None
        } else {
            Some((config.username.clone(), config.password.clone()))
        };

        let mut builder =
            reqwest::Client::builder().danger_accept_invalid_certs(!config.verify_ssl);
        // a timeout of zero means no timeout
        if config.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.timeout_secs));
        }
        let client = builder.build()?;

        Ok(Self {
            location: config.location.clone(),
            protocol: config.protocol.clone(),
            auth,
            app_id_prefix: config.app_id_prefix.clone(),
            client,
            metrics,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.protocol, self.location, path)
    }

    fn mark_failure(&self, method: &str, err: &AppcopError) {
        self.metrics.mark(&format!("orchestrator.{method}.error"));
        if let AppcopError::BadStatus { status, .. } = err {
            self.metrics
                .mark(&format!("orchestrator.{method}.error.{status}"));
        }
    }

    async fn get_bytes(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<u8>> {
        debug!(path, location = %self.location, "Sending GET request to orchestrator");

        let started = Instant::now();
        let result = self.get_with_retry(path, query).await;
        self.metrics.observe("orchestrator.get", started.elapsed());

        if let Err(err) = &result {
            self.mark_failure("get", err);
            warn!(path, error = %err, "Orchestrator GET failed");
        }
        result
    }

    async fn get_with_retry(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<u8>> {
        let url = self.url(path);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let mut request = self
                .client
                .get(&url)
                .query(query)
                .header(ACCEPT, "application/json");
            if let Some((user, pass)) = &self.auth {
                request = request.basic_auth(user, Some(pass.as_str()));
            }

            let failure = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::OK {
                        return Ok(response.bytes().await?.to_vec());
                    }
                    let err = AppcopError::BadStatus {
                        status: status.as_u16(),
                        path: path.to_string(),
                    };
                    // only server-side failures are worth another attempt
                    if !status.is_server_error() {
                        return Err(err);
                    }
                    err
                }
                Err(err) => AppcopError::Network(err),
            };

            if attempt >= GET_MAX_ATTEMPTS {
                return Err(failure);
            }
            let delay = backoff_delay(attempt);
            debug!(path, attempt, ?delay, "Retrying orchestrator GET");
            tokio::time::sleep(delay).await;
        }
    }

    async fn mutate(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let timer_name = format!("orchestrator.{}", method.as_str().to_lowercase());
        let metric_method = method.as_str().to_lowercase();
        debug!(path, method = %method, location = %self.location, "Sending request to orchestrator");

        let url = self.url(path);
        let mut request = self
            .client
            .request(method, &url)
            .query(query)
            .header(ACCEPT, "application/json");
        if let Some((user, pass)) = &self.auth {
            request = request.basic_auth(user, Some(pass.as_str()));
        }
        if let Some(bytes) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(bytes);
        }

        let started = Instant::now();
        let result = async {
            let response = request.send().await?;
            let status = response.status();
            if status != StatusCode::OK {
                return Err(AppcopError::BadStatus {
                    status: status.as_u16(),
                    path: path.to_string(),
                });
            }
            Ok(response.bytes().await?.to_vec())
        }
        .await;
        self.metrics.observe(&timer_name, started.elapsed());

        if let Err(err) = &result {
            self.mark_failure(&metric_method, err);
            warn!(path, error = %err, "Orchestrator request failed");
        }
        result
    }
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn get_app(&self, id: &AppId) -> Result<App> {
        debug!(app_id = %id, "Asking orchestrator for application");
        let body = self
            .get_bytes(
                &format!("/v2/apps/{}", id.trimmed()),
                &[("embed", "apps.tasks")],
            )
            .await?;
        app::parse_app(&body)
    }

    async fn get_apps(&self) -> Result<Vec<App>> {
        debug!("Asking orchestrator for list of applications");
        let body = self.get_bytes("/v2/apps/", &[]).await?;
        app::parse_apps(&body)
    }

    async fn get_tasks(&self, id: &AppId) -> Result<Vec<Task>> {
        debug!(app_id = %id, "Asking orchestrator for tasks");
        let body = self
            .get_bytes(&format!("/v2/apps/{}/tasks", id.trimmed()), &[])
            .await?;
        app::parse_tasks(&body)
    }

    async fn get_leader(&self) -> Result<String> {
        debug!(location = %self.location, "Asking orchestrator for leader");
        let body = self.get_bytes("/v2/leader", &[]).await?;
        let response: LeaderResponse = serde_json::from_slice(&body)?;
        Ok(response.leader)
    }

    async fn scale_down(&self, app: &App) -> Result<()> {
        debug!(app_id = %app.id, "Scaling down application because of score");

        let mut penalized = app.clone();
        penalized.penalize()?;
        info!(
            app_id = %app.id,
            label = penalized.labels.get(app::APPCOP_LABEL).map(String::as_str),
            "Altering labels"
        );

        let scale = ScaleData {
            instances: penalized.instances,
            labels: &penalized.labels,
        };
        let body = self
            .mutate(
                reqwest::Method::PUT,
                &format!("/v2/apps/{}", app.id.trimmed()),
                &[("force", "true")],
                Some(serde_json::to_vec(&scale)?),
            )
            .await?;

        let response: DeploymentResponse = serde_json::from_slice(&body)?;
        debug!(deployment = %response.deployment_id, "Scale down accepted");
        Ok(())
    }

    async fn delete_app(&self, id: &AppId) -> Result<()> {
        info!(app_id = %id, "Deleting application");
        let body = self
            .mutate(
                reqwest::Method::DELETE,
                &format!("/v2/apps/{}", id.trimmed()),
                &[],
                None,
            )
            .await?;
        let _: DeploymentResponse = serde_json::from_slice(&body)?;
        Ok(())
    }

    async fn get_groups(&self) -> Result<Vec<Group>> {
        debug!("Asking orchestrator for list of groups");
        let body = self.get_bytes("/v2/groups/", &[]).await?;
        group::parse_groups(&body)
    }

    async fn delete_group(&self, id: &GroupId) -> Result<()> {
        info!(group_id = %id, "Deleting group");
        let body = self
            .mutate(
                reqwest::Method::DELETE,
                &format!("/v2/groups/{}", id.trimmed()),
                &[],
                None,
            )
            .await?;
        let _: DeploymentResponse = serde_json::from_slice(&body)?;
        Ok(())
    }

    fn auth(&self) -> Option<(String, String)> {
        self.auth.clone()
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn app_id_prefix(&self) -> &str {
        &self.app_id_prefix
    }
}
