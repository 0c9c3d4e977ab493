//! Application and task models as the orchestrator serializes them

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppcopError, Result};

/// Label marking an application exempt from scale-down
pub const IMMUNITY_LABEL: &str = "APP_IMMUNITY";

/// Label written by appcop after a scale-down
pub const APPCOP_LABEL: &str = "appcop";

pub const TASK_FINISHED: &str = "TASK_FINISHED";
pub const TASK_FAILED: &str = "TASK_FAILED";
pub const TASK_KILLED: &str = "TASK_KILLED";
pub const TASK_RUNNING: &str = "TASK_RUNNING";

/// Application path id, usually of the form `/group/subgroup/name`.
/// Allowed characters: lowercase letters, digits, hyphens, slash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path with surrounding slashes removed, as interpolated into URLs.
    pub fn trimmed(&self) -> &str {
        self.0.trim_matches('/')
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(s: &str) -> Self {
        AppId(s.to_string())
    }
}

impl From<String> for AppId {
    fn from(s: String) -> Self {
        AppId(s)
    }
}

/// Task id, usually the owning app id with `/` replaced by `_`, a dot, and
/// a uuid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the owning application id: everything before the last `.`,
    /// with `_` mapped back to `/` and a leading `/` prepended.
    pub fn app_id(&self) -> AppId {
        let stem = match self.0.rfind('.') {
            Some(index) => &self.0[..index],
            None => self.0.as_str(),
        };
        AppId(format!("/{}", stem.replace('_', "/")))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

/// Scaling history the orchestrator reports per application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    #[serde(default)]
    pub last_scaling_at: String,

    #[serde(default)]
    pub last_config_change_at: String,
}

/// Application as returned by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub id: AppId,

    #[serde(default)]
    pub tasks: Vec<Task>,

    #[serde(default)]
    pub instances: u32,

    #[serde(default)]
    pub version_info: VersionInfo,
}

impl App {
    /// Whether misbehavior of this application is tolerated without
    /// consequence.
    pub fn has_immunity(&self) -> bool {
        self.labels
            .get(IMMUNITY_LABEL)
            .is_some_and(|value| value == "true")
    }

    /// Apply the scale-down penalty to this local copy: drop one instance
    /// and stamp the `appcop` label, `suspend` when nothing is left running.
    pub fn penalize(&mut self) -> Result<()> {
        if self.instances >= 1 {
            self.instances -= 1;
        } else {
            return Err(AppcopError::ZeroInstances);
        }

        let state = if self.instances == 0 {
            "suspend"
        } else {
            "scaleDown"
        };
        self.labels.insert(APPCOP_LABEL.to_string(), state.to_string());

        Ok(())
    }
}

/// Health check verdict attached to a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    #[serde(default)]
    pub alive: bool,
}

/// Task definition as it appears in orchestrator responses and, after the
/// `taskId` rewrite, in event bodies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default)]
    pub id: TaskId,

    #[serde(default)]
    pub task_status: String,

    #[serde(default)]
    pub app_id: AppId,

    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub ports: Vec<u16>,

    #[serde(default)]
    pub health_check_results: Vec<HealthCheckResult>,
}

impl Task {
    /// Per-application metric name: the app id with the configured prefix
    /// stripped and slashes mapped to dots, joined with the task status.
    /// Empty pieces are dropped.
    pub fn metric_name(&self, app_id_prefix: &str) -> String {
        let id = self.app_id.as_str();
        let stripped = id.strip_prefix(app_id_prefix).unwrap_or(id);
        let app_part = stripped.trim_matches('/').replace('/', ".");

        [app_part.as_str(), self.task_status.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(".")
    }
}

#[derive(Debug, Deserialize)]
struct AppWrapper {
    #[serde(default)]
    app: App,
}

#[derive(Debug, Deserialize)]
struct AppsResponse {
    #[serde(default)]
    apps: Vec<App>,
}

#[derive(Debug, Deserialize)]
struct TasksResponse {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Parse a single-app envelope, `{"app": {…}}`
pub fn parse_app(body: &[u8]) -> Result<App> {
    let wrapper: AppWrapper = serde_json::from_slice(body)?;
    Ok(wrapper.app)
}

/// Parse an app-list envelope, `{"apps": […]}`
pub fn parse_apps(body: &[u8]) -> Result<Vec<App>> {
    let response: AppsResponse = serde_json::from_slice(body)?;
    Ok(response.apps)
}

/// Parse a task-list envelope, `{"tasks": […]}`
pub fn parse_tasks(body: &[u8]) -> Result<Vec<Task>> {
    let response: TasksResponse = serde_json::from_slice(body)?;
    Ok(response.tasks)
}

/// Parse a bare task body as carried by stream events
pub fn parse_task(body: &[u8]) -> Result<Task> {
    Ok(serde_json::from_slice(body)?)
}
