//! Canned orchestrator used by tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{AppcopError, Result};
use crate::orchestrator::{App, AppId, Group, GroupId, Orchestrator, Task};

/// Stub implementation of the orchestrator capability. Failure toggles make
/// individual operations error; counters record what the control plane
/// attempted.
#[derive(Default)]
pub struct StubOrchestrator {
    pub apps: Vec<App>,
    pub groups: Vec<Group>,
    pub leader: String,
    pub location: String,
    pub app_id_prefix: String,

    /// When set, `get_apps` returns an error
    pub apps_get_fail: bool,
    /// When set, `delete_app` returns an error
    pub app_delete_fail: bool,
    /// When set, every second `delete_app` call returns an error
    pub app_delete_half_fail: bool,
    /// When set, `delete_group` returns an error
    pub group_delete_fail: bool,
    /// When set, `scale_down` returns an error
    pub scale_down_fail: bool,

    pub delete_calls: AtomicUsize,
    pub scale_calls: AtomicUsize,
    pub scaled: Mutex<Vec<App>>,
    pub deleted_apps: Mutex<Vec<AppId>>,
    pub deleted_groups: Mutex<Vec<GroupId>>,
}

impl StubOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_apps(apps: Vec<App>) -> Self {
        Self {
            apps,
            ..Self::default()
        }
    }

    pub fn with_groups(groups: Vec<Group>) -> Self {
        Self {
            groups,
            ..Self::default()
        }
    }

    /// Number of accepted scale-down requests
    pub fn scale_count(&self) -> usize {
        self.scale_calls.load(Ordering::SeqCst)
    }

    /// Penalized application states received by accepted scale-downs
    pub fn scaled(&self) -> Vec<App> {
        self.scaled.lock().unwrap().clone()
    }

    /// Ids of successfully deleted applications
    pub fn deleted_apps(&self) -> Vec<AppId> {
        self.deleted_apps.lock().unwrap().clone()
    }

    /// Ids of successfully deleted groups
    pub fn deleted_groups(&self) -> Vec<GroupId> {
        self.deleted_groups.lock().unwrap().clone()
    }

    fn bad_status(path: &str) -> AppcopError {
        AppcopError::BadStatus {
            status: 500,
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl Orchestrator for StubOrchestrator {
    async fn get_app(&self, id: &AppId) -> Result<App> {
        Ok(self
            .apps
            .iter()
            .find(|app| &app.id == id)
            .cloned()
            .unwrap_or_else(|| App {
                id: id.clone(),
                ..App::default()
            }))
    }

    async fn get_apps(&self) -> Result<Vec<App>> {
        if self.apps_get_fail {
            return Err(Self::bad_status("/v2/apps/"));
        }
        Ok(self.apps.clone())
    }

    async fn get_tasks(&self, id: &AppId) -> Result<Vec<Task>> {
        Ok(vec![Task {
            app_id: id.clone(),
            ..Task::default()
        }])
    }

    async fn get_leader(&self) -> Result<String> {
        Ok(self.leader.clone())
    }

    async fn scale_down(&self, app: &App) -> Result<()> {
        if self.scale_down_fail {
            return Err(Self::bad_status("/v2/apps/"));
        }
        let mut penalized = app.clone();
        penalized.penalize()?;
        self.scale_calls.fetch_add(1, Ordering::SeqCst);
        self.scaled.lock().unwrap().push(penalized);
        Ok(())
    }

    async fn delete_app(&self, id: &AppId) -> Result<()> {
        if self.app_delete_fail {
            return Err(Self::bad_status("/v2/apps/"));
        }
        let call = self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.app_delete_half_fail && call % 2 == 1 {
            return Err(Self::bad_status("/v2/apps/"));
        }
        self.deleted_apps.lock().unwrap().push(id.clone());
        Ok(())
    }

    async fn get_groups(&self) -> Result<Vec<Group>> {
        Ok(self.groups.clone())
    }

    async fn delete_group(&self, id: &GroupId) -> Result<()> {
        if self.group_delete_fail {
            return Err(Self::bad_status("/v2/groups/"));
        }
        self.deleted_groups.lock().unwrap().push(id.clone());
        Ok(())
    }

    fn auth(&self) -> Option<(String, String)> {
        None
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn protocol(&self) -> &str {
        "http"
    }

    fn app_id_prefix(&self) -> &str {
        &self.app_id_prefix
    }
}
