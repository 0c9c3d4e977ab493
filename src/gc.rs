//! Garbage collection of long-suspended applications and empty groups

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::time::interval_at;
use tracing::{debug, error, info, warn};

use crate::config::GcConfig;
use crate::error::{AppcopError, Result};
use crate::metrics::Metrics;
use crate::orchestrator::{app::APPCOP_LABEL, App, Orchestrator};

/// The orchestrator's timestamp format: ISO-8601 with exactly three
/// millisecond digits and a mandatory trailing `Z`.
const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Parse an orchestrator timestamp. Anything not matching the pinned
/// format is rejected, which for collection decisions means "keep".
pub fn parse_orchestrator_date(value: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value, DATE_FORMAT)
        .map_err(|_| AppcopError::BadDate(value.to_string()))?;
    Ok(naive.and_utc())
}

fn elapsed_since(timestamp: DateTime<Utc>) -> Duration {
    (Utc::now() - timestamp).to_std().unwrap_or(Duration::ZERO)
}

/// Periodically reconciles the orchestrator inventory against the
/// configured age thresholds.
pub struct GarbageCollector {
    enabled: bool,
    max_suspend_time: Duration,
    interval: Duration,
    appcop_only: bool,
    orchestrator: Arc<dyn Orchestrator>,
    metrics: Metrics,
    apps: Vec<App>,
    last_refresh: Option<Instant>,
}

impl GarbageCollector {
    pub fn new(config: &GcConfig, orchestrator: Arc<dyn Orchestrator>, metrics: Metrics) -> Self {
        Self {
            enabled: config.enabled,
            max_suspend_time: Duration::from_secs(config.max_suspend_time_secs),
            interval: Duration::from_secs(config.interval_secs),
            appcop_only: config.appcop_only,
            orchestrator,
            metrics,
            apps: Vec::new(),
            last_refresh: None,
        }
    }

    /// Run the collection loop. Returns immediately when disabled.
    pub async fn run(mut self) {
        if !self.enabled {
            info!("Garbage collection disabled");
            return;
        }
        info!(interval_secs = self.interval.as_secs(), "Garbage collection job started");

        let start = tokio::time::Instant::now();
        let mut ticker = interval_at(start + self.interval, self.interval);
        loop {
            ticker.tick().await;
            self.cycle().await;
        }
    }

    async fn cycle(&mut self) {
        let started = Instant::now();
        let refreshed = self.refresh().await;
        self.metrics.observe("gc.refresh", started.elapsed());

        if let Err(err) = refreshed {
            self.metrics.mark("gc.refresh.error");
            error!(error = %err, "App registry refresh failed, skipping GC cycle");
            return;
        }

        self.collect_suspended().await;
        self.collect_empty_groups().await;
    }

    async fn refresh(&mut self) -> Result<()> {
        debug!(
            last_refresh_secs = self.last_refresh.map(|at| at.elapsed().as_secs()),
            "Refreshing local app registry"
        );
        self.apps = self.orchestrator.get_apps().await?;
        self.last_refresh = Some(Instant::now());
        Ok(())
    }

    /// Suspended longer than the threshold means collectable. Unparseable
    /// scaling timestamps mean the app is kept.
    fn should_collect(&self, app: &App) -> bool {
        if app.instances > 0 {
            return false;
        }
        match parse_orchestrator_date(&app.version_info.last_scaling_at) {
            Ok(scaled_at) => elapsed_since(scaled_at) > self.max_suspend_time,
            Err(err) => {
                warn!(app_id = %app.id, error = %err, "Unable to parse scaling date");
                false
            }
        }
    }

    fn old_suspended(&self) -> Vec<App> {
        self.apps
            .iter()
            .filter(|app| self.should_collect(app))
            .filter(|app| !self.appcop_only || app.labels.contains_key(APPCOP_LABEL))
            .cloned()
            .collect()
    }

    async fn collect_suspended(&mut self) {
        info!("Starting GC on suspended apps");
        let apps = self.old_suspended();
        if apps.is_empty() {
            info!("No suspended apps to gc");
            return;
        }

        let started = Instant::now();
        let deleted = self.delete_suspended(&apps).await;
        self.metrics.observe("gc.delete.suspended", started.elapsed());
        self.metrics
            .update_gauge("gc.delete.suspended.count", deleted as i64);
        if deleted == 0 {
            info!("Nothing collected for long suspend");
        }
    }

    /// Returns the number of successfully deleted applications.
    async fn delete_suspended(&self, apps: &[App]) -> usize {
        let mut deleted = 0;
        for app in apps {
            match self.orchestrator.delete_app(&app.id).await {
                Ok(()) => deleted += 1,
                Err(err) => {
                    self.metrics.mark("gc.delete.suspended.error");
                    error!(app_id = %app.id, error = %err, "Error while deleting suspended app");
                }
            }
        }
        deleted
    }

    async fn collect_empty_groups(&mut self) {
        info!("Starting GC on empty groups");
        let groups = match self.orchestrator.get_empty_leaf_groups().await {
            Ok(groups) => groups,
            Err(err) => {
                error!(error = %err, "Ending empty group GC");
                return;
            }
        };

        for group in groups {
            let changed_at = match parse_orchestrator_date(&group.version) {
                Ok(changed_at) => changed_at,
                Err(err) => {
                    error!(group_id = %group.id, error = %err, "Unable to parse group version");
                    continue;
                }
            };
            if elapsed_since(changed_at) <= self.max_suspend_time {
                continue;
            }

            info!(group_id = %group.id, "Deleting empty group");
            let started = Instant::now();
            let result = self.orchestrator.delete_group(&group.id).await;
            self.metrics.observe("gc.groups.delete", started.elapsed());
            if let Err(err) = result {
                self.metrics.mark("gc.groups.delete.error");
                error!(group_id = %group.id, error = %err, "Error while deleting group");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::stub::StubOrchestrator;
    use crate::orchestrator::{AppId, Group, GroupId, VersionInfo};

    const OLD_DATE: &str = "2000-01-01T00:00:00.000Z";

    fn test_config(appcop_only: bool) -> GcConfig {
        GcConfig {
            enabled: true,
            max_suspend_time_secs: 3600,
            interval_secs: 60,
            appcop_only,
        }
    }

    fn suspended_app(id: &str, scaled_at: &str, appcopped: bool) -> App {
        let mut app = App {
            id: AppId::from(id),
            instances: 0,
            version_info: VersionInfo {
                last_scaling_at: scaled_at.to_string(),
                last_config_change_at: scaled_at.to_string(),
            },
            ..App::default()
        };
        if appcopped {
            app.labels
                .insert(APPCOP_LABEL.to_string(), "suspend".to_string());
        }
        app
    }

    fn collector(stub: Arc<StubOrchestrator>, appcop_only: bool) -> GarbageCollector {
        GarbageCollector::new(&test_config(appcop_only), stub, Metrics::disabled())
    }

    #[test]
    fn pinned_date_format_parses() {
        let parsed = parse_orchestrator_date("2017-01-24T15:37:58.780Z").unwrap();
        assert_eq!(parsed.timestamp(), 1_485_272_278);
    }

    #[test]
    fn other_date_shapes_are_rejected() {
        for bad in [
            "",
            "2017-01-24T15:37:58Z",
            "2017-01-24T15:37:58.78Z",
            "2017-01-24T15:37:58.7801Z",
            "2017-01-24T15:37:58.780",
            "2017-01-24 15:37:58.780Z",
            "not a date",
        ] {
            assert!(parse_orchestrator_date(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn running_apps_are_never_collected() {
        let gc = collector(Arc::new(StubOrchestrator::new()), false);
        let mut app = suspended_app("/app", OLD_DATE, false);
        app.instances = 1;
        assert!(!gc.should_collect(&app));
    }

    #[test]
    fn old_suspended_apps_are_collected() {
        let gc = collector(Arc::new(StubOrchestrator::new()), false);
        assert!(gc.should_collect(&suspended_app("/app", OLD_DATE, false)));
    }

    #[test]
    fn unparseable_dates_mean_keep() {
        let gc = collector(Arc::new(StubOrchestrator::new()), false);
        assert!(!gc.should_collect(&suspended_app("/app", "garbage", false)));
    }

    #[test]
    fn recent_suspends_are_kept() {
        let gc = collector(Arc::new(StubOrchestrator::new()), false);
        let recent = Utc::now().format(DATE_FORMAT).to_string();
        assert!(!gc.should_collect(&suspended_app("/app", &recent, false)));
    }

    #[tokio::test]
    async fn selection_honors_appcop_only() {
        let apps = vec![
            suspended_app("/copped", OLD_DATE, true),
            suspended_app("/other", OLD_DATE, false),
        ];

        let mut gc = collector(Arc::new(StubOrchestrator::with_apps(apps.clone())), true);
        gc.refresh().await.unwrap();
        let selected = gc.old_suspended();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, AppId::from("/copped"));

        let mut gc = collector(Arc::new(StubOrchestrator::with_apps(apps)), false);
        gc.refresh().await.unwrap();
        assert_eq!(gc.old_suspended().len(), 2);
    }

    #[tokio::test]
    async fn refresh_failure_skips_the_cycle() {
        let stub = Arc::new(StubOrchestrator {
            apps: vec![suspended_app("/old", OLD_DATE, true)],
            apps_get_fail: true,
            ..StubOrchestrator::default()
        });
        let mut gc = collector(stub.clone(), true);

        gc.cycle().await;

        assert!(stub.deleted_apps().is_empty());
        assert!(stub.deleted_groups().is_empty());
    }

    #[tokio::test]
    async fn old_appcopped_suspended_app_is_deleted() {
        let stub = Arc::new(StubOrchestrator::with_apps(vec![suspended_app(
            "/old", OLD_DATE, true,
        )]));
        let mut gc = collector(stub.clone(), true);

        gc.cycle().await;

        assert_eq!(stub.deleted_apps(), vec![AppId::from("/old")]);
    }

    #[tokio::test]
    async fn half_failing_deletes_still_remove_the_rest() {
        let stub = Arc::new(StubOrchestrator {
            apps: vec![
                suspended_app("/one", OLD_DATE, true),
                suspended_app("/two", OLD_DATE, true),
            ],
            app_delete_half_fail: true,
            ..StubOrchestrator::default()
        });
        let mut gc = collector(stub.clone(), true);

        gc.cycle().await;

        assert_eq!(stub.deleted_apps().len(), 1);
    }

    #[tokio::test]
    async fn old_empty_leaf_group_is_deleted() {
        let stub = Arc::new(StubOrchestrator::with_groups(vec![Group {
            id: GroupId::from("/empty"),
            version: OLD_DATE.to_string(),
            ..Group::default()
        }]));
        let mut gc = collector(stub.clone(), true);

        gc.cycle().await;

        assert_eq!(stub.deleted_groups(), vec![GroupId::from("/empty")]);
    }

    #[tokio::test]
    async fn recent_or_unparseable_groups_survive() {
        let recent = Utc::now().format(DATE_FORMAT).to_string();
        let stub = Arc::new(StubOrchestrator::with_groups(vec![
            Group {
                id: GroupId::from("/recent"),
                version: recent,
                ..Group::default()
            },
            Group {
                id: GroupId::from("/undated"),
                version: "not a date".to_string(),
                ..Group::default()
            },
        ]));
        let mut gc = collector(stub.clone(), true);

        gc.cycle().await;

        assert!(stub.deleted_groups().is_empty());
    }

    #[tokio::test]
    async fn populated_groups_are_not_offered_for_deletion() {
        // a leaf with apps is not empty, so the walker never returns it
        let stub = Arc::new(StubOrchestrator::with_groups(vec![Group {
            id: GroupId::from("/busy"),
            version: OLD_DATE.to_string(),
            apps: vec![App::default()],
            ..Group::default()
        }]));
        let mut gc = collector(stub.clone(), true);

        gc.cycle().await;

        assert!(stub.deleted_groups().is_empty());
    }

    #[tokio::test]
    async fn disabled_collector_returns_immediately() {
        let mut config = test_config(true);
        config.enabled = false;
        let gc = GarbageCollector::new(
            &config,
            Arc::new(StubOrchestrator::new()),
            Metrics::disabled(),
        );
        gc.run().await;
    }
}
