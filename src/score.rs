//! Scoring engine
//!
//! Keeps the per-application misbehavior scores and acts on them. The map
//! is owned by a single task running one `select!` over the update channel
//! and the print/evaluate/reset tickers, so no lock is ever taken and a
//! score subtraction is always atomic with the scale-down that earned it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tracing::{debug, info, warn};

use crate::config::ScoreConfig;
use crate::error::{AppcopError, Result};
use crate::metrics::Metrics;
use crate::orchestrator::{App, AppId, Orchestrator};

/// Scale-down attempts (successful or failed) allowed per evaluate tick.
// TODO: make the per-tick limiter honor the scale_limit config once it
// becomes shared state across evaluations.
const EVALUATE_ATTEMPT_LIMIT: usize = 2;

/// Message carried on the score-update channel
#[derive(Debug, Clone)]
pub struct ScoreUpdate {
    pub app: App,
    pub delta: i64,
}

/// Per-application score record
#[derive(Debug, Clone)]
struct Score {
    score: i64,
    last_update: Instant,
}

/// Records the behavior of all observed applications and scales down the
/// ones whose score crosses the threshold.
pub struct Scorer {
    dry_run: bool,
    scale_down_score: i64,
    update_interval: Duration,
    reset_interval: Duration,
    evaluate_interval: Duration,
    #[allow(dead_code)]
    scale_limit: usize,
    orchestrator: Arc<dyn Orchestrator>,
    metrics: Metrics,
    scores: HashMap<AppId, Score>,
}

impl Scorer {
    pub fn new(
        config: &ScoreConfig,
        orchestrator: Arc<dyn Orchestrator>,
        metrics: Metrics,
    ) -> Result<Self> {
        if config.reset_interval_secs <= config.update_interval_secs {
            return Err(AppcopError::Config(
                "update interval must be lower than reset interval".into(),
            ));
        }
        if config.reset_interval_secs <= config.evaluate_interval_secs {
            return Err(AppcopError::Config(
                "evaluate interval must be lower than reset interval".into(),
            ));
        }

        Ok(Self {
            dry_run: config.dry_run,
            scale_down_score: config.scale_down_score,
            update_interval: Duration::from_secs(config.update_interval_secs),
            reset_interval: Duration::from_secs(config.reset_interval_secs),
            evaluate_interval: Duration::from_secs(config.evaluate_interval_secs),
            scale_limit: config.scale_limit,
            orchestrator,
            metrics,
            scores: HashMap::new(),
        })
    }

    /// Start the score manager task. The returned sender is the only way
    /// in; dropping every clone of it stops the task.
    pub fn spawn(mut self) -> (mpsc::Sender<ScoreUpdate>, JoinHandle<()>) {
        // workers block on the send until the manager picks the update up
        let (update_tx, mut update_rx) = mpsc::channel::<ScoreUpdate>(1);

        info!("Starting score manager");
        if self.dry_run {
            info!("Dry run, no orchestrator mutations will be made");
        }

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let mut print_ticker =
                interval_at(start + self.update_interval, self.update_interval);
            let mut evaluate_ticker =
                interval_at(start + self.evaluate_interval, self.evaluate_interval);
            let mut reset_ticker =
                interval_at(start + self.reset_interval, self.reset_interval);

            loop {
                tokio::select! {
                    update = update_rx.recv() => match update {
                        Some(update) => {
                            self.metrics
                                .update_gauge("score.update_queue", update_rx.len() as i64);
                            self.apply_update(update);
                        }
                        None => {
                            debug!("Update channel closed, stopping score manager");
                            break;
                        }
                    },
                    _ = evaluate_ticker.tick() => {
                        self.metrics.mark("score.evaluates");
                        self.evaluate().await;
                    }
                    _ = print_ticker.tick() => self.print_scores(),
                    _ = reset_ticker.tick() => {
                        self.metrics.mark("score.resets");
                        self.reset_scores();
                    }
                }
            }
        });

        (update_tx, handle)
    }

    fn apply_update(&mut self, update: ScoreUpdate) {
        debug!(app_id = %update.app.id, delta = update.delta, "Score update");

        let now = Instant::now();
        self.scores
            .entry(update.app.id)
            .and_modify(|score| {
                score.score += update.delta;
                score.last_update = now;
            })
            .or_insert(Score {
                score: update.delta,
                last_update: now,
            });
    }

    /// Forget one application; the next violation starts from zero.
    fn reset_score(&mut self, id: &AppId) {
        self.scores.remove(id);
    }

    /// Noop when the application has no score.
    fn subtract_score(&mut self, id: &AppId) {
        if let Some(score) = self.scores.get_mut(id) {
            score.score -= self.scale_down_score;
        }
    }

    fn reset_scores(&mut self) {
        debug!(recorded = self.scores.len(), "Resetting scores");
        self.scores = HashMap::new();
    }

    /// Scale down applications whose score exceeds the threshold. Returns
    /// the number of applications actually pacified.
    async fn evaluate(&mut self) -> usize {
        let candidates: Vec<AppId> = self
            .scores
            .iter()
            .filter(|(_, score)| score.score > self.scale_down_score)
            .map(|(id, _)| id.clone())
            .collect();

        let mut attempts = 0;
        let mut pacified = 0;

        for id in candidates {
            if attempts >= EVALUATE_ATTEMPT_LIMIT {
                break;
            }
            attempts += 1;

            match self.scale_down(&id).await {
                Ok(()) => {
                    self.metrics.mark("score.scale_success");
                    self.subtract_score(&id);
                    pacified += 1;
                }
                Err(err) => {
                    warn!(app_id = %id, error = %err, "Scale down failed");
                    self.metrics.mark("score.scale_fail");
                    self.reset_score(&id);
                }
            }
        }

        debug!(pacified, "Apps qualified for penalty");
        pacified
    }

    async fn scale_down(&self, id: &AppId) -> Result<()> {
        let score = self.scores.get(id).map(|score| score.score).unwrap_or(0);
        info!(app_id = %id, score, "Scaling down application");

        let app = self.orchestrator.get_app(id).await?;

        if self.dry_run {
            info!(app_id = %id, score, "Dry run, skipping scale down");
            return Ok(());
        }

        if app.has_immunity() {
            // surfacing an error keeps the attempt limiter moving, so
            // immune apps cannot pin the evaluate loop
            return Err(AppcopError::Immune(id.clone()));
        }

        self.orchestrator.scale_down(&app).await
    }

    fn print_scores(&self) {
        for (id, score) in &self.scores {
            debug!(
                app_id = %id,
                score = score.score,
                idle_secs = score.last_update.elapsed().as_secs(),
                "Current scores"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::stub::StubOrchestrator;
    use std::collections::HashMap as Map;

    fn test_config(scale_down_score: i64, dry_run: bool) -> ScoreConfig {
        ScoreConfig {
            dry_run,
            scale_down_score,
            scale_limit: 1,
            update_interval_secs: 1,
            reset_interval_secs: 3,
            evaluate_interval_secs: 2,
        }
    }

    fn scalable_app(id: &str, instances: u32) -> App {
        App {
            id: AppId::from(id),
            instances,
            ..App::default()
        }
    }

    fn scorer_with(
        stub: Arc<StubOrchestrator>,
        scale_down_score: i64,
        dry_run: bool,
    ) -> Scorer {
        Scorer::new(&test_config(scale_down_score, dry_run), stub, Metrics::disabled()).unwrap()
    }

    fn seed(scorer: &mut Scorer, scores: &[(&str, i64)]) {
        for (id, value) in scores {
            scorer.scores.insert(
                AppId::from(*id),
                Score {
                    score: *value,
                    last_update: Instant::now(),
                },
            );
        }
    }

    fn score_of(scorer: &Scorer, id: &str) -> Option<i64> {
        scorer.scores.get(&AppId::from(id)).map(|score| score.score)
    }

    #[test]
    fn equal_intervals_are_rejected() {
        let mut config = test_config(1, false);
        config.update_interval_secs = 1;
        config.reset_interval_secs = 1;
        config.evaluate_interval_secs = 1;

        let result = Scorer::new(
            &config,
            Arc::new(StubOrchestrator::new()),
            Metrics::disabled(),
        );
        assert!(matches!(result, Err(AppcopError::Config(_))));
    }

    #[test]
    fn evaluate_longer_than_reset_is_rejected() {
        let mut config = test_config(1, false);
        config.evaluate_interval_secs = 10;

        let result = Scorer::new(
            &config,
            Arc::new(StubOrchestrator::new()),
            Metrics::disabled(),
        );
        assert!(matches!(result, Err(AppcopError::Config(_))));
    }

    #[test]
    fn updates_accumulate_per_app() {
        let cases: &[(&[(&str, i64)], &[(&str, i64)])] = &[
            (&[("appid", 1)], &[("appid", 1)]),
            (
                &[("appid", 1), ("appid", 1), ("appid", 1), ("appid", 1)],
                &[("appid", 4)],
            ),
            (
                &[("appid0", 1), ("appid0", 1), ("appid1", 1), ("appid1", 1)],
                &[("appid0", 2), ("appid1", 2)],
            ),
            (
                &[("appid0", -1), ("appid0", 1), ("appid1", -1), ("appid1", -1)],
                &[("appid0", 0), ("appid1", -2)],
            ),
            (
                &[("appid0", -1), ("appid1", 1), ("appid2", -1), ("appid3", -1)],
                &[("appid0", -1), ("appid1", 1), ("appid2", -1), ("appid3", -1)],
            ),
        ];

        for (updates, expected) in cases {
            let mut scorer = scorer_with(Arc::new(StubOrchestrator::new()), 1, false);
            for (id, delta) in *updates {
                scorer.apply_update(ScoreUpdate {
                    app: scalable_app(id, 1),
                    delta: *delta,
                });
            }
            for (id, value) in *expected {
                assert_eq!(score_of(&scorer, id), Some(*value), "app {id}");
            }
        }
    }

    #[test]
    fn reset_score_removes_only_the_target() {
        let mut scorer = scorer_with(Arc::new(StubOrchestrator::new()), 1, false);
        seed(&mut scorer, &[("testapp0", 1), ("testapp1", 2)]);

        scorer.reset_score(&AppId::from("testapp0"));

        assert_eq!(score_of(&scorer, "testapp0"), None);
        assert_eq!(score_of(&scorer, "testapp1"), Some(2));
    }

    #[test]
    fn subtract_applies_threshold_and_skips_unknown_apps() {
        let cases: &[(&[(&str, i64)], &[&str], Map<&str, i64>)] = &[
            (&[], &["missing"], Map::new()),
            (
                &[("id1", 1), ("id2", 2)],
                &["id1", "id2"],
                Map::from([("id1", 0), ("id2", 1)]),
            ),
            (
                &[("id1", 20), ("id2", 30)],
                &["id1", "id2"],
                Map::from([("id1", 19), ("id2", 29)]),
            ),
            (
                &[("id1", -1), ("id2", -2)],
                &["id1", "id2"],
                Map::from([("id1", -2), ("id2", -3)]),
            ),
        ];

        for (initial, subtract_from, expected) in cases {
            let mut scorer = scorer_with(Arc::new(StubOrchestrator::new()), 1, false);
            seed(&mut scorer, initial);
            for id in *subtract_from {
                scorer.subtract_score(&AppId::from(*id));
            }
            for (id, value) in expected {
                assert_eq!(score_of(&scorer, id), Some(*value), "app {id}");
            }
        }
    }

    #[test]
    fn reset_is_idempotent() {
        let mut scorer = scorer_with(Arc::new(StubOrchestrator::new()), 1, false);
        seed(&mut scorer, &[("a", 5), ("b", -2)]);

        scorer.reset_scores();
        assert!(scorer.scores.is_empty());
        scorer.reset_scores();
        assert!(scorer.scores.is_empty());
    }

    #[tokio::test]
    async fn evaluate_pacifies_only_apps_above_threshold() {
        let cases: &[(&[(&str, i64)], usize)] = &[
            (&[("id1", 1), ("id2", 2)], 0),
            (&[("id1", 21), ("id2", 3)], 1),
            (&[("id1", 21), ("id2", 3), ("id3", -1)], 1),
            (&[("id1", 1230), ("id2", 3), ("id3", -1)], 1),
        ];

        for (initial, expected) in cases {
            let apps = initial
                .iter()
                .map(|(id, _)| scalable_app(id, 2))
                .collect::<Vec<_>>();
            let stub = Arc::new(StubOrchestrator::with_apps(apps));
            let mut scorer = scorer_with(stub.clone(), 20, false);
            seed(&mut scorer, initial);

            let pacified = scorer.evaluate().await;
            assert_eq!(pacified, *expected);
            assert_eq!(stub.scale_count(), *expected);
        }
    }

    #[tokio::test]
    async fn dry_run_counts_but_never_scales() {
        let stub = Arc::new(StubOrchestrator::with_apps(vec![scalable_app("id1", 2)]));
        let mut scorer = scorer_with(stub.clone(), 20, true);
        seed(&mut scorer, &[("id1", 21), ("id2", 3)]);

        let pacified = scorer.evaluate().await;

        assert_eq!(pacified, 1);
        assert_eq!(stub.scale_count(), 0);
        // the dry run still subtracts, so the app can re-trigger later
        assert_eq!(score_of(&scorer, "id1"), Some(1));
    }

    #[tokio::test]
    async fn immune_apps_are_skipped_and_forgotten() {
        let mut immune = scalable_app("/a", 3);
        immune
            .labels
            .insert(crate::orchestrator::app::IMMUNITY_LABEL.to_string(), "true".to_string());
        let stub = Arc::new(StubOrchestrator::with_apps(vec![immune]));
        let mut scorer = scorer_with(stub.clone(), 20, false);
        seed(&mut scorer, &[("/a", 21)]);

        let pacified = scorer.evaluate().await;

        assert_eq!(pacified, 0);
        assert_eq!(stub.scale_count(), 0);
        // score entry dropped so the immune app does not pin the limiter
        assert_eq!(score_of(&scorer, "/a"), None);
    }

    #[tokio::test]
    async fn evaluate_attempts_are_capped() {
        let ids = ["/a", "/b", "/c", "/d", "/e"];
        let apps = ids.iter().map(|id| scalable_app(id, 5)).collect();
        let stub = Arc::new(StubOrchestrator::with_apps(apps));
        let mut scorer = scorer_with(stub.clone(), 20, false);
        seed(&mut scorer, &ids.map(|id| (id, 100)));

        let pacified = scorer.evaluate().await;

        assert_eq!(pacified, EVALUATE_ATTEMPT_LIMIT);
        assert_eq!(stub.scale_count(), EVALUATE_ATTEMPT_LIMIT);
    }

    #[tokio::test]
    async fn failed_attempts_count_against_the_cap() {
        let mut immune = scalable_app("/immune", 3);
        immune
            .labels
            .insert(crate::orchestrator::app::IMMUNITY_LABEL.to_string(), "true".to_string());
        let mut apps = vec![immune];
        apps.extend(["/b", "/c", "/d"].iter().map(|id| scalable_app(id, 5)));
        let stub = Arc::new(StubOrchestrator::with_apps(apps));
        let mut scorer = scorer_with(stub.clone(), 20, false);
        seed(
            &mut scorer,
            &[("/immune", 500), ("/b", 100), ("/c", 100), ("/d", 100)],
        );

        let pacified = scorer.evaluate().await;

        // every attempt, failed or not, consumes the budget
        assert!(pacified < EVALUATE_ATTEMPT_LIMIT + 1);
        assert!(stub.scale_count() <= EVALUATE_ATTEMPT_LIMIT);
    }

    #[tokio::test]
    async fn success_subtracts_threshold_and_keeps_the_entry() {
        let stub = Arc::new(StubOrchestrator::with_apps(vec![scalable_app("/a", 2)]));
        let mut scorer = scorer_with(stub.clone(), 20, false);
        seed(&mut scorer, &[("/a", 50)]);

        scorer.evaluate().await;

        assert_eq!(score_of(&scorer, "/a"), Some(30));
        let scaled = stub.scaled();
        assert_eq!(scaled.len(), 1);
        assert_eq!(scaled[0].instances, 1);
        assert_eq!(
            scaled[0].labels.get(crate::orchestrator::app::APPCOP_LABEL).map(String::as_str),
            Some("scaleDown")
        );
    }

    #[tokio::test]
    async fn failure_drops_the_entry() {
        let stub = Arc::new(StubOrchestrator {
            apps: vec![scalable_app("/a", 2)],
            scale_down_fail: true,
            ..StubOrchestrator::default()
        });
        let mut scorer = scorer_with(stub.clone(), 20, false);
        seed(&mut scorer, &[("/a", 50)]);

        let pacified = scorer.evaluate().await;

        assert_eq!(pacified, 0);
        assert_eq!(score_of(&scorer, "/a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_task_applies_updates_and_evaluates_on_tick() {
        let stub = Arc::new(StubOrchestrator::with_apps(vec![scalable_app("/a", 2)]));
        let scorer = scorer_with(stub.clone(), 1, false);
        let (update_tx, handle) = scorer.spawn();

        update_tx
            .send(ScoreUpdate {
                app: scalable_app("/a", 2),
                delta: 5,
            })
            .await
            .unwrap();

        // past the evaluate interval of the test config
        tokio::time::sleep(Duration::from_millis(2100)).await;

        drop(update_tx);
        handle.await.unwrap();

        assert_eq!(stub.scale_count(), 1);
    }
}
