//! Metrics sink for appcop
//!
//! A cloneable handle over a concurrent registry of counters, gauges and
//! timers. The handle is passed down from construction; a disabled target
//! turns every operation into a no-op. The `stdout` target periodically
//! dumps the registry through the logger.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::MetricsConfig;
use crate::error::{AppcopError, Result};

const METRIC_SEPARATOR: &str = ".";

#[derive(Default)]
struct TimerStats {
    count: AtomicU64,
    total_nanos: AtomicU64,
}

struct MetricsInner {
    instance: String,
    system_sub_prefix: String,
    app_sub_prefix: String,
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    timers: DashMap<String, TimerStats>,
}

/// Cloneable metrics handle
#[derive(Clone)]
pub struct Metrics {
    inner: Option<Arc<MetricsInner>>,
    /// Reporting prefix, resolved from config or `<hostname>.<exe>`
    prefix: String,
    interval: Duration,
}

impl Metrics {
    /// Build a handle from config. Empty target disables the sink entirely.
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let prefix = if config.prefix == "default" {
            default_prefix()
        } else {
            config.prefix.clone()
        };

        let instance = if config.instance.is_empty() {
            local_hostname()
        } else {
            config.instance.clone()
        };

        let inner = match config.target.as_str() {
            "" => {
                info!("Metrics disabled");
                None
            }
            "stdout" => {
                info!("Sending metrics to stdout as {prefix:?}");
                Some(Arc::new(MetricsInner {
                    instance,
                    system_sub_prefix: config.system_sub_prefix.clone(),
                    app_sub_prefix: config.app_sub_prefix.clone(),
                    counters: DashMap::new(),
                    gauges: DashMap::new(),
                    timers: DashMap::new(),
                }))
            }
            other => {
                return Err(AppcopError::Config(format!(
                    "unsupported metrics target {other:?}"
                )))
            }
        };

        Ok(Self {
            inner,
            prefix,
            interval: Duration::from_secs(config.interval_secs),
        })
    }

    /// A disabled sink for tests and dry wiring
    pub fn disabled() -> Self {
        Self {
            inner: None,
            prefix: String::new(),
            interval: Duration::from_secs(30),
        }
    }

    /// Increment a system counter
    pub fn mark(&self, name: &str) {
        if let Some(inner) = &self.inner {
            let key = inner.system_metric(name);
            inner
                .counters
                .entry(key)
                .or_default()
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increment a per-application counter
    pub fn mark_app(&self, name: &str) {
        if name.is_empty() {
            return;
        }
        if let Some(inner) = &self.inner {
            let key = inner.app_metric(name);
            inner
                .counters
                .entry(key)
                .or_default()
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Set a system gauge
    pub fn update_gauge(&self, name: &str, value: i64) {
        if let Some(inner) = &self.inner {
            let key = inner.system_metric(name);
            inner
                .gauges
                .entry(key)
                .or_default()
                .store(value, Ordering::Relaxed);
        }
    }

    /// Record one observation of a timed operation
    pub fn observe(&self, name: &str, elapsed: Duration) {
        if let Some(inner) = &self.inner {
            let key = inner.system_metric(name);
            let stats = inner.timers.entry(key).or_default();
            stats.count.fetch_add(1, Ordering::Relaxed);
            stats
                .total_nanos
                .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        }
    }

    /// Current value of a system counter, mainly for tests and the reporter
    pub fn counter(&self, name: &str) -> u64 {
        match &self.inner {
            Some(inner) => inner
                .counters
                .get(&inner.system_metric(name))
                .map(|counter| counter.load(Ordering::Relaxed))
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Spawn the periodic reporter when a target is configured
    pub fn spawn_reporter(&self) {
        let Some(inner) = self.inner.clone() else {
            return;
        };
        let prefix = self.prefix.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                report(&prefix, &inner);
            }
        });
    }
}

fn report(prefix: &str, inner: &MetricsInner) {
    for entry in inner.counters.iter() {
        debug!(
            metric = %format_args!("{prefix}.{}", entry.key()),
            count = entry.value().load(Ordering::Relaxed),
            "meter"
        );
    }
    for entry in inner.gauges.iter() {
        debug!(
            metric = %format_args!("{prefix}.{}", entry.key()),
            value = entry.value().load(Ordering::Relaxed),
            "gauge"
        );
    }
    for entry in inner.timers.iter() {
        let count = entry.value().count.load(Ordering::Relaxed);
        let total = entry.value().total_nanos.load(Ordering::Relaxed);
        let mean_us = if count == 0 { 0 } else { total / count / 1_000 };
        debug!(
            metric = %format_args!("{prefix}.{}", entry.key()),
            count, mean_us, "timer"
        );
    }
}

impl MetricsInner {
    fn system_metric(&self, name: &str) -> String {
        join_non_empty(&[&self.system_sub_prefix, &self.instance, name])
    }

    fn app_metric(&self, name: &str) -> String {
        join_non_empty(&[&self.app_sub_prefix, name])
    }
}

fn join_non_empty(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(METRIC_SEPARATOR)
}

fn local_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Characters that would split graphite-style metric paths are flattened.
fn clean(s: &str) -> String {
    if s.is_empty() {
        return "_".to_string();
    }
    s.replace(['.', ':'], "_").to_lowercase()
}

fn default_prefix() -> String {
    let exe = std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().to_string()))
        .unwrap_or_else(|| "appcop".to_string());
    format!("{}.{}", clean(&local_hostname()), clean(&exe))
}
