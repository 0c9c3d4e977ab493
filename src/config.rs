//! Configuration for appcop
//!
//! Every option is a command-line flag with a default; `--config-file`
//! points at an optional TOML file whose present fields override whatever
//! the flags produced.

use std::collections::HashMap;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{AppcopError, Result};

/// Command-line flags
#[derive(Debug, Parser)]
#[command(name = "appcop", version, about = "Application cop for Marathon-style orchestrators")]
pub struct Flags {
    /// Address to listen on for health checking
    #[arg(long, default_value = crate::defaults::LISTEN)]
    pub listen: String,

    /// Event stream URL (informational; the subscription URL is derived
    /// from the orchestrator location)
    #[arg(long = "event-stream", default_value = "http://example.com:8080/v2/events")]
    pub event_stream: String,

    /// Size of the bounded event queue
    #[arg(long = "events-queue-size", default_value_t = crate::defaults::QUEUE_SIZE)]
    pub events_queue_size: usize,

    /// Number of concurrent workers processing events
    #[arg(long = "workers-pool-size", default_value_t = crate::defaults::WORKERS_COUNT)]
    pub workers_pool_size: usize,

    /// Subscribe to the event stream once the orchestrator reports this
    /// string as its leader
    #[arg(long = "my-leader", default_value = "example.com:8080")]
    pub my_leader: String,

    /// Orchestrator host:port
    #[arg(long = "orchestrator-location", default_value = "example.com:8080")]
    pub orchestrator_location: String,

    /// Orchestrator protocol (http or https)
    #[arg(long = "orchestrator-protocol", default_value = "http")]
    pub orchestrator_protocol: String,

    /// Orchestrator username for basic auth
    #[arg(long = "orchestrator-username", default_value = "")]
    pub orchestrator_username: String,

    /// Orchestrator password for basic auth
    #[arg(long = "orchestrator-password", default_value = "")]
    pub orchestrator_password: String,

    /// Verify certificates when connecting via SSL
    #[arg(long = "orchestrator-ssl-verify", action = clap::ArgAction::Set, default_value_t = true)]
    pub orchestrator_ssl_verify: bool,

    /// Time limit in seconds for orchestrator requests; zero means no limit
    #[arg(long = "orchestrator-timeout", default_value_t = crate::defaults::ORCHESTRATOR_TIMEOUT_SECS)]
    pub orchestrator_timeout: u64,

    /// Prefix common to all fully qualified application ids, stripped from
    /// per-application metric names
    #[arg(long = "appid-prefix", default_value = "")]
    pub appid_prefix: String,

    /// Perform a trial run with no changes made to the orchestrator
    #[arg(long = "dry-run", default_value_t = false)]
    pub dry_run: bool,

    /// Score at which an application is scaled one instance down
    #[arg(long = "scale-down-score", default_value_t = crate::defaults::SCALE_DOWN_SCORE)]
    pub scale_down_score: i64,

    /// How many scale-down actions to commit in one evaluate interval
    #[arg(long = "scale-limit", default_value_t = 2)]
    pub scale_limit: usize,

    /// Seconds between score debug printouts
    #[arg(long = "update-interval", default_value_t = 2)]
    pub update_interval: u64,

    /// Seconds between score resets
    #[arg(long = "reset-interval", default_value_t = 3600)]
    pub reset_interval: u64,

    /// Seconds between score evaluations
    #[arg(long = "evaluate-interval", default_value_t = 120)]
    pub evaluate_interval: u64,

    /// Garbage collect old suspended applications and empty groups
    #[arg(long = "gc-enabled", action = clap::ArgAction::Set, default_value_t = true)]
    pub gc_enabled: bool,

    /// Seconds an application must stay suspended before deletion
    #[arg(long = "gc-max-suspend-time", default_value_t = 7 * 24 * 3600)]
    pub gc_max_suspend_time: u64,

    /// Seconds between garbage collection cycles
    #[arg(long = "gc-interval", default_value_t = 8 * 3600)]
    pub gc_interval: u64,

    /// Delete only applications suspended by appcop
    #[arg(long = "gc-appcop-only", action = clap::ArgAction::Set, default_value_t = true)]
    pub gc_appcop_only: bool,

    /// Metrics destination: stdout, or empty to disable
    #[arg(long = "metrics-target", default_value = "stdout")]
    pub metrics_target: String,

    /// Metrics prefix; "default" resolves to <hostname>.<app_name>
    #[arg(long = "metrics-prefix", default_value = "default")]
    pub metrics_prefix: String,

    /// Instance discriminator appended to system metric names
    #[arg(long = "metrics-instance", default_value = "")]
    pub metrics_instance: String,

    /// Sub-prefix for appcop-internal metrics
    #[arg(long = "metrics-system-sub-prefix", default_value = "appcop-internal")]
    pub metrics_system_sub_prefix: String,

    /// Sub-prefix for per-application metrics
    #[arg(long = "metrics-app-sub-prefix", default_value = "applications")]
    pub metrics_app_sub_prefix: String,

    /// Seconds between metrics reports
    #[arg(long = "metrics-interval", default_value_t = 30)]
    pub metrics_interval: u64,

    /// Log level: error, warn, info, debug or trace
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Log format: text or json
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: String,

    /// Log file; empty logs to stderr
    #[arg(long = "log-file", default_value = "")]
    pub log_file: String,

    /// Path to a TOML file whose fields override flag values
    #[arg(long = "config-file", default_value = "")]
    pub config_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub listen: String,
    pub location: String,
    pub queue_size: usize,
    pub workers_count: usize,
    pub my_leader: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub location: String,
    pub protocol: String,
    pub username: String,
    pub password: String,
    pub verify_ssl: bool,
    pub timeout_secs: u64,
    pub app_id_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreConfig {
    pub dry_run: bool,
    pub scale_down_score: i64,
    pub scale_limit: usize,
    pub update_interval_secs: u64,
    pub reset_interval_secs: u64,
    pub evaluate_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    pub enabled: bool,
    pub max_suspend_time_secs: u64,
    pub interval_secs: u64,
    pub appcop_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub target: String,
    pub prefix: String,
    pub instance: String,
    pub system_sub_prefix: String,
    pub app_sub_prefix: String,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
    pub file: String,
}

/// Full appcop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub web: WebConfig,
    pub orchestrator: OrchestratorConfig,
    pub score: ScoreConfig,
    pub gc: GcConfig,
    pub metrics: MetricsConfig,
    pub log: LogConfig,
}

impl Config {
    /// Resolve configuration from parsed flags plus the optional overlay
    /// file.
    pub fn load(flags: &Flags) -> Result<Self> {
        let mut config = Self::from_flags(flags);
        if !flags.config_file.is_empty() {
            let raw = std::fs::read_to_string(&flags.config_file)?;
            let overlay: Overlay = toml::from_str(&raw)
                .map_err(|e| AppcopError::Config(format!("bad config file: {e}")))?;
            overlay.apply(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    fn from_flags(flags: &Flags) -> Self {
        Self {
            web: WebConfig {
                listen: flags.listen.clone(),
                location: flags.event_stream.clone(),
                queue_size: flags.events_queue_size,
                workers_count: flags.workers_pool_size,
                my_leader: flags.my_leader.clone(),
            },
            orchestrator: OrchestratorConfig {
                location: flags.orchestrator_location.clone(),
                protocol: flags.orchestrator_protocol.clone(),
                username: flags.orchestrator_username.clone(),
                password: flags.orchestrator_password.clone(),
                verify_ssl: flags.orchestrator_ssl_verify,
                timeout_secs: flags.orchestrator_timeout,
                app_id_prefix: flags.appid_prefix.clone(),
            },
            score: ScoreConfig {
                dry_run: flags.dry_run,
                scale_down_score: flags.scale_down_score,
                scale_limit: flags.scale_limit,
                update_interval_secs: flags.update_interval,
                reset_interval_secs: flags.reset_interval,
                evaluate_interval_secs: flags.evaluate_interval,
            },
            gc: GcConfig {
                enabled: flags.gc_enabled,
                max_suspend_time_secs: flags.gc_max_suspend_time,
                interval_secs: flags.gc_interval,
                appcop_only: flags.gc_appcop_only,
            },
            metrics: MetricsConfig {
                target: flags.metrics_target.clone(),
                prefix: flags.metrics_prefix.clone(),
                instance: flags.metrics_instance.clone(),
                system_sub_prefix: flags.metrics_system_sub_prefix.clone(),
                app_sub_prefix: flags.metrics_app_sub_prefix.clone(),
                interval_secs: flags.metrics_interval,
            },
            log: LogConfig {
                level: flags.log_level.clone(),
                format: flags.log_format.clone(),
                file: flags.log_file.clone(),
            },
        }
    }

    fn validate(&self) -> Result<()> {
        if self.web.queue_size == 0 {
            return Err(AppcopError::Config("events queue size must be positive".into()));
        }
        if self.web.workers_count == 0 {
            return Err(AppcopError::Config("workers pool size must be positive".into()));
        }
        match self.log.level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(AppcopError::Config(format!("unknown log level {other:?}")));
            }
        }
        match self.log.format.to_uppercase().as_str() {
            "TEXT" | "JSON" => {}
            other => {
                return Err(AppcopError::Config(format!("unknown log format {other:?}")));
            }
        }
        Ok(())
    }
}

/// TOML overlay with every field optional; only present fields override.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Overlay {
    web: HashMap<String, toml::Value>,
    orchestrator: HashMap<String, toml::Value>,
    score: HashMap<String, toml::Value>,
    gc: HashMap<String, toml::Value>,
    metrics: HashMap<String, toml::Value>,
    log: HashMap<String, toml::Value>,
}

fn set_string(target: &mut String, section: &HashMap<String, toml::Value>, key: &str) {
    if let Some(value) = section.get(key).and_then(|v| v.as_str()) {
        *target = value.to_string();
    }
}

fn set_bool(target: &mut bool, section: &HashMap<String, toml::Value>, key: &str) {
    if let Some(value) = section.get(key).and_then(|v| v.as_bool()) {
        *target = value;
    }
}

fn set_u64(target: &mut u64, section: &HashMap<String, toml::Value>, key: &str) {
    if let Some(value) = section.get(key).and_then(|v| v.as_integer()) {
        *target = value.max(0) as u64;
    }
}

fn set_usize(target: &mut usize, section: &HashMap<String, toml::Value>, key: &str) {
    if let Some(value) = section.get(key).and_then(|v| v.as_integer()) {
        *target = value.max(0) as usize;
    }
}

fn set_i64(target: &mut i64, section: &HashMap<String, toml::Value>, key: &str) {
    if let Some(value) = section.get(key).and_then(|v| v.as_integer()) {
        *target = value;
    }
}

impl Overlay {
    fn apply(&self, config: &mut Config) {
        set_string(&mut config.web.listen, &self.web, "listen");
        set_string(&mut config.web.location, &self.web, "location");
        set_usize(&mut config.web.queue_size, &self.web, "queue_size");
        set_usize(&mut config.web.workers_count, &self.web, "workers_count");
        set_string(&mut config.web.my_leader, &self.web, "my_leader");

        set_string(&mut config.orchestrator.location, &self.orchestrator, "location");
        set_string(&mut config.orchestrator.protocol, &self.orchestrator, "protocol");
        set_string(&mut config.orchestrator.username, &self.orchestrator, "username");
        set_string(&mut config.orchestrator.password, &self.orchestrator, "password");
        set_bool(&mut config.orchestrator.verify_ssl, &self.orchestrator, "verify_ssl");
        set_u64(&mut config.orchestrator.timeout_secs, &self.orchestrator, "timeout_secs");
        set_string(
            &mut config.orchestrator.app_id_prefix,
            &self.orchestrator,
            "app_id_prefix",
        );

        set_bool(&mut config.score.dry_run, &self.score, "dry_run");
        set_i64(&mut config.score.scale_down_score, &self.score, "scale_down_score");
        set_usize(&mut config.score.scale_limit, &self.score, "scale_limit");
        set_u64(&mut config.score.update_interval_secs, &self.score, "update_interval_secs");
        set_u64(&mut config.score.reset_interval_secs, &self.score, "reset_interval_secs");
        set_u64(
            &mut config.score.evaluate_interval_secs,
            &self.score,
            "evaluate_interval_secs",
        );

        set_bool(&mut config.gc.enabled, &self.gc, "enabled");
        set_u64(&mut config.gc.max_suspend_time_secs, &self.gc, "max_suspend_time_secs");
        set_u64(&mut config.gc.interval_secs, &self.gc, "interval_secs");
        set_bool(&mut config.gc.appcop_only, &self.gc, "appcop_only");

        set_string(&mut config.metrics.target, &self.metrics, "target");
        set_string(&mut config.metrics.prefix, &self.metrics, "prefix");
        set_string(&mut config.metrics.instance, &self.metrics, "instance");
        set_string(
            &mut config.metrics.system_sub_prefix,
            &self.metrics,
            "system_sub_prefix",
        );
        set_string(&mut config.metrics.app_sub_prefix, &self.metrics, "app_sub_prefix");
        set_u64(&mut config.metrics.interval_secs, &self.metrics, "interval_secs");

        set_string(&mut config.log.level, &self.log, "level");
        set_string(&mut config.log.format, &self.log, "format");
        set_string(&mut config.log.file, &self.log, "file");
    }
}
