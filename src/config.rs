//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;
use crate::scheduler::ResourceCapacity;

/// Task creation limits.
#[derive(Debug, Clone)]
pub struct CreatorConfig {
    /// Upper bound on any task's estimated duration.
    pub max_task_timeout: Duration,
    /// Duration of a single epoch at the strategy's default batch size.
    pub base_duration: Duration,
}

impl Default for CreatorConfig {
    fn default() -> Self {
        Self {
            max_task_timeout: Duration::from_secs(6 * 3600), // 6 hours
            base_duration: Duration::from_secs(600),         // 10 minutes
        }
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Workers silent for longer than this are unregistered.
    pub worker_timeout: Duration,
    /// Queued entries waiting longer than this are promoted one tier.
    pub boost_threshold: Duration,
    /// Auto-assignment loop interval.
    pub tick_interval: Duration,
    /// Worker losses tolerated per task before it fails permanently.
    pub max_requeues: u32,
    /// Maximum number of queued entries.
    pub max_queue_size: usize,
    /// How long finished entries are kept before the monitor prunes them.
    pub entry_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(30),
            boost_threshold: Duration::from_secs(300), // 5 minutes
            tick_interval: Duration::from_secs(5),
            max_requeues: 3,
            max_queue_size: 10_000,
            entry_retention: Duration::from_secs(24 * 3600), // 24 hours
        }
    }
}

/// Progress tracker tuning.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Contexts without a heartbeat for this long are reported stale.
    pub stale_threshold: Duration,
    /// Stale-monitor loop interval.
    pub monitor_interval: Duration,
    /// Status log entries kept per context.
    pub max_status_updates: usize,
    /// How long finished contexts stay in the archive.
    pub archive_retention: Duration,
    /// Hard cap on archived contexts.
    pub max_archived: usize,
    /// Maximum concurrently tracked contexts.
    pub max_active_contexts: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(120),
            monitor_interval: Duration::from_secs(15),
            max_status_updates: 100,
            archive_retention: Duration::from_secs(24 * 3600), // 24 hours
            max_archived: 1_000,
            max_active_contexts: 10_000,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub creator: CreatorConfig,
    pub scheduler: SchedulerConfig,
    pub tracker: TrackerConfig,
}

impl OrchestratorConfig {
    /// Build config from `LEARNQ_*` environment variables.
    /// Unset or unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs = |key: &str, default: Duration| -> Duration {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let count = |key: &str, default: usize| -> usize {
            lookup(key)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(default)
        };

        let creator_defaults = CreatorConfig::default();
        let scheduler_defaults = SchedulerConfig::default();
        let tracker_defaults = TrackerConfig::default();

        Self {
            creator: CreatorConfig {
                max_task_timeout: secs(
                    "LEARNQ_MAX_TASK_TIMEOUT_SECS",
                    creator_defaults.max_task_timeout,
                ),
                base_duration: secs("LEARNQ_BASE_DURATION_SECS", creator_defaults.base_duration),
            },
            scheduler: SchedulerConfig {
                worker_timeout: secs(
                    "LEARNQ_WORKER_TIMEOUT_SECS",
                    scheduler_defaults.worker_timeout,
                ),
                boost_threshold: secs(
                    "LEARNQ_BOOST_THRESHOLD_SECS",
                    scheduler_defaults.boost_threshold,
                ),
                tick_interval: secs("LEARNQ_SCHEDULER_TICK_SECS", scheduler_defaults.tick_interval),
                max_requeues: lookup("LEARNQ_MAX_REQUEUES")
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(scheduler_defaults.max_requeues),
                max_queue_size: count("LEARNQ_MAX_QUEUE_SIZE", scheduler_defaults.max_queue_size),
                entry_retention: secs(
                    "LEARNQ_ENTRY_RETENTION_SECS",
                    scheduler_defaults.entry_retention,
                ),
            },
            tracker: TrackerConfig {
                stale_threshold: secs(
                    "LEARNQ_STALE_THRESHOLD_SECS",
                    tracker_defaults.stale_threshold,
                ),
                monitor_interval: secs("LEARNQ_MONITOR_TICK_SECS", tracker_defaults.monitor_interval),
                max_status_updates: count(
                    "LEARNQ_MAX_STATUS_UPDATES",
                    tracker_defaults.max_status_updates,
                ),
                archive_retention: secs(
                    "LEARNQ_ARCHIVE_RETENTION_SECS",
                    tracker_defaults.archive_retention,
                ),
                max_archived: count("LEARNQ_MAX_ARCHIVED", tracker_defaults.max_archived),
                max_active_contexts: count(
                    "LEARNQ_MAX_ACTIVE_CONTEXTS",
                    tracker_defaults.max_active_contexts,
                ),
            },
        }
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("scheduler.worker_timeout", self.scheduler.worker_timeout),
            ("scheduler.boost_threshold", self.scheduler.boost_threshold),
            ("scheduler.tick_interval", self.scheduler.tick_interval),
            ("tracker.stale_threshold", self.tracker.stale_threshold),
            ("tracker.monitor_interval", self.tracker.monitor_interval),
            ("creator.base_duration", self.creator.base_duration),
        ];
        for (key, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        if self.creator.max_task_timeout < self.creator.base_duration {
            return Err(ConfigError::InvalidValue {
                key: "creator.max_task_timeout".to_string(),
                message: "must not be shorter than creator.base_duration".to_string(),
            });
        }
        if self.scheduler.max_queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.max_queue_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.tracker.max_status_updates == 0 || self.tracker.max_active_contexts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "tracker".to_string(),
                message: "max_status_updates and max_active_contexts must be at least 1"
                    .to_string(),
            });
        }

        Ok(())
    }
}

/// A worker declared in `LEARNQ_WORKERS`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub worker_id: String,
    pub capacity: ResourceCapacity,
    pub capabilities: Vec<String>,
}

/// Parse a static worker pool: `id:cpu:memory_mb:gpus[:cap+cap]`, comma
/// separated. Blank entries are skipped.
pub fn parse_worker_pool(spec: &str) -> Result<Vec<WorkerSpec>, ConfigError> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_worker)
        .collect()
}

fn parse_worker(entry: &str) -> Result<WorkerSpec, ConfigError> {
    let bad = |what: &str| ConfigError::ParseError(format!("worker '{entry}': {what}"));
    let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
    if !(4..=5).contains(&parts.len()) {
        return Err(bad("expected id:cpu:memory_mb:gpus[:capabilities]"));
    }
    if parts[0].is_empty() {
        return Err(bad("empty worker id"));
    }
    let cpu_cores: f64 = parts[1].parse().map_err(|_| bad("invalid cpu cores"))?;
    if !cpu_cores.is_finite() || cpu_cores <= 0.0 {
        return Err(bad("cpu cores must be positive"));
    }
    let memory_mb: u64 = parts[2].parse().map_err(|_| bad("invalid memory_mb"))?;
    let gpu_count: u32 = parts[3].parse().map_err(|_| bad("invalid gpu count"))?;
    let capabilities = parts
        .get(4)
        .map(|caps| {
            caps.split('+')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Ok(WorkerSpec {
        worker_id: parts[0].to_string(),
        capacity: ResourceCapacity::new(cpu_cores, memory_mb, gpu_count),
        capabilities,
    })
}
