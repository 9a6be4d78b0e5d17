//! Task creation: validation, defaults and resource estimation.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::CreatorConfig;
use crate::error::ValidationError;
use crate::memory::PolicyKind;
use crate::task::model::{
    LearningStrategy, ResourceRequirements, StrategyProfile, TaskDescriptor, TaskId,
};

/// Absolute batch-size bounds, independent of strategy.
pub const MIN_BATCH_SIZE: i64 = 1;
pub const MAX_BATCH_SIZE: i64 = 65_536;

const MAX_EPOCHS: i64 = 10_000;
const MAX_REPLAY_CAPACITY: i64 = 10_000_000;

/// CPU cores and memory a strategy with multiplier 1.0 needs at its default batch.
const BASE_CPU_CORES: f64 = 1.0;
const BASE_MEMORY_MB: f64 = 1024.0;

/// Raw creation request as an outer layer would deserialize it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub target_id: Option<String>,
    pub strategy: Option<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// A soft violation: the task is still created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

impl ValidationWarning {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Replay buffer requested by the task config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplaySpec {
    pub capacity: usize,
    pub policy: PolicyKind,
}

/// Output of a successful creation.
#[derive(Debug, Clone)]
pub struct CreatedTask {
    pub descriptor: TaskDescriptor,
    pub warnings: Vec<ValidationWarning>,
    pub replay: Option<ReplaySpec>,
}

/// Validates task configuration and issues descriptors.
#[derive(Debug, Clone)]
pub struct TaskCreator {
    config: CreatorConfig,
}

impl TaskCreator {
    pub fn new(config: CreatorConfig) -> Self {
        Self { config }
    }

    /// Create a task for `target_id` with the given strategy.
    pub fn create(
        &self,
        target_id: &str,
        strategy: LearningStrategy,
        config: Map<String, Value>,
    ) -> Result<CreatedTask, ValidationError> {
        self.create_at(target_id, strategy, config, Utc::now())
    }

    pub fn create_at(
        &self,
        target_id: &str,
        strategy: LearningStrategy,
        config: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<CreatedTask, ValidationError> {
        self.build(target_id, strategy, config, now)
    }

    /// Create a task from a raw request whose fields may be missing.
    pub fn create_from_request(&self, request: TaskRequest) -> Result<CreatedTask, ValidationError> {
        self.create_from_request_at(request, Utc::now())
    }

    pub fn create_from_request_at(
        &self,
        request: TaskRequest,
        now: DateTime<Utc>,
    ) -> Result<CreatedTask, ValidationError> {
        let target_id = request
            .target_id
            .ok_or_else(|| ValidationError::MissingField("target_id".to_string()))?;
        let strategy = request
            .strategy
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ValidationError::MissingField("strategy".to_string()))?
            .parse::<LearningStrategy>()?;
        self.build(&target_id, strategy, request.config, now)
    }

    fn build(
        &self,
        target_id: &str,
        strategy: LearningStrategy,
        mut config: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<CreatedTask, ValidationError> {
        let target_id = target_id.trim();
        if target_id.is_empty() {
            return Err(ValidationError::MissingField("target_id".to_string()));
        }

        match config.get("data_source") {
            None | Some(Value::Null) => {
                return Err(ValidationError::MissingField("data_source".to_string()));
            }
            Some(Value::String(s)) if s.trim().is_empty() => {
                return Err(ValidationError::MissingField("data_source".to_string()));
            }
            Some(Value::String(_)) => {}
            Some(_) => return Err(wrong_type("data_source", "string")),
        }

        let profile = strategy.profile();
        let mut warnings = Vec::new();

        let batch_size = self.resolve_batch_size(&config, &profile, strategy, &mut warnings)?;
        let epochs = match int_field(&config, "epochs")? {
            None => 1,
            Some(e) => check_bounds("epochs", e, 1, MAX_EPOCHS)?,
        };

        match config.get("learning_rate") {
            None | Some(Value::Null) => {}
            Some(v) => {
                let lr = v.as_f64().ok_or_else(|| wrong_type("learning_rate", "number"))?;
                if !(lr > 0.0 && lr <= 1.0) {
                    warnings.push(ValidationWarning::new(
                        "learning_rate",
                        format!("{lr} is outside (0, 1]; training may diverge"),
                    ));
                }
            }
        }

        let replay = resolve_replay(&config, &mut warnings)?;
        let dependencies = resolve_dependencies(&config)?;

        let (resource_requirements, estimated_duration) =
            self.estimate(&profile, batch_size, epochs, &mut warnings);

        config.insert("batch_size".to_string(), Value::from(batch_size));
        config.insert("epochs".to_string(), Value::from(epochs));

        let mut descriptor =
            TaskDescriptor::new(TaskId::generate(now), target_id, strategy, now);
        descriptor.parameters = config;
        descriptor.resource_requirements = resource_requirements;
        descriptor.estimated_duration = estimated_duration;
        descriptor.dependencies = dependencies;

        for warning in &warnings {
            tracing::debug!(
                task_id = %descriptor.task_id,
                field = %warning.field,
                "Task created with warning: {}",
                warning.message
            );
        }

        Ok(CreatedTask {
            descriptor,
            warnings,
            replay,
        })
    }

    fn resolve_batch_size(
        &self,
        config: &Map<String, Value>,
        profile: &StrategyProfile,
        strategy: LearningStrategy,
        warnings: &mut Vec<ValidationWarning>,
    ) -> Result<u32, ValidationError> {
        let Some(requested) = int_field(config, "batch_size")? else {
            return Ok(profile.default_batch);
        };
        let requested = check_bounds("batch_size", requested, MIN_BATCH_SIZE, MAX_BATCH_SIZE)?;
        let requested = requested as u32;

        let clamped = requested.clamp(profile.min_batch, profile.max_batch);
        if clamped != requested {
            warnings.push(ValidationWarning::new(
                "batch_size",
                format!(
                    "{requested} is outside [{}, {}] for {strategy}; using {clamped}",
                    profile.min_batch, profile.max_batch
                ),
            ));
        }
        Ok(clamped)
    }

    /// Scale the strategy multipliers by batch size and epochs.
    fn estimate(
        &self,
        profile: &StrategyProfile,
        batch_size: u32,
        epochs: i64,
        warnings: &mut Vec<ValidationWarning>,
    ) -> (ResourceRequirements, Duration) {
        let batch_factor = f64::from(batch_size) / f64::from(profile.default_batch);

        let secs = self.config.base_duration.as_secs_f64()
            * profile.duration_multiplier
            * batch_factor
            * epochs as f64;
        let mut duration = Duration::from_secs_f64(secs);
        if duration > self.config.max_task_timeout {
            warnings.push(ValidationWarning::new(
                "estimated_duration",
                format!(
                    "estimate of {}s capped at {}s",
                    duration.as_secs(),
                    self.config.max_task_timeout.as_secs()
                ),
            ));
            duration = self.config.max_task_timeout;
        }

        let cpu = BASE_CPU_CORES * profile.cpu_multiplier * batch_factor.clamp(0.5, 4.0);
        let requirements = ResourceRequirements {
            cpu_cores: (cpu * 100.0).round() / 100.0,
            memory_mb: (BASE_MEMORY_MB * profile.memory_multiplier * batch_factor.clamp(0.5, 8.0))
                .ceil() as u64,
            gpu_count: profile.gpu_count,
        };

        (requirements, duration)
    }
}

impl Default for TaskCreator {
    fn default() -> Self {
        Self::new(CreatorConfig::default())
    }
}

fn wrong_type(field: &str, expected: &str) -> ValidationError {
    ValidationError::WrongType {
        field: field.to_string(),
        expected: expected.to_string(),
    }
}

fn int_field(config: &Map<String, Value>, key: &str) -> Result<Option<i64>, ValidationError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| wrong_type(key, "integer")),
    }
}

fn check_bounds(field: &str, value: i64, min: i64, max: i64) -> Result<i64, ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::OutOfBounds {
            field: field.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn resolve_replay(
    config: &Map<String, Value>,
    warnings: &mut Vec<ValidationWarning>,
) -> Result<Option<ReplaySpec>, ValidationError> {
    let policy = match config.get("replay_policy") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.parse::<PolicyKind>()?),
        Some(_) => return Err(wrong_type("replay_policy", "string")),
    };

    let Some(capacity) = int_field(config, "replay_capacity")? else {
        if policy.is_some() {
            warnings.push(ValidationWarning::new(
                "replay_policy",
                "ignored without replay_capacity",
            ));
        }
        return Ok(None);
    };
    let capacity = check_bounds("replay_capacity", capacity, 1, MAX_REPLAY_CAPACITY)?;

    Ok(Some(ReplaySpec {
        capacity: capacity as usize,
        policy: policy.unwrap_or(PolicyKind::Random),
    }))
}

fn resolve_dependencies(config: &Map<String, Value>) -> Result<BTreeSet<TaskId>, ValidationError> {
    match config.get("dependencies") {
        None | Some(Value::Null) => Ok(BTreeSet::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(TaskId::from)
                    .ok_or_else(|| wrong_type("dependencies", "array of task ids"))
            })
            .collect(),
        Some(_) => Err(wrong_type("dependencies", "array of task ids")),
    }
}
