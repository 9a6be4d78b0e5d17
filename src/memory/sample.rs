//! Replay samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One buffered sample. The payload is opaque to the buffer; the optional
/// scores are supplied by the caller and drive the scored policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub importance: Option<f64>,
    pub gradient_magnitude: Option<f64>,
    pub cluster_id: Option<u32>,
    pub inserted_at: DateTime<Utc>,
}

impl MemorySample {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            importance: None,
            gradient_magnitude: None,
            cluster_id: None,
            inserted_at: Utc::now(),
        }
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_gradient_magnitude(mut self, magnitude: f64) -> Self {
        self.gradient_magnitude = Some(magnitude);
        self
    }

    pub fn with_cluster(mut self, cluster_id: u32) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }

    /// Importance with missing or non-finite values treated as 0.
    pub fn importance_score(&self) -> f64 {
        finite_or_zero(self.importance)
    }

    /// Gradient magnitude with missing or non-finite values treated as 0.
    pub fn gradient_score(&self) -> f64 {
        finite_or_zero(self.gradient_magnitude)
    }
}

fn finite_or_zero(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() => v,
        _ => 0.0,
    }
}
