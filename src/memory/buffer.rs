//! Bounded replay buffer.

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use uuid::Uuid;

use crate::error::BufferError;
use crate::memory::policy::{Admission, PolicyKind, ReplayPolicy, policy_for};
use crate::memory::sample::MemorySample;

/// Outcome of a buffer operation. Empty buffers and oversized requests are
/// reported here, never as errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferOpResult {
    pub items_processed: usize,
    pub buffer_size_after: usize,
    pub success: bool,
    pub error: Option<String>,
}

impl BufferOpResult {
    fn ok(items_processed: usize, buffer_size_after: usize) -> Self {
        Self {
            items_processed,
            buffer_size_after,
            success: true,
            error: None,
        }
    }
}

/// Samples returned by [`MemoryBuffer::sample`].
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub samples: Vec<MemorySample>,
    pub result: BufferOpResult,
}

/// Point-in-time buffer statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferStats {
    pub policy: PolicyKind,
    pub capacity: usize,
    pub size: usize,
    pub utilization: f64,
    pub inserts: u64,
    pub evictions: u64,
    pub rejections: u64,
    pub cluster_distribution: BTreeMap<u32, usize>,
    pub untagged: usize,
}

/// Fixed-capacity sample buffer with one eviction policy chosen at construction.
#[derive(Debug)]
pub struct MemoryBuffer {
    capacity: usize,
    samples: Vec<MemorySample>,
    policy: Box<dyn ReplayPolicy>,
    rng: StdRng,
    inserts: u64,
    evictions: u64,
    rejections: u64,
}

impl MemoryBuffer {
    /// Create a buffer seeded from OS entropy.
    pub fn new(capacity: usize, policy: PolicyKind) -> Result<Self, BufferError> {
        Self::with_rng(capacity, policy, StdRng::from_entropy())
    }

    /// Create a buffer with reproducible random choices.
    pub fn with_seed(capacity: usize, policy: PolicyKind, seed: u64) -> Result<Self, BufferError> {
        Self::with_rng(capacity, policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(capacity: usize, policy: PolicyKind, rng: StdRng) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        Ok(Self {
            capacity,
            samples: Vec::with_capacity(capacity.min(4096)),
            policy: policy_for(policy),
            rng,
            inserts: 0,
            evictions: 0,
            rejections: 0,
        })
    }

    pub fn policy(&self) -> PolicyKind {
        self.policy.kind()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Buffer contents in insertion order.
    pub fn samples(&self) -> &[MemorySample] {
        &self.samples
    }

    /// Insert one sample. A full buffer evicts exactly one sample or, for the
    /// scored policies, may drop the incoming sample (`items_processed == 0`).
    pub fn insert(&mut self, sample: MemorySample) -> BufferOpResult {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
            self.inserts += 1;
            return self.finish(1);
        }

        match self.policy.on_full(&self.samples, &sample, &mut self.rng) {
            Admission::Replace(idx) => {
                let evicted = self.samples.remove(idx);
                tracing::trace!(
                    evicted = %evicted.id,
                    inserted = %sample.id,
                    policy = %self.policy.kind(),
                    "Evicted replay sample"
                );
                self.samples.push(sample);
                self.inserts += 1;
                self.evictions += 1;
                self.finish(1)
            }
            Admission::Reject => {
                self.rejections += 1;
                self.finish(0)
            }
        }
    }

    /// Insert many samples; `items_processed` counts the admitted ones.
    pub fn insert_batch(&mut self, samples: impl IntoIterator<Item = MemorySample>) -> BufferOpResult {
        let admitted = samples
            .into_iter()
            .map(|s| self.insert(s).items_processed)
            .sum();
        self.finish(admitted)
    }

    /// Return up to `n` samples chosen by `policy`, or by the buffer's own
    /// policy when `None`.
    pub fn sample(&mut self, n: usize, policy: Option<PolicyKind>) -> SampleBatch {
        let n = n.min(self.samples.len());
        if n == 0 {
            return SampleBatch {
                samples: Vec::new(),
                result: self.finish(0),
            };
        }

        let indices = match policy {
            Some(kind) if kind != self.policy.kind() => {
                policy_for(kind).select(&self.samples, n, &mut self.rng)
            }
            _ => self.policy.select(&self.samples, n, &mut self.rng),
        };
        let samples: Vec<MemorySample> = indices.iter().map(|&i| self.samples[i].clone()).collect();
        let result = self.finish(samples.len());

        SampleBatch { samples, result }
    }

    /// Refresh a sample's importance, e.g. after its loss was recomputed.
    pub fn update_importance(&mut self, id: Uuid, importance: f64) -> BufferOpResult {
        match self.samples.iter_mut().find(|s| s.id == id) {
            Some(sample) => {
                sample.importance = Some(importance);
                self.finish(1)
            }
            None => BufferOpResult {
                items_processed: 0,
                buffer_size_after: self.samples.len(),
                success: false,
                error: Some(format!("sample {id} not in buffer")),
            },
        }
    }

    pub fn clear(&mut self) -> BufferOpResult {
        let removed = self.samples.len();
        self.samples.clear();
        self.finish(removed)
    }

    /// Verify the structural invariant without panicking.
    pub fn check_integrity(&self) -> Result<(), BufferError> {
        if self.samples.len() > self.capacity {
            return Err(BufferError::CapacityExceeded {
                size: self.samples.len(),
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> BufferStats {
        let mut cluster_distribution = BTreeMap::new();
        let mut untagged = 0;
        for sample in &self.samples {
            match sample.cluster_id {
                Some(cluster) => *cluster_distribution.entry(cluster).or_insert(0) += 1,
                None => untagged += 1,
            }
        }

        BufferStats {
            policy: self.policy.kind(),
            capacity: self.capacity,
            size: self.samples.len(),
            utilization: self.samples.len() as f64 / self.capacity as f64,
            inserts: self.inserts,
            evictions: self.evictions,
            rejections: self.rejections,
            cluster_distribution,
            untagged,
        }
    }

    fn finish(&self, items_processed: usize) -> BufferOpResult {
        assert!(
            self.samples.len() <= self.capacity,
            "replay buffer holds {} samples, above capacity {}",
            self.samples.len(),
            self.capacity
        );
        BufferOpResult::ok(items_processed, self.samples.len())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn importance(value: f64) -> MemorySample {
        MemorySample::new(json!({"v": value})).with_importance(value)
    }

    fn importances(buffer: &MemoryBuffer) -> Vec<f64> {
        let mut values: Vec<f64> = buffer.samples().iter().map(|s| s.importance_score()).collect();
        values.sort_by(f64::total_cmp);
        values
    }

    #[test]
    fn zero_capacity_rejected() {
        assert_eq!(
            MemoryBuffer::new(0, PolicyKind::Random).unwrap_err(),
            BufferError::ZeroCapacity
        );
    }

    #[test]
    fn importance_eviction_scenario() {
        let mut buffer = MemoryBuffer::with_seed(3, PolicyKind::Importance, 1).unwrap();
        for v in [1.0, 2.0, 3.0] {
            assert_eq!(buffer.insert(importance(v)).items_processed, 1);
        }
        assert_eq!(buffer.len(), 3);

        let rejected = buffer.insert(importance(0.5));
        assert_eq!(rejected.items_processed, 0);
        assert!(rejected.success);
        assert_eq!(rejected.buffer_size_after, 3);
        assert_eq!(importances(&buffer), vec![1.0, 2.0, 3.0]);

        let replaced = buffer.insert(importance(5.0));
        assert_eq!(replaced.items_processed, 1);
        assert_eq!(importances(&buffer), vec![2.0, 3.0, 5.0]);

        let stats = buffer.stats();
        assert_eq!(stats.rejections, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn random_eviction_replaces_exactly_one() {
        let mut buffer = MemoryBuffer::with_seed(4, PolicyKind::Random, 42).unwrap();
        let originals: Vec<MemorySample> = (0..4).map(|i| MemorySample::new(json!(i))).collect();
        buffer.insert_batch(originals.clone());

        let newcomer = MemorySample::new(json!("new"));
        let result = buffer.insert(newcomer.clone());
        assert_eq!(result.items_processed, 1);
        assert_eq!(buffer.len(), 4);

        let survivors = originals
            .iter()
            .filter(|o| buffer.samples().iter().any(|s| s.id == o.id))
            .count();
        assert_eq!(survivors, 3);
        assert_eq!(buffer.samples().last().map(|s| s.id), Some(newcomer.id));
    }

    #[test]
    fn gradient_eviction_and_top_n() {
        let mut buffer = MemoryBuffer::with_seed(3, PolicyKind::GradientBased, 3).unwrap();
        for g in [0.3, 0.9, 0.1] {
            buffer.insert(MemorySample::new(json!(g)).with_gradient_magnitude(g));
        }
        assert_eq!(
            buffer
                .insert(MemorySample::new(json!(0.05)).with_gradient_magnitude(0.05))
                .items_processed,
            0
        );
        buffer.insert(MemorySample::new(json!(0.5)).with_gradient_magnitude(0.5));

        let batch = buffer.sample(2, None);
        let picked: Vec<f64> = batch.samples.iter().map(|s| s.gradient_score()).collect();
        assert_eq!(picked, vec![0.9, 0.5]);
    }

    #[test]
    fn cluster_eviction_targets_largest_cluster() {
        let mut buffer = MemoryBuffer::with_seed(4, PolicyKind::ClusterBased, 5).unwrap();
        buffer.insert(MemorySample::new(json!("a1")).with_cluster(1));
        buffer.insert(MemorySample::new(json!("b1")).with_cluster(2));
        buffer.insert(MemorySample::new(json!("b2")).with_cluster(2));
        buffer.insert(MemorySample::new(json!("b3")).with_cluster(2));

        buffer.insert(MemorySample::new(json!("c1")).with_cluster(3));

        let stats = buffer.stats();
        assert_eq!(stats.cluster_distribution.get(&2), Some(&2));
        assert_eq!(stats.cluster_distribution.get(&3), Some(&1));
        // the oldest member of cluster 2 went
        assert!(buffer.samples().iter().all(|s| s.payload != json!("b1")));
    }

    #[test]
    fn cluster_without_tags_falls_back_to_random() {
        let mut buffer = MemoryBuffer::with_seed(2, PolicyKind::ClusterBased, 9).unwrap();
        buffer.insert(MemorySample::new(json!(1)));
        buffer.insert(MemorySample::new(json!(2)));
        let result = buffer.insert(MemorySample::new(json!(3)));
        assert_eq!(result.items_processed, 1);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.stats().evictions, 1);
    }

    #[test]
    fn sample_caps_at_size_and_handles_empty() {
        let mut buffer = MemoryBuffer::with_seed(10, PolicyKind::Random, 11).unwrap();
        let empty = buffer.sample(5, None);
        assert!(empty.samples.is_empty());
        assert!(empty.result.success);
        assert_eq!(empty.result.items_processed, 0);

        buffer.insert_batch((0..3).map(|i| MemorySample::new(json!(i))));
        let batch = buffer.sample(50, None);
        assert_eq!(batch.samples.len(), 3);
        assert_eq!(batch.result.items_processed, 3);

        let mut ids: Vec<Uuid> = batch.samples.iter().map(|s| s.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn importance_sampling_with_zero_weight_falls_back_to_random() {
        let mut buffer = MemoryBuffer::with_seed(5, PolicyKind::Importance, 13).unwrap();
        buffer.insert_batch((0..5).map(|i| MemorySample::new(json!(i))));
        let batch = buffer.sample(4, Some(PolicyKind::Importance));
        assert_eq!(batch.samples.len(), 4);
    }

    #[test]
    fn sample_with_override_policy() {
        let mut buffer = MemoryBuffer::with_seed(4, PolicyKind::Random, 17).unwrap();
        for g in [0.2, 0.8, 0.4, 0.6] {
            buffer.insert(MemorySample::new(json!(g)).with_gradient_magnitude(g));
        }
        let batch = buffer.sample(1, Some(PolicyKind::GradientBased));
        assert_eq!(batch.samples[0].gradient_score(), 0.8);
        assert_eq!(buffer.policy(), PolicyKind::Random);
    }

    #[test]
    fn update_importance_changes_eviction_order() {
        let mut buffer = MemoryBuffer::with_seed(2, PolicyKind::Importance, 19).unwrap();
        let low = importance(1.0);
        let low_id = low.id;
        buffer.insert(low);
        buffer.insert(importance(2.0));

        assert!(buffer.update_importance(low_id, 10.0).success);
        buffer.insert(importance(3.0));
        assert!(buffer.samples().iter().any(|s| s.id == low_id));
        assert_eq!(importances(&buffer), vec![3.0, 10.0]);

        let missing = buffer.update_importance(Uuid::new_v4(), 1.0);
        assert!(!missing.success);
        assert!(missing.error.is_some());
    }

    #[test]
    fn clear_reports_removed() {
        let mut buffer = MemoryBuffer::with_seed(3, PolicyKind::Random, 23).unwrap();
        buffer.insert_batch((0..3).map(|i| MemorySample::new(json!(i))));
        let result = buffer.clear();
        assert_eq!(result.items_processed, 3);
        assert_eq!(result.buffer_size_after, 0);
        assert!(buffer.is_empty());
        assert!(buffer.check_integrity().is_ok());
    }

    #[test]
    fn importance_sampling_with_extreme_scores() {
        let mut buffer = MemoryBuffer::with_seed(3, PolicyKind::Importance, 29).unwrap();
        for score in [f64::MAX, f64::MAX, 1.0] {
            buffer.insert(importance(score));
        }
        let batch = buffer.sample(2, None);
        assert!(batch.result.success);
        assert_eq!(batch.samples.len(), 2);
    }
}
