//! Eviction and sampling policies, one implementation per variant.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::memory::sample::MemorySample;

/// Policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Random,
    Importance,
    GradientBased,
    ClusterBased,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Importance => "importance",
            Self::GradientBased => "gradient_based",
            Self::ClusterBased => "cluster_based",
        }
    }
}

impl FromStr for PolicyKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "random" => Ok(Self::Random),
            "importance" => Ok(Self::Importance),
            "gradient" | "gradient_based" => Ok(Self::GradientBased),
            "cluster" | "cluster_based" => Ok(Self::ClusterBased),
            _ => Err(ValidationError::UnknownReplayPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a full buffer does with an incoming sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Evict the sample at this index and keep the incoming one.
    Replace(usize),
    /// Drop the incoming sample.
    Reject,
}

/// Eviction and sampling behaviour of one policy.
///
/// `samples` is always the buffer contents in insertion order.
pub trait ReplayPolicy: Send + Sync + fmt::Debug {
    fn kind(&self) -> PolicyKind;

    /// Decide admission for `incoming` into a full, non-empty buffer.
    fn on_full(
        &self,
        samples: &[MemorySample],
        incoming: &MemorySample,
        rng: &mut StdRng,
    ) -> Admission;

    /// Pick `n` distinct indices, `n <= samples.len()`.
    fn select(&self, samples: &[MemorySample], n: usize, rng: &mut StdRng) -> Vec<usize>;
}

/// Build the policy for `kind`.
pub fn policy_for(kind: PolicyKind) -> Box<dyn ReplayPolicy> {
    match kind {
        PolicyKind::Random => Box::new(RandomPolicy),
        PolicyKind::Importance => Box::new(ImportancePolicy),
        PolicyKind::GradientBased => Box::new(GradientPolicy),
        PolicyKind::ClusterBased => Box::new(ClusterPolicy),
    }
}

/// Uniform eviction, uniform sampling without replacement.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomPolicy;

impl ReplayPolicy for RandomPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Random
    }

    fn on_full(
        &self,
        samples: &[MemorySample],
        _incoming: &MemorySample,
        rng: &mut StdRng,
    ) -> Admission {
        Admission::Replace(rng.gen_range(0..samples.len()))
    }

    fn select(&self, samples: &[MemorySample], n: usize, rng: &mut StdRng) -> Vec<usize> {
        rand::seq::index::sample(rng, samples.len(), n).into_vec()
    }
}

/// Replace-if-greater on importance, importance-weighted sampling.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportancePolicy;

impl ReplayPolicy for ImportancePolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Importance
    }

    fn on_full(
        &self,
        samples: &[MemorySample],
        incoming: &MemorySample,
        _rng: &mut StdRng,
    ) -> Admission {
        replace_if_greater(samples, incoming, MemorySample::importance_score)
    }

    fn select(&self, samples: &[MemorySample], n: usize, rng: &mut StdRng) -> Vec<usize> {
        let weights: Vec<f64> = samples
            .iter()
            .map(|s| s.importance_score().max(0.0))
            .collect();
        if !weights.iter().any(|&w| w > 0.0) {
            return RandomPolicy.select(samples, n, rng);
        }
        weighted_without_replacement(weights, n, rng)
    }
}

/// Replace-if-greater on gradient magnitude, top-n selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientPolicy;

impl ReplayPolicy for GradientPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::GradientBased
    }

    fn on_full(
        &self,
        samples: &[MemorySample],
        incoming: &MemorySample,
        _rng: &mut StdRng,
    ) -> Admission {
        replace_if_greater(samples, incoming, MemorySample::gradient_score)
    }

    fn select(&self, samples: &[MemorySample], n: usize, _rng: &mut StdRng) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..samples.len()).collect();
        // stable: equal magnitudes keep insertion order
        indices.sort_by(|&a, &b| {
            samples[b]
                .gradient_score()
                .total_cmp(&samples[a].gradient_score())
        });
        indices.truncate(n);
        indices
    }
}

/// Evict from the most represented cluster, round-robin sampling.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterPolicy;

impl ReplayPolicy for ClusterPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::ClusterBased
    }

    fn on_full(
        &self,
        samples: &[MemorySample],
        incoming: &MemorySample,
        rng: &mut StdRng,
    ) -> Admission {
        // cluster -> (count, oldest index)
        let mut clusters: BTreeMap<u32, (usize, usize)> = BTreeMap::new();
        for (idx, sample) in samples.iter().enumerate() {
            if let Some(cluster) = sample.cluster_id {
                clusters.entry(cluster).or_insert((0, idx)).0 += 1;
            }
        }

        let mut largest: Option<(usize, usize)> = None;
        for &(count, oldest) in clusters.values() {
            if largest.is_none_or(|(best, _)| count > best) {
                largest = Some((count, oldest));
            }
        }

        match largest {
            Some((_, oldest)) => Admission::Replace(oldest),
            None => RandomPolicy.on_full(samples, incoming, rng),
        }
    }

    fn select(&self, samples: &[MemorySample], n: usize, _rng: &mut StdRng) -> Vec<usize> {
        let mut tagged: BTreeMap<u32, VecDeque<usize>> = BTreeMap::new();
        let mut untagged = VecDeque::new();
        for (idx, sample) in samples.iter().enumerate() {
            match sample.cluster_id {
                Some(cluster) => tagged.entry(cluster).or_default().push_back(idx),
                None => untagged.push_back(idx),
            }
        }

        let mut groups: Vec<VecDeque<usize>> = tagged.into_values().collect();
        if !untagged.is_empty() {
            groups.push(untagged);
        }

        let mut picked = Vec::with_capacity(n);
        while picked.len() < n {
            let mut progressed = false;
            for group in groups.iter_mut() {
                if picked.len() == n {
                    break;
                }
                if let Some(idx) = group.pop_front() {
                    picked.push(idx);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        picked
    }
}

fn replace_if_greater(
    samples: &[MemorySample],
    incoming: &MemorySample,
    score: fn(&MemorySample) -> f64,
) -> Admission {
    let lowest = samples
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| score(a).total_cmp(&score(b)));

    match lowest {
        Some((idx, existing)) if score(incoming) > score(existing) => Admission::Replace(idx),
        _ => Admission::Reject,
    }
}

/// Sequential weighted draws. Once the remaining weight is exhausted the
/// rest are drawn uniformly from what is left.
fn weighted_without_replacement(mut weights: Vec<f64>, n: usize, rng: &mut StdRng) -> Vec<usize> {
    // Scale into [0, 1] so the running total cannot overflow to infinity.
    let max = weights.iter().copied().fold(0.0_f64, f64::max);
    if max > 0.0 {
        for w in &mut weights {
            *w /= max;
        }
    }
    let mut remaining: Vec<usize> = (0..weights.len()).collect();
    let mut picked = Vec::with_capacity(n);

    while picked.len() < n && !remaining.is_empty() {
        let total: f64 = remaining.iter().map(|&i| weights[i]).sum();
        let position = if total > 0.0 {
            let mut target = rng.gen_range(0.0..total);
            let mut chosen = None;
            for (pos, &i) in remaining.iter().enumerate() {
                if weights[i] <= 0.0 {
                    continue;
                }
                if target < weights[i] {
                    chosen = Some(pos);
                    break;
                }
                target -= weights[i];
            }
            // rounding can walk past the end; take the last weighted entry
            chosen.unwrap_or_else(|| {
                remaining
                    .iter()
                    .rposition(|&i| weights[i] > 0.0)
                    .unwrap_or(remaining.len() - 1)
            })
        } else {
            rng.gen_range(0..remaining.len())
        };

        let idx = remaining.swap_remove(position);
        weights[idx] = 0.0;
        picked.push(idx);
    }
    picked
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use serde_json::json;

    use super::*;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn scored(importance: f64) -> MemorySample {
        MemorySample::new(json!(importance)).with_importance(importance)
    }

    #[test]
    fn parse_policy_names() {
        assert_eq!("gradient".parse::<PolicyKind>().unwrap(), PolicyKind::GradientBased);
        assert_eq!("Cluster-Based".parse::<PolicyKind>().unwrap(), PolicyKind::ClusterBased);
        assert!("lifo".parse::<PolicyKind>().is_err());
    }

    #[test]
    fn importance_rejects_ties() {
        let samples = vec![scored(1.0), scored(2.0)];
        assert_eq!(
            ImportancePolicy.on_full(&samples, &scored(1.0), &mut rng()),
            Admission::Reject
        );
        assert_eq!(
            ImportancePolicy.on_full(&samples, &scored(1.5), &mut rng()),
            Admission::Replace(0)
        );
    }

    #[test]
    fn weighted_sampling_never_picks_zero_weight_while_weight_remains() {
        let samples = vec![scored(0.0), scored(5.0), scored(0.0), scored(3.0)];
        let mut rng = rng();
        for _ in 0..50 {
            let mut picked = ImportancePolicy.select(&samples, 2, &mut rng);
            picked.sort_unstable();
            assert_eq!(picked, vec![1, 3]);
        }
    }

    #[test]
    fn weighted_sampling_fills_from_zero_weight_tail() {
        let samples = vec![scored(0.0), scored(5.0), scored(0.0)];
        let mut picked = ImportancePolicy.select(&samples, 3, &mut rng());
        assert_eq!(picked[0], 1);
        picked.sort_unstable();
        assert_eq!(picked, vec![0, 1, 2]);
    }

    #[test]
    fn weighted_sampling_survives_huge_importances() {
        let samples = vec![scored(f64::MAX), scored(f64::MAX), scored(1.0)];
        let mut picked = ImportancePolicy.select(&samples, 2, &mut rng());
        picked.sort_unstable();
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|&i| i < 3));
    }

    #[test]
    fn infinite_importance_counts_as_zero() {
        let samples = vec![scored(f64::INFINITY), scored(2.0)];
        assert_eq!(samples[0].importance_score(), 0.0);
        let picked = ImportancePolicy.select(&samples, 1, &mut rng());
        assert_eq!(picked, vec![1]);
    }

    #[test]
    fn cluster_round_robin_order() {
        let samples = vec![
            MemorySample::new(json!(0)).with_cluster(2),
            MemorySample::new(json!(1)).with_cluster(2),
            MemorySample::new(json!(2)).with_cluster(1),
            MemorySample::new(json!(3)),
            MemorySample::new(json!(4)).with_cluster(2),
        ];
        let picked = ClusterPolicy.select(&samples, 5, &mut rng());
        // cluster 1, cluster 2, untagged, then cluster 2 again
        assert_eq!(picked, vec![2, 0, 3, 1, 4]);
    }

    #[test]
    fn cluster_eviction_prefers_smallest_id_on_tie() {
        let samples = vec![
            MemorySample::new(json!(0)).with_cluster(9),
            MemorySample::new(json!(1)).with_cluster(4),
            MemorySample::new(json!(2)).with_cluster(9),
            MemorySample::new(json!(3)).with_cluster(4),
        ];
        let incoming = MemorySample::new(json!(4)).with_cluster(1);
        assert_eq!(
            ClusterPolicy.on_full(&samples, &incoming, &mut rng()),
            Admission::Replace(1)
        );
    }
}
