//! Pluggable `dataLocalityScore` strategies, selected at runtime
//! construction time (spec §4.4's "scheduling policy" knob).

use super::{LocalityScore, WorkerView};
use crate::types::TaskSpec;

/// Computes the data-locality component of a task/worker `Score`.
pub trait SchedulingPolicy: Send + Sync {
    fn data_locality_score(&self, spec: &TaskSpec, worker: &WorkerView) -> LocalityScore;
}

/// Ignores data locality entirely; placement is driven by priority and
/// resource fit alone. Matches spec's baseline policy.
pub struct FifoPolicy;

impl SchedulingPolicy for FifoPolicy {
    fn data_locality_score(&self, _spec: &TaskSpec, _worker: &WorkerView) -> LocalityScore {
        LocalityScore::default()
    }
}

/// Favors workers that already hold a copy of the task's read inputs,
/// scored as `sum(size_hint)` over resident read `Did`s (spec §4.4),
/// tiebroken by how many of the reads are resident.
pub struct DataPolicy;

impl SchedulingPolicy for DataPolicy {
    fn data_locality_score(&self, spec: &TaskSpec, worker: &WorkerView) -> LocalityScore {
        let reads: Vec<_> = spec
            .params
            .iter()
            .flat_map(|p| p.flatten_leaves())
            .filter(|p| p.direction.reads())
            .collect();
        score_over(reads.into_iter(), worker)
    }
}

/// Like `DataPolicy`, but additionally rewards workers that also hold
/// the task's write targets (anticipating downstream consumers placed
/// on the same host) — the full-graph-aware variant of spec §4.4.
pub struct FullGraphPolicy;

impl SchedulingPolicy for FullGraphPolicy {
    fn data_locality_score(&self, spec: &TaskSpec, worker: &WorkerView) -> LocalityScore {
        let leaves = spec.params.iter().flat_map(|p| p.flatten_leaves());
        score_over(leaves, worker)
    }
}

fn score_over<'a>(params: impl Iterator<Item = &'a crate::types::Parameter>, worker: &WorkerView) -> LocalityScore {
    let mut resident_bytes = 0.0;
    let mut resident_count = 0u32;
    for p in params {
        if worker.resident.contains(&p.access.did) {
            resident_bytes += p.size_hint as f64;
            resident_count += 1;
        }
    }
    LocalityScore { resident_bytes, resident_count }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{AppId, Did, WorkerId};
    use crate::types::{AccessMode, ParamType, Parameter, ResourceVector};
    use uuid::Uuid;

    fn worker_with_resident(dids: &[Did]) -> WorkerView {
        WorkerView {
            id: WorkerId("w".into()),
            kind: "cpu".into(),
            total: ResourceVector::default(),
            in_use: ResourceVector::default(),
            resident: dids.iter().copied().collect(),
            degraded: false,
        }
    }

    fn spec_with_reads(dids: &[Did]) -> TaskSpec {
        spec_with_sized_reads(&dids.iter().map(|d| (*d, 0u64)).collect::<Vec<_>>())
    }

    fn spec_with_sized_reads(dids: &[(Did, u64)]) -> TaskSpec {
        TaskSpec {
            app: AppId(Uuid::nil()),
            group: None,
            signature: "s".into(),
            implementations: vec![],
            params: dids
                .iter()
                .map(|(d, size)| {
                    let mut p = Parameter::new(*d, AccessMode::R, ParamType::File, "in");
                    p.size_hint = *size;
                    p
                })
                .collect(),
            priority: 0,
        }
    }

    #[test]
    fn fifo_ignores_locality() {
        let w = worker_with_resident(&[Did(1)]);
        let s = spec_with_reads(&[Did(1)]);
        assert_eq!(FifoPolicy.data_locality_score(&s, &w), LocalityScore::default());
    }

    #[test]
    fn data_policy_scores_byte_weighted_resident() {
        let w = worker_with_resident(&[Did(1)]);
        let s = spec_with_sized_reads(&[(Did(1), 100), (Did(2), 50)]);
        let score = DataPolicy.data_locality_score(&s, &w);
        assert_eq!(score.resident_bytes, 100.0);
        assert_eq!(score.resident_count, 1);
    }

    #[test]
    fn larger_resident_input_outscores_more_numerous_smaller_ones_s5() {
        // W1 holds D1 (larger); W2 holds D2 (smaller). A task reading both
        // must prefer W1 under the byte-weighted formula even though a
        // naive fraction-resident count would call both workers equal.
        let w1 = worker_with_resident(&[Did(1)]);
        let w2 = worker_with_resident(&[Did(2)]);
        let s = spec_with_sized_reads(&[(Did(1), 1_000), (Did(2), 10)]);
        let score1 = DataPolicy.data_locality_score(&s, &w1);
        let score2 = DataPolicy.data_locality_score(&s, &w2);
        assert!(score1 > score2, "byte-weighted locality must favor the larger resident input");
    }
}
