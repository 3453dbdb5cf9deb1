use std::collections::BTreeMap;

use arbiter_core::ResourceVector;

use super::{AllocationPolicy, PROPORTION_POLICY_NAME};

/// Weighted proportional share.
///
/// On every dimension, each queue deserves `floor(capacity * weight / sum(weights))`. Rounding
/// always goes down, so the sum of all shares never exceeds the capacity. The remainder is left
/// unassigned.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProportionPolicy;

impl AllocationPolicy for ProportionPolicy {
    fn name(&self) -> &'static str {
        PROPORTION_POLICY_NAME
    }

    fn compute(&self, weights: &BTreeMap<String, u32>, capacity: &ResourceVector) -> BTreeMap<String, ResourceVector> {
        let total: u128 = weights.values().map(|weight| effective_weight(*weight)).sum();
        if total == 0 {
            return BTreeMap::new();
        }
        weights
            .iter()
            .map(|(key, weight)| {
                let weight = effective_weight(*weight);
                let share = ResourceVector::new(share_of(capacity.cpu, weight, total), share_of(capacity.memory, weight, total));
                (key.clone(), share)
            })
            .collect()
    }
}

fn effective_weight(weight: u32) -> u128 {
    u128::from(weight.max(1))
}

/// Compute `floor(capacity * weight / total)` without overflow.
fn share_of(capacity: i64, weight: u128, total: u128) -> i64 {
    let capacity = capacity.max(0) as u128;
    // As weight <= total, the share never exceeds the capacity and always fits back into an i64.
    (capacity * weight / total) as i64
}

#[cfg(test)]
mod test {
    use super::*;

    const GI: i64 = 1 << 30;

    fn weights(input: &[(&str, u32)]) -> BTreeMap<String, u32> {
        input.iter().map(|(key, weight)| (key.to_string(), *weight)).collect()
    }

    fn total(shares: &BTreeMap<String, ResourceVector>) -> ResourceVector {
        shares.values().copied().sum()
    }

    #[test]
    fn two_queues_split_capacity_by_weight() {
        let capacity = ResourceVector::new(15_000, 15 * GI);
        let shares = ProportionPolicy.compute(&weights(&[("ns01", 1), ("ns02", 2)]), &capacity);

        assert!(shares.len() == 2, "unexpected number of shares, got {}, expected {}", shares.len(), 2);
        assert_eq!(shares.get("ns01"), Some(&ResourceVector::new(5_000, 5 * GI)));
        assert_eq!(shares.get("ns02"), Some(&ResourceVector::new(10_000, 10 * GI)));
    }

    #[test]
    fn new_queue_shrinks_existing_shares() {
        let capacity = ResourceVector::new(15_000, 15 * GI);
        let before = ProportionPolicy.compute(&weights(&[("ns01", 1), ("ns02", 2)]), &capacity);
        let after = ProportionPolicy.compute(&weights(&[("ns01", 1), ("ns02", 2), ("ns03", 2)]), &capacity);

        assert_eq!(after.get("ns01"), Some(&ResourceVector::new(3_000, 3 * GI)));
        assert_eq!(after.get("ns02"), Some(&ResourceVector::new(6_000, 6 * GI)));
        assert_eq!(after.get("ns03"), Some(&ResourceVector::new(6_000, 6 * GI)));
        for (key, share) in before.iter() {
            let new_share = after.get(key).copied().unwrap_or_default();
            assert!(new_share.is_under(share), "unexpected share growth for {}, got {}, expected at most {}", key, new_share, share);
        }
    }

    #[test]
    fn shares_never_exceed_capacity() {
        let capacities = [
            ResourceVector::new(0, 0),
            ResourceVector::new(1, 1),
            ResourceVector::new(7_001, 3 * GI + 17),
            ResourceVector::new(i64::MAX, i64::MAX),
        ];
        let weight_sets = [
            weights(&[("a", 1)]),
            weights(&[("a", 1), ("b", 1), ("c", 1)]),
            weights(&[("a", 3), ("b", 7), ("c", 11), ("d", 13)]),
            weights(&[("a", u32::MAX), ("b", u32::MAX), ("c", 1)]),
        ];
        for capacity in capacities.iter() {
            for input in weight_sets.iter() {
                let shares = ProportionPolicy.compute(input, capacity);
                let sum = total(&shares);
                assert!(sum.is_under(capacity), "unexpected over-allocation, got {}, expected at most {}", sum, capacity);
                assert!(shares.len() == input.len(), "unexpected number of shares, got {}, expected {}", shares.len(), input.len());
                assert!(
                    shares.values().all(|share| share.cpu >= 0 && share.memory >= 0),
                    "unexpected negative share in {:?}",
                    shares
                );
            }
        }
    }

    #[test]
    fn compute_is_deterministic() {
        let capacity = ResourceVector::new(9_999, 10 * GI + 3);
        let input = weights(&[("ns01", 2), ("ns02", 5), ("ns03", 1)]);
        let first = ProportionPolicy.compute(&input, &capacity);
        let second = ProportionPolicy.compute(&input, &capacity);
        assert_eq!(first, second);
    }

    #[test]
    fn zero_weight_counts_as_one() {
        let capacity = ResourceVector::new(10_000, 10 * GI);
        let shares = ProportionPolicy.compute(&weights(&[("ns01", 0), ("ns02", 1)]), &capacity);
        assert_eq!(shares.get("ns01"), shares.get("ns02"));
    }

    #[test]
    fn empty_input_produces_empty_output() {
        let shares = ProportionPolicy.compute(&BTreeMap::new(), &ResourceVector::new(15_000, 15 * GI));
        assert!(shares.is_empty(), "expected no shares, got {:?}", shares);
    }
}
