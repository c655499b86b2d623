use super::SelectionCursor;
use crate::discovery::ServiceInstance;
use std::sync::Arc;

/// Weighted Round-Robin using prefix sum + modular counter.
///
/// Weights come from the `weight` metadata key (default 1). Over one cycle of
/// `total_weight` calls each instance is chosen exactly `weight` times.
pub struct WeightedRoundRobinBalancer {
    cursor: SelectionCursor,
}

impl Default for WeightedRoundRobinBalancer {
    fn default() -> Self {
        Self {
            cursor: SelectionCursor::default(),
        }
    }
}

impl WeightedRoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, service: &str, candidates: &[Arc<ServiceInstance>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let mut prefix_sum = Vec::with_capacity(candidates.len());
        let mut sum: u64 = 0;
        for inst in candidates {
            sum += inst.weight().max(1) as u64;
            prefix_sum.push(sum);
        }
        let target = self.cursor.advance(service, candidates) % sum;
        Some(prefix_sum.partition_point(|&s| s <= target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceDefinition;
    use crate::discovery::ServiceRegistry;
    use std::collections::HashMap;

    fn weighted(weights: &[u32]) -> Vec<Arc<ServiceInstance>> {
        let reg = ServiceRegistry::default();
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let def = ServiceDefinition::new("svc", "127.0.0.1", 7000 + i as u16)
                    .with_metadata("weight", w.to_string());
                let id = reg.register(def).unwrap();
                reg.get(&id).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_weighted() {
        let lb = WeightedRoundRobinBalancer::new();
        let list = weighted(&[2, 3]);
        let mut counts = HashMap::new();
        for _ in 0..5000 {
            let i = lb.select("svc", &list).unwrap();
            *counts.entry(i).or_insert(0) += 1;
        }
        assert_eq!(counts[&0], 2000);
        assert_eq!(counts[&1], 3000);
    }

    #[test]
    fn test_cycle_order() {
        let lb = WeightedRoundRobinBalancer::new();
        let list = weighted(&[1, 2]);
        let seq: Vec<usize> = (0..6).map(|_| lb.select("svc", &list).unwrap()).collect();
        assert_eq!(seq, vec![0, 1, 1, 0, 1, 1]);
    }

    #[test]
    fn test_default_weight_is_uniform() {
        let lb = WeightedRoundRobinBalancer::new();
        let list = crate::upstream::loadbalance::tests::instances(3);
        let seq: Vec<usize> = (0..6).map(|_| lb.select("svc", &list).unwrap()).collect();
        assert_eq!(seq, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_empty() {
        let lb = WeightedRoundRobinBalancer::new();
        assert!(lb.select("svc", &[]).is_none());
    }
}
