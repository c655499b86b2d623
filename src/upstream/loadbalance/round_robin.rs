use super::SelectionCursor;
use crate::discovery::ServiceInstance;
use std::sync::Arc;

/// Plain cyclic rotation: call `i` on a stable set returns `candidates[i % len]`.
pub struct RoundRobinBalancer {
    cursor: SelectionCursor,
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self {
            cursor: SelectionCursor::default(),
        }
    }
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, service: &str, candidates: &[Arc<ServiceInstance>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let pos = self.cursor.advance(service, candidates);
        Some((pos % candidates.len() as u64) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::loadbalance::tests::instances;
    use std::collections::HashMap;

    #[test]
    fn test_uniform() {
        let lb = RoundRobinBalancer::new();
        let list = instances(2);
        let mut counts = HashMap::new();
        for _ in 0..1000 {
            let i = lb.select("svc", &list).unwrap();
            *counts.entry(i).or_insert(0) += 1;
        }
        assert_eq!(counts[&0], 500);
        assert_eq!(counts[&1], 500);
    }

    #[test]
    fn test_services_rotate_independently() {
        let lb = RoundRobinBalancer::new();
        let list = instances(3);
        assert_eq!(lb.select("a", &list), Some(0));
        assert_eq!(lb.select("a", &list), Some(1));
        assert_eq!(lb.select("b", &list), Some(0));
        assert_eq!(lb.select("a", &list), Some(2));
    }

    #[test]
    fn test_empty() {
        let lb = RoundRobinBalancer::new();
        assert!(lb.select("svc", &[]).is_none());
    }

    #[test]
    fn test_single() {
        let lb = RoundRobinBalancer::new();
        let list = instances(1);
        for _ in 0..100 {
            assert_eq!(lb.select("svc", &list), Some(0));
        }
    }
}
