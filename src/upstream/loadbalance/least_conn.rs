use crate::discovery::ServiceInstance;
use std::sync::Arc;

/// Fewest active connections wins; ties go to the earliest registration.
pub struct LeastConnBalancer;

impl LeastConnBalancer {
    pub fn select(&self, candidates: &[Arc<ServiceInstance>]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.active_connections()
                    .cmp(&b.active_connections())
                    .then_with(|| a.seq().cmp(&b.seq()))
            })
            .map(|(idx, _)| idx)
    }
}
