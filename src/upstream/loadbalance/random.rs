use crate::discovery::ServiceInstance;
use rand::Rng;
use std::sync::Arc;

/// Uniform random choice.
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn select(&self, candidates: &[Arc<ServiceInstance>]) -> Option<usize> {
        match candidates.len() {
            0 => None,
            1 => Some(0),
            len => Some(rand::thread_rng().gen_range(0..len)),
        }
    }
}
