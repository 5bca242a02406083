//! Strategies pick one instance out of the filtered candidates.

use crate::registry::Service;
use rand::Rng;
use std::sync::Arc;

/// Picks one candidate. Returns `None` only for an empty slice.
pub type Strategy = Arc<dyn Fn(&[Service]) -> Option<Service> + Send + Sync>;

/// Uniformly random choice.
pub fn random() -> Strategy {
    Arc::new(|services: &[Service]| {
        if services.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..services.len());
        services.get(index).cloned()
    })
}

/// Always the first candidate.
pub fn first() -> Strategy {
    Arc::new(|services: &[Service]| services.first().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services(n: usize) -> Vec<Service> {
        (0..n)
            .map(|i| Service {
                address: format!("10.0.0.{}:1", i),
                ..Service::default()
            })
            .collect()
    }

    #[test]
    fn test_random_picks_a_member() {
        let candidates = services(5);
        let pick = random();
        for _ in 0..50 {
            let chosen = pick(&candidates).unwrap();
            assert!(candidates.iter().any(|s| s.address == chosen.address));
        }
        assert!(pick(&[]).is_none());
    }

    #[test]
    fn test_first() {
        assert_eq!(first()(&services(3)).unwrap().address, "10.0.0.0:1");
    }
}
