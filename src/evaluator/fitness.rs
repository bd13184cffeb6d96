// src/evaluator/fitness.rs - Objective-to-fitness transforms

use serde::Serialize;

/// Turns a raw objective (lower is better) into a fitness (higher is better).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FitnessTransform {
    /// `1 / objective`, used by the population searches.
    Reciprocal,
    /// `baseline - objective`, the tree search reward.
    Improvement { baseline: f64 },
}

impl FitnessTransform {
    pub fn apply(&self, objective: f64) -> f64 {
        match *self {
            FitnessTransform::Reciprocal => 1.0 / objective.max(f64::MIN_POSITIVE),
            FitnessTransform::Improvement { baseline } => baseline - objective,
        }
    }

    /// Sentinel fitness for a candidate whose evaluation failed.
    pub fn worst(&self) -> f64 {
        match *self {
            FitnessTransform::Reciprocal => 0.0,
            FitnessTransform::Improvement { baseline } => -baseline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Evaluation {
    pub objective: f64,
    pub fitness: f64,
}

impl Evaluation {
    pub fn scored(objective: f64, transform: FitnessTransform) -> Self {
        Self {
            objective,
            fitness: transform.apply(objective),
        }
    }

    /// A failed candidate: infinitely bad objective, sentinel fitness.
    pub fn failed(transform: FitnessTransform) -> Self {
        Self {
            objective: f64::INFINITY,
            fitness: transform.worst(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.objective.is_infinite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reciprocal_orders_inversely() {
        let t = FitnessTransform::Reciprocal;
        assert!(t.apply(50.0) > t.apply(60.0));
        assert!((t.apply(4.0) - 0.25).abs() < 1e-12);
        assert!(t.apply(0.0).is_finite());
    }

    #[test]
    fn test_worst_is_below_any_real_score() {
        let t = FitnessTransform::Reciprocal;
        assert!(t.worst() < t.apply(1e9));

        let t = FitnessTransform::Improvement { baseline: 80.0 };
        assert_eq!(t.apply(70.0), 10.0);
        assert_eq!(t.worst(), -80.0);
        assert!(t.worst() <= t.apply(160.0));
    }

    #[test]
    fn test_failed_evaluation() {
        let e = Evaluation::failed(FitnessTransform::Reciprocal);
        assert!(e.is_failure());
        assert_eq!(e.fitness, 0.0);
        assert!(!Evaluation::scored(3.0, FitnessTransform::Reciprocal).is_failure());
    }
}
