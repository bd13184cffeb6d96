// src/search/space.rs - Road segments, configurations and their invariants

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use rand::Rng;
use serde::Serialize;

use crate::infra::config::SpaceConfig;
use crate::infra::errors::SearchError;

/// A set of closed road segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Configuration(BTreeSet<usize>);

impl Configuration {
    pub fn from_segments(segments: impl IntoIterator<Item = usize>) -> Self {
        Self(segments.into_iter().collect())
    }

    /// Segments marked `true` in a full-universe mask.
    pub fn from_mask(mask: &[bool]) -> Self {
        Self(
            mask.iter()
                .enumerate()
                .filter_map(|(i, closed)| closed.then_some(i))
                .collect(),
        )
    }

    /// This configuration plus one more closed segment.
    pub fn with(&self, segment: usize) -> Self {
        let mut next = self.0.clone();
        next.insert(segment);
        Self(next)
    }

    pub fn contains(&self, segment: usize) -> bool {
        self.0.contains(&segment)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ascending segment ids.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    pub fn to_mask(&self, universe: usize) -> Vec<bool> {
        let mut mask = vec![false; universe];
        for &s in self.0.iter().filter(|&&s| s < universe) {
            mask[s] = true;
        }
        mask
    }
}

/// Renders as a list literal, `[3, 10, 11]`.
impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, s) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{s}")?;
        }
        f.write_str("]")
    }
}

/// The segment universe with its always-closed and never-closed subsets.
#[derive(Debug, Clone)]
pub struct SegmentSpace {
    universe: usize,
    baseline: BTreeSet<usize>,
    forbidden: BTreeSet<usize>,
}

impl SegmentSpace {
    pub fn new(
        universe: usize,
        baseline: impl IntoIterator<Item = usize>,
        forbidden: impl IntoIterator<Item = usize>,
    ) -> Result<Self, SearchError> {
        let baseline: BTreeSet<usize> = baseline.into_iter().collect();
        let forbidden: BTreeSet<usize> = forbidden.into_iter().collect();

        if universe == 0 {
            return Err(SearchError::Config("segment universe is empty".into()));
        }
        if let Some(s) = baseline.iter().chain(forbidden.iter()).find(|&&s| s >= universe) {
            return Err(SearchError::Config(format!(
                "segment {s} is outside the universe of {universe}"
            )));
        }
        if let Some(s) = baseline.intersection(&forbidden).next() {
            return Err(SearchError::Config(format!(
                "segment {s} is both baseline and forbidden"
            )));
        }

        Ok(Self {
            universe,
            baseline,
            forbidden,
        })
    }

    pub fn from_config(config: &SpaceConfig) -> Result<Self, SearchError> {
        Self::new(
            config.universe,
            config.baseline.iter().copied(),
            config.forbidden.iter().copied(),
        )
    }

    pub fn universe(&self) -> usize {
        self.universe
    }

    pub fn baseline(&self) -> &BTreeSet<usize> {
        &self.baseline
    }

    pub fn forbidden(&self) -> &BTreeSet<usize> {
        &self.forbidden
    }

    /// The configuration every search starts from: exactly the baseline.
    pub fn root(&self) -> Configuration {
        Configuration(self.baseline.clone())
    }

    /// In range, contains the baseline, avoids the forbidden set.
    pub fn is_admissible(&self, config: &Configuration) -> bool {
        config.iter().all(|s| s < self.universe && !self.forbidden.contains(&s))
            && self.baseline.iter().all(|&s| config.contains(s))
    }

    /// Whether a search may decide this segment's state.
    pub fn is_free(&self, segment: usize) -> bool {
        segment < self.universe
            && !self.baseline.contains(&segment)
            && !self.forbidden.contains(&segment)
    }

    /// Force baseline segments closed and forbidden ones open.
    pub fn enforce(&self, mask: &mut [bool]) {
        for &s in &self.baseline {
            if let Some(bit) = mask.get_mut(s) {
                *bit = true;
            }
        }
        for &s in &self.forbidden {
            if let Some(bit) = mask.get_mut(s) {
                *bit = false;
            }
        }
    }

    /// Each free segment closed independently with probability `p`.
    pub fn random_mask<R: Rng>(&self, rng: &mut R, p: f64) -> Vec<bool> {
        let mut mask: Vec<bool> = (0..self.universe).map(|_| rng.gen_bool(p)).collect();
        self.enforce(&mut mask);
        mask
    }

    /// Configuration for a mask, after enforcing the invariants.
    pub fn configuration(&self, mask: &[bool]) -> Configuration {
        let mut mask = mask.to_vec();
        mask.resize(self.universe, false);
        self.enforce(&mut mask);
        Configuration::from_mask(&mask)
    }

    /// Keep the candidates that are free and not yet closed in `config`,
    /// first occurrence order, no duplicates.
    pub fn legal_actions(
        &self,
        config: &Configuration,
        candidates: impl IntoIterator<Item = usize>,
    ) -> Vec<usize> {
        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|&s| self.is_free(s) && !config.contains(s) && seen.insert(s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const NONE: [usize; 0] = [];

    fn space() -> SegmentSpace {
        SegmentSpace::new(10, [1, 2], [7]).unwrap()
    }

    #[test]
    fn test_rejects_overlap_and_out_of_range() {
        assert!(SegmentSpace::new(10, [1], [1]).is_err());
        assert!(SegmentSpace::new(10, [10], NONE).is_err());
        assert!(SegmentSpace::new(0, NONE, NONE).is_err());
    }

    #[test]
    fn test_root_is_baseline() {
        let s = space();
        assert_eq!(s.root(), Configuration::from_segments([1, 2]));
        assert!(s.is_admissible(&s.root()));
    }

    #[test]
    fn test_admissibility() {
        let s = space();
        assert!(s.is_admissible(&Configuration::from_segments([1, 2, 5])));
        assert!(!s.is_admissible(&Configuration::from_segments([1, 5])));
        assert!(!s.is_admissible(&Configuration::from_segments([1, 2, 7])));
        assert!(!s.is_admissible(&Configuration::from_segments([1, 2, 12])));
    }

    #[test]
    fn test_mask_round_trip_and_display() {
        let c = Configuration::from_segments([3, 1, 2]);
        let mask = c.to_mask(5);
        assert_eq!(mask, vec![false, true, true, true, false]);
        assert_eq!(Configuration::from_mask(&mask), c);
        assert_eq!(c.to_string(), "[1, 2, 3]");
        assert_eq!(Configuration::default().to_string(), "[]");
    }

    #[test]
    fn test_enforce_overrides_mask() {
        let s = space();
        let mut mask = vec![true; 10];
        mask[1] = false;
        s.enforce(&mut mask);
        assert!(mask[1] && mask[2]);
        assert!(!mask[7]);
    }

    #[test]
    fn test_random_mask_is_admissible() {
        let s = space();
        let mut rng = StdRng::seed_from_u64(3);
        for p in [0.0, 0.5, 1.0] {
            let mask = s.random_mask(&mut rng, p);
            assert!(s.is_admissible(&s.configuration(&mask)));
        }
    }

    #[test]
    fn test_legal_actions_filters_and_dedups() {
        let s = space();
        let c = Configuration::from_segments([1, 2, 4]);
        let actions = s.legal_actions(&c, [4, 5, 1, 7, 5, 12, 3]);
        assert_eq!(actions, vec![5, 3]);
    }
}
