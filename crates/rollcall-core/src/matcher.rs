use crate::capability::{MatchCandidate, Matcher};
use crate::config::DEFAULT_MATCH_TOLERANCE;
use crate::types::{Embedding, KnownFace};

/// Euclidean nearest-neighbour matcher.
///
/// Distance is the L2 norm between encodings; a face matches when its nearest
/// roster entry lies at or below `tolerance`. Lower tolerance is stricter.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tolerance: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_MATCH_TOLERANCE,
        }
    }
}

impl EuclideanMatcher {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }
}

impl Matcher for EuclideanMatcher {
    fn nearest(&self, embedding: &Embedding, known: &[KnownFace]) -> Option<MatchCandidate> {
        let mut best: Option<(usize, f32)> = None;

        for (index, face) in known.iter().enumerate() {
            // Encodings from a different model cannot be compared
            let Some(distance) = euclidean_distance(&embedding.values, &face.embedding.values)
            else {
                continue;
            };
            if !distance.is_finite() {
                continue;
            }
            let is_better = match best {
                None => true,
                Some((_, d)) => distance < d,
            };
            if is_better {
                best = Some((index, distance));
            }
        }

        best.map(|(index, distance)| MatchCandidate {
            index,
            distance,
            is_match: distance <= self.tolerance,
        })
    }
}

/// L2 distance, or `None` when the lengths differ.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let sum: f32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum();
    Some(sum.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(id: &str, values: Vec<f32>) -> KnownFace {
        KnownFace {
            id: id.to_string(),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_distance_known_geometry() {
        // 3-4-5 triangle
        let d = euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]).unwrap();
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_length_mismatch() {
        assert!(euclidean_distance(&[0.0, 0.0], &[1.0]).is_none());
    }

    #[test]
    fn test_empty_roster() {
        let matcher = EuclideanMatcher::default();
        assert!(matcher.nearest(&Embedding::new(vec![0.0; 4]), &[]).is_none());
    }

    #[test]
    fn test_picks_nearest_and_accepts_within_tolerance() {
        let matcher = EuclideanMatcher::default();
        let roster = vec![
            face("S001", vec![1.0, 0.0, 0.0]),
            face("S002", vec![0.0, 1.0, 0.0]),
            face("S003", vec![0.0, 0.0, 1.0]),
        ];
        let probe = Embedding::new(vec![0.1, 0.9, 0.0]);
        let candidate = matcher.nearest(&probe, &roster).unwrap();
        assert_eq!(candidate.index, 1);
        assert!(candidate.is_match);
        assert!(candidate.distance < 0.2);
    }

    #[test]
    fn test_nearest_beyond_tolerance_is_not_a_match() {
        let matcher = EuclideanMatcher::new(0.5);
        let roster = vec![face("S001", vec![1.0, 0.0])];
        let candidate = matcher
            .nearest(&Embedding::new(vec![0.0, 1.0]), &roster)
            .unwrap();
        assert_eq!(candidate.index, 0);
        assert!(!candidate.is_match);
    }

    #[test]
    fn test_tolerance_is_inclusive() {
        let matcher = EuclideanMatcher::new(1.0);
        let roster = vec![face("S001", vec![1.0, 0.0])];
        let candidate = matcher
            .nearest(&Embedding::new(vec![0.0, 0.0]), &roster)
            .unwrap();
        assert!(candidate.is_match);
    }

    #[test]
    fn test_skips_incomparable_entries() {
        let matcher = EuclideanMatcher::default();
        let roster = vec![
            face("legacy", vec![0.0; 2]),
            face("S001", vec![0.0, 0.0, 0.0]),
        ];
        let candidate = matcher
            .nearest(&Embedding::new(vec![0.0, 0.0, 0.1]), &roster)
            .unwrap();
        assert_eq!(candidate.index, 1);
    }
}
