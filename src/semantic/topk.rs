//! Capacity-limited ranked accumulator.

/// A scored match produced by a search.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct MatchResult {
    /// Photo ID
    pub photo_id: u64,
    /// Cosine similarity score
    pub score: f32,
}

/// Keeps the `capacity` highest-scoring entries, sorted by score descending.
///
/// Entries with equal scores keep the order in which they were offered.
#[derive(Debug, Clone)]
pub struct BoundedTopK {
    entries: Vec<MatchResult>,
    capacity: usize,
}

impl BoundedTopK {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Lowest retained score, if any.
    pub fn min_score(&self) -> Option<f32> {
        self.entries.last().map(|m| m.score)
    }

    /// Offer a candidate. Returns true if it was retained.
    ///
    /// The candidate is placed before the first entry with a strictly lower
    /// score. When the accumulator is full, the last entry is evicted.
    pub fn offer(&mut self, photo_id: u64, score: f32) -> bool {
        if self.capacity == 0 || score.is_nan() {
            return false;
        }

        let candidate = MatchResult { photo_id, score };
        match self.entries.iter().position(|m| m.score < score) {
            Some(index) => {
                self.entries.insert(index, candidate);
                if self.entries.len() > self.capacity {
                    self.entries.pop();
                }
                true
            }
            None if !self.is_full() => {
                self.entries.push(candidate);
                true
            }
            None => false,
        }
    }

    /// Fold another accumulator into this one.
    ///
    /// When `other` holds candidates that were offered after everything in
    /// `self`, the result equals offering all of them to a single accumulator.
    pub fn merge(&mut self, other: BoundedTopK) {
        for m in other.entries {
            // Entries arrive in descending order, so the first rejection
            // means nothing after it can be retained either.
            if !self.offer(m.photo_id, m.score) {
                break;
            }
        }
    }

    /// Retained photo IDs, highest score first.
    pub fn to_ordered_ids(&self) -> Vec<u64> {
        self.entries.iter().map(|m| m.photo_id).collect()
    }

    pub fn matches(&self) -> &[MatchResult] {
        &self.entries
    }

    pub fn into_matches(self) -> Vec<MatchResult> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_descending(topk: &BoundedTopK) -> bool {
        topk.matches().windows(2).all(|w| w[0].score >= w[1].score)
    }

    #[test]
    fn test_eviction_scenario() {
        let mut topk = BoundedTopK::new(2);
        topk.offer(1, 0.9);
        topk.offer(2, 0.5);
        topk.offer(3, 0.8);

        assert_eq!(topk.to_ordered_ids(), vec![1, 3]);
    }

    #[test]
    fn test_appends_when_not_full() {
        let mut topk = BoundedTopK::new(3);
        assert!(topk.offer(1, 0.9));
        assert!(topk.offer(2, 0.1));
        assert!(topk.offer(3, 0.05));
        assert_eq!(topk.to_ordered_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_full_rejects_lower_or_equal_minimum() {
        let mut topk = BoundedTopK::new(2);
        topk.offer(1, 0.9);
        topk.offer(2, 0.5);

        assert!(!topk.offer(3, 0.4));
        assert!(!topk.offer(4, 0.5));
        assert_eq!(topk.to_ordered_ids(), vec![1, 2]);
        assert_eq!(topk.min_score(), Some(0.5));
    }

    #[test]
    fn test_ties_keep_offer_order() {
        let mut topk = BoundedTopK::new(4);
        topk.offer(10, 0.7);
        topk.offer(11, 0.7);
        topk.offer(12, 0.9);
        topk.offer(13, 0.7);

        assert_eq!(topk.to_ordered_ids(), vec![12, 10, 11, 13]);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut topk = BoundedTopK::new(5);
        // Deterministic pseudo-random scores
        let mut x: u32 = 12345;
        for id in 0..500u64 {
            x = x.wrapping_mul(1103515245).wrapping_add(12345);
            let score = (x % 1000) as f32 / 1000.0;
            topk.offer(id, score);
            assert!(topk.len() <= 5);
            assert!(is_descending(&topk));
        }
        assert_eq!(topk.len(), 5);
    }

    #[test]
    fn test_zero_capacity_and_nan() {
        let mut topk = BoundedTopK::new(0);
        assert!(!topk.offer(1, 1.0));
        assert!(topk.is_empty());

        let mut topk = BoundedTopK::new(3);
        assert!(!topk.offer(1, f32::NAN));
        assert!(topk.is_empty());
    }

    #[test]
    fn test_merge_matches_sequential_offers() {
        let scores: Vec<(u64, f32)> = vec![
            (1, 0.3),
            (2, 0.8),
            (3, 0.8),
            (4, 0.1),
            (5, 0.95),
            (6, 0.8),
            (7, 0.3),
            (8, 0.6),
        ];

        let mut sequential = BoundedTopK::new(4);
        for (id, score) in &scores {
            sequential.offer(*id, *score);
        }

        let mut merged = BoundedTopK::new(4);
        for chunk in scores.chunks(3) {
            let mut local = BoundedTopK::new(4);
            for (id, score) in chunk {
                local.offer(*id, *score);
            }
            merged.merge(local);
        }

        assert_eq!(merged.to_ordered_ids(), sequential.to_ordered_ids());
        assert_eq!(merged.to_ordered_ids(), vec![5, 2, 3, 6]);
    }
}
