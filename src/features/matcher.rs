use super::Descriptor;

/// Lowe's ratio: a match survives only if it is clearly better than the
/// runner-up
pub const RATIO_THRESHOLD: f32 = 0.75;

/// Correspondence between a query descriptor and a train descriptor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
}

pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Strict ratio test: `best < ratio * second`
pub fn passes_ratio_test(best: f32, second: f32, ratio: f32) -> bool {
    best < ratio * second
}

/// Brute-force two-nearest-neighbour matching with ratio test.
///
/// Every query descriptor is compared against all train descriptors. Queries
/// for which fewer than two train descriptors exist are skipped.
pub fn match_descriptors(query: &[Descriptor], train: &[Descriptor], ratio: f32) -> Vec<Match> {
    if train.len() < 2 {
        return Vec::new();
    }

    let mut matches = Vec::new();
    for (qi, q) in query.iter().enumerate() {
        let mut best = (usize::MAX, u32::MAX);
        let mut second = u32::MAX;

        for (ti, t) in train.iter().enumerate() {
            let d = hamming_distance(q, t);
            if d < best.1 {
                second = best.1;
                best = (ti, d);
            } else if d < second {
                second = d;
            }
        }

        if passes_ratio_test(best.1 as f32, second as f32, ratio) {
            matches.push(Match {
                query_idx: qi,
                train_idx: best.0,
                distance: best.1,
            });
        }
    }

    tracing::debug!(
        "Matched {} of {} query descriptors",
        matches.len(),
        query.len()
    );
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Descriptor with the first `bits` bits set
    fn with_bits(bits: usize) -> Descriptor {
        let mut d = [0u8; 32];
        for i in 0..bits {
            d[i / 8] |= 1 << (i % 8);
        }
        d
    }

    #[test]
    fn test_hamming() {
        assert_eq!(hamming_distance(&with_bits(0), &with_bits(0)), 0);
        assert_eq!(hamming_distance(&with_bits(0), &with_bits(256)), 256);
        assert_eq!(hamming_distance(&with_bits(10), &with_bits(3)), 7);
    }

    #[test]
    fn test_ratio_boundary_is_rejected() {
        assert!(!passes_ratio_test(75.0, 100.0, RATIO_THRESHOLD));
        assert!(passes_ratio_test(74.0, 100.0, RATIO_THRESHOLD));
        assert!(!passes_ratio_test(0.0, 0.0, RATIO_THRESHOLD));
    }

    #[test]
    fn test_match_at_exact_ratio_is_dropped() {
        let query = [with_bits(0)];
        // best = 3, second = 4 -> 3 == 0.75 * 4
        let train = [with_bits(4), with_bits(3)];
        assert!(match_descriptors(&query, &train, RATIO_THRESHOLD).is_empty());

        // best = 2, second = 4 -> accepted
        let train = [with_bits(4), with_bits(2)];
        let m = match_descriptors(&query, &train, RATIO_THRESHOLD);
        assert_eq!(
            m,
            vec![Match {
                query_idx: 0,
                train_idx: 1,
                distance: 2
            }]
        );
    }

    #[test]
    fn test_ambiguous_duplicates_rejected() {
        let query = [with_bits(5)];
        let train = [with_bits(5), with_bits(5), with_bits(200)];
        assert!(match_descriptors(&query, &train, RATIO_THRESHOLD).is_empty());
    }

    #[test]
    fn test_single_train_descriptor_yields_nothing() {
        let query = [with_bits(5)];
        let train = [with_bits(5)];
        assert!(match_descriptors(&query, &train, RATIO_THRESHOLD).is_empty());
    }
}
