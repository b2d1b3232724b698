use crate::Descriptor;
use log::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A descriptor in set A paired with its nearest neighbour in set B.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DescriptorMatch {
    pub a_index: usize,
    pub b_index: usize,
    /// Euclidean distance between the two descriptors.
    pub distance: f32,
}

/// Index and distance of the nearest candidate, plus the second nearest distance.
fn two_nearest(query: &Descriptor, candidates: &[Descriptor]) -> Option<(usize, f32, f32)> {
    if candidates.len() < 2 {
        return None;
    }
    let mut best = (0, f32::INFINITY);
    let mut second = f32::INFINITY;
    for (index, candidate) in candidates.iter().enumerate() {
        let distance = query.distance(candidate);
        if distance < best.1 {
            second = best.1;
            best = (index, distance);
        } else if distance < second {
            second = distance;
        }
    }
    Some((best.0, best.1, second))
}

/// Match descriptors with Lowe's ratio test.
///
/// Every descriptor of `a` is compared with all of `b` by brute force. A match is
/// kept when the nearest distance is below `ratio` times the second nearest one,
/// which rejects ambiguous descriptors. The result is ordered by `a_index` and
/// contains each `a_index` at most once. When `b` holds fewer than two descriptors
/// no ratio can be formed and the result is empty.
pub fn match_descriptors(a: &[Descriptor], b: &[Descriptor], ratio: f32) -> Vec<DescriptorMatch> {
    let matches: Vec<DescriptorMatch> = a
        .iter()
        .enumerate()
        .filter_map(|(a_index, query)| {
            let (b_index, distance, second) = two_nearest(query, b)?;
            if distance < ratio * second {
                Some(DescriptorMatch {
                    a_index,
                    b_index,
                    distance,
                })
            } else {
                None
            }
        })
        .collect();
    debug!(
        "Ratio test kept {} of {} descriptors against {}",
        matches.len(),
        a.len(),
        b.len()
    );
    matches
}

/// Like [`match_descriptors`], but only keeps matches that also pass the ratio test
/// from `b` to `a` and land on the same pair.
pub fn symmetric_match_descriptors(
    a: &[Descriptor],
    b: &[Descriptor],
    ratio: f32,
) -> Vec<DescriptorMatch> {
    let mut reverse = vec![None; b.len()];
    for m in match_descriptors(b, a, ratio) {
        reverse[m.a_index] = Some(m.b_index);
    }
    let matches: Vec<DescriptorMatch> = match_descriptors(a, b, ratio)
        .into_iter()
        .filter(|m| reverse[m.b_index] == Some(m.a_index))
        .collect();
    debug!("{} matches survived the cross check", matches.len());
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DESCRIPTOR_SIZE;

    fn one_hot(index: usize, value: f32) -> Descriptor {
        let mut data = [0f32; DESCRIPTOR_SIZE];
        data[index] = value;
        Descriptor(data)
    }

    #[test]
    fn fewer_than_two_candidates_gives_no_matches() {
        let a = vec![one_hot(0, 1.0)];
        assert!(match_descriptors(&a, &[], 0.75).is_empty());
        assert!(match_descriptors(&a, &[one_hot(0, 1.0)], 0.75).is_empty());
    }

    #[test]
    fn distinct_descriptors_match_uniquely() {
        let a: Vec<_> = (0..5).map(|i| one_hot(i, 1.0)).collect();
        let b: Vec<_> = (0..5).rev().map(|i| one_hot(i, 0.95)).collect();
        let matches = match_descriptors(&a, &b, 0.75);
        assert_eq!(matches.len(), 5);
        for (i, m) in matches.iter().enumerate() {
            assert_eq!(m.a_index, i);
            assert_eq!(m.b_index, 4 - i);
            approx::assert_relative_eq!(m.distance, 0.05, epsilon = 1e-6);
        }
    }

    #[test]
    fn ambiguous_descriptor_is_rejected() {
        let a = vec![one_hot(0, 1.0)];
        let b = vec![one_hot(1, 1.0), one_hot(2, 1.0)];
        assert!(match_descriptors(&a, &b, 0.75).is_empty());
    }

    #[test]
    fn symmetric_matching_drops_one_sided_matches() {
        // Both descriptors of `a` prefer b[0], but b[0] only prefers a[0].
        let a = vec![one_hot(0, 1.0), one_hot(0, 0.8)];
        let b = vec![one_hot(0, 1.0), one_hot(5, 1.0)];
        let forward = match_descriptors(&a, &b, 0.9);
        assert_eq!(forward.len(), 2);
        let symmetric = symmetric_match_descriptors(&a, &b, 0.9);
        assert_eq!(symmetric.len(), 1);
        assert_eq!((symmetric[0].a_index, symmetric[0].b_index), (0, 0));
    }
}
