use crate::{FloatType, SegmentIndex};
use itertools::{EitherOrBoth, Itertools};
use ndarray::ArrayView1;

/// Indices (ascending) of the segments whose amplitude statistic is usable: strictly
/// positive, not NaN, and strictly below `max_over_std`. Zero marks a gap, large values
/// mark earthquakes or glitches.
pub fn valid_segments(
    stats: ArrayView1<'_, FloatType>,
    max_over_std: FloatType,
) -> Vec<SegmentIndex> {
    stats
        .iter()
        .enumerate()
        .filter(|&(_, &s)| !s.is_nan() && s > 0.0 && s < max_over_std)
        .map(|(i, _)| i)
        .collect()
}

/// Segments that are clean at both stations, ascending. Empty means the pair is skipped.
pub fn usable_segments(
    source: ArrayView1<'_, FloatType>,
    receiver: ArrayView1<'_, FloatType>,
    max_over_std: FloatType,
) -> Vec<SegmentIndex> {
    valid_segments(source, max_over_std)
        .into_iter()
        .merge_join_by(valid_segments(receiver, max_over_std), |a, b| a.cmp(b))
        .filter_map(|either| match either {
            EitherOrBoth::Both(index, _) => Some(index),
            _ => None,
        })
        .collect()
}

#[test]
fn test_valid_segments_thresholds() {
    let stats = ndarray::arr1(&[2.0, 0.0, -1.0, f32::NAN, 10.0, 9.99, f32::INFINITY, 0.1]);
    assert_eq!(valid_segments(stats.view(), 10.0), vec![0, 5, 7]);
}

#[test]
fn test_usable_is_intersection() {
    let source = ndarray::arr1(&[2.0, 2.0, 50.0, 2.0, 0.0, 2.0]);
    let receiver = ndarray::arr1(&[0.0, 2.0, 2.0, 2.0, 2.0, 2.0]);
    assert_eq!(
        usable_segments(source.view(), receiver.view(), 10.0),
        vec![1, 3, 5]
    );
}

#[test]
fn test_all_invalid_receiver_gives_nothing() {
    let source = ndarray::arr1(&[2.0; 4]);
    let receiver = ndarray::arr1(&[0.0; 4]);
    assert!(usable_segments(source.view(), receiver.view(), 10.0).is_empty());
}

#[test]
fn test_filter_is_idempotent() {
    let source = ndarray::arr1(&[2.0, f32::NAN, 3.0, 12.0, 1.0, 4.0, 0.0]);
    let receiver = ndarray::arr1(&[5.0, 5.0, 0.0, 5.0, 5.0, 5.0, 5.0]);
    let usable = usable_segments(source.view(), receiver.view(), 10.0);

    // Zero out everything outside the usable set and filter again
    let keep = |stats: &ndarray::Array1<f32>| {
        ndarray::Array1::from_shape_fn(stats.len(), |i| {
            if usable.contains(&i) {
                stats[i]
            } else {
                0.0
            }
        })
    };
    let (source, receiver) = (keep(&source), keep(&receiver));

    assert_eq!(
        usable_segments(source.view(), receiver.view(), 10.0),
        usable
    );
    assert_eq!(usable, vec![0, 4, 5]);
}
