pub mod balancer;
pub mod dates;
pub mod fft;
pub mod io;
pub mod loader;

/// Running mean over a window of `2 * half_window + 1` samples, same length as the input.
///
/// The ends are padded with the first and last `half_window` samples of `values`
/// (not mirrored), so the output near an edge leans towards the edge values.
/// `half_window` is clamped to the input length.
pub fn moving_average(values: &[f64], half_window: usize) -> Vec<f64> {
    let len = values.len();
    if len == 0 || half_window == 0 {
        return values.to_vec();
    }
    let n = half_window.min(len);
    let width = 2 * n + 1;

    // Pad front and back
    let padded: Vec<f64> = values[..n]
        .iter()
        .chain(values.iter())
        .chain(values[len - n..].iter())
        .copied()
        .collect();

    // Sum the first window once, then slide
    let mut sum: f64 = padded[..width].iter().sum();
    let mut averaged = Vec::with_capacity(len);
    averaged.push(sum / width as f64);
    for i in 1..len {
        sum += padded[i + width - 1] - padded[i - 1];
        averaged.push(sum / width as f64);
    }

    averaged
}

pub fn div_ceil(a: usize, b: usize) -> usize {
    // Note to self:
    // If a is zero this will be zero.
    // If b is zero this will panic.
    (a + b - 1) / b
}

#[test]
fn test_moving_average_of_constant_is_constant() {
    let values = vec![3.0; 17];
    let averaged = moving_average(&values, 4);
    assert_eq!(averaged.len(), values.len());
    assert!(averaged.iter().all(|&x| (x - 3.0).abs() < 1e-12));
}

#[test]
fn test_moving_average_interior_of_ramp() {
    let values: Vec<f64> = (0..20).map(|i| i as f64).collect();
    let averaged = moving_average(&values, 2);

    // A symmetric window leaves a linear ramp untouched away from the edges
    for i in 2..18 {
        assert!((averaged[i] - values[i]).abs() < 1e-9, "index {i}");
    }
}

#[test]
fn test_moving_average_edge_padding() {
    let values = [1.0, 2.0, 3.0, 4.0];
    let averaged = moving_average(&values, 1);

    // Padded sequence is [1, 1, 2, 3, 4, 4]
    let expected = [4.0 / 3.0, 2.0, 3.0, 11.0 / 3.0];
    for (a, e) in averaged.iter().zip(expected) {
        assert!((a - e).abs() < 1e-12);
    }
}

#[test]
fn test_moving_average_window_wider_than_input() {
    let values = [2.0, 4.0];
    let averaged = moving_average(&values, 10);

    // Clamped to half-width 2, padded sequence is [2, 4, 2, 4, 2, 4]
    assert_eq!(averaged.len(), 2);
    assert!((averaged[0] - 14.0 / 5.0).abs() < 1e-12);
    assert!((averaged[1] - 16.0 / 5.0).abs() < 1e-12);
}

#[test]
fn test_moving_average_zero_window_is_identity() {
    let values = [1.0, -2.0, 5.0];
    assert_eq!(moving_average(&values, 0), values.to_vec());
}

#[test]
fn test_div_ceil() {
    assert_eq!(div_ceil(10, 3), 4);
    assert_eq!(div_ceil(9, 3), 3);
    assert_eq!(div_ceil(0, 3), 0);
}
