//! Pixel kernels for background-corrected frame stacking.
//!
//! The background of each frame is estimated by its median sample value,
//! computed with [median] in expected linear time. Frames are summed into a
//! signed accumulator with [accumulate_background_subtracted] and the stack is
//! converted back to 16-bit samples with [min_value] and [scale_offset_to_u16].

// The public functions are `#[inline]` because they sit in the per-frame path
// of the frame delivery callback.

/// Select the lower median of `arr` in place.
///
/// Returns the element which would be at sorted index `(n - 1) / 2`, or `None`
/// if `arr` is empty. The order of `arr` is scrambled. This is a quickselect
/// using a median-of-three pivot and a partition that nibbles inward from both
/// ends, so it runs in expected linear time and allocates nothing.
#[inline]
pub fn median_in_place(arr: &mut [u16]) -> Option<u16> {
    if arr.is_empty() {
        return None;
    }
    let median = (arr.len() - 1) / 2;
    let mut low = 0;
    let mut high = arr.len() - 1;

    loop {
        if high <= low {
            return Some(arr[median]);
        }

        if high == low + 1 {
            if arr[low] > arr[high] {
                arr.swap(low, high);
            }
            return Some(arr[median]);
        }

        // Order low, middle and high so that the median of the three lands in
        // `low` and both other positions act as sentinels for the scans below.
        let middle = (low + high) / 2;
        if arr[middle] > arr[high] {
            arr.swap(middle, high);
        }
        if arr[low] > arr[high] {
            arr.swap(low, high);
        }
        if arr[middle] > arr[low] {
            arr.swap(middle, low);
        }
        arr.swap(middle, low + 1);

        let pivot = arr[low];
        let mut ll = low + 1;
        let mut hh = high;
        loop {
            ll += 1;
            while pivot > arr[ll] {
                ll += 1;
            }
            hh -= 1;
            while arr[hh] > pivot {
                hh -= 1;
            }
            if hh < ll {
                break;
            }
            arr.swap(ll, hh);
        }

        // Pivot into its final place.
        arr.swap(low, hh);

        if hh <= median {
            low = ll;
        }
        if hh >= median {
            high = hh - 1;
        }
    }
}

/// Lower median of `pixels`, computed on a single scratch copy.
///
/// `pixels` itself is left untouched. Returns `None` if `pixels` is empty.
#[inline]
pub fn median(pixels: &[u16]) -> Option<u16> {
    let mut scratch = pixels.to_vec();
    median_in_place(&mut scratch)
}

/// Add `frame - background` into `sum`, sample by sample.
///
/// Sums saturate at the `i32` limits instead of wrapping.
///
/// Panics: panics if `sum` and `frame` differ in length.
#[inline]
pub fn accumulate_background_subtracted(sum: &mut [i32], frame: &[u16], background: u16) {
    assert_eq!(sum.len(), frame.len());
    let background = background as i32;
    for (acc, px) in sum.iter_mut().zip(frame.iter()) {
        *acc = acc.saturating_add(*px as i32 - background);
    }
}

/// The smallest value in `sum`, or `None` if it is empty.
#[inline]
pub fn min_value(sum: &[i32]) -> Option<i32> {
    sum.iter().copied().min()
}

/// Convert accumulator values to 16-bit samples.
///
/// Each output sample is `scale * (sum[i] - offset)` clamped to `0..=65535`,
/// with the fractional part truncated.
#[inline]
pub fn scale_offset_to_u16(sum: &[i32], offset: i32, scale: f64) -> Vec<u16> {
    sum.iter()
        .map(|value| {
            let shifted = (*value as i64 - offset as i64) as f64 * scale;
            shifted.clamp(0.0, u16::MAX as f64) as u16
        })
        .collect()
}

#[cfg(test)]
mod tests {

    use super::*;

    /// Deterministic pseudo-random samples with many duplicates.
    fn lcg_samples(n: usize, seed: u64, modulus: u64) -> Vec<u16> {
        let mut state = seed;
        (0..n)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) % modulus) as u16
            })
            .collect()
    }

    fn reference_median(pixels: &[u16]) -> u16 {
        let mut sorted = pixels.to_vec();
        sorted.sort_unstable();
        sorted[(sorted.len() - 1) / 2]
    }

    #[test]
    fn test_median_empty() {
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_median_uniform() {
        for n in [1, 2, 3, 4, 17, 1000] {
            let pixels = vec![1234u16; n];
            assert_eq!(median(&pixels), Some(1234), "n = {n}");
        }
    }

    #[test]
    fn test_median_two_returns_smaller() {
        assert_eq!(median(&[9, 3]), Some(3));
        assert_eq!(median(&[3, 9]), Some(3));
    }

    #[test]
    fn test_median_matches_sort() {
        for (n, modulus) in [
            (1, 10),
            (2, 10),
            (3, 3),
            (1000, 50),
            (1001, 65536),
            (327680, 4096),
        ] {
            for seed in [1, 42, 1234567] {
                let pixels = lcg_samples(n, seed, modulus);
                assert_eq!(
                    median(&pixels),
                    Some(reference_median(&pixels)),
                    "n = {n} seed = {seed}"
                );
            }
        }
    }

    #[test]
    fn test_median_sorted_and_reversed() {
        let ascending: Vec<u16> = (0..1000).collect();
        let descending: Vec<u16> = (0..1000).rev().collect();
        assert_eq!(median(&ascending), Some(499));
        assert_eq!(median(&descending), Some(499));
    }

    #[test]
    fn test_median_independent_of_order() {
        let pixels = lcg_samples(999, 7, 20);
        let mut rotated = pixels.clone();
        rotated.rotate_left(333);
        let mut reversed = pixels.clone();
        reversed.reverse();
        assert_eq!(median(&pixels), median(&rotated));
        assert_eq!(median(&pixels), median(&reversed));
    }

    #[test]
    fn test_median_leaves_input_alone() {
        let pixels = vec![5, 1, 4, 2, 3];
        let copy = pixels.clone();
        assert_eq!(median(&pixels), Some(3));
        assert_eq!(pixels, copy);
    }

    #[test]
    fn test_accumulate_and_scale() {
        let mut sum = vec![0i32; 4];
        accumulate_background_subtracted(&mut sum, &[10, 12, 8, 10], 10);
        accumulate_background_subtracted(&mut sum, &[10, 14, 6, 10], 10);
        assert_eq!(sum, vec![0, 6, -6, 0]);

        let min = min_value(&sum).unwrap();
        assert_eq!(min, -6);
        assert_eq!(scale_offset_to_u16(&sum, min, 1.0), vec![6, 12, 0, 6]);
        assert_eq!(scale_offset_to_u16(&sum, min, 0.4), vec![2, 4, 0, 2]);
    }

    #[test]
    fn test_scale_clamps_high() {
        let sum = vec![0, 70000, 200000];
        assert_eq!(scale_offset_to_u16(&sum, 0, 1.0), vec![0, 65535, 65535]);
        assert_eq!(scale_offset_to_u16(&sum, 0, 0.4), vec![0, 28000, 65535]);
    }

    #[test]
    fn test_accumulate_saturates() {
        // A saturated pixel over 36000 frames exceeds i32::MAX.
        let mut sum = vec![i32::MAX - 100_000, i32::MIN + 100_000, 0];
        accumulate_background_subtracted(&mut sum, &[u16::MAX, 0, 100], 0);
        accumulate_background_subtracted(&mut sum, &[u16::MAX, 0, 100], u16::MAX);
        assert_eq!(sum[0], i32::MAX - 100_000 + 65535);
        assert_eq!(sum[1], i32::MIN + 100_000 - 65535);

        for _ in 0..2 {
            accumulate_background_subtracted(&mut sum, &[u16::MAX, 0, 100], 0);
            accumulate_background_subtracted(&mut sum, &[u16::MAX, 0, 100], u16::MAX);
        }
        assert_eq!(sum[0], i32::MAX);
        assert_eq!(sum[1], i32::MIN);
        assert_eq!(sum[2], 3 * (100 + 100 - 65535));
        assert_eq!(min_value(&sum), Some(i32::MIN));
    }

    #[test]
    #[should_panic]
    fn test_accumulate_length_mismatch() {
        let mut sum = vec![0i32; 3];
        accumulate_background_subtracted(&mut sum, &[1, 2], 0);
    }
}
