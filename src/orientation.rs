use crate::scale_space::Octave;
use crate::{KeyPoint, Sift};
use std::f32::consts::PI;

const ORIENTATION_BINS: usize = 36;
/// Radius of the sampled region in units of the keypoint's octave sigma.
const ORIENTATION_RADIUS: f32 = 3.0 * ORIENTATION_SIGMA;
/// Gaussian weighting in units of the keypoint's octave sigma.
const ORIENTATION_SIGMA: f32 = 1.5;
/// Secondary peaks at or above this fraction of the highest one spawn extra keypoints.
const PEAK_RATIO: f32 = 0.8;

/// Map an angle into `[0, 2π)`.
pub(crate) fn wrap_angle(angle: f32) -> f32 {
    let wrapped = angle.rem_euclid(2.0 * PI);
    // rem_euclid of a tiny negative angle rounds up to exactly 2π.
    if wrapped >= 2.0 * PI {
        0.0
    } else {
        wrapped
    }
}

/// Circular `[1, 4, 6, 4, 1] / 16` smoothing.
fn smooth_histogram(hist: &[f32; ORIENTATION_BINS]) -> [f32; ORIENTATION_BINS] {
    let n = ORIENTATION_BINS;
    let mut smoothed = [0f32; ORIENTATION_BINS];
    for (i, out) in smoothed.iter_mut().enumerate() {
        *out = (hist[(i + n - 2) % n]
            + hist[(i + 2) % n]
            + 4.0 * (hist[(i + n - 1) % n] + hist[(i + 1) % n])
            + 6.0 * hist[i])
            / 16.0;
    }
    smoothed
}

/// Angles of every local maximum within `PEAK_RATIO` of the highest bin.
fn dominant_angles(hist: &[f32; ORIENTATION_BINS]) -> Vec<f32> {
    let n = ORIENTATION_BINS;
    let max = hist.iter().copied().fold(0.0, f32::max);
    if max <= 0.0 {
        return vec![];
    }
    (0..n)
        .filter_map(|i| {
            let left = hist[(i + n - 1) % n];
            let right = hist[(i + 1) % n];
            let center = hist[i];
            if center > left && center > right && center >= PEAK_RATIO * max {
                let denominator = left - 2.0 * center + right;
                let shift = if denominator != 0.0 {
                    0.5 * (left - right) / denominator
                } else {
                    0.0
                };
                let bin = i as f32 + shift;
                Some(wrap_angle(bin * 2.0 * PI / n as f32))
            } else {
                None
            }
        })
        .collect()
}

impl Sift {
    /// Assign dominant gradient orientations to a keypoint.
    ///
    /// Returns one copy of the keypoint per dominant orientation. The keypoint
    /// must have passed the descriptor support check, which also keeps every
    /// sample taken here inside the image.
    pub(crate) fn orientations(&self, octave: &Octave, keypoint: &KeyPoint) -> Vec<KeyPoint> {
        let image = &octave.gaussians[keypoint.level];
        let (x, y, sigma) = keypoint.octave_frame();
        let (cx, cy) = (x.round() as isize, y.round() as isize);
        let radius = (ORIENTATION_RADIUS * sigma).round() as isize;
        let weight_sigma = ORIENTATION_SIGMA * sigma;
        let weight_factor = -0.5 / (weight_sigma * weight_sigma);
        let (width, height) = (image.width() as isize, image.height() as isize);

        let mut hist = [0f32; ORIENTATION_BINS];
        for dy in -radius..=radius {
            let py = cy + dy;
            if py < 1 || py >= height - 1 {
                continue;
            }
            for dx in -radius..=radius {
                let px = cx + dx;
                if px < 1 || px >= width - 1 {
                    continue;
                }
                let (gx, gy) = image.gradient(px as usize, py as usize);
                let magnitude = (gx * gx + gy * gy).sqrt();
                let angle = wrap_angle(gy.atan2(gx));
                let weight = ((dx * dx + dy * dy) as f32 * weight_factor).exp();
                let bin = angle * ORIENTATION_BINS as f32 / (2.0 * PI);
                let lower = bin.floor();
                let fraction = bin - lower;
                let lower = lower as usize % ORIENTATION_BINS;
                hist[lower] += weight * magnitude * (1.0 - fraction);
                hist[(lower + 1) % ORIENTATION_BINS] += weight * magnitude * fraction;
            }
        }

        dominant_angles(&smooth_histogram(&hist))
            .into_iter()
            .map(|angle| KeyPoint { angle, ..*keypoint })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_peak_is_interpolated() {
        let mut hist = [0f32; ORIENTATION_BINS];
        hist[9] = 1.0;
        hist[10] = 0.5;
        let angles = dominant_angles(&smooth_histogram(&hist));
        assert_eq!(angles.len(), 1);
        // Pulled from the centre of bin 9 towards bin 10.
        let bin = angles[0] * 36.0 / (2.0 * PI);
        assert!(bin > 9.0 && bin < 9.5, "peak at bin {}", bin);
    }

    #[test]
    fn secondary_peak_above_ratio_splits() {
        let mut hist = [0f32; ORIENTATION_BINS];
        hist[3] = 1.0;
        hist[20] = 0.9;
        hist[30] = 0.5;
        let angles = dominant_angles(&smooth_histogram(&hist));
        assert_eq!(angles.len(), 2);
    }

    #[test]
    fn peak_wraps_around_zero() {
        let mut hist = [0f32; ORIENTATION_BINS];
        hist[0] = 1.0;
        hist[35] = 0.5;
        let angles = dominant_angles(&smooth_histogram(&hist));
        assert_eq!(angles.len(), 1);
        let bin = angles[0] * 36.0 / (2.0 * PI);
        assert!(bin > 35.5 && bin < 36.0, "peak at bin {}", bin);
    }

    #[test]
    fn empty_histogram_has_no_orientation() {
        assert!(dominant_angles(&[0f32; ORIENTATION_BINS]).is_empty());
    }
}
