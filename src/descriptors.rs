use crate::orientation::wrap_angle;
use crate::scale_space::Octave;
use crate::{Descriptor, Error, KeyPoint, Sift, DESCRIPTOR_SIZE};
use log::*;
use std::f32::consts::{PI, SQRT_2};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Spatial cells along each side of the descriptor window.
const DESCRIPTOR_WIDTH: usize = 4;
const DESCRIPTOR_BINS: usize = 8;
/// Width of one spatial cell in units of the keypoint's octave sigma.
const CELL_SCALE: f32 = 3.0;
/// Individual bins are clipped to this value after the first normalization.
const MAGNITUDE_CLIP: f32 = 0.2;

/// Sample radius around the keypoint, in octave pixels, that the rotated
/// descriptor window can reach.
fn window_radius(octave_sigma: f32) -> isize {
    let cell_width = CELL_SCALE * octave_sigma;
    (cell_width * SQRT_2 * (DESCRIPTOR_WIDTH + 1) as f32 * 0.5).round() as isize
}

/// Scale to unit length, clip large bins and scale to unit length again.
fn normalize(histogram: &mut [f32; DESCRIPTOR_SIZE]) {
    let norm = histogram.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return;
    }
    for v in histogram.iter_mut() {
        *v = (*v / norm).min(MAGNITUDE_CLIP);
    }
    let norm = histogram.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in histogram.iter_mut() {
            *v /= norm;
        }
    }
}

impl Sift {
    /// Assign orientations and extract descriptors for detected keypoints.
    ///
    /// Keypoints whose descriptor window does not fit inside their octave are
    /// dropped. Every other keypoint produces one output per dominant orientation,
    /// in input order.
    ///
    /// # Arguments
    /// * `octaves` - the Gaussian scale space
    /// * `keypoints` - the keypoints detected.
    /// # Return value
    /// The oriented keypoints and their descriptors.
    pub(crate) fn extract_descriptors(
        &self,
        octaves: &[Octave],
        keypoints: &[KeyPoint],
    ) -> (Vec<KeyPoint>, Vec<Descriptor>) {
        #[cfg(not(feature = "rayon"))]
        let features: Vec<(KeyPoint, Descriptor)> = keypoints
            .iter()
            .flat_map(|keypoint| self.describe_keypoint(octaves, keypoint))
            .collect();
        #[cfg(feature = "rayon")]
        let features: Vec<(KeyPoint, Descriptor)> = keypoints
            .par_iter()
            .flat_map_iter(|keypoint| self.describe_keypoint(octaves, keypoint))
            .collect();
        debug!(
            "{} keypoints produced {} oriented features",
            keypoints.len(),
            features.len()
        );
        features.into_iter().unzip()
    }

    fn describe_keypoint(
        &self,
        octaves: &[Octave],
        keypoint: &KeyPoint,
    ) -> Vec<(KeyPoint, Descriptor)> {
        let octave = &octaves[keypoint.octave];
        if let Err(e) = self.check_support(octave, keypoint) {
            trace!("Dropping keypoint at {:?}: {}", keypoint.point, e);
            return vec![];
        }
        self.orientations(octave, keypoint)
            .into_iter()
            .filter_map(|oriented| Some((oriented, self.get_descriptor(octave, &oriented).ok()?)))
            .collect()
    }

    /// Make sure the whole rotated descriptor window, plus one pixel for central
    /// differences, lies inside the octave.
    fn check_support(&self, octave: &Octave, keypoint: &KeyPoint) -> Result<(), Error> {
        let (x, y, sigma) = keypoint.octave_frame();
        let radius = window_radius(sigma) + 1;
        let (cx, cy) = (x.round() as isize, y.round() as isize);
        let (width, height) = (octave.width(), octave.height());
        for (sx, sy) in [(cx - radius, cy - radius), (cx + radius, cy + radius)] {
            if !(0..width as isize).contains(&sx) || !(0..height as isize).contains(&sy) {
                return Err(Error::SampleOutOfBounds {
                    x: sx,
                    y: sy,
                    width,
                    height,
                });
            }
        }
        Ok(())
    }

    /// Computes the 4x4x8 gradient histogram of an oriented keypoint.
    ///
    /// Samples are rotated into the keypoint's frame and spread over the two
    /// nearest rows, columns and orientation bins.
    fn get_descriptor(&self, octave: &Octave, keypoint: &KeyPoint) -> Result<Descriptor, Error> {
        self.check_support(octave, keypoint)?;
        let image = &octave.gaussians[keypoint.level];
        let (x, y, sigma) = keypoint.octave_frame();
        let (cx, cy) = (x.round() as isize, y.round() as isize);
        let cell_width = CELL_SCALE * sigma;
        let radius = window_radius(sigma);
        let (sin, cos) = keypoint.angle.sin_cos();
        let (sin, cos) = (sin / cell_width, cos / cell_width);
        let half_width = DESCRIPTOR_WIDTH as f32 * 0.5;
        let weight_factor = -1.0 / (2.0 * half_width * half_width);
        let bins_per_radian = DESCRIPTOR_BINS as f32 / (2.0 * PI);

        let mut histogram = [0f32; DESCRIPTOR_SIZE];
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                // Offset in cell units, rotated into the keypoint frame.
                let rx = dx as f32 * cos + dy as f32 * sin;
                let ry = -(dx as f32) * sin + dy as f32 * cos;
                let row = ry + half_width - 0.5;
                let col = rx + half_width - 0.5;
                if row <= -1.0
                    || row >= DESCRIPTOR_WIDTH as f32
                    || col <= -1.0
                    || col >= DESCRIPTOR_WIDTH as f32
                {
                    continue;
                }
                let (gx, gy) = image.gradient((cx + dx) as usize, (cy + dy) as usize);
                let magnitude = (gx * gx + gy * gy).sqrt()
                    * ((rx * rx + ry * ry) * weight_factor).exp();
                let bin = wrap_angle(gy.atan2(gx) - keypoint.angle) * bins_per_radian;

                let (row0, col0, bin0) = (row.floor(), col.floor(), bin.floor());
                let (fr, fc, fb) = (row - row0, col - col0, bin - bin0);
                for (r, wr) in [(row0 as isize, 1.0 - fr), (row0 as isize + 1, fr)] {
                    if !(0..DESCRIPTOR_WIDTH as isize).contains(&r) {
                        continue;
                    }
                    for (c, wc) in [(col0 as isize, 1.0 - fc), (col0 as isize + 1, fc)] {
                        if !(0..DESCRIPTOR_WIDTH as isize).contains(&c) {
                            continue;
                        }
                        for (b, wb) in [(bin0 as usize, 1.0 - fb), (bin0 as usize + 1, fb)] {
                            let index = (r as usize * DESCRIPTOR_WIDTH + c as usize)
                                * DESCRIPTOR_BINS
                                + b % DESCRIPTOR_BINS;
                            histogram[index] += magnitude * wr * wc * wb;
                        }
                    }
                }
            }
        }
        normalize(&mut histogram);
        Ok(Descriptor(histogram))
    }
}
