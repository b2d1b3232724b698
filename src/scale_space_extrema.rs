use crate::image::GrayFloatImage;
use crate::scale_space::Octave;
use crate::{KeyPoint, Sift};
use cv_core::nalgebra::{Matrix3, Vector3};
use log::*;

/// Pixels closer than this to an octave border are never searched.
pub(crate) const IMAGE_BORDER: usize = 5;

const MAX_REFINEMENT_STEPS: usize = 5;

/// Gradient and Hessian of the DoG stack at an integer sample, ordered `(x, y, s)`.
fn derivatives(
    dogs: &[GrayFloatImage],
    x: usize,
    y: usize,
    s: usize,
) -> (Vector3<f32>, Matrix3<f32>) {
    let (prev, cur, next) = (&dogs[s - 1], &dogs[s], &dogs[s + 1]);
    let v = cur.get(x, y);
    let dx = 0.5 * (cur.get(x + 1, y) - cur.get(x - 1, y));
    let dy = 0.5 * (cur.get(x, y + 1) - cur.get(x, y - 1));
    let ds = 0.5 * (next.get(x, y) - prev.get(x, y));
    let dxx = cur.get(x + 1, y) + cur.get(x - 1, y) - 2.0 * v;
    let dyy = cur.get(x, y + 1) + cur.get(x, y - 1) - 2.0 * v;
    let dss = next.get(x, y) + prev.get(x, y) - 2.0 * v;
    let dxy = 0.25
        * (cur.get(x + 1, y + 1) - cur.get(x - 1, y + 1) - cur.get(x + 1, y - 1)
            + cur.get(x - 1, y - 1));
    let dxs = 0.25
        * (next.get(x + 1, y) - next.get(x - 1, y) - prev.get(x + 1, y) + prev.get(x - 1, y));
    let dys = 0.25
        * (next.get(x, y + 1) - next.get(x, y - 1) - prev.get(x, y + 1) + prev.get(x, y - 1));
    (
        Vector3::new(dx, dy, ds),
        Matrix3::new(dxx, dxy, dxs, dxy, dyy, dys, dxs, dys, dss),
    )
}

/// Strict 26-neighbour extremum test across three adjacent DoG levels.
fn is_extremum(dogs: &[GrayFloatImage], x: usize, y: usize, s: usize) -> bool {
    let value = dogs[s].get(x, y);
    let mut neighbours = dogs[s - 1..=s + 1].iter().enumerate().flat_map(|(ds, level)| {
        (y - 1..=y + 1).flat_map(move |ny| {
            (x - 1..=x + 1)
                .filter(move |&nx| !(ds == 1 && nx == x && ny == y))
                .map(move |nx| level.get(nx, ny))
        })
    });
    if value > 0.0 {
        neighbours.all(|n| value > n)
    } else {
        neighbours.all(|n| value < n)
    }
}

impl Sift {
    /// Find the refined extrema of every octave.
    ///
    /// Keypoints come out ordered by octave, then level, then row and column of
    /// the candidate that produced them. The angle is left at zero; orientation
    /// assignment happens with the descriptors.
    pub(crate) fn find_scale_space_extrema(&self, octaves: &[Octave]) -> Vec<KeyPoint> {
        let mut keypoints = vec![];
        for octave in octaves {
            let mut candidates = 0usize;
            let before = keypoints.len();
            if octave.width() <= 2 * IMAGE_BORDER || octave.height() <= 2 * IMAGE_BORDER {
                trace!("Octave {} is too small to search.", octave.index);
                continue;
            }
            for s in 1..=self.scales_per_octave {
                let dog = &octave.dogs[s];
                for y in IMAGE_BORDER..octave.height() - IMAGE_BORDER {
                    for x in IMAGE_BORDER..octave.width() - IMAGE_BORDER {
                        if dog.get(x, y).abs() < self.contrast_threshold
                            || !is_extremum(&octave.dogs, x, y, s)
                        {
                            continue;
                        }
                        candidates += 1;
                        if let Some(keypoint) = self.localize_extremum(octave, x, y, s) {
                            keypoints.push(keypoint);
                        }
                    }
                }
            }
            debug!(
                "Octave {}: {} candidates, {} refined, {} rejected",
                octave.index,
                candidates,
                keypoints.len() - before,
                candidates - (keypoints.len() - before)
            );
        }
        keypoints
    }

    /// Quadratic sub-pixel and sub-scale refinement of a candidate, followed by the
    /// contrast and edge tests.
    fn localize_extremum(&self, octave: &Octave, x: usize, y: usize, s: usize) -> Option<KeyPoint> {
        let dogs = &octave.dogs;
        let (mut x, mut y, mut s) = (x, y, s);
        let mut refined = None;
        for _ in 0..MAX_REFINEMENT_STEPS {
            let (gradient, hessian) = derivatives(dogs, x, y, s);
            let offset = -(hessian.try_inverse()? * gradient);
            if offset.iter().all(|d| d.abs() < 0.5) {
                refined = Some((offset, gradient));
                break;
            }
            let nx = x as isize + offset.x.round() as isize;
            let ny = y as isize + offset.y.round() as isize;
            let ns = s as isize + offset.z.round() as isize;
            if ns < 1
                || ns > self.scales_per_octave as isize
                || nx < IMAGE_BORDER as isize
                || ny < IMAGE_BORDER as isize
                || nx >= (octave.width() - IMAGE_BORDER) as isize
                || ny >= (octave.height() - IMAGE_BORDER) as isize
            {
                return None;
            }
            x = nx as usize;
            y = ny as usize;
            s = ns as usize;
        }
        let (offset, gradient) = refined?;

        let response = dogs[s].get(x, y) + 0.5 * gradient.dot(&offset);
        if response.abs() < self.contrast_threshold {
            return None;
        }

        let (_, hessian) = derivatives(dogs, x, y, s);
        let trace = hessian[(0, 0)] + hessian[(1, 1)];
        let det = hessian[(0, 0)] * hessian[(1, 1)] - hessian[(0, 1)] * hessian[(0, 1)];
        let r = self.edge_threshold;
        if det <= 0.0 || trace * trace * r >= (r + 1.0) * (r + 1.0) * det {
            return None;
        }

        let scale = (1usize << octave.index) as f32;
        let offset_to_base = (scale - 1.0) * 0.5;
        Some(KeyPoint {
            point: (
                (x as f32 + offset.x) * scale + offset_to_base,
                (y as f32 + offset.y) * scale + offset_to_base,
            ),
            sigma: self.sigma
                * 2f32.powf(
                    octave.index as f32 + (s as f32 + offset.z) / self.scales_per_octave as f32,
                ),
            octave: octave.index,
            level: s,
            response: response.abs(),
            angle: 0.0,
        })
    }
}
