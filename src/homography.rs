use crate::{DescriptorMatch, Error, Ransac};
use cv_core::nalgebra::{Matrix3, MatrixN, Point2, Vector3, VectorN, U9};
use cv_core::sample_consensus::{Consensus, Estimator, Model};
use cv_core::ImagePoint;
use float_ord::FloatOrd;
use log::*;
use rand::SeedableRng;
use rand_pcg::Pcg64;

/// A correspondence between a point in image A and a point in image B.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointMatch(pub Point2<f64>, pub Point2<f64>);

/// A projective transformation from image A to image B, normalized so `h33 = 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography(pub Matrix3<f64>);

impl Homography {
    fn normalized(matrix: Matrix3<f64>) -> Option<Self> {
        let scale = matrix[(2, 2)];
        if scale.abs() < 1e-12 || matrix.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(Self(matrix / scale))
    }

    /// Map a point through the homography.
    ///
    /// Returns `None` when the point maps to infinity.
    pub fn transform_point(&self, point: &Point2<f64>) -> Option<Point2<f64>> {
        let projected = self.0 * point.to_homogeneous();
        if projected.z.abs() < 1e-12 {
            None
        } else {
            Point2::from_homogeneous(projected)
        }
    }

    /// The homography mapping image B back to image A.
    pub fn inverse(&self) -> Option<Self> {
        Self::normalized(self.0.try_inverse()?)
    }
}

impl Model<PointMatch> for Homography {
    /// Forward reprojection error `‖H·a − b‖` in pixels.
    fn residual(&self, data: &PointMatch) -> f64 {
        let PointMatch(a, b) = data;
        self.transform_point(a)
            .map(|projected| (projected - *b).norm())
            .unwrap_or(f64::INFINITY)
    }
}

/// Similarity transform that moves the centroid of `points` to the origin and
/// their mean distance from it to `√2`.
fn normalizing_transform(
    points: impl Iterator<Item = Point2<f64>> + Clone,
) -> Option<Matrix3<f64>> {
    let count = points.clone().count() as f64;
    let centroid = points
        .clone()
        .fold(Vector3::zeros(), |acc, p| acc + p.to_homogeneous())
        / count;
    let centroid = Point2::new(centroid.x, centroid.y);
    let mean_distance = points.map(|p| (p - centroid).norm()).sum::<f64>() / count;
    if mean_distance < 1e-12 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_distance;
    Some(Matrix3::new(
        s,
        0.0,
        -s * centroid.x,
        0.0,
        s,
        -s * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

/// Whether three points are (close to) collinear or coincident.
fn collinear(a: &Point2<f64>, b: &Point2<f64>, c: &Point2<f64>) -> bool {
    let ab = *b - *a;
    let ac = *c - *a;
    let scale = ab.norm() * ac.norm();
    scale < 1e-12 || (ab.x * ac.y - ab.y * ac.x).abs() <= 1e-6 * scale
}

fn degenerate(points: &[Point2<f64>]) -> bool {
    let n = points.len();
    (0..n).any(|i| {
        (i + 1..n).any(|j| (j + 1..n).any(|k| collinear(&points[i], &points[j], &points[k])))
    })
}

/// Estimates homographies with the normalized direct linear transform.
///
/// Minimal samples of four correspondences are rejected when any three of their
/// points are collinear in either image, so RANSAC draws again.
#[derive(Copy, Clone, Debug)]
pub struct HomographyEstimator {
    pub epsilon: f64,
    pub iterations: usize,
}

impl HomographyEstimator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Fit a homography to four or more correspondences in the least squares sense.
    ///
    /// This does not check for degenerate configurations beyond requiring the
    /// points to be spread out in both images.
    pub fn least_squares<I>(&self, data: I) -> Option<Homography>
    where
        I: Iterator<Item = PointMatch> + Clone,
    {
        if data.clone().count() < <Self as Estimator<PointMatch>>::MIN_SAMPLES {
            return None;
        }
        let ta = normalizing_transform(data.clone().map(|PointMatch(a, _)| a))?;
        let tb = normalizing_transform(data.clone().map(|PointMatch(_, b)| b))?;

        // Accumulate AᵀA of the DLT system one correspondence (two rows) at a time.
        let mut ata = MatrixN::<f64, U9>::zeros();
        for PointMatch(a, b) in data {
            let a = ta * a.to_homogeneous();
            let b = tb * b.to_homogeneous();
            let (x, y) = (a.x / a.z, a.y / a.z);
            let (u, v) = (b.x / b.z, b.y / b.z);
            let rows = [
                VectorN::<f64, U9>::from_column_slice(&[
                    -x,
                    -y,
                    -1.0,
                    0.0,
                    0.0,
                    0.0,
                    u * x,
                    u * y,
                    u,
                ]),
                VectorN::<f64, U9>::from_column_slice(&[
                    0.0,
                    0.0,
                    0.0,
                    -x,
                    -y,
                    -1.0,
                    v * x,
                    v * y,
                    v,
                ]),
            ];
            for row in rows {
                ata += row * row.transpose();
            }
        }

        let eigens = ata.try_symmetric_eigen(self.epsilon, self.iterations)?;
        let h = eigens
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| FloatOrd(n))
            .map(|(ix, _)| eigens.eigenvectors.column(ix).into_owned())?;
        let normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
        Homography::normalized(tb.try_inverse()? * normalized * ta)
    }
}

impl Default for HomographyEstimator {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

impl Estimator<PointMatch> for HomographyEstimator {
    type Model = Homography;
    type ModelIter = Option<Homography>;
    const MIN_SAMPLES: usize = 4;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = PointMatch> + Clone,
    {
        let a: Vec<Point2<f64>> = data.clone().map(|PointMatch(a, _)| a).collect();
        let b: Vec<Point2<f64>> = data.clone().map(|PointMatch(_, b)| b).collect();
        if a.len() < Self::MIN_SAMPLES {
            return None;
        }
        if a.len() == Self::MIN_SAMPLES && (degenerate(&a) || degenerate(&b)) {
            trace!("Rejected a degenerate sample.");
            return None;
        }
        self.least_squares(data)
    }
}

/// The result of a successful [`estimate_homography`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct HomographyEstimate {
    pub homography: Homography,
    /// Indices into the match list, in ascending order.
    pub inliers: Vec<usize>,
}

/// Robustly estimate the homography mapping image A to image B.
///
/// `matches` index into `points_a` and `points_b`. RANSAC runs for
/// `max_iterations` trials seeded with `seed`, so equal inputs and seeds give
/// equal results. The best consensus set is refit by least squares, and the refit
/// replaces the minimal model when it keeps at least as many inliers. Inliers are
/// the matches whose forward reprojection error is below `inlier_threshold` pixels.
pub fn estimate_homography<PA, PB>(
    points_a: &[PA],
    points_b: &[PB],
    matches: &[DescriptorMatch],
    max_iterations: usize,
    inlier_threshold: f64,
    min_inliers: usize,
    seed: u64,
) -> Result<HomographyEstimate, Error>
where
    PA: ImagePoint,
    PB: ImagePoint,
{
    let required = <HomographyEstimator as Estimator<PointMatch>>::MIN_SAMPLES;
    if matches.len() < required {
        return Err(Error::InsufficientCorrespondences {
            found: matches.len(),
            required,
        });
    }
    let correspondences = matches
        .iter()
        .map(|m| {
            match (points_a.get(m.a_index), points_b.get(m.b_index)) {
                (Some(a), Some(b)) => Ok(PointMatch(a.image_point(), b.image_point())),
                _ => Err(Error::InvalidInput(format!(
                    "match ({}, {}) is out of range for {} and {} points",
                    m.a_index,
                    m.b_index,
                    points_a.len(),
                    points_b.len()
                ))),
            }
        })
        .collect::<Result<Vec<PointMatch>, Error>>()?;

    let estimator = HomographyEstimator::new();
    let mut ransac = Ransac::new(inlier_threshold, Pcg64::seed_from_u64(seed))
        .max_iterations(max_iterations)
        .min_inliers(min_inliers);
    let (minimal, consensus) = ransac
        .model_inliers(&estimator, correspondences.iter().copied())
        .ok_or(Error::NoModelFound {
            iterations: max_iterations,
            min_inliers,
        })?;
    debug!(
        "RANSAC consensus holds {} of {} matches",
        consensus.len(),
        matches.len()
    );

    let inliers_of = |model: &Homography| -> Vec<usize> {
        correspondences
            .iter()
            .enumerate()
            .filter(|(_, data)| model.residual(data) < inlier_threshold)
            .map(|(index, _)| index)
            .collect()
    };
    let refit = estimator
        .least_squares(consensus.iter().map(|&index| correspondences[index]))
        .map(|model| {
            let inliers = inliers_of(&model);
            (model, inliers)
        })
        .filter(|(_, inliers)| inliers.len() >= consensus.len());
    let (homography, inliers) = match refit {
        Some(refit) => {
            trace!("Least squares refit kept {} inliers.", refit.1.len());
            refit
        }
        None => {
            let inliers = inliers_of(&minimal);
            (minimal, inliers)
        }
    };
    info!(
        "Estimated homography with {} of {} inliers",
        inliers.len(),
        matches.len()
    );
    Ok(HomographyEstimate {
        homography,
        inliers,
    })
}
