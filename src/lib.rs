mod descriptors;
mod homography;
pub mod image;
mod matching;
mod orientation;
mod ransac;
mod scale_space;
mod scale_space_extrema;

pub use crate::homography::{
    estimate_homography, Homography, HomographyEstimate, HomographyEstimator, PointMatch,
};
pub use crate::image::{gaussian_blur, GrayFloatImage};
pub use crate::matching::{match_descriptors, symmetric_match_descriptors, DescriptorMatch};
pub use crate::ransac::Ransac;

use ::image::{DynamicImage, ImageError};
use cv_core::nalgebra::Point2;
use cv_core::ImagePoint;
use derive_more::{AsRef, Deref};
use log::*;
use std::path::Path;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Images with a shorter side below this many pixels are rejected, and octaves
/// that would shrink below it are not built.
pub const MIN_IMAGE_SIZE: usize = 8;

/// Length of a [`Descriptor`]: 4x4 spatial cells with 8 orientation bins each.
pub const DESCRIPTOR_SIZE: usize = 128;

/// A point of interest in an image.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KeyPoint {
    /// Sub-pixel location `(x, y)` in the frame of the input image.
    ///
    /// +x faces right and +y faces toward the bottom of the image, with the origin
    /// in the top left corner.
    pub point: (f32, f32),
    /// Effective blur of the detection scale, in input image pixels.
    pub sigma: f32,
    /// The octave in which the keypoint was detected.
    pub octave: usize,
    /// The scale level within the octave.
    pub level: usize,
    /// Absolute value of the interpolated difference-of-Gaussians response.
    pub response: f32,
    /// Dominant gradient orientation in radians, in `[0, 2π)`.
    pub angle: f32,
}

impl KeyPoint {
    /// Location and blur in the coordinates of the keypoint's octave.
    pub(crate) fn octave_frame(&self) -> (f32, f32, f32) {
        let scale = (1usize << self.octave) as f32;
        let offset = (scale - 1.0) * 0.5;
        (
            (self.point.0 - offset) / scale,
            (self.point.1 - offset) / scale,
            self.sigma / scale,
        )
    }
}

impl ImagePoint for KeyPoint {
    fn image_point(&self) -> Point2<f64> {
        Point2::new(self.point.0 as f64, self.point.1 as f64)
    }
}

/// A 128 dimensional gradient histogram describing the neighbourhood of a keypoint.
///
/// Descriptors produced by the detector have unit length.
#[derive(Debug, Clone, Copy, PartialEq, AsRef, Deref)]
pub struct Descriptor(pub [f32; DESCRIPTOR_SIZE]);

impl Descriptor {
    /// Euclidean distance between two descriptors.
    pub fn distance(&self, other: &Self) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("at least {required} correspondences are required, found {found}")]
    InsufficientCorrespondences { found: usize, required: usize },
    #[error("no model with at least {min_inliers} inliers found in {iterations} iterations")]
    NoModelFound {
        iterations: usize,
        min_inliers: usize,
    },
    #[error("sample ({x}, {y}) is outside of the {width}x{height} image")]
    SampleOutOfBounds {
        x: isize,
        y: isize,
        width: usize,
        height: usize,
    },
    #[error("failed to load image: {0}")]
    Image(#[from] ImageError),
}

/// Contains the configuration parameters of the SIFT detector.
///
/// The most important parameter to pay attention to is `contrast_threshold`.
/// [`Sift::new`] can be used to set this threshold and let all other parameters
/// remain default. You can also use the helpers [`Sift::sparse`] and
/// [`Sift::dense`]. The default value of `contrast_threshold` is `0.03`.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sift {
    /// Upper bound on the number of octaves; small images get fewer.
    pub num_octaves: usize,

    /// Scale levels searched per octave
    pub scales_per_octave: usize,

    /// Blur of the first level of every octave, relative to that octave
    pub sigma: f32,

    /// Blur the input image is assumed to carry already
    pub assumed_blur: f32,

    /// Minimum absolute difference-of-Gaussians response, on a `[0, 1]` intensity scale
    pub contrast_threshold: f32,

    /// Maximum ratio of principal curvatures before a point is considered an edge
    pub edge_threshold: f32,
}

impl Sift {
    /// This convenience constructor is provided for the very common case
    /// that the contrast threshold needs to be modified.
    pub fn new(contrast_threshold: f32) -> Self {
        Self {
            contrast_threshold,
            ..Default::default()
        }
    }

    /// Create a `Sift` that sparsely detects features.
    ///
    /// Uses a threshold of `0.06` (default is `0.03`).
    pub fn sparse() -> Self {
        Self::new(0.06)
    }

    /// Create a `Sift` that densely detects features.
    ///
    /// Uses a threshold of `0.01` (default is `0.03`).
    pub fn dense() -> Self {
        Self::new(0.01)
    }

    fn validate(&self, image: &GrayFloatImage) -> Result<(), Error> {
        if self.num_octaves == 0 || self.scales_per_octave == 0 {
            return Err(Error::InvalidInput(format!(
                "need at least one octave and one scale per octave, got {} and {}",
                self.num_octaves, self.scales_per_octave
            )));
        }
        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            return Err(Error::InvalidInput(format!(
                "sigma must be positive, got {}",
                self.sigma
            )));
        }
        if !(self.edge_threshold.is_finite() && self.edge_threshold > 0.0) {
            return Err(Error::InvalidInput(format!(
                "edge threshold must be positive, got {}",
                self.edge_threshold
            )));
        }
        if !(self.contrast_threshold >= 0.0) {
            return Err(Error::InvalidInput(format!(
                "contrast threshold must not be negative, got {}",
                self.contrast_threshold
            )));
        }
        if image.width() < MIN_IMAGE_SIZE || image.height() < MIN_IMAGE_SIZE {
            return Err(Error::InvalidInput(format!(
                "image is {}x{}, both sides must be at least {} pixels",
                image.width(),
                image.height(),
                MIN_IMAGE_SIZE
            )));
        }
        Ok(())
    }

    /// Extract features from a single channel float image.
    ///
    /// Descriptor `i` of the output belongs to keypoint `i`. A detected point may
    /// appear several times with different angles when its neighbourhood has more
    /// than one dominant orientation.
    pub fn extract_from_gray_float_image(
        &self,
        image: &GrayFloatImage,
    ) -> Result<(Vec<KeyPoint>, Vec<Descriptor>), Error> {
        self.validate(image)?;
        trace!("Building scale space.");
        let octaves = self.build_scale_space(image);
        trace!("Finding scale space extrema.");
        let keypoints = self.find_scale_space_extrema(&octaves);
        trace!("Extracting descriptors.");
        let (keypoints, descriptors) = self.extract_descriptors(&octaves, &keypoints);
        info!("Extracted {} features", keypoints.len());
        Ok((keypoints, descriptors))
    }

    /// Extract features using the SIFT feature extractor.
    ///
    /// Color images are converted to luminance first.
    ///
    /// # Example
    /// ```
    /// let image = image::DynamicImage::new_luma8(64, 64);
    /// let (keypoints, descriptors) = sift::Sift::default().extract(&image).unwrap();
    /// assert_eq!(keypoints.len(), descriptors.len());
    /// ```
    pub fn extract(&self, image: &DynamicImage) -> Result<(Vec<KeyPoint>, Vec<Descriptor>), Error> {
        self.extract_from_gray_float_image(&GrayFloatImage::from_dynamic(image))
    }

    /// Extract features from an image on disk.
    pub fn extract_path(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<(Vec<KeyPoint>, Vec<Descriptor>), Error> {
        self.extract(&::image::open(path)?)
    }
}

impl Default for Sift {
    fn default() -> Sift {
        Sift {
            num_octaves: 4,
            scales_per_octave: 3,
            sigma: 1.6,
            assumed_blur: 0.5,
            contrast_threshold: 0.03,
            edge_threshold: 10.0,
        }
    }
}

/// Detect keypoints and compute their descriptors in one call.
///
/// This is [`Sift::extract_from_gray_float_image`] with every parameter spelled out
/// and the default assumed input blur.
pub fn detect_and_describe(
    image: &GrayFloatImage,
    octaves: usize,
    scales_per_octave: usize,
    sigma0: f32,
    contrast_threshold: f32,
    edge_threshold: f32,
) -> Result<(Vec<KeyPoint>, Vec<Descriptor>), Error> {
    Sift {
        num_octaves: octaves,
        scales_per_octave,
        sigma: sigma0,
        contrast_threshold,
        edge_threshold,
        ..Default::default()
    }
    .extract_from_gray_float_image(image)
}
