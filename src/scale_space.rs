use crate::image::{gaussian_blur, GrayFloatImage};
use crate::{Sift, MIN_IMAGE_SIZE};
use log::*;

/// One resolution of the Gaussian scale space.
///
/// `gaussians` holds `S + 3` progressively blurred images and `dogs` the `S + 2`
/// differences of adjacent levels, where `S` is the number of scales per octave.
#[derive(Debug, Clone)]
pub struct Octave {
    pub index: usize,
    pub gaussians: Vec<GrayFloatImage>,
    pub dogs: Vec<GrayFloatImage>,
}

impl Octave {
    pub fn width(&self) -> usize {
        self.gaussians[0].width()
    }

    pub fn height(&self) -> usize {
        self.gaussians[0].height()
    }
}

impl Sift {
    /// The multiplicative blur step between adjacent levels, `2^(1/S)`.
    pub(crate) fn level_ratio(&self) -> f32 {
        2f32.powf(1.0 / self.scales_per_octave as f32)
    }

    /// Octaves that fit an image of the given size, at most `num_octaves`.
    pub(crate) fn octave_count(&self, width: usize, height: usize) -> usize {
        let mut side = width.min(height);
        let mut count = 0;
        while count < self.num_octaves && side >= MIN_IMAGE_SIZE {
            count += 1;
            side /= 2;
        }
        count
    }

    /// Blur that takes level `i - 1` of an octave to level `i`.
    fn incremental_sigma(&self, level: usize) -> f32 {
        let k = self.level_ratio();
        self.sigma * k.powi(level as i32 - 1) * (k * k - 1.0).sqrt()
    }

    /// Build the Gaussian and difference-of-Gaussians pyramids.
    ///
    /// The image must already have been validated against [`MIN_IMAGE_SIZE`].
    pub(crate) fn build_scale_space(&self, image: &GrayFloatImage) -> Vec<Octave> {
        let num_octaves = self.octave_count(image.width(), image.height());
        let levels = self.scales_per_octave + 3;
        let initial_sigma =
            (self.sigma * self.sigma - self.assumed_blur * self.assumed_blur).max(0.0).sqrt();
        debug!(
            "Building {} octaves of {} levels, initial blur sigma={}",
            num_octaves, levels, initial_sigma
        );
        let mut base = gaussian_blur(image, initial_sigma);
        let mut octaves: Vec<Octave> = Vec::with_capacity(num_octaves);
        for index in 0..num_octaves {
            trace!("Creating octave {}.", index);
            if let Some(previous) = octaves.last() {
                base = previous.gaussians[self.scales_per_octave].half_size();
                trace!("Half-sizing done.");
                debug!("New octave size: {}x{}", base.width(), base.height());
            }
            let mut gaussians = Vec::with_capacity(levels);
            gaussians.push(base.clone());
            for level in 1..levels {
                let blurred = gaussian_blur(&gaussians[level - 1], self.incremental_sigma(level));
                gaussians.push(blurred);
            }
            trace!("Gaussian levels finished.");
            let dogs = gaussians
                .windows(2)
                .map(|pair| pair[1].subtract(&pair[0]))
                .collect();
            octaves.push(Octave {
                index,
                gaussians,
                dogs,
            });
        }
        octaves
    }
}
