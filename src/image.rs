use crate::Error;
use derive_more::{Deref, DerefMut};
use image::{DynamicImage, ImageBuffer, Luma};
use log::*;
use ndarray::{azip, s, Array2, ArrayView2, ArrayViewMut2};
use nshare::{MutNdarray2, RefNdarray2};
use std::f32;
use wide::f32x4;

pub type GrayImageBuffer = ImageBuffer<Luma<f32>, Vec<f32>>;

/// The single channel image every stage of the pipeline works on.
///
/// This wraps a contiguous `f32` buffer from the image crate. Loading and
/// luminance conversion go through the image crate, while the filters used to
/// build the scale space are implemented here as separable SIMD passes since the
/// scale space performs a lot of Gaussian blurs.
///
/// Pixel values are in `[0, 1]` when the image was converted from an 8 or 16 bit
/// image. The pipeline never mutates an image it was given.
#[derive(Debug, Clone, Deref, DerefMut)]
pub struct GrayFloatImage(pub GrayImageBuffer);

impl GrayFloatImage {
    /// Create a unit float image from the image crate's DynamicImage type.
    ///
    /// Color images are converted to luminance first.
    ///
    /// # Arguments
    /// * `input_image` - the input image.
    /// # Return value
    /// An image with pixel values between 0 and 1.
    pub fn from_dynamic(input_image: &DynamicImage) -> Self {
        let (width, height) = (input_image.width(), input_image.height());
        Self(match input_image {
            DynamicImage::ImageLuma8(_)
            | DynamicImage::ImageLumaA8(_)
            | DynamicImage::ImageRgb8(_)
            | DynamicImage::ImageRgba8(_) => {
                info!("Loaded a {} x {} 8-bit image", width, height);
                let gray = input_image.to_luma8();
                ImageBuffer::from_fn(width, height, |x, y| {
                    Luma([f32::from(gray[(x, y)][0]) / 255f32])
                })
            }
            _ => {
                info!("Loaded a {} x {} wide image", width, height);
                let gray = input_image.to_luma16();
                ImageBuffer::from_fn(width, height, |x, y| {
                    Luma([f32::from(gray[(x, y)][0]) / 65535f32])
                })
            }
        })
    }

    /// Wrap a row-major buffer of `width * height` samples.
    pub fn from_raw(width: usize, height: usize, data: Vec<f32>) -> Result<Self, Error> {
        if data.len() != width * height {
            return Err(Error::InvalidInput(format!(
                "a {}x{} image needs {} samples, got {}",
                width,
                height,
                width * height,
                data.len()
            )));
        }
        ImageBuffer::from_raw(width as u32, height as u32, data)
            .map(Self)
            .ok_or_else(|| Error::InvalidInput("image dimensions overflow".into()))
    }

    /// Build an image by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        Self(ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
            Luma([f(x as usize, y as usize)])
        }))
    }

    pub fn from_array2(arr: Array2<f32>) -> Self {
        let (height, width) = arr.dim();
        // `as_standard_layout` guarantees row-major order for `into_raw_vec`.
        let data = arr.as_standard_layout().into_owned().into_raw_vec();
        Self(
            ImageBuffer::from_raw(width as u32, height as u32, data)
                .expect("array dimensions always match the pixel count"),
        )
    }

    pub fn ref_array2(&self) -> ArrayView2<f32> {
        self.0.ref_ndarray2()
    }

    pub fn mut_array2(&mut self) -> ArrayViewMut2<f32> {
        self.0.mut_ndarray2()
    }

    pub fn zero_array(&self) -> Array2<f32> {
        Array2::zeros((self.height(), self.width()))
    }

    pub fn width(&self) -> usize {
        self.0.width() as usize
    }

    pub fn height(&self) -> usize {
        self.0.height() as usize
    }

    pub fn new(width: usize, height: usize) -> Self {
        Self(ImageBuffer::from_pixel(
            width as u32,
            height as u32,
            Luma([0.0]),
        ))
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.get_pixel(x as u32, y as u32)[0]
    }

    pub fn put(&mut self, x: usize, y: usize, pixel_value: f32) {
        self.put_pixel(x as u32, y as u32, Luma([pixel_value]));
    }

    /// Central difference gradient `(dx, dy)` at an interior pixel.
    ///
    /// `y` grows downwards, so a positive `dy` means intensity increases towards
    /// the bottom of the image.
    pub fn gradient(&self, x: usize, y: usize) -> (f32, f32) {
        (
            self.get(x + 1, y) - self.get(x - 1, y),
            self.get(x, y + 1) - self.get(x, y - 1),
        )
    }

    /// Pixel-wise `self - other`. Both images must have the same size.
    pub fn subtract(&self, other: &Self) -> Self {
        debug_assert_eq!(self.dimensions(), other.dimensions());
        let mut difference = self.zero_array();
        azip!((
            out in &mut difference,
            &a in self.ref_array2(),
            &b in other.ref_array2(),
        ) {
            *out = a - b;
        });
        Self::from_array2(difference)
    }

    /// Decimate by two with 2x2 area averaging.
    ///
    /// A trailing odd row or column is dropped, so pixel `(x, y)` of the result
    /// always averages the block whose top-left corner is `(2x, 2y)`.
    pub fn half_size(&self) -> Self {
        let width = self.width() / 2;
        let height = self.height() / 2;
        let mut half = Array2::zeros((height, width));
        let source = self.ref_array2().slice_move(s![..height * 2, ..width * 2]);
        azip!((
            out in &mut half,
            window in source.exact_chunks((2, 2)),
        ) {
            *out = window.sum() * 0.25;
        });
        Self::from_array2(half)
    }
}

/// Split a kernel into zero padded SIMD lanes.
///
/// Returns the lanes and the padded kernel length.
fn simd_kernel(kernel: &[f32]) -> (Vec<f32x4>, usize) {
    let lanes = kernel
        .chunks(4)
        .map(|chunk| {
            let mut data = [0f32; 4];
            data[..chunk.len()].copy_from_slice(chunk);
            f32x4::new(data)
        })
        .collect::<Vec<_>>();
    let padded = lanes.len() * 4;
    (lanes, padded)
}

/// Dot product of a padded window with a SIMD kernel.
fn convolve_window(window: &[f32], lanes: &[f32x4]) -> f32 {
    window
        .chunks_exact(4)
        .map(|chunk| f32x4::new([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .zip(lanes.iter())
        .fold(f32x4::splat(0.), |acc, (a, b)| a.mul_add(*b, acc))
        .reduce_add()
}

/// Fill `scratch` with `line`, replicating the edge samples `half` times on each
/// side and zeroing whatever padding remains after that.
fn fill_replicated(scratch: &mut [f32], line: impl ExactSizeIterator<Item = f32>, half: usize) {
    let len = line.len();
    for (slot, value) in scratch[half..half + len].iter_mut().zip(line) {
        *slot = value;
    }
    let first = scratch[half];
    let last = scratch[half + len - 1];
    scratch[..half].fill(first);
    scratch[half + len..2 * half + len].fill(last);
    scratch[2 * half + len..].fill(0.);
}

/// Convolve every row with `kernel`, replicating border pixels.
pub fn horizontal_filter(image: &GrayImageBuffer, kernel: &[f32]) -> GrayImageBuffer {
    debug_assert!(kernel.len() % 2 == 1);
    let half = kernel.len() / 2;
    let width = image.width() as usize;
    let height = image.height() as usize;
    let (lanes, padded) = simd_kernel(kernel);
    let mut output = vec![0.0; width * height];
    let mut scratch = vec![0f32; width + 2 * half + (padded - kernel.len())];
    for (row_in, row_out) in image
        .as_raw()
        .chunks_exact(width)
        .zip(output.chunks_exact_mut(width))
    {
        fill_replicated(&mut scratch, row_in.iter().copied(), half);
        for (window, out) in scratch.windows(padded).zip(row_out.iter_mut()) {
            *out = convolve_window(window, &lanes);
        }
    }
    GrayImageBuffer::from_raw(width as u32, height as u32, output)
        .expect("output buffer has one sample per pixel")
}

/// Convolve every column with `kernel`, replicating border pixels.
pub fn vertical_filter(image: &GrayImageBuffer, kernel: &[f32]) -> GrayImageBuffer {
    debug_assert!(kernel.len() % 2 == 1);
    let half = kernel.len() / 2;
    let width = image.width() as usize;
    let height = image.height() as usize;
    let (lanes, padded) = simd_kernel(kernel);
    let mut output = vec![0.0; width * height];
    let raw = image.as_raw();
    let mut scratch = vec![0f32; height + 2 * half + (padded - kernel.len())];
    for x in 0..width {
        fill_replicated(
            &mut scratch,
            raw.iter().skip(x).step_by(width).copied(),
            half,
        );
        for (y, window) in scratch.windows(padded).take(height).enumerate() {
            output[y * width + x] = convolve_window(window, &lanes);
        }
    }
    GrayImageBuffer::from_raw(width as u32, height as u32, output)
        .expect("output buffer has one sample per pixel")
}

pub fn separable_filter(
    image: &GrayImageBuffer,
    h_kernel: &[f32],
    v_kernel: &[f32],
) -> GrayImageBuffer {
    let h = horizontal_filter(image, h_kernel);
    vertical_filter(&h, v_kernel)
}

/// The Gaussian function.
///
/// # Arguments
/// * `x` - the offset.
/// * `r` - sigma.
/// # Return value
/// The kernel value at x.
fn gaussian(x: f32, r: f32) -> f32 {
    ((2.0 * f32::consts::PI).sqrt() * r).recip() * (-x.powi(2) / (2.0 * r.powi(2))).exp()
}

/// Generate a normalized Gaussian kernel.
///
/// # Arguments
/// * `r` - sigma.
/// * `kernel_size` - The size of the kernel, must be odd.
/// # Return value
/// The kernel (a vector).
pub fn gaussian_kernel(r: f32, kernel_size: usize) -> Vec<f32> {
    debug_assert!(kernel_size % 2 == 1, "kernel_size must be odd");
    let half_width = (kernel_size / 2) as i32;
    let mut kernel: Vec<f32> = (-half_width..=half_width)
        .map(|i| gaussian(i as f32, r))
        .collect();
    let sum: f32 = kernel.iter().sum();
    for val in kernel.iter_mut() {
        *val /= sum;
    }
    kernel
}

/// Perform Gaussian blur on an image.
///
/// The kernel extends to three standard deviations on each side. A non-positive
/// sigma returns an unmodified copy.
///
/// # Arguments
/// * `r` - sigma.
/// # Return value
/// The resulting image after the filter was applied.
pub fn gaussian_blur(image: &GrayFloatImage, r: f32) -> GrayFloatImage {
    if r <= 0.0 {
        return image.clone();
    }
    let kernel_radius = (3.0 * r).ceil() as usize;
    let kernel = gaussian_kernel(r, kernel_radius * 2 + 1);
    GrayFloatImage(separable_filter(image, &kernel, &kernel))
}

#[cfg(test)]
mod tests {
    use super::{gaussian_kernel, GrayFloatImage};

    fn ramp_image() -> GrayFloatImage {
        GrayFloatImage::from_fn(37, 23, |x, y| {
            ((x * 7 + y * 13) % 17) as f32 / 17.0 + 0.01 * (x as f32 - y as f32)
        })
    }

    #[test]
    fn gaussian_kernel_correct() {
        // test against known correct kernel
        let kernel = gaussian_kernel(3.0, 7);
        let known_correct_kernel = vec![
            0.1062_8852,
            0.1403_2133,
            0.1657_7007,
            0.1752_4014,
            0.1657_7007,
            0.1403_2133,
            0.1062_8852,
        ];
        for (i, j) in kernel.iter().zip(known_correct_kernel.iter()) {
            assert!(f32::abs(*i - *j) < 0.0001);
        }
    }

    #[test]
    fn horizontal_filter() {
        let image = ramp_image();
        let kernel = gaussian_kernel(3.0, 7);
        let filtered_ours = super::horizontal_filter(&image.0, &kernel);
        let filtered_imageproc = imageproc::filter::horizontal_filter(&image.0, &kernel);
        imageproc::assert_pixels_eq_within!(filtered_ours, filtered_imageproc, 0.0001);
    }

    #[test]
    fn vertical_filter() {
        let image = ramp_image();
        let kernel = gaussian_kernel(3.0, 7);
        let filtered_ours = super::vertical_filter(&image.0, &kernel);
        let filtered_imageproc = imageproc::filter::vertical_filter(&image.0, &kernel);
        imageproc::assert_pixels_eq_within!(filtered_ours, filtered_imageproc, 0.0001);
    }

    #[test]
    fn blur_preserves_constant_image() {
        let image = GrayFloatImage::from_fn(20, 12, |_, _| 0.25);
        let blurred = super::gaussian_blur(&image, 2.0);
        assert!(blurred.pixels().all(|p| (p[0] - 0.25).abs() < 1e-5));
    }

    #[test]
    fn half_size_averages_blocks() {
        let image = GrayFloatImage::from_fn(5, 4, |x, y| (x + 10 * y) as f32);
        let half = image.half_size();
        assert_eq!((half.width(), half.height()), (2, 2));
        // Block (0..2, 0..2) holds 0, 1, 10, 11.
        assert!((half.get(0, 0) - 5.5).abs() < 1e-6);
        // Block (2..4, 2..4) holds 22, 23, 32, 33.
        assert!((half.get(1, 1) - 27.5).abs() < 1e-6);
    }

    #[test]
    fn subtract_is_pixelwise() {
        let a = ramp_image();
        let b = GrayFloatImage::from_fn(37, 23, |x, _| x as f32 * 0.01);
        let difference = a.subtract(&b);
        assert!((difference.get(12, 7) - (a.get(12, 7) - b.get(12, 7))).abs() < 1e-6);
        assert!(a.subtract(&a).pixels().all(|p| p[0] == 0.0));
    }

    #[test]
    fn from_raw_rejects_wrong_length() {
        assert!(GrayFloatImage::from_raw(4, 4, vec![0.0; 15]).is_err());
        assert!(GrayFloatImage::from_raw(4, 4, vec![0.0; 16]).is_ok());
    }
}
