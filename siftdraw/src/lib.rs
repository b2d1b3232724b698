use image::{imageops::FilterType, DynamicImage, GenericImageView, Rgba, RgbaImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::{drawing, pixelops};
use itertools::Itertools;
use palette::{FromColor, Hsv, RgbHue, Srgb};
use sift::{DescriptorMatch, Homography, KeyPoint};

const REJECTED_COLOR: Rgba<u8> = Rgba([110, 20, 20, 255]);

/// Panoramas with a side longer than this are not rendered.
const MAX_PANORAMA_SIDE: f64 = 16384.0;

/// Shrink `image` so it is at most `max_width` pixels wide, keeping its aspect ratio.
pub fn limit_width(image: DynamicImage, max_width: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width <= max_width || max_width == 0 {
        return image;
    }
    let new_height = ((height as u64 * max_width as u64) / width as u64).max(1) as u32;
    image.resize_exact(max_width, new_height, FilterType::Triangle)
}

/// Draw a cross on every keypoint.
pub fn render_keypoints(image: &DynamicImage, keypoints: &[KeyPoint]) -> DynamicImage {
    let mut image = drawing::Blend(image.to_rgba8());
    for KeyPoint { point: (x, y), .. } in keypoints {
        drawing::draw_cross_mut(&mut image, Rgba([0, 255, 255, 128]), *x as i32, *y as i32);
    }
    DynamicImage::ImageRgba8(image.0)
}

/// Place both images side by side and draw a line for every match.
///
/// Matches listed in `inliers` (indices into `matches`) are coloured by rotating
/// through a colour wheel, all other matches are drawn in dim red underneath.
pub fn render_matches(
    image_a: &DynamicImage,
    image_b: &DynamicImage,
    points_a: &[KeyPoint],
    points_b: &[KeyPoint],
    matches: &[DescriptorMatch],
    inliers: &[usize],
) -> DynamicImage {
    let rgba_image_a = image_a.to_rgba8();
    let rgba_image_b = image_b.to_rgba8();
    let offset = rgba_image_a.width();
    let canvas_width = offset + rgba_image_b.width();
    let canvas_height = std::cmp::max(rgba_image_a.height(), rgba_image_b.height());
    let mut canvas = RgbaImage::from_pixel(canvas_width, canvas_height, Rgba([0, 0, 0, 255]));

    let mut render_image_onto_canvas_x_offset = |image: &RgbaImage, x_offset: u32| {
        let (width, height) = image.dimensions();
        for (x, y) in (0..width).cartesian_product(0..height) {
            canvas.put_pixel(x + x_offset, y, *image.get_pixel(x, y));
        }
    };
    render_image_onto_canvas_x_offset(&rgba_image_a, 0);
    render_image_onto_canvas_x_offset(&rgba_image_b, offset);

    let endpoints = |m: &DescriptorMatch| {
        let a = points_a.get(m.a_index)?;
        let b = points_b.get(m.b_index)?;
        Some((
            (a.point.0 as i32, a.point.1 as i32),
            (b.point.0 as i32 + offset as i32, b.point.1 as i32),
        ))
    };

    let is_inlier = {
        let mut flags = vec![false; matches.len()];
        for &ix in inliers {
            if let Some(flag) = flags.get_mut(ix) {
                *flag = true;
            }
        }
        flags
    };

    for (start, end) in matches
        .iter()
        .zip(&is_inlier)
        .filter(|(_, inlier)| !**inlier)
        .filter_map(|(m, _)| endpoints(m))
    {
        drawing::draw_antialiased_line_segment_mut(
            &mut canvas,
            start,
            end,
            REJECTED_COLOR,
            pixelops::interpolate,
        );
    }

    for (ix, (start, end)) in inliers
        .iter()
        .filter_map(|&ix| endpoints(matches.get(ix)?))
        .enumerate()
    {
        let hsv = Hsv::new(RgbHue::from_radians(ix as f32 * 0.1), 1.0, 1.0);
        let rgb = Srgb::from_color(hsv);
        drawing::draw_antialiased_line_segment_mut(
            &mut canvas,
            start,
            end,
            Rgba([
                (rgb.red * 255.0) as u8,
                (rgb.green * 255.0) as u8,
                (rgb.blue * 255.0) as u8,
                255,
            ]),
            pixelops::interpolate,
        );
    }

    DynamicImage::ImageRgba8(canvas)
}

fn map_corner(h: &Homography, x: f64, y: f64) -> Option<(f64, f64)> {
    let m = &h.0;
    let w = m[(2, 0)] * x + m[(2, 1)] * y + m[(2, 2)];
    if w <= 1e-12 {
        return None;
    }
    Some((
        (m[(0, 0)] * x + m[(0, 1)] * y + m[(0, 2)]) / w,
        (m[(1, 0)] * x + m[(1, 1)] * y + m[(1, 2)]) / w,
    ))
}

/// Warp image A into the frame of image B and stitch the two together.
///
/// The canvas covers B and the warped corners of A. Where both images have
/// content the pixels are averaged, which makes misregistration easy to see.
///
/// Returns `None` when a corner of A maps to or past infinity or the canvas would
/// be unreasonably large.
pub fn render_panorama(
    image_a: &DynamicImage,
    image_b: &DynamicImage,
    homography: &Homography,
) -> Option<DynamicImage> {
    let rgba_image_a = image_a.to_rgba8();
    let rgba_image_b = image_b.to_rgba8();
    let (width_a, height_a) = (rgba_image_a.width() as f64, rgba_image_a.height() as f64);
    let (width_b, height_b) = (rgba_image_b.width() as f64, rgba_image_b.height() as f64);

    let mut corners = vec![(0.0, 0.0), (width_b, height_b)];
    for &(x, y) in &[
        (0.0, 0.0),
        (width_a, 0.0),
        (width_a, height_a),
        (0.0, height_a),
    ] {
        corners.push(map_corner(homography, x, y)?);
    }
    let min_x = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min).floor();
    let min_y = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min).floor();
    let max_x = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max).ceil();
    let max_y = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max).ceil();
    if max_x - min_x > MAX_PANORAMA_SIDE || max_y - min_y > MAX_PANORAMA_SIDE {
        return None;
    }

    // Shift the homography so the top left corner of the canvas is the origin.
    let m = &homography.0;
    let mut shifted = [0.0f32; 9];
    for col in 0..3 {
        shifted[col] = (m[(0, col)] - min_x * m[(2, col)]) as f32;
        shifted[3 + col] = (m[(1, col)] - min_y * m[(2, col)]) as f32;
        shifted[6 + col] = m[(2, col)] as f32;
    }
    let projection = Projection::from_matrix(shifted)?;

    let mut canvas = RgbaImage::new((max_x - min_x) as u32, (max_y - min_y) as u32);
    warp_into(
        &rgba_image_a,
        &projection,
        Interpolation::Bilinear,
        Rgba([0, 0, 0, 0]),
        &mut canvas,
    );

    let (offset_x, offset_y) = (-min_x as u32, -min_y as u32);
    for (x, y, pixel) in rgba_image_b.enumerate_pixels() {
        let target = canvas.get_pixel_mut(x + offset_x, y + offset_y);
        if target[3] == 0 {
            *target = *pixel;
        } else {
            *target = pixelops::interpolate(*target, *pixel, 0.5);
        }
    }

    Some(DynamicImage::ImageRgba8(canvas))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::Matrix3;

    fn keypoint(x: f32, y: f32) -> KeyPoint {
        KeyPoint {
            point: (x, y),
            sigma: 2.0,
            octave: 0,
            level: 1,
            response: 0.1,
            angle: 0.0,
        }
    }

    #[test]
    fn canvas_holds_both_images() {
        let a = DynamicImage::new_rgb8(40, 30);
        let b = DynamicImage::new_rgb8(20, 50);
        let matches = [DescriptorMatch {
            a_index: 0,
            b_index: 0,
            distance: 0.1,
        }];
        let canvas = render_matches(
            &a,
            &b,
            &[keypoint(5.0, 5.0)],
            &[keypoint(10.0, 10.0)],
            &matches,
            &[0],
        );
        assert_eq!(canvas.dimensions(), (60, 50));
    }

    #[test]
    fn out_of_range_indices_are_skipped() {
        let a = DynamicImage::new_rgb8(16, 16);
        let matches = [DescriptorMatch {
            a_index: 3,
            b_index: 0,
            distance: 0.1,
        }];
        let canvas = render_matches(&a, &a, &[], &[keypoint(1.0, 1.0)], &matches, &[0, 7]);
        assert_eq!(canvas.dimensions(), (32, 16));
    }

    #[test]
    fn panorama_covers_both_images() {
        let a = DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 30, Rgba([200, 0, 0, 255])));
        let b = DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 30, Rgba([0, 0, 200, 255])));
        // Image A lands 25 pixels to the right of image B's origin.
        let shift = Homography(Matrix3::new(1.0, 0.0, 25.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0));
        let panorama = render_panorama(&a, &b, &shift).unwrap().to_rgba8();
        assert_eq!(panorama.dimensions(), (65, 30));
        assert_eq!(*panorama.get_pixel(5, 15), Rgba([0, 0, 200, 255]));
        assert_eq!(*panorama.get_pixel(55, 15), Rgba([200, 0, 0, 255]));
        let overlap = panorama.get_pixel(32, 15);
        assert!(overlap[0] > 50 && overlap[2] > 50, "{:?}", overlap);
    }

    #[test]
    fn panorama_rejects_points_at_infinity() {
        let a = DynamicImage::new_rgb8(40, 30);
        let h = Homography(Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, -0.1, 0.0, 1.0));
        assert!(render_panorama(&a, &a, &h).is_none());
    }

    #[test]
    fn wide_images_are_downscaled() {
        let image = DynamicImage::new_luma8(3600, 1000);
        assert_eq!(limit_width(image, 1800).dimensions(), (1800, 500));
        let image = DynamicImage::new_luma8(640, 480);
        assert_eq!(limit_width(image, 1800).dimensions(), (640, 480));
    }
}
