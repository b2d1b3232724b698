use cv_core::nalgebra::Point2;
use log::*;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use sift::{
    detect_and_describe, estimate_homography, match_descriptors, Error, GrayFloatImage, KeyPoint,
    Sift,
};
use std::f32::consts::PI;

const LOWES_RATIO: f32 = 0.75;

struct Blob {
    center: (f32, f32),
    std: f32,
    amplitude: f32,
}

fn render(
    blobs: &[Blob],
    width: usize,
    height: usize,
    f: impl Fn(f32, f32) -> (f32, f32),
) -> GrayFloatImage {
    GrayFloatImage::from_fn(width, height, |x, y| {
        let (x, y) = f(x as f32, y as f32);
        0.5 + blobs
            .iter()
            .map(|blob| {
                let dx = x - blob.center.0;
                let dy = y - blob.center.1;
                blob.amplitude * (-(dx * dx + dy * dy) / (2.0 * blob.std * blob.std)).exp()
            })
            .sum::<f32>()
    })
}

/// Overlapping blobs of random size and sign scattered over `width` x `height`.
fn random_blobs(seed: u64, count: usize, width: f32, height: f32) -> Vec<Blob> {
    let mut rng = Pcg64::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let sign = if rng.gen::<bool>() { 1.0 } else { -1.0 };
            Blob {
                center: (rng.gen_range(0.0..width), rng.gen_range(0.0..height)),
                std: rng.gen_range(2.0..5.0),
                amplitude: sign * rng.gen_range(0.2..0.5),
            }
        })
        .collect()
}

fn init_logging() {
    let _ = pretty_env_logger::try_init_timed();
}

fn distance(kp: &KeyPoint, x: f32, y: f32) -> f32 {
    ((kp.point.0 - x).powi(2) + (kp.point.1 - y).powi(2)).sqrt()
}

fn angle_difference(a: f32, b: f32) -> f32 {
    let d = (a - b).rem_euclid(2.0 * PI);
    d.min(2.0 * PI - d)
}

#[test]
fn rejects_tiny_images() {
    let image = GrayFloatImage::from_fn(7, 64, |_, _| 0.5);
    assert!(matches!(
        Sift::default().extract_from_gray_float_image(&image),
        Err(Error::InvalidInput(_))
    ));
}

#[test]
fn keypoints_and_descriptors_line_up() {
    init_logging();
    let blobs = random_blobs(7, 60, 160.0, 128.0);
    let image = render(&blobs, 160, 128, |x, y| (x, y));
    let (keypoints, descriptors) = Sift::default().extract_from_gray_float_image(&image).unwrap();
    info!("Found {} keypoints", keypoints.len());
    assert!(!keypoints.is_empty());
    assert_eq!(keypoints.len(), descriptors.len());
    for (kp, descriptor) in keypoints.iter().zip(&descriptors) {
        assert!((0.0..2.0 * PI).contains(&kp.angle));
        assert!(kp.point.0 >= 0.0 && kp.point.0 < 160.0);
        assert!(kp.point.1 >= 0.0 && kp.point.1 < 128.0);
        assert!(kp.sigma > 0.0);
        let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }
}

#[test]
fn detection_is_deterministic() {
    let blobs = random_blobs(11, 50, 128.0, 128.0);
    let image = render(&blobs, 128, 128, |x, y| (x, y));
    let first = detect_and_describe(&image, 4, 3, 1.6, 0.03, 10.0).unwrap();
    let second = detect_and_describe(&image, 4, 3, 1.6, 0.03, 10.0).unwrap();
    assert_eq!(first.0, second.0);
    assert_eq!(first.1, second.1);
}

#[test]
fn blobs_are_found_at_twice_the_scale() {
    init_logging();
    // Centres away from whole and half pixels keep DoG samples and orientation
    // histograms free of exact ties.
    let centers = [(48.3, 47.6), (111.7, 50.4), (50.2, 109.7), (110.6, 112.3)];
    let blobs: Vec<Blob> = centers
        .iter()
        .map(|&center| Blob {
            center,
            std: 3.0,
            amplitude: 0.4,
        })
        .collect();
    let small = render(&blobs, 160, 160, |x, y| (x, y));
    let large = render(&blobs, 320, 320, |x, y| (x / 2.0, y / 2.0));
    let (small_kps, _) = Sift::default().extract_from_gray_float_image(&small).unwrap();
    let (large_kps, _) = Sift::default().extract_from_gray_float_image(&large).unwrap();

    for &(x, y) in &centers {
        let near_small: Vec<&KeyPoint> =
            small_kps.iter().filter(|kp| distance(kp, x, y) < 1.5).collect();
        assert!(!near_small.is_empty(), "blob at ({}, {}) not found", x, y);
        // Pixel X of the large image samples the scene at X / 2.
        let near_large: Vec<&KeyPoint> = large_kps
            .iter()
            .filter(|kp| distance(kp, 2.0 * x, 2.0 * y) < 3.0)
            .collect();
        assert!(!near_large.is_empty(), "blob at ({}, {}) not found when doubled", x, y);
        assert!(
            near_large.iter().any(|large| near_small.iter().any(|small| {
                let ratio = large.sigma / small.sigma;
                (1.5..=2.5).contains(&ratio)
            })),
            "blob at ({}, {}) was not found at twice the scale",
            x,
            y
        );
    }
}

#[test]
fn quarter_turn_rotates_keypoints_and_keeps_descriptors() {
    init_logging();
    let blobs = random_blobs(3, 70, 128.0, 128.0);
    let image = render(&blobs, 128, 128, |x, y| (x, y));
    let rotated = GrayFloatImage(::image::imageops::rotate90(&image.0));
    let sift = Sift::default();
    let (kps, descriptors) = sift.extract_from_gray_float_image(&image).unwrap();
    let (rotated_kps, rotated_descriptors) = sift.extract_from_gray_float_image(&rotated).unwrap();

    let mut pairs = 0;
    for (kp, descriptor) in kps.iter().zip(&descriptors) {
        // Clockwise quarter turn: (x, y) -> (h - 1 - y, x).
        let (x, y) = (127.0 - kp.point.1, kp.point.0);
        let angle = kp.angle + PI / 2.0;
        let counterpart = rotated_kps
            .iter()
            .zip(&rotated_descriptors)
            .find(|(other, _)| {
                distance(other, x, y) < 0.5 && angle_difference(other.angle, angle) < 0.1
            });
        if let Some((other, other_descriptor)) = counterpart {
            pairs += 1;
            approx::assert_relative_eq!(kp.sigma, other.sigma, epsilon = 1e-3);
            assert!(
                descriptor.distance(other_descriptor) < 0.1,
                "descriptor moved by {}",
                descriptor.distance(other_descriptor)
            );
        }
    }
    info!("{} of {} keypoints paired after rotation", pairs, kps.len());
    assert!(pairs * 2 >= kps.len());
}

#[test]
fn translation_is_recovered_end_to_end() {
    init_logging();
    let blobs = random_blobs(42, 110, 200.0, 160.0);
    let image_a = render(&blobs, 176, 144, |x, y| (x, y));
    // Image B shows the scene shifted by (16, 8).
    let image_b = render(&blobs, 176, 144, |x, y| (x + 16.0, y + 8.0));
    let sift = Sift::default();
    let (kps_a, ds_a) = sift.extract_from_gray_float_image(&image_a).unwrap();
    let (kps_b, ds_b) = sift.extract_from_gray_float_image(&image_b).unwrap();
    let matches = match_descriptors(&ds_a, &ds_b, LOWES_RATIO);
    info!("{} matches", matches.len());

    let estimate = estimate_homography(&kps_a, &kps_b, &matches, 1000, 2.0, 8, 0).unwrap();
    assert!(estimate.inliers.len() >= 8);
    assert!(estimate.inliers.windows(2).all(|w| w[0] < w[1]));
    for &(x, y) in &[(40.0, 40.0), (120.0, 30.0), (90.0, 100.0)] {
        let mapped = estimate
            .homography
            .transform_point(&Point2::new(x, y))
            .unwrap();
        assert!((mapped.x - (x - 16.0)).abs() < 0.5, "{:?}", mapped);
        assert!((mapped.y - (y - 8.0)).abs() < 0.5, "{:?}", mapped);
    }
}
