use image::{ImageError, ImageOutputFormat};
use log::*;
use sift::{estimate_homography, match_descriptors, symmetric_match_descriptors, Error, Sift};
use std::io::{Cursor, Write};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "siftdraw",
    about = "Matches SIFT features between two images and draws the RANSAC homography inliers"
)]
struct Opt {
    /// Lowe's ratio: a match is kept when its distance is below this fraction of the
    /// distance to the second best candidate.
    #[structopt(short, long, default_value = "0.75")]
    ratio: f32,
    /// Only keep matches that are also the best match from image B to image A.
    #[structopt(long)]
    symmetric: bool,
    /// Reprojection error in pixels below which a match counts as an inlier.
    #[structopt(short, long, default_value = "3.0")]
    threshold: f64,
    /// Number of RANSAC trials.
    #[structopt(short, long, default_value = "2000")]
    iterations: usize,
    /// Fail when the best homography has fewer inliers than this.
    #[structopt(long, default_value = "4")]
    min_inliers: usize,
    /// Seed for the RANSAC sampler.
    #[structopt(long, default_value = "0")]
    seed: u64,
    /// Images wider than this are downscaled before feature extraction.
    #[structopt(long, default_value = "1800")]
    max_width: u32,
    /// The SIFT contrast threshold to use.
    ///
    /// 0.06 will be sparse and 0.01 will be dense.
    #[structopt(short, long, default_value = "0.03")]
    contrast: f32,
    /// Draw the detected keypoints of image A instead of the matches.
    #[structopt(long)]
    keypoints: bool,
    /// The output path to write to (autodetects image type from extension).
    ///
    /// If this is not provided, then the output goes to stdout as a PNG.
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,
    /// Also warp image A into the frame of image B and save the stitched result here.
    #[structopt(long, parse(from_os_str))]
    warp: Option<PathBuf>,
    /// The first image.
    #[structopt(parse(from_os_str))]
    image_a: PathBuf,
    /// The second image, whose frame the homography maps into.
    #[structopt(parse(from_os_str))]
    image_b: PathBuf,
}

fn write_output(image: &image::DynamicImage, output: &Option<PathBuf>) -> Result<(), Error> {
    if let Some(path) = output {
        image.save(path)?;
    } else {
        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageOutputFormat::Png)?;
        std::io::stdout()
            .lock()
            .write_all(png.get_ref())
            .map_err(ImageError::from)?;
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();
    let image_a = siftdraw::limit_width(image::open(&opt.image_a)?, opt.max_width);
    let image_b = siftdraw::limit_width(image::open(&opt.image_b)?, opt.max_width);

    let sift = Sift::new(opt.contrast);
    let (kps_a, ds_a) = sift.extract(&image_a)?;
    let (kps_b, ds_b) = sift.extract(&image_b)?;
    info!("{} features in A, {} features in B", kps_a.len(), kps_b.len());

    if opt.keypoints {
        return write_output(&siftdraw::render_keypoints(&image_a, &kps_a), &opt.output);
    }

    let matches = if opt.symmetric {
        symmetric_match_descriptors(&ds_a, &ds_b, opt.ratio)
    } else {
        match_descriptors(&ds_a, &ds_b, opt.ratio)
    };
    info!("{} matches passed the ratio test", matches.len());

    let estimate = estimate_homography(
        &kps_a,
        &kps_b,
        &matches,
        opt.iterations,
        opt.threshold,
        opt.min_inliers,
        opt.seed,
    );
    let inliers = match &estimate {
        Ok(estimate) => {
            let report = format!(
                "homography ({} of {} matches are inliers):{}",
                estimate.inliers.len(),
                matches.len(),
                estimate.homography.0
            );
            // Stdout may carry the image.
            if opt.output.is_some() {
                println!("{}", report);
            } else {
                eprintln!("{}", report);
            }
            if let Some(path) = &opt.warp {
                match siftdraw::render_panorama(&image_a, &image_b, &estimate.homography) {
                    Some(panorama) => panorama.save(path)?,
                    None => warn!("the homography does not give a drawable panorama"),
                }
            }
            estimate.inliers.clone()
        }
        Err(e) => {
            warn!("no homography: {}", e);
            vec![]
        }
    };

    let canvas = siftdraw::render_matches(&image_a, &image_b, &kps_a, &kps_b, &matches, &inliers);
    write_output(&canvas, &opt.output)?;
    estimate.map(|_| ())
}
