//! Image preprocessing filters for OCR
//!
//! IC markings are small, low-contrast and often laser-etched, so each
//! photograph is turned into several variants and every OCR engine reads
//! all of them. Fusion later decides which reading wins.

use anyhow::{anyhow, bail, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};
use imageproc::contrast::{equalize_histogram, otsu_level};
use imageproc::filter::median_filter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::OcrPreprocessing;

/// Kind of preprocessed image handed to the OCR engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    /// Photograph as loaded
    #[default]
    Original,
    /// Grayscale, equalized, contrast and sharpen applied
    Enhanced,
    /// Otsu-thresholded enhanced image
    Binarized,
    /// Inverted binarized image (light etched text on dark epoxy)
    Inverted,
    /// Median-filtered enhanced image
    Denoised,
}

impl VariantKind {
    pub const ALL: [VariantKind; 5] = [
        VariantKind::Original,
        VariantKind::Enhanced,
        VariantKind::Binarized,
        VariantKind::Inverted,
        VariantKind::Denoised,
    ];

    /// Short name used in file names and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            VariantKind::Original => "original",
            VariantKind::Enhanced => "enhanced",
            VariantKind::Binarized => "binarized",
            VariantKind::Inverted => "inverted",
            VariantKind::Denoised => "denoised",
        }
    }
}

impl std::fmt::Display for VariantKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One preprocessed image
pub struct ImageVariant {
    pub kind: VariantKind,
    pub image: DynamicImage,
}

/// Load an image from disk
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("Failed to open image {:?}", path))
}

/// Largest side an upscaled image may have
const MAX_UPSCALED_SIDE: u32 = 32_768;

/// Build the enhanced grayscale image according to settings
pub fn apply_preprocessing(image: &DynamicImage, settings: &OcrPreprocessing) -> Result<GrayImage> {
    let image = if settings.scale > 1 {
        let scaled = |side: u32| {
            side.checked_mul(settings.scale).ok_or_else(|| {
                anyhow!(
                    "Upscale factor {} overflows a {}x{} image",
                    settings.scale,
                    image.width(),
                    image.height()
                )
            })
        };
        let (w, h) = (scaled(image.width())?, scaled(image.height())?);
        if w > MAX_UPSCALED_SIDE || h > MAX_UPSCALED_SIDE {
            bail!(
                "Upscaled image {}x{} exceeds {} pixels per side; lower preprocessing.scale",
                w,
                h,
                MAX_UPSCALED_SIDE
            );
        }
        debug!("Upscaling {}x{} -> {}x{}", image.width(), image.height(), w, h);
        image.resize_exact(w, h, FilterType::CatmullRom)
    } else {
        image.clone()
    };

    let mut gray = image.to_luma8();

    if settings.grayscale {
        gray = equalize_histogram(&gray);
    }

    if (settings.contrast - 1.0).abs() > 0.01 {
        apply_contrast(&mut gray, settings.contrast);
    }

    if settings.sharpen > 0.01 {
        gray = apply_sharpen(&gray, settings.sharpen);
    }

    Ok(gray)
}

/// Produce the configured variants of a photograph
pub fn generate_variants(image: &DynamicImage, settings: &OcrPreprocessing) -> Result<Vec<ImageVariant>> {
    if !settings.enabled {
        debug!("OCR preprocessing disabled");
        return Ok(vec![ImageVariant {
            kind: VariantKind::Original,
            image: image.clone(),
        }]);
    }

    let wants = |kind: VariantKind| settings.variants.contains(&kind);
    let enhanced = apply_preprocessing(image, settings)?;
    let mut variants = Vec::new();

    if wants(VariantKind::Original) {
        variants.push(ImageVariant {
            kind: VariantKind::Original,
            image: image.clone(),
        });
    }

    if wants(VariantKind::Binarized) || wants(VariantKind::Inverted) {
        let level = otsu_level(&enhanced);
        debug!("Otsu threshold level {}", level);
        let binary = binarize(&enhanced, level);

        if wants(VariantKind::Inverted) {
            let mut inverted = binary.clone();
            apply_invert(&mut inverted);
            variants.push(ImageVariant {
                kind: VariantKind::Inverted,
                image: DynamicImage::ImageLuma8(inverted),
            });
        }
        if wants(VariantKind::Binarized) {
            variants.push(ImageVariant {
                kind: VariantKind::Binarized,
                image: DynamicImage::ImageLuma8(binary),
            });
        }
    }

    if wants(VariantKind::Denoised) && settings.denoise {
        variants.push(ImageVariant {
            kind: VariantKind::Denoised,
            image: DynamicImage::ImageLuma8(median_filter(&enhanced, 1, 1)),
        });
    }

    if wants(VariantKind::Enhanced) {
        variants.push(ImageVariant {
            kind: VariantKind::Enhanced,
            image: DynamicImage::ImageLuma8(enhanced),
        });
    }

    variants.sort_by_key(|v| VariantKind::ALL.iter().position(|k| *k == v.kind));
    Ok(variants)
}

/// Write variants as PNG files into `dir`
pub fn write_variants(variants: &[ImageVariant], dir: &Path) -> Result<Vec<(VariantKind, PathBuf)>> {
    std::fs::create_dir_all(dir)?;
    variants
        .iter()
        .map(|variant| {
            let path = dir.join(format!("{}.png", variant.kind));
            variant
                .image
                .save(&path)
                .with_context(|| format!("Failed to write variant {:?}", path))?;
            Ok((variant.kind, path))
        })
        .collect()
}

/// Contrast around mid-grey; factor > 1.0 increases contrast
fn apply_contrast(image: &mut GrayImage, factor: f32) {
    for pixel in image.pixels_mut() {
        let val = pixel[0] as f32;
        pixel[0] = ((val - 128.0) * factor + 128.0).clamp(0.0, 255.0) as u8;
    }
}

/// 4-neighbour sharpen kernel; strength 0.0 leaves the image unchanged
fn apply_sharpen(image: &GrayImage, strength: f32) -> GrayImage {
    let (w, h) = image.dimensions();
    let mut result = image.clone();
    if w < 3 || h < 3 {
        return result;
    }

    let center_weight = 1.0 + 4.0 * strength;
    let neighbor_weight = -strength;

    for y in 1..(h - 1) {
        for x in 1..(w - 1) {
            let px = |x: u32, y: u32| image.get_pixel(x, y)[0] as f32;
            let sharpened = px(x, y) * center_weight
                + (px(x, y - 1) + px(x, y + 1) + px(x - 1, y) + px(x + 1, y)) * neighbor_weight;
            result.put_pixel(x, y, Luma([sharpened.clamp(0.0, 255.0) as u8]));
        }
    }

    result
}

/// Pixels above `level` become white, the rest black
fn binarize(image: &GrayImage, level: u8) -> GrayImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        pixel[0] = if pixel[0] > level { 255 } else { 0 };
    }
    out
}

fn apply_invert(image: &mut GrayImage) {
    for pixel in image.pixels_mut() {
        pixel[0] = 255 - pixel[0];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, _| {
            let v = (x * 255 / width.max(1)) as u8;
            image::Rgb([v, v, v])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_contrast_increase() {
        let mut img = GrayImage::from_raw(3, 1, vec![100, 128, 200]).unwrap();
        apply_contrast(&mut img, 2.0);
        // 100: (100-128)*2+128 = 72, 200 clamps to 255
        assert_eq!(img.as_raw(), &vec![72, 128, 255]);
    }

    #[test]
    fn test_invert() {
        let mut img = GrayImage::from_raw(3, 1, vec![0, 100, 255]).unwrap();
        apply_invert(&mut img);
        assert_eq!(img.as_raw(), &vec![255, 155, 0]);
    }

    #[test]
    fn test_binarize() {
        let img = GrayImage::from_raw(4, 1, vec![10, 120, 121, 250]).unwrap();
        let out = binarize(&img, 120);
        assert_eq!(out.as_raw(), &vec![0, 0, 255, 255]);
    }

    #[test]
    fn test_sharpen_flat_image_unchanged() {
        let img = GrayImage::from_pixel(5, 5, Luma([90]));
        let out = apply_sharpen(&img, 1.0);
        assert_eq!(out, img);
    }

    #[test]
    fn test_sharpen_tiny_image_is_noop() {
        let img = GrayImage::from_raw(2, 1, vec![0, 255]).unwrap();
        assert_eq!(apply_sharpen(&img, 1.0), img);
    }

    #[test]
    fn test_preprocessing_upscales() {
        let settings = OcrPreprocessing::default();
        let out = apply_preprocessing(&gradient(8, 4), &settings).unwrap();
        assert_eq!(out.dimensions(), (16, 8));
    }

    #[test]
    fn test_oversized_scale_is_an_error() {
        let settings = OcrPreprocessing {
            scale: u32::MAX,
            ..Default::default()
        };
        let err = apply_preprocessing(&gradient(8, 4), &settings).unwrap_err();
        assert!(err.to_string().contains("overflows"));
        assert!(generate_variants(&gradient(8, 4), &settings).is_err());

        let settings = OcrPreprocessing {
            scale: 10_000,
            ..Default::default()
        };
        let err = apply_preprocessing(&gradient(8, 4), &settings).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_disabled_yields_only_original() {
        let settings = OcrPreprocessing {
            enabled: false,
            ..Default::default()
        };
        let variants = generate_variants(&gradient(8, 4), &settings).unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].kind, VariantKind::Original);
        assert_eq!(variants[0].image.width(), 8);
    }

    #[test]
    fn test_all_variants_in_order() {
        let settings = OcrPreprocessing::default();
        let variants = generate_variants(&gradient(16, 8), &settings).unwrap();
        let kinds: Vec<_> = variants.iter().map(|v| v.kind).collect();
        assert_eq!(kinds, VariantKind::ALL.to_vec());
    }

    #[test]
    fn test_selected_variants_only() {
        let settings = OcrPreprocessing {
            variants: vec![VariantKind::Inverted],
            ..Default::default()
        };
        let variants = generate_variants(&gradient(16, 8), &settings).unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].kind, VariantKind::Inverted);
    }

    #[test]
    fn test_write_variants() {
        let dir = tempfile::tempdir().unwrap();
        let settings = OcrPreprocessing {
            variants: vec![VariantKind::Original, VariantKind::Binarized],
            ..Default::default()
        };
        let variants = generate_variants(&gradient(16, 8), &settings).unwrap();
        let written = write_variants(&variants, dir.path()).unwrap();

        assert_eq!(written.len(), 2);
        for (kind, path) in written {
            assert!(path.exists());
            assert!(path.ends_with(format!("{}.png", kind)));
        }
    }
}
