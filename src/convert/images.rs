//! Image optimization.
//!
//! | Input | Treatment |
//! |---|---|
//! | PNG | decode, re-encode losslessly at maximum compression |
//! | JPEG | decode, re-encode at the configured quality |
//! | SVG, ICO, GIF | passed through unchanged |
//!
//! Whichever of the original and the re-encoded bytes is smaller is kept,
//! so optimizing never grows a file. Results are memoized in the
//! [`ImageCache`] when one is configured.

use super::{ConvertError, Converter};
use crate::cache::{self, ImageCache};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ImageFormat};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Optimizable {
    Png,
    Jpeg,
}

impl Optimizable {
    fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }
}

pub struct ImageConverter {
    jpeg_quality: u8,
    cache: Option<ImageCache>,
}

impl ImageConverter {
    pub fn new(jpeg_quality: u8, cache: Option<ImageCache>) -> Self {
        Self {
            jpeg_quality,
            cache,
        }
    }

    fn optimize(&self, bytes: &[u8], kind: Optimizable) -> Result<Vec<u8>, ConvertError> {
        let mut out = Vec::new();
        match kind {
            Optimizable::Png => {
                let img = image::load_from_memory_with_format(bytes, ImageFormat::Png)?;
                let encoder = PngEncoder::new_with_quality(
                    &mut out,
                    CompressionType::Best,
                    FilterType::Adaptive,
                );
                img.write_with_encoder(encoder)?;
            }
            Optimizable::Jpeg => {
                let img = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?;
                let encoder = JpegEncoder::new_with_quality(&mut out, self.jpeg_quality);
                DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)?;
            }
        }
        Ok(out)
    }

    fn quality_param(&self, kind: Optimizable) -> u8 {
        match kind {
            Optimizable::Png => 0,
            Optimizable::Jpeg => self.jpeg_quality,
        }
    }
}

impl Converter for ImageConverter {
    fn name(&self) -> &str {
        "images"
    }

    fn output_extension(&self) -> Option<&str> {
        None
    }

    fn convert(&self, input: &Path) -> Result<Vec<u8>, ConvertError> {
        let bytes = std::fs::read(input)?;
        let Some(kind) = Optimizable::from_path(input) else {
            return Ok(bytes);
        };

        let source_hash = cache::hash_bytes(&bytes);
        let params_hash = cache::hash_image_params(kind.label(), self.quality_param(kind));
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(&source_hash, &params_hash)
        {
            debug!(input = %input.display(), "image cache hit");
            return Ok(hit);
        }

        let optimized = self.optimize(&bytes, kind)?;
        let source_len = bytes.len();
        let output = if optimized.len() < source_len {
            optimized
        } else {
            bytes
        };

        if let Some(cache) = &self.cache
            && let Err(e) = cache.put(&source_hash, &params_hash, source_len, &output)
        {
            warn!(error = %e, dir = %cache.dir().display(), "failed to store image in cache");
        }
        Ok(output)
    }

    fn finish(&self) -> Result<Option<String>, ConvertError> {
        match &self.cache {
            Some(cache) => Ok(Some(format!("Cache: {}", cache.flush()?))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::fs;
    use tempfile::TempDir;

    fn write_png(path: &Path) {
        let img = RgbImage::from_fn(64, 48, |x, _| {
            if x < 32 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) }
        });
        img.save(path).unwrap();
    }

    fn write_jpeg(path: &Path) {
        let img = RgbImage::from_fn(40, 30, |x, y| Rgb([(x * 6) as u8, (y * 8) as u8, 128]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 100)
            .encode_image(&img)
            .unwrap();
        fs::write(path, out).unwrap();
    }

    #[test]
    fn png_is_never_larger_and_keeps_dimensions() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logo.png");
        write_png(&path);

        let out = ImageConverter::new(80, None).convert(&path).unwrap();
        assert!(out.len() as u64 <= fs::metadata(&path).unwrap().len());
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn jpeg_is_reencoded_at_quality() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("photo.JPG");
        write_jpeg(&path);

        let out = ImageConverter::new(50, None).convert(&path).unwrap();
        assert!(out.len() as u64 <= fs::metadata(&path).unwrap().len());
        assert_eq!(
            image::guess_format(&out).unwrap(),
            ImageFormat::Jpeg
        );
    }

    #[test]
    fn svg_passes_through() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("icon.svg");
        fs::write(&path, "<svg xmlns=\"http://www.w3.org/2000/svg\"/>").unwrap();

        let out = ImageConverter::new(80, None).convert(&path).unwrap();
        assert_eq!(out, fs::read(&path).unwrap());
    }

    #[test]
    fn corrupt_png_is_image_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.png");
        fs::write(&path, "definitely not a png").unwrap();

        let result = ImageConverter::new(80, None).convert(&path);
        assert!(matches!(result, Err(ConvertError::Image(_))));
    }

    #[test]
    fn second_run_hits_cache_with_identical_output() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logo.png");
        write_png(&path);
        let cache_dir = tmp.path().join("cache");

        let first = ImageConverter::new(80, Some(ImageCache::open(cache_dir.clone())));
        let fresh = first.convert(&path).unwrap();
        assert_eq!(
            first.finish().unwrap().as_deref(),
            Some("Cache: 1 optimized")
        );
        drop(first);

        let second = ImageConverter::new(80, Some(ImageCache::open(cache_dir)));
        let cached = second.convert(&path).unwrap();
        assert_eq!(cached, fresh);
        assert_eq!(
            second.finish().unwrap().as_deref(),
            Some("Cache: 1 cached, 0 optimized (1 total)")
        );
    }

    #[test]
    fn finish_without_cache_has_no_summary() {
        assert_eq!(ImageConverter::new(80, None).finish().unwrap(), None);
    }
}
