// ABOUTME: HDRI (OpenEXR) compression using the exr codec library
// ABOUTME: Downsamples to a target resolution and rewrites as ZIP-compressed half floats

use anyhow::{anyhow, Context, Result};
use exr::prelude::*;
use ::image::{imageops, imageops::FilterType, ImageBuffer, Luma};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// OpenEXR magic number
const EXR_MAGIC: [u8; 4] = [0x76, 0x2f, 0x31, 0x01];

/// Suffix appended to the source stem for the compressed file
pub const OUTPUT_SUFFIX: &str = "_2K_ZIP";

#[derive(Debug, Clone, Copy)]
pub struct HdriSettings {
    pub target_width: u32,
    pub target_height: u32,
}

impl Default for HdriSettings {
    fn default() -> Self {
        Self {
            target_width: 2048,
            target_height: 1024,
        }
    }
}

/// Output of a single compression run
#[derive(Debug, Clone)]
pub struct CompressedHdri {
    pub path: PathBuf,
    pub source_width: usize,
    pub source_height: usize,
    pub width: usize,
    pub height: usize,
    pub has_alpha: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressionResult {
    pub file: String,
    pub original_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: String,
}

impl CompressionResult {
    pub fn new(file: String, original_size: u64, compressed_size: u64) -> Self {
        Self {
            file,
            original_size,
            compressed_size,
            compression_ratio: compression_ratio(original_size, compressed_size),
        }
    }
}

/// Space saved as a percentage, e.g. "87.5%"; negative when the output grew
pub fn compression_ratio(original_size: u64, compressed_size: u64) -> String {
    if original_size == 0 {
        return "0.0%".to_string();
    }
    let saved = (original_size as f64 - compressed_size as f64) / original_size as f64 * 100.0;
    format!("{:.1}%", saved)
}

pub fn is_exr(data: &[u8]) -> bool {
    data.len() >= EXR_MAGIC.len() && data[..EXR_MAGIC.len()] == EXR_MAGIC
}

/// `{stem}_2K_ZIP.exr`
pub fn output_file_name(input: &Path) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "hdri".to_string());
    format!("{}{}.exr", stem, OUTPUT_SUFFIX)
}

/// Decoded RGBA planes, one `Vec` per channel in row-major order
struct Planes {
    width: usize,
    height: usize,
    has_alpha: bool,
    channels: [Vec<f32>; 4],
}

impl Planes {
    fn new(width: usize, height: usize, has_alpha: bool) -> Self {
        let plane = vec![0.0; width * height];
        Self {
            width,
            height,
            has_alpha,
            channels: [plane.clone(), plane.clone(), plane.clone(), plane],
        }
    }

    fn set(&mut self, x: usize, y: usize, pixel: [f32; 4]) {
        let index = y * self.width + x;
        for (channel, value) in self.channels.iter_mut().zip(pixel) {
            channel[index] = value;
        }
    }
}

/// Resample one plane with a triangle filter.
///
/// The image crate clamps float samples to [0, 1] while filtering, so the plane
/// is mapped into that range by its finite min/max and mapped back afterwards.
fn resample_plane(
    plane: &[f32],
    width: usize,
    height: usize,
    target_width: u32,
    target_height: u32,
) -> Result<Vec<f32>> {
    let target_len = target_width as usize * target_height as usize;

    let (min, max) = plane
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if min > max {
        // No finite samples at all
        return Ok(vec![0.0; target_len]);
    }
    let range = max - min;
    if range <= 0.0 || !range.is_finite() {
        return Ok(vec![min; target_len]);
    }

    let normalized: Vec<f32> = plane
        .iter()
        .map(|&v| {
            if v.is_finite() {
                (v - min) / range
            } else if v == f32::INFINITY {
                1.0
            } else {
                0.0
            }
        })
        .collect();

    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(width as u32, height as u32, normalized)
            .ok_or_else(|| anyhow!("plane size does not match {}x{}", width, height))?;

    let resized = imageops::resize(&buffer, target_width, target_height, FilterType::Triangle);

    Ok(resized
        .into_raw()
        .into_iter()
        .map(|v| v * range + min)
        .collect())
}

/// Compress `input` into `output_dir`: resample, convert to half floats, ZIP-compress.
///
/// Blocking; call from `spawn_blocking`.
pub fn compress_exr(input: &Path, output_dir: &Path, settings: &HdriSettings) -> Result<CompressedHdri> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory {:?}", output_dir))?;

    let image = read_first_rgba_layer_from_file(
        input,
        |resolution: Vec2<usize>, channels: &RgbaChannels| {
            Planes::new(resolution.width(), resolution.height(), channels.3.is_some())
        },
        |planes: &mut Planes, position: Vec2<usize>, (r, g, b, a): (f32, f32, f32, f32)| {
            planes.set(position.x(), position.y(), [r, g, b, a])
        },
    )
    .with_context(|| format!("reading EXR {:?}", input))?;

    let mut attributes = image.layer_data.attributes.clone();
    let planes = image.layer_data.channel_data.pixels;
    debug!(
        "Input dimensions: {}x{} (alpha: {})",
        planes.width, planes.height, planes.has_alpha
    );

    if planes.width == 0 || planes.height == 0 {
        return Err(anyhow!("EXR has an empty data window"));
    }

    let target_width = settings.target_width;
    let target_height = settings.target_height;
    debug!("Resampling to {}x{}", target_width, target_height);

    let plane_count = if planes.has_alpha { 4 } else { 3 };
    let mut resized = Vec::with_capacity(plane_count);
    for plane in planes.channels.iter().take(plane_count) {
        resized.push(resample_plane(
            plane,
            planes.width,
            planes.height,
            target_width,
            target_height,
        )?);
    }

    let output_path = output_dir.join(output_file_name(input));
    let size = Vec2(target_width as usize, target_height as usize);
    let encoding = Encoding {
        compression: Compression::ZIP16,
        blocks: Blocks::ScanLines,
        line_order: LineOrder::Increasing,
    };
    // The written data window always starts at the origin
    attributes.layer_position = Vec2(0, 0);

    let row = target_width as usize;
    let sample = |channel: usize, position: Vec2<usize>| {
        f16::from_f32(resized[channel][position.y() * row + position.x()])
    };

    debug!("Saving with ZIP compression to: {:?}", output_path);
    if planes.has_alpha {
        let layer = Layer::new(
            size,
            attributes,
            encoding,
            SpecificChannels::rgba(|position: Vec2<usize>| {
                (
                    sample(0, position),
                    sample(1, position),
                    sample(2, position),
                    sample(3, position),
                )
            }),
        );
        Image::from_layer(layer)
            .write()
            .to_file(&output_path)
            .with_context(|| format!("writing EXR {:?}", output_path))?;
    } else {
        let layer = Layer::new(
            size,
            attributes,
            encoding,
            SpecificChannels::rgb(|position: Vec2<usize>| {
                (sample(0, position), sample(1, position), sample(2, position))
            }),
        );
        Image::from_layer(layer)
            .write()
            .to_file(&output_path)
            .with_context(|| format!("writing EXR {:?}", output_path))?;
    }

    debug!("Compression complete: {:?}", output_path);
    Ok(CompressedHdri {
        path: output_path,
        source_width: planes.width,
        source_height: planes.height,
        width: target_width as usize,
        height: target_height as usize,
        has_alpha: planes.has_alpha,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write a small RGBA EXR with a horizontal gradient and a bright column
    pub(crate) fn write_test_exr(path: &Path, width: usize, height: usize, with_alpha: bool) {
        let value = move |position: Vec2<usize>| {
            let x = position.x();
            let bright = if x == 0 { 8.0 } else { x as f32 / width as f32 };
            (bright, 0.5_f32, 2.0_f32)
        };
        if with_alpha {
            write_rgba_file(path, width, height, |x, y| {
                let (r, g, b) = value(Vec2(x, y));
                (r, g, b, 1.0_f32)
            })
            .unwrap();
        } else {
            write_rgb_file(path, width, height, |x, y| value(Vec2(x, y))).unwrap();
        }
    }

    fn read_back(path: &Path) -> (Vec2<usize>, Vec<(f32, f32, f32, f32)>, bool) {
        let image = read_first_rgba_layer_from_file(
            path,
            |resolution: Vec2<usize>, channels: &RgbaChannels| {
                (
                    resolution,
                    vec![(0.0, 0.0, 0.0, 0.0); resolution.area()],
                    channels.3.is_some(),
                )
            },
            |(resolution, pixels, _): &mut (Vec2<usize>, Vec<(f32, f32, f32, f32)>, bool),
             position: Vec2<usize>,
             pixel: (f32, f32, f32, f32)| {
                pixels[position.y() * resolution.width() + position.x()] = pixel;
            },
        )
        .unwrap();
        image.layer_data.channel_data.pixels
    }

    #[test]
    fn test_is_exr() {
        assert!(is_exr(&[0x76, 0x2f, 0x31, 0x01, 0x02, 0x00]));
        assert!(!is_exr(b"RIFF....WAVE"));
        assert!(!is_exr(&[0x76, 0x2f]));
    }

    #[test]
    fn test_output_file_name() {
        assert_eq!(output_file_name(Path::new("/tmp/abc/sky.exr")), "sky_2K_ZIP.exr");
        assert_eq!(output_file_name(Path::new("studio.light.exr")), "studio.light_2K_ZIP.exr");
    }

    #[test]
    fn test_compression_ratio() {
        assert_eq!(compression_ratio(1000, 125), "87.5%");
        assert_eq!(compression_ratio(1000, 1000), "0.0%");
        assert_eq!(compression_ratio(100, 150), "-50.0%");
        assert_eq!(compression_ratio(0, 10), "0.0%");
    }

    #[test]
    fn test_resample_constant_plane_keeps_hdr_value() {
        let plane = vec![5.0_f32; 16];
        let out = resample_plane(&plane, 4, 4, 2, 2).unwrap();
        assert_eq!(out, vec![5.0; 4]);
    }

    #[test]
    fn test_resample_preserves_range_above_one() {
        let plane: Vec<f32> = (0..64).map(|i| (i % 8) as f32 * 4.0).collect();
        let out = resample_plane(&plane, 8, 8, 4, 4).unwrap();
        assert_eq!(out.len(), 16);
        assert!(out.iter().all(|v| (0.0..=28.0 + 1e-3).contains(v)));
        assert!(out.iter().any(|&v| v > 1.0));
    }

    #[test]
    fn test_resample_non_finite_plane() {
        let plane = vec![f32::NAN; 4];
        let out = resample_plane(&plane, 2, 2, 1, 1).unwrap();
        assert_eq!(out, vec![0.0]);
    }

    #[test]
    fn test_compress_exr_rgba() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("sky.exr");
        write_test_exr(&input, 32, 16, true);

        let settings = HdriSettings {
            target_width: 8,
            target_height: 4,
        };
        let result = compress_exr(&input, &dir.path().join("out"), &settings).unwrap();

        assert_eq!(result.path.file_name().unwrap(), "sky_2K_ZIP.exr");
        assert_eq!((result.source_width, result.source_height), (32, 16));
        assert_eq!((result.width, result.height), (8, 4));
        assert!(result.has_alpha);

        let (size, pixels, has_alpha) = read_back(&result.path);
        assert_eq!((size.width(), size.height()), (8, 4));
        assert!(has_alpha);
        for (_, g, b, a) in &pixels {
            assert!((g - 0.5).abs() < 1e-3);
            assert!((b - 2.0).abs() < 1e-3);
            assert!((a - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_compress_exr_rgb_without_alpha() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("studio.exr");
        write_test_exr(&input, 16, 8, false);

        let settings = HdriSettings {
            target_width: 4,
            target_height: 2,
        };
        let result = compress_exr(&input, dir.path(), &settings).unwrap();
        assert!(!result.has_alpha);

        let (size, _, has_alpha) = read_back(&result.path);
        assert_eq!((size.width(), size.height()), (4, 2));
        assert!(!has_alpha);
    }

    #[test]
    fn test_compress_rejects_non_exr() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("fake.exr");
        std::fs::write(&input, b"definitely not an exr").unwrap();

        assert!(compress_exr(&input, dir.path(), &HdriSettings::default()).is_err());
    }
}
