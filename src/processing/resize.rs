use std::fmt;
use std::io::Cursor;

use bytes::Bytes;
use fast_image_resize as fir;
use image::RgbaImage;
use image::buffer::ConvertBuffer;
use image::codecs::jpeg::JpegEncoder;
use tracing::debug;

use crate::error::StageError;

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Upload-ready JPEG plus the geometry of the displayed image.
#[derive(Clone)]
pub struct ResizedImage {
    pub payload: Bytes,
    pub width: u32,
    pub height: u32,
    /// Width over height of the oriented source, before scaling.
    pub aspect_ratio: f64,
}

impl fmt::Debug for ResizedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResizedImage")
            .field("bytes", &self.payload.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("aspect_ratio", &self.aspect_ratio)
            .finish()
    }
}

/// Dimensions after shrinking so the longer side is at most `max_dimension`.
/// Never scales up.
pub fn target_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let w = width.max(1);
    let h = height.max(1);
    let max_dim = max_dimension.max(1);
    let longest = w.max(h);
    if longest <= max_dim {
        return (w, h);
    }
    let scale = f64::from(max_dim) / f64::from(longest);
    let tw = ((f64::from(w) * scale).round() as u32).clamp(1, max_dim);
    let th = ((f64::from(h) * scale).round() as u32).clamp(1, max_dim);
    (tw, th)
}

/// Decodes `raw`, applies EXIF orientation, shrinks it to fit `max_dimension`
/// and re-encodes it as JPEG.
pub fn resize(raw: &[u8], max_dimension: u32, jpeg_quality: u8) -> Result<ResizedImage, StageError> {
    let rgba = decode_upright(raw)?;
    let (src_w, src_h) = rgba.dimensions();
    let aspect_ratio = f64::from(src_w.max(1)) / f64::from(src_h.max(1));
    let (width, height) = target_dimensions(src_w, src_h, max_dimension);
    let scaled = scale(rgba, width, height)?;
    let payload = encode_jpeg(&scaled, jpeg_quality)?;
    debug!(
        src_w,
        src_h,
        width,
        height,
        bytes = payload.len(),
        "prepared upload payload"
    );
    Ok(ResizedImage {
        payload: Bytes::from(payload),
        width,
        height,
        aspect_ratio,
    })
}

/// How a stored image must be turned to match its EXIF orientation tag:
/// clockwise quarter turns, then an optional horizontal mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Orientation {
    quarter_turns: u8,
    mirror: bool,
}

impl Orientation {
    const UPRIGHT: Self = Self::new(0, false);

    const fn new(quarter_turns: u8, mirror: bool) -> Self {
        Self {
            quarter_turns,
            mirror,
        }
    }

    /// Tags 1 through 8; anything else is treated as upright.
    fn from_tag(tag: u32) -> Self {
        const BY_TAG: [Orientation; 8] = [
            Orientation::new(0, false),
            Orientation::new(0, true),
            Orientation::new(2, false),
            Orientation::new(2, true),
            Orientation::new(1, true),
            Orientation::new(1, false),
            Orientation::new(3, true),
            Orientation::new(3, false),
        ];
        tag.checked_sub(1)
            .and_then(|idx| BY_TAG.get(idx as usize).copied())
            .unwrap_or(Self::UPRIGHT)
    }

    fn read(raw: &[u8]) -> Self {
        let tag = exif::Reader::new()
            .read_from_container(&mut Cursor::new(raw))
            .ok()
            .and_then(|exif| {
                exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                    .and_then(|field| field.value.get_uint(0))
            });
        match tag {
            Some(tag) => {
                debug!(tag, "exif orientation");
                Self::from_tag(tag)
            }
            None => Self::UPRIGHT,
        }
    }

    fn apply(self, img: RgbaImage) -> RgbaImage {
        use image::imageops::{flip_horizontal, rotate90, rotate180, rotate270};
        let turned = match self.quarter_turns % 4 {
            1 => rotate90(&img),
            2 => rotate180(&img),
            3 => rotate270(&img),
            _ => img,
        };
        if self.mirror {
            flip_horizontal(&turned)
        } else {
            turned
        }
    }
}

fn decode_upright(raw: &[u8]) -> Result<RgbaImage, StageError> {
    let decoded = image::ImageReader::new(Cursor::new(raw))
        .with_guessed_format()
        .map_err(|err| StageError::Decode(err.to_string()))?
        .decode()
        .map_err(|err| StageError::Decode(err.to_string()))?;
    Ok(Orientation::read(raw).apply(decoded.into_rgba8()))
}

/// Scales to exactly `width` x `height`; a same-size request hands the input back.
fn scale(source: RgbaImage, width: u32, height: u32) -> Result<RgbaImage, StageError> {
    if source.dimensions() == (width, height) {
        return Ok(source);
    }
    let src = fir::images::ImageRef::new(
        source.width(),
        source.height(),
        source.as_raw(),
        fir::PixelType::U8x4,
    )
    .map_err(|err| StageError::Encode(format!("invalid source buffer: {err}")))?;
    let mut dst = fir::images::Image::new(width, height, fir::PixelType::U8x4);
    fir::Resizer::new()
        .resize(
            &src,
            &mut dst,
            &fir::ResizeOptions::new()
                .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom)),
        )
        .map_err(|err| StageError::Encode(format!("resize failed: {err}")))?;
    RgbaImage::from_raw(width, height, dst.into_vec())
        .ok_or_else(|| StageError::Encode("resized buffer has the wrong length".into()))
}

fn encode_jpeg(image: &RgbaImage, quality: u8) -> Result<Vec<u8>, StageError> {
    let rgb: image::RgbImage = image.convert();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|err| StageError::Encode(err.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    // JPEG 2x1 with EXIF orientation 6 (rotate 90 CW), base64 encoded
    const ORIENT6_JPEG: &str = concat!(
        "/9j/4AAQSkZJRgABAQAAAQABAAD/4QAiRXhpZgAATU0AKgAAAAgAAQESAAMAAAABAAYAAAAAAAD/2wBDAAgGBgcGBQgHBwcJCQgKDBQNDAsLDBkSEw8UHRofHh0aHBwgJC4nICIsIxwcKDcpLDAxNDQ0Hyc5PTgyPC4zNDL/",
        "2wBDAQkJCQwLDBgNDRgyIRwhMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjL/wAARCAABAAIDASIAAhEBAxEB/8QAHwAAAQUBAQEBAQEAAAAAAAAAAAECAwQFBgcICQoL/8QAtRAAAgEDAwIEAwUFBAQAAAF9AQIDAAQRBRIhMUEGE1FhByJxFDKBkaEII0KxwRVS0fAkM2JyggkKFhcYGRolJicoKSo0NTY3ODk6Q0RFRkdISUpTVFVWV1hZWmNkZWZnaGlqc3R1dnd4eXqDhIWGh4iJipKTlJWWl5iZmqKjpKWmp6ipqrKztLW2t7i5usLDxMXGx8jJytLT1NXW19jZ2uHi4+Tl5ufo6erx8vP09fb3+Pn6/8QAHwEAAwEBAQEBAQEBAQAAAAAAAAECAwQFBgcICQoL/8QAtREAAgECBAQDBAcFBAQAAQJ3AAECAxEEBSExBhJBUQdhcRMiMoEIFEKRobHBCSMzUvAVYnLRChYkNOEl8RcYGRomJygpKjU2Nzg5OkNERUZHSElKU1RVVldYWVpjZGVmZ2hpanN0dXZ3eHl6goOEhYaHiImKkpOUlZaXmJmaoqOkpaanqKmqsrO0tba3uLm6wsPExcbHyMnK0tPU1dbX2Nna4uPk5ebn6Onq8vP09fb3+Pn6/9oADAMBAAIRAxEAPwDi6KKK+ZP3E//Z"
    );

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn target_dimensions_never_exceed_max_and_keep_ratio() {
        for &(w, h) in &[(4000, 3000), (3000, 4000), (1920, 1080), (1, 5000), (5000, 1)] {
            for &max in &[64u32, 512, 1024] {
                let (tw, th) = target_dimensions(w, h, max);
                assert!(tw.max(th) <= max, "{w}x{h} -> {tw}x{th} over {max}");
                assert!(tw >= 1 && th >= 1);
                // each side within one pixel of the exact scaled size
                let scale = f64::from(max) / f64::from(w.max(h));
                assert!((f64::from(tw) - f64::from(w) * scale).abs() <= 1.0);
                assert!((f64::from(th) - f64::from(h) * scale).abs() <= 1.0);
            }
        }
    }

    #[test]
    fn small_images_are_not_upscaled() {
        assert_eq!(target_dimensions(40, 20, 100), (40, 20));
        assert_eq!(target_dimensions(100, 100, 100), (100, 100));
    }

    #[test]
    fn target_dimensions_are_deterministic() {
        assert_eq!(
            target_dimensions(3024, 4032, 1024),
            target_dimensions(3024, 4032, 1024)
        );
        assert_eq!(target_dimensions(3024, 4032, 1024), (768, 1024));
    }

    #[test]
    fn shrinks_oversized_png_to_jpeg() {
        let raw = png_bytes(400, 200);
        let out = resize(&raw, 100, DEFAULT_JPEG_QUALITY).unwrap();
        assert_eq!((out.width, out.height), (100, 50));
        assert!((out.aspect_ratio - 2.0).abs() < 1e-9);
        assert_eq!(
            image::guess_format(&out.payload).unwrap(),
            image::ImageFormat::Jpeg
        );
        let decoded = image::load_from_memory(&out.payload).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 50));
    }

    #[test]
    fn rejects_non_image_input() {
        let err = resize(b"definitely not an image", 100, DEFAULT_JPEG_QUALITY).unwrap_err();
        assert!(matches!(err, StageError::Decode(_)), "{err:?}");
    }

    #[test]
    fn orientation_tags_turn_then_mirror() {
        // One row: red then blue.
        let red = image::Rgba([255, 0, 0, 255]);
        let blue = image::Rgba([0, 0, 255, 255]);
        let row = RgbaImage::from_fn(2, 1, |x, _| if x == 0 { red } else { blue });
        let pixels = |tag: u32| {
            let img = Orientation::from_tag(tag).apply(row.clone());
            (img.dimensions(), img.pixels().copied().collect::<Vec<_>>())
        };

        assert_eq!(pixels(1), ((2, 1), vec![red, blue]));
        assert_eq!(pixels(2), ((2, 1), vec![blue, red]));
        assert_eq!(pixels(3), ((2, 1), vec![blue, red]));
        assert_eq!(pixels(4), ((2, 1), vec![red, blue]));
        assert_eq!(pixels(6), ((1, 2), vec![red, blue]));
        assert_eq!(pixels(8), ((1, 2), vec![blue, red]));
        assert_eq!(pixels(0), pixels(1));
        assert_eq!(pixels(42), pixels(1));
    }

    #[test]
    fn applies_orientation_six() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(ORIENT6_JPEG)
            .unwrap();
        let out = resize(&bytes, 1024, DEFAULT_JPEG_QUALITY).unwrap();
        assert_eq!((out.width, out.height), (1, 2));
        assert!((out.aspect_ratio - 0.5).abs() < 1e-9);
    }
}
