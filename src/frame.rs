//! Decoded frames.
//!
//! - `RawImage`: an RGB8 buffer as produced by a transport, not yet tied to a camera.
//! - `Frame`: a `RawImage` tagged with its camera and capture timestamps.
//!
//! A `Frame` is moved from the acquisition thread through the multiplexer to the
//! consumer. No `Clone`, no mutable pixel access.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::time::{Instant, SystemTime};

/// Decoded RGB8 image, row-major, no padding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RawImage {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    /// Uniform image, handy for synthetic scenes.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            pixels.extend_from_slice(&rgb);
        }
        Self {
            pixels,
            width,
            height,
        }
    }

    pub fn from_rgb_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: image.into_raw(),
            width,
            height,
        }
    }
}

/// A decoded frame owned by exactly one stage of the pipeline at a time.
pub struct Frame {
    camera_id: String,
    image: RawImage,
    sequence: u64,
    captured_at: Instant,
    captured_wall: SystemTime,
}

impl Frame {
    pub fn new(camera_id: impl Into<String>, image: RawImage, sequence: u64) -> Self {
        Self {
            camera_id: camera_id.into(),
            image,
            sequence,
            captured_at: Instant::now(),
            captured_wall: SystemTime::now(),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.image.pixels
    }

    /// Per-reader sequence number, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Monotonic capture instant.
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Wall-clock capture time, used for capture file names.
    pub fn captured_wall(&self) -> SystemTime {
        self.captured_wall
    }

    /// Single-channel intensity plane (ITU-R BT.601 weights, fixed point).
    pub fn luma(&self) -> Vec<u8> {
        self.image
            .pixels
            .chunks_exact(3)
            .map(|px| {
                let (r, g, b) = (px[0] as u32, px[1] as u32, px[2] as u32);
                ((77 * r + 150 * g + 29 * b + 128) >> 8) as u8
            })
            .collect()
    }

    /// Copy of the pixels as an `image` buffer for encoding.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.image.width, self.image.height, self.image.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }

    pub fn byte_len(&self) -> usize {
        self.image.pixels.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("camera_id", &self.camera_id)
            .field("width", &self.image.width)
            .field("height", &self.image.height)
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_image_rejects_mismatched_buffer() {
        assert!(RawImage::new(vec![0; 10], 2, 2).is_err());
        assert!(RawImage::new(vec![0; 12], 2, 2).is_ok());
    }

    #[test]
    fn luma_of_grey_pixels_is_exact() {
        let frame = Frame::new("cam1", RawImage::filled(4, 2, [200, 200, 200]), 1);
        assert!(frame.luma().iter().all(|&v| v == 200));
        assert_eq!(frame.luma().len(), 8);
    }

    #[test]
    fn luma_weights_green_heaviest() {
        let red = Frame::new("cam1", RawImage::filled(1, 1, [255, 0, 0]), 1).luma()[0];
        let green = Frame::new("cam1", RawImage::filled(1, 1, [0, 255, 0]), 1).luma()[0];
        let blue = Frame::new("cam1", RawImage::filled(1, 1, [0, 0, 255]), 1).luma()[0];
        assert!(green > red && red > blue);
    }

    #[test]
    fn frame_round_trips_to_rgb_image() -> Result<()> {
        let frame = Frame::new("cam2", RawImage::filled(3, 2, [1, 2, 3]), 7);
        let image = frame.to_rgb_image()?;
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(2, 1).0, [1, 2, 3]);
        assert_eq!(frame.camera_id(), "cam2");
        assert_eq!(frame.sequence(), 7);
        Ok(())
    }
}
