//! Raw capture persistence.
//!
//! Captures land at `{capture_dir}/{camera_id}/{YYYYMMDD-HHMMSS}.jpg` (local
//! time, second resolution). Two captures from the same camera in the same
//! second share a path and the later one overwrites the earlier.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::frame::Frame;

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Durable home for raw captures that are about to be classified.
pub trait FrameStore: Send {
    /// Write the frame and return where it went.
    fn persist(&self, frame: &Frame) -> Result<PathBuf>;
}

/// File stem shared by a capture and every artifact derived from it.
pub fn capture_stem(at: SystemTime) -> String {
    DateTime::<Local>::from(at).format("%Y%m%d-%H%M%S").to_string()
}

/// `{root}/{camera_id}/{stem}.{ext}`, rejecting ids that would escape `root`.
pub fn camera_path(root: &Path, camera_id: &str, stem: &str, ext: &str) -> Result<PathBuf> {
    validate_camera_id(camera_id)?;
    Ok(root.join(camera_id).join(format!("{}.{}", stem, ext)))
}

pub fn validate_camera_id(camera_id: &str) -> Result<()> {
    let ok = !camera_id.is_empty()
        && camera_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && camera_id != "."
        && camera_id != "..";
    if ok {
        Ok(())
    } else {
        Err(anyhow!(
            "camera id {:?} must be ascii letters, digits, '-', '_' or '.'",
            camera_id
        ))
    }
}

/// Encode an RGB image as JPEG, creating parent directories.
pub fn write_jpeg(image: &RgbImage, path: &Path, quality: u8) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let file = fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality)
        .encode(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .with_context(|| format!("encode jpeg {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("flush {}", path.display()))?;
    Ok(())
}

/// Writes captures as JPEG files under one root directory.
#[derive(Clone, Debug)]
pub struct JpegFrameStore {
    root: PathBuf,
    quality: u8,
}

impl JpegFrameStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, frame: &Frame) -> Result<PathBuf> {
        camera_path(
            &self.root,
            frame.camera_id(),
            &capture_stem(frame.captured_wall()),
            "jpg",
        )
    }
}

impl FrameStore for JpegFrameStore {
    fn persist(&self, frame: &Frame) -> Result<PathBuf> {
        let path = self.path_for(frame)?;
        let image = frame.to_rgb_image()?;
        write_jpeg(&image, &path, self.quality)?;
        Ok(path)
    }
}
