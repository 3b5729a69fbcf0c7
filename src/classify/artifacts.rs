//! Side outputs of a classification.
//!
//! - annotated copy with boxes drawn: `{detections_dir}/{camera_id}/{stem}.jpg`
//! - YOLO training sample: `{training_dir}/{camera_id}/{stem}.jpg` plus
//!   `{stem}.txt` with one `class_id xc yc w h` line per detection,
//!   normalized to the image size, six decimals

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::Detection;
use crate::storage::{camera_path, write_jpeg, DEFAULT_JPEG_QUALITY};
use crate::telemetry::LogSink;

const TARGET: &str = "camwatch::artifacts";
const BOX_THICKNESS: u32 = 2;

pub struct ArtifactWriter {
    detections_dir: PathBuf,
    training_dir: Option<PathBuf>,
    class_names: Vec<String>,
    quality: u8,
    sink: Arc<dyn LogSink>,
}

impl ArtifactWriter {
    pub fn new(detections_dir: impl Into<PathBuf>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            detections_dir: detections_dir.into(),
            training_dir: None,
            class_names: Vec::new(),
            quality: DEFAULT_JPEG_QUALITY,
            sink,
        }
    }

    /// Also write YOLO training samples. `class_names` gives the class id order.
    pub fn with_training_data(mut self, dir: impl Into<PathBuf>, class_names: Vec<String>) -> Self {
        self.training_dir = Some(dir.into());
        self.class_names = class_names;
        self
    }

    pub fn detections_dir(&self) -> &Path {
        &self.detections_dir
    }

    /// Write every artifact for `capture` and return the annotated image path.
    ///
    /// A training-sample failure is logged and does not fail the call; the
    /// annotated image is the only artifact the caller depends on.
    pub fn write(
        &self,
        capture: &Path,
        camera_id: &str,
        image: &RgbImage,
        detections: &[Detection],
    ) -> Result<PathBuf> {
        let stem = capture
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("capture path {} has no file stem", capture.display()))?;

        let annotated_path = camera_path(&self.detections_dir, camera_id, stem, "jpg")?;
        write_jpeg(&annotate(image, detections), &annotated_path, self.quality)?;

        if let Some(dir) = &self.training_dir {
            if let Err(err) = self.write_training_sample(dir, camera_id, stem, image, detections) {
                self.sink.warn(
                    TARGET,
                    format_args!("training sample for {} not written: {:#}", camera_id, err),
                );
            }
        }

        Ok(annotated_path)
    }

    fn write_training_sample(
        &self,
        dir: &Path,
        camera_id: &str,
        stem: &str,
        image: &RgbImage,
        detections: &[Detection],
    ) -> Result<()> {
        let labels = yolo_labels(detections, image.width(), image.height(), &self.class_names, |label| {
            self.sink.warn(
                TARGET,
                format_args!("label {:?} is not in the class list; skipped", label),
            )
        });
        let image_path = camera_path(dir, camera_id, stem, "jpg")?;
        write_jpeg(image, &image_path, self.quality)?;
        let label_path = image_path.with_extension("txt");
        fs::write(&label_path, labels)
            .with_context(|| format!("write {}", label_path.display()))?;
        Ok(())
    }
}

/// Copy of `image` with each detection outlined.
pub fn annotate(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut out = image.clone();
    for detection in detections {
        let color = label_color(&detection.label);
        for inset in 0..BOX_THICKNESS {
            draw_rectangle(
                &mut out,
                detection.bbox.x1().saturating_add(inset),
                detection.bbox.y1().saturating_add(inset),
                detection.bbox.x2().saturating_sub(inset),
                detection.bbox.y2().saturating_sub(inset),
                color,
            );
        }
    }
    out
}

/// YOLO label file body. Labels missing from `class_names` go to `on_unknown`.
pub fn yolo_labels(
    detections: &[Detection],
    width: u32,
    height: u32,
    class_names: &[String],
    mut on_unknown: impl FnMut(&str),
) -> String {
    let (w, h) = (width.max(1) as f64, height.max(1) as f64);
    let mut out = String::new();
    for detection in detections {
        let Some(class_id) = class_names.iter().position(|c| *c == detection.label) else {
            on_unknown(&detection.label);
            continue;
        };
        let bbox = detection.bbox;
        let xc = (bbox.x1() as f64 + bbox.x2() as f64) / 2.0 / w;
        let yc = (bbox.y1() as f64 + bbox.y2() as f64) / 2.0 / h;
        let bw = bbox.width() as f64 / w;
        let bh = bbox.height() as f64 / h;
        let _ = writeln!(out, "{} {:.6} {:.6} {:.6} {:.6}", class_id, xc, yc, bw, bh);
    }
    out
}

fn label_color(label: &str) -> Rgb<u8> {
    match label {
        "person" => Rgb([0, 255, 0]),
        "car" | "truck" | "bus" | "motorcycle" => Rgb([255, 160, 0]),
        _ => {
            let hash = label
                .bytes()
                .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
            Rgb([(hash >> 16) as u8 | 0x40, (hash >> 8) as u8 | 0x40, hash as u8 | 0x40])
        }
    }
}

fn draw_rectangle(image: &mut RgbImage, left: u32, top: u32, right: u32, bottom: u32, color: Rgb<u8>) {
    if image.width() == 0 || image.height() == 0 || left > right || top > bottom {
        return;
    }
    let max_x = image.width() - 1;
    let max_y = image.height() - 1;
    let (left, right) = (left.min(max_x), right.min(max_x));
    let (top, bottom) = (top.min(max_y), bottom.min(max_y));

    for x in left..=right {
        image.put_pixel(x, top, color);
        image.put_pixel(x, bottom, color);
    }
    for y in top..=bottom {
        image.put_pixel(left, y, color);
        image.put_pixel(right, y, color);
    }
}
