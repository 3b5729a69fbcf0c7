//! Object classification of persisted captures.
//!
//! A `Classifier` reads a capture from disk, returns what it found, and reports
//! where it wrote the annotated copy. Backends:
//! - `StubClassifier`: scripted results for tests and dry runs
//! - `TractClassifier`: YOLOv8-style ONNX model via tract (feature: backend-tract)

pub mod artifacts;
pub mod stub;
#[cfg(feature = "backend-tract")]
pub mod tract;

use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub use artifacts::ArtifactWriter;
pub use stub::StubClassifier;

/// The 80 COCO class names in model output order.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Axis-aligned box in integer pixel coordinates, `x1 <= x2` and `y1 <= y2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    x1: u32,
    y1: u32,
    x2: u32,
    y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Result<Self> {
        if x1 > x2 || y1 > y2 {
            return Err(anyhow!(
                "invalid box ({}, {}, {}, {}): corners out of order",
                x1,
                y1,
                x2,
                y2
            ));
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    /// Build from float corners, clamping into a `width` x `height` frame.
    pub fn from_corners_clamped(x1: f32, y1: f32, x2: f32, y2: f32, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        let cx = |v: f32| v.clamp(0.0, max_x).round() as u32;
        let cy = |v: f32| v.clamp(0.0, max_y).round() as u32;
        let (ax, bx) = (cx(x1), cx(x2));
        let (ay, by) = (cy(y1), cy(y2));
        Self {
            x1: ax.min(bx),
            y1: ay.min(by),
            x2: ax.max(bx),
            y2: ay.max(by),
        }
    }

    pub fn x1(&self) -> u32 {
        self.x1
    }

    pub fn y1(&self) -> u32 {
        self.y1
    }

    pub fn x2(&self) -> u32 {
        self.x2
    }

    pub fn y2(&self) -> u32 {
        self.y2
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        if ix2 <= ix1 || iy2 <= iy1 {
            return 0.0;
        }
        let inter = (ix2 - ix1) as u64 * (iy2 - iy1) as u64;
        let union = self.area() + other.area() - inter;
        if union == 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Result<Self> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(anyhow!("confidence {} outside [0, 1]", confidence));
        }
        Ok(Self {
            label: label.into(),
            confidence,
            bbox,
        })
    }
}

/// Outcome of classifying one capture.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Classification {
    pub detections: Vec<Detection>,
    /// Where the annotated copy was written, if one was.
    pub annotated_path: Option<PathBuf>,
}

impl Classification {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn labels(&self) -> BTreeSet<&str> {
        self.detections.iter().map(|d| d.label.as_str()).collect()
    }

    /// `person (0.91), car (0.77)`
    pub fn summary(&self) -> String {
        self.detections
            .iter()
            .map(|d| format!("{} ({:.2})", d.label, d.confidence))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Object classifier over persisted captures.
pub trait Classifier: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Classify the capture at `image_path` taken by `camera_id`.
    ///
    /// Errors mean "no result"; the caller logs them and treats the capture as
    /// having no detections.
    fn classify(&mut self, image_path: &Path, camera_id: &str) -> Result<Classification>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Target-class and confidence filtering shared by backends.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionFilter {
    classes: BTreeSet<String>,
    confidence_threshold: f32,
}

impl DetectionFilter {
    /// An empty class set accepts every label.
    pub fn new(classes: impl IntoIterator<Item = String>, confidence_threshold: f32) -> Self {
        Self {
            classes: classes.into_iter().collect(),
            confidence_threshold,
        }
    }

    pub fn accepts(&self, label: &str, confidence: f32) -> bool {
        confidence >= self.confidence_threshold
            && (self.classes.is_empty() || self.classes.contains(label))
    }

    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| self.accepts(&d.label, d.confidence))
            .collect()
    }
}

/// Class-wise non-maximum suppression, highest confidence first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let overlaps = keep.iter().any(|kept| {
            kept.label == candidate.label && kept.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            keep.push(candidate);
        }
    }
    keep
}
