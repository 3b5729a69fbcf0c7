#![cfg(feature = "backend-tract")]

//! YOLOv8-style ONNX object detector on tract.
//!
//! Expects a single `[1, 3, S, S]` float input (RGB, 0..1) and a
//! `[1, 4 + classes, boxes]` output where the first four rows are
//! `cx, cy, w, h` in input pixels and the rest are per-class scores.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tract_onnx::prelude::*;

use super::{
    non_max_suppression, ArtifactWriter, BoundingBox, Classification, Classifier, Detection,
    DetectionFilter,
};

pub const DEFAULT_INPUT_SIZE: u32 = 640;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

pub struct TractClassifier {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    class_names: Vec<String>,
    filter: DetectionFilter,
    iou_threshold: f32,
    artifacts: Option<ArtifactWriter>,
}

impl TractClassifier {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, class_names: Vec<String>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            class_names,
            filter: DetectionFilter::new(Vec::new(), 0.5),
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            artifacts: None,
        })
    }

    pub fn with_filter(mut self, filter: DetectionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    pub fn with_artifacts(mut self, writer: ArtifactWriter) -> Self {
        self.artifacts = Some(writer);
        self
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let side = self.input_size;
        let resized = imageops::resize(image, side, side, FilterType::Triangle);
        let side = side as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.0
        })
        .into_tensor()
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let shape = output.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let data = output
            .as_slice::<f32>()
            .context("model output tensor was not f32")?;

        let decoded = decode_output(
            data,
            shape[1],
            shape[2],
            &self.class_names,
            &self.filter,
            Scale {
                x: image.width() as f32 / self.input_size as f32,
                y: image.height() as f32 / self.input_size as f32,
                width: image.width(),
                height: image.height(),
            },
        );
        Ok(non_max_suppression(decoded, self.iou_threshold))
    }
}

impl Classifier for TractClassifier {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn classify(&mut self, image_path: &Path, camera_id: &str) -> Result<Classification> {
        let image = image::open(image_path)
            .with_context(|| format!("open capture {}", image_path.display()))?
            .into_rgb8();
        let detections = self.detect(&image)?;
        let annotated_path = match &self.artifacts {
            Some(writer) if !detections.is_empty() => {
                Some(writer.write(image_path, camera_id, &image, &detections)?)
            }
            _ => None,
        };
        Ok(Classification {
            detections,
            annotated_path,
        })
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.input_size, self.input_size);
        self.detect(&blank).map(|_| ())
    }
}

#[derive(Clone, Copy, Debug)]
struct Scale {
    x: f32,
    y: f32,
    width: u32,
    height: u32,
}

/// Decode a row-major `[attrs, boxes]` YOLOv8 head into frame-space detections.
fn decode_output(
    data: &[f32],
    attrs: usize,
    boxes: usize,
    class_names: &[String],
    filter: &DetectionFilter,
    scale: Scale,
) -> Vec<Detection> {
    let at = |row: usize, col: usize| data.get(row * boxes + col).copied().unwrap_or(0.0);
    let classes = attrs - 4;
    let mut detections = Vec::new();

    for i in 0..boxes {
        let Some((class_id, score)) = (0..classes)
            .map(|c| (c, at(4 + c, i)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
        else {
            continue;
        };
        let Some(label) = class_names.get(class_id) else {
            continue;
        };
        if !score.is_finite() || !filter.accepts(label, score) {
            continue;
        }

        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let bbox = BoundingBox::from_corners_clamped(
            (cx - w / 2.0) * scale.x,
            (cy - h / 2.0) * scale.y,
            (cx + w / 2.0) * scale.x,
            (cy + h / 2.0) * scale.y,
            scale.width,
            scale.height,
        );
        if let Ok(detection) = Detection::new(label.clone(), score.clamp(0.0, 1.0), bbox) {
            detections.push(detection);
        }
    }
    detections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_best_class_and_scales_to_frame() {
        let classes = vec!["person".to_string(), "car".to_string()];
        // Two boxes, six attribute rows (cx, cy, w, h, person, car).
        let data = [
            320.0, 100.0, // cx
            320.0, 100.0, // cy
            64.0, 10.0, // w
            128.0, 10.0, // h
            0.9, 0.1, // person
            0.2, 0.3, // car
        ];
        let filter = DetectionFilter::new(Vec::new(), 0.5);
        let scale = Scale {
            x: 2.0,
            y: 0.5,
            width: 1280,
            height: 320,
        };
        let detections = decode_output(&data, 6, 2, &classes, &filter, scale);
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.label, "person");
        assert_eq!((d.bbox.x1(), d.bbox.x2()), (576, 704));
        assert_eq!((d.bbox.y1(), d.bbox.y2()), (128, 192));
    }
}
