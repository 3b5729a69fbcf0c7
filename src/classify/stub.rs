use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{ArtifactWriter, BoundingBox, Classification, Classifier, Detection};

#[derive(Clone, Debug)]
enum Fallback {
    Nothing,
    Fixed(Vec<Detection>),
    WholeFrame { label: String, confidence: f32 },
}

/// Classifier that returns canned results. Used for dry runs and tests.
///
/// Queued results are consumed first, one per call; after that every call
/// gets the fallback.
pub struct StubClassifier {
    script: VecDeque<std::result::Result<Vec<Detection>, String>>,
    fallback: Fallback,
    artifacts: Option<ArtifactWriter>,
    calls: Arc<AtomicUsize>,
}

impl StubClassifier {
    /// Never detects anything.
    pub fn empty() -> Self {
        Self::with_fallback(Fallback::Nothing)
    }

    /// Always reports `detections`.
    pub fn fixed(detections: Vec<Detection>) -> Self {
        Self::with_fallback(Fallback::Fixed(detections))
    }

    /// Always reports one `label` covering the whole capture.
    pub fn whole_frame(label: impl Into<String>, confidence: f32) -> Self {
        Self::with_fallback(Fallback::WholeFrame {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
        })
    }

    fn with_fallback(fallback: Fallback) -> Self {
        Self {
            script: VecDeque::new(),
            fallback,
            artifacts: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push_result(mut self, detections: Vec<Detection>) -> Self {
        self.script.push_back(Ok(detections));
        self
    }

    pub fn push_error(mut self, message: impl Into<String>) -> Self {
        self.script.push_back(Err(message.into()));
        self
    }

    /// Render annotated copies (and training samples) for non-empty results.
    pub fn with_artifacts(mut self, writer: ArtifactWriter) -> Self {
        self.artifacts = Some(writer);
        self
    }

    /// Shared call counter, readable after the classifier is handed off.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    fn fallback_detections(&self, image_path: &Path) -> Result<Vec<Detection>> {
        match &self.fallback {
            Fallback::Nothing => Ok(Vec::new()),
            Fallback::Fixed(detections) => Ok(detections.clone()),
            Fallback::WholeFrame { label, confidence } => {
                let (w, h) = image::image_dimensions(image_path)
                    .with_context(|| format!("read dimensions of {}", image_path.display()))?;
                let bbox = BoundingBox::new(0, 0, w.saturating_sub(1), h.saturating_sub(1))?;
                Ok(vec![Detection::new(label.clone(), *confidence, bbox)?])
            }
        }
    }
}

impl Classifier for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn classify(&mut self, image_path: &Path, camera_id: &str) -> Result<Classification> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let detections = match self.script.pop_front() {
            Some(Ok(detections)) => detections,
            Some(Err(message)) => return Err(anyhow!(message)),
            None => self.fallback_detections(image_path)?,
        };

        let annotated_path = match (&self.artifacts, detections.is_empty()) {
            (Some(writer), false) => {
                let image = image::open(image_path)
                    .with_context(|| format!("open capture {}", image_path.display()))?
                    .into_rgb8();
                Some(writer.write(image_path, camera_id, &image, &detections)?)
            }
            _ => None,
        };

        Ok(Classification {
            detections,
            annotated_path,
        })
    }
}
