//! Detection orchestrator.
//!
//! The single consumer of the frame feed. For each frame it runs that camera's
//! motion filter, and on motion outside the detection cooldown it escalates:
//! wait for the scene to settle, persist the frame, classify the capture, and
//! alert when an alert-worthy label shows up outside the alert cooldown.
//!
//! All per-camera state is owned here and touched from one thread only.
//! Classification and delivery run inline, so while one camera escalates the
//! others queue (bounded) or drop in the multiplexer.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::classify::{Classification, Classifier};
use crate::clock::{Clock, SystemClock};
use crate::cooldown::CooldownState;
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::ingest::CameraSource;
use crate::motion::{MotionDetector, MotionThresholds};
use crate::mux::FrameFeed;
use crate::notify::{Alert, ConversationState, Notifier};
use crate::storage::FrameStore;
use crate::telemetry::LogSink;

const TARGET: &str = "camwatch::orchestrator";

pub const DEFAULT_STABILIZATION_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_DETECTION_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_ALERT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Pause between motion and persisting the frame.
    pub stabilization_delay: Duration,
    /// Minimum gap after a classification hit before the camera escalates again.
    pub detection_cooldown: Duration,
    /// Minimum gap between delivered alerts for one camera.
    pub alert_cooldown: Duration,
    pub alert_labels: BTreeSet<String>,
    pub recipients: Vec<String>,
    pub motion: MotionThresholds,
    /// How often `run` logs a health line. `None` disables it.
    pub health_interval: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stabilization_delay: DEFAULT_STABILIZATION_DELAY,
            detection_cooldown: DEFAULT_DETECTION_COOLDOWN,
            alert_cooldown: DEFAULT_ALERT_COOLDOWN,
            alert_labels: BTreeSet::from(["person".to_string()]),
            recipients: Vec::new(),
            motion: MotionThresholds::default(),
            health_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// External capabilities the orchestrator drives.
pub struct Capabilities {
    pub classifier: Box<dyn Classifier>,
    pub notifier: Box<dyn Notifier>,
    pub store: Box<dyn FrameStore>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraState {
    Idle,
    MotionPending,
    Escalated,
}

/// What happened to one frame.
#[derive(Clone, Debug, PartialEq)]
pub enum EventOutcome {
    NoMotion { score: u64 },
    /// Motion seen while the detection cooldown was running.
    CoolingDown { score: u64 },
    PersistFailed,
    NoDetections { capture: PathBuf },
    Escalated {
        capture: PathBuf,
        classification: Classification,
        alerted: bool,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub frames_seen: u64,
    pub motion_events: u64,
    pub cooldown_skips: u64,
    pub escalations: u64,
    pub detections: u64,
    pub alerts_sent: u64,
    pub persist_failures: u64,
    pub classification_failures: u64,
    pub delivery_failures: u64,
}

struct CameraPipeline {
    display_name: String,
    motion: MotionDetector,
    cooldown: CooldownState,
    state: CameraState,
    conversation: ConversationState,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    cameras: HashMap<String, CameraPipeline>,
    capabilities: Capabilities,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn LogSink>,
    stats: OrchestratorStats,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        cameras: &[CameraSource],
        capabilities: Capabilities,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self> {
        let mut pipelines = HashMap::with_capacity(cameras.len());
        for camera in cameras {
            let pipeline = CameraPipeline {
                display_name: camera.name().to_string(),
                motion: MotionDetector::new(config.motion),
                cooldown: CooldownState::new(),
                state: CameraState::Idle,
                conversation: ConversationState::new(),
            };
            if pipelines.insert(camera.id().to_string(), pipeline).is_some() {
                return Err(PipelineError::DuplicateCamera(camera.id().to_string()).into());
            }
        }
        Ok(Self {
            config,
            cameras: pipelines,
            capabilities,
            clock: Arc::new(SystemClock),
            sink,
            stats: OrchestratorStats::default(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn stats(&self) -> &OrchestratorStats {
        &self.stats
    }

    pub fn state(&self, camera_id: &str) -> Option<CameraState> {
        self.cameras.get(camera_id).map(|c| c.state)
    }

    pub fn cooldown(&self, camera_id: &str) -> Option<CooldownState> {
        self.cameras.get(camera_id).map(|c| c.cooldown)
    }

    /// Overwrite a camera's cooldown timestamps.
    pub fn set_cooldown(&mut self, camera_id: &str, cooldown: CooldownState) -> Result<()> {
        let camera = self
            .cameras
            .get_mut(camera_id)
            .ok_or_else(|| PipelineError::UnknownCamera(camera_id.to_string()))?;
        camera.cooldown = cooldown;
        Ok(())
    }

    pub fn conversation(&self, camera_id: &str) -> Option<&ConversationState> {
        self.cameras.get(camera_id).map(|c| &c.conversation)
    }

    /// Process one frame end to end.
    ///
    /// Only an invariant violation (a frame from an unconfigured camera) is
    /// returned as an error. Persist, classify and delivery failures are logged
    /// and folded into the outcome.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<EventOutcome> {
        self.stats.frames_seen += 1;
        let now = self.clock.now();
        let camera_id = frame.camera_id().to_string();
        let camera = self
            .cameras
            .get_mut(&camera_id)
            .ok_or_else(|| PipelineError::UnknownCamera(camera_id.clone()))?;

        let reading = camera.motion.detect(&frame);
        if !reading.motion_detected {
            return Ok(EventOutcome::NoMotion {
                score: reading.score,
            });
        }
        self.stats.motion_events += 1;

        if camera
            .cooldown
            .in_detection_cooldown(now, self.config.detection_cooldown)
        {
            self.stats.cooldown_skips += 1;
            self.sink.debug(
                TARGET,
                format_args!("{} motion (score {}) during detection cooldown", camera_id, reading.score),
            );
            return Ok(EventOutcome::CoolingDown {
                score: reading.score,
            });
        }

        camera.state = CameraState::MotionPending;
        self.sink.info(
            TARGET,
            format_args!("{} motion detected (score {})", camera_id, reading.score),
        );
        if !self.config.stabilization_delay.is_zero() {
            std::thread::sleep(self.config.stabilization_delay);
        }

        let capture = match self.capabilities.store.persist(&frame) {
            Ok(path) => path,
            Err(err) => {
                self.stats.persist_failures += 1;
                camera.state = CameraState::Idle;
                self.sink.warn(
                    TARGET,
                    format_args!("{} capture not saved, event dropped: {:#}", camera_id, err),
                );
                return Ok(EventOutcome::PersistFailed);
            }
        };
        self.sink
            .debug(TARGET, format_args!("{} frame saved: {}", camera_id, capture.display()));

        camera.state = CameraState::Escalated;
        self.stats.escalations += 1;
        let classification = match self.capabilities.classifier.classify(&capture, &camera_id) {
            Ok(classification) => classification,
            Err(err) => {
                self.stats.classification_failures += 1;
                self.sink.warn(
                    TARGET,
                    format_args!(
                        "{} classification by {} failed: {:#}",
                        camera_id,
                        self.capabilities.classifier.name(),
                        err
                    ),
                );
                Classification::empty()
            }
        };

        if classification.is_empty() {
            camera.state = CameraState::Idle;
            return Ok(EventOutcome::NoDetections { capture });
        }

        camera.cooldown.record_detection(now);
        self.stats.detections += 1;
        self.sink.info(
            TARGET,
            format_args!("{} detected: {}", camera_id, classification.summary()),
        );

        let worthy: Vec<&str> = classification
            .labels()
            .into_iter()
            .filter(|label| self.config.alert_labels.contains(*label))
            .collect();

        let mut alerted = false;
        if !worthy.is_empty() {
            if camera.cooldown.alert_ready(now, self.config.alert_cooldown) {
                if classification.annotated_path.is_none() {
                    self.sink.warn(
                        TARGET,
                        format_args!("{} no annotated image; alert goes out without attachment", camera_id),
                    );
                }
                let alert = build_alert(
                    &camera_id,
                    &camera.display_name,
                    &worthy,
                    &classification,
                    &self.config.recipients,
                );
                match self
                    .capabilities
                    .notifier
                    .deliver(&alert, &mut camera.conversation)
                {
                    Ok(()) => {
                        camera.cooldown.record_alert(now);
                        self.stats.alerts_sent += 1;
                        alerted = true;
                        self.sink.info(
                            TARGET,
                            format_args!(
                                "{} alert sent via {} to {} recipient(s)",
                                camera_id,
                                self.capabilities.notifier.name(),
                                alert.recipients.len()
                            ),
                        );
                    }
                    Err(err) => {
                        self.stats.delivery_failures += 1;
                        self.sink.warn(
                            TARGET,
                            format_args!("{} alert not delivered: {:#}", camera_id, err),
                        );
                    }
                }
            } else {
                self.sink.debug(
                    TARGET,
                    format_args!("{} alert suppressed by cooldown", camera_id),
                );
            }
        }

        camera.state = CameraState::Idle;
        Ok(EventOutcome::Escalated {
            capture,
            classification,
            alerted,
        })
    }

    /// Consume frames until `stop` is set.
    ///
    /// Returns early only on an invariant violation.
    pub fn run<F: FrameFeed + ?Sized>(
        &mut self,
        feed: &F,
        stop: &AtomicBool,
        poll_timeout: Duration,
    ) -> Result<()> {
        let mut last_health = Instant::now();
        while !stop.load(Ordering::SeqCst) {
            if let Some(frame) = feed.next_frame(poll_timeout) {
                self.handle_frame(frame)?;
            }
            if let Some(interval) = self.config.health_interval {
                if last_health.elapsed() >= interval {
                    last_health = Instant::now();
                    self.log_health(feed.health_report());
                }
            }
        }
        self.sink.info(
            TARGET,
            format_args!(
                "consumer stopped after {} frame(s), {} alert(s)",
                self.stats.frames_seen, self.stats.alerts_sent
            ),
        );
        Ok(())
    }

    fn log_health(&self, feed_report: Option<String>) {
        let s = &self.stats;
        self.sink.info(
            TARGET,
            format_args!(
                "health: frames={} motion={} escalations={} alerts={} failures(persist={} classify={} deliver={}){}{}",
                s.frames_seen,
                s.motion_events,
                s.escalations,
                s.alerts_sent,
                s.persist_failures,
                s.classification_failures,
                s.delivery_failures,
                if feed_report.is_some() { " " } else { "" },
                feed_report.unwrap_or_default()
            ),
        );
    }
}

fn build_alert(
    camera_id: &str,
    display_name: &str,
    worthy: &[&str],
    classification: &Classification,
    recipients: &[String],
) -> Alert {
    let headline = worthy
        .iter()
        .map(|label| capitalize(label))
        .collect::<Vec<_>>()
        .join(", ");
    Alert {
        camera_id: camera_id.to_string(),
        subject: format!("Alert: {} detected on {}", headline, display_name),
        body: format!(
            "Detected {} on camera {} ({}).",
            classification.summary(),
            display_name,
            camera_id
        ),
        recipients: recipients.to_vec(),
        attachment: classification.annotated_path.clone(),
    }
}

fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{BoundingBox, Detection, StubClassifier};
    use crate::clock::ManualClock;
    use crate::frame::RawImage;
    use crate::notify::LogNotifier;
    use crate::telemetry::MemorySink;

    struct NullStore;

    impl FrameStore for NullStore {
        fn persist(&self, frame: &Frame) -> Result<PathBuf> {
            Ok(PathBuf::from(format!("/tmp/{}-{}.jpg", frame.camera_id(), frame.sequence())))
        }
    }

    fn frame(level: u8, seq: u64) -> Frame {
        Frame::new("cam1", RawImage::filled(10, 10, [level; 3]), seq)
    }

    fn orchestrator(classifier: StubClassifier) -> Orchestrator {
        let sink = MemorySink::new();
        let config = OrchestratorConfig {
            stabilization_delay: Duration::ZERO,
            motion: MotionThresholds {
                pixel_threshold: 25,
                min_area: 10,
            },
            ..OrchestratorConfig::default()
        };
        Orchestrator::new(
            config,
            &[CameraSource::new("cam1", "Driveway", "stub://cam1")],
            Capabilities {
                classifier: Box::new(classifier),
                notifier: Box::new(LogNotifier::new(sink.clone())),
                store: Box::new(NullStore),
            },
            sink,
        )
        .expect("orchestrator")
        .with_clock(Arc::new(ManualClock::new(Duration::from_secs(1_000))))
    }

    #[test]
    fn first_frame_never_escalates() -> Result<()> {
        let mut orch = orchestrator(StubClassifier::empty());
        assert_eq!(orch.handle_frame(frame(0, 1))?, EventOutcome::NoMotion { score: 0 });
        assert_eq!(orch.stats().motion_events, 0);
        Ok(())
    }

    #[test]
    fn empty_classification_returns_to_idle_without_cooldown() -> Result<()> {
        let mut orch = orchestrator(StubClassifier::empty());
        orch.handle_frame(frame(0, 1))?;
        let outcome = orch.handle_frame(frame(200, 2))?;
        assert!(matches!(outcome, EventOutcome::NoDetections { .. }));
        assert_eq!(orch.state("cam1"), Some(CameraState::Idle));
        assert_eq!(orch.cooldown("cam1"), Some(CooldownState::new()));
        Ok(())
    }

    #[test]
    fn alert_subject_names_camera_and_labels() {
        let bbox = BoundingBox::new(10, 10, 50, 50).expect("box");
        let classification = Classification {
            detections: vec![Detection::new("person", 0.91, bbox).expect("det")],
            annotated_path: Some(PathBuf::from("/d/cam1/x.jpg")),
        };
        let alert = build_alert("cam1", "Driveway", &["person"], &classification, &["a@b".into()]);
        assert_eq!(alert.subject, "Alert: Person detected on Driveway");
        assert_eq!(alert.body, "Detected person (0.91) on camera Driveway (cam1).");
        assert_eq!(alert.attachment, Some(PathBuf::from("/d/cam1/x.jpg")));
    }

    #[test]
    fn duplicate_cameras_are_rejected() {
        let sink = MemorySink::new();
        let cam = CameraSource::new("cam1", "A", "stub://a");
        let result = Orchestrator::new(
            OrchestratorConfig::default(),
            &[cam.clone(), cam],
            Capabilities {
                classifier: Box::new(StubClassifier::empty()),
                notifier: Box::new(LogNotifier::new(sink.clone())),
                store: Box::new(NullStore),
            },
            sink,
        );
        assert!(result.is_err());
    }
}
