//! camwatch: multi-camera motion-gated object detection and alerting.
//!
//! # Architecture
//!
//! One acquisition thread per camera pulls frames through a reconnecting
//! [`StreamReader`] and pushes them into a bounded channel owned by the
//! [`StreamMultiplexer`]. A single consumer, the [`Orchestrator`], drains that
//! channel and runs each camera's pipeline:
//!
//! 1. Motion gate ([`MotionDetector`]) against the camera's previous frame.
//! 2. Detection cooldown check.
//! 3. Persist the frame ([`FrameStore`]) and classify it ([`Classifier`]).
//! 4. Alert on alert-worthy labels outside the alert cooldown ([`Notifier`]).
//!
//! A slow consumer never blocks acquisition indefinitely: producers give up
//! after a push timeout and the frame is counted as dropped.
//!
//! # Module Structure
//!
//! - `ingest`: camera sources, transports (RTSP, MJPEG, synthetic) and the reader
//! - `mux`: acquisition threads and the bounded frame channel
//! - `motion`, `cooldown`: per-camera gating
//! - `storage`: capture persistence
//! - `classify`: detection types, backends and annotated artifacts
//! - `notify`: alert delivery (log, MQTT)
//! - `orchestrator`: the consumer loop
//! - `config`: file and environment configuration

pub mod classify;
pub mod clock;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod motion;
pub mod mux;
pub mod notify;
pub mod orchestrator;
pub mod storage;
pub mod telemetry;

pub use classify::{
    BoundingBox, Classification, Classifier, Detection, DetectionFilter, StubClassifier,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CamwatchConfig;
pub use cooldown::CooldownState;
pub use error::PipelineError;
pub use frame::{Frame, RawImage};
pub use ingest::{CameraSource, FrameTransport, ReaderState, StreamReader};
pub use motion::{MotionDetector, MotionReading, MotionThresholds};
pub use mux::{FrameFeed, MultiplexerOptions, SourceStats, StreamMultiplexer};
pub use notify::{Alert, ConversationState, LogNotifier, Notifier};
pub use orchestrator::{
    CameraState, Capabilities, EventOutcome, Orchestrator, OrchestratorConfig, OrchestratorStats,
};
pub use storage::{FrameStore, JpegFrameStore};
pub use telemetry::{LogFacadeSink, LogSink, MemorySink};
