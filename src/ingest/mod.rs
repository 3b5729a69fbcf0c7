//! Frame acquisition.
//!
//! This module provides:
//! - `CameraSource`: immutable description of one configured camera
//! - `FrameTransport`: the grab/retrieve seam every backend implements
//! - `StreamReader`: the self-healing reader state machine driven by one thread
//!
//! Transports are selected by URL scheme:
//! - `stub://` synthetic scenes (always available, used in tests and dry runs)
//! - `http(s)://` MJPEG or JPEG snapshots (feature: ingest-mjpeg)
//! - `rtsp(s)://` GStreamer decode (feature: rtsp-gstreamer)
//!
//! Transports report errors; they never retry. Reconnect policy lives in the
//! reader so every backend gets the same behavior.

#[cfg(feature = "ingest-mjpeg")]
pub mod mjpeg;
pub mod reader;
pub mod rtsp;
pub mod synthetic;

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::frame::RawImage;

pub use reader::{Frames, ReaderState, ReaderStats, StreamReader};
pub use synthetic::SyntheticTransport;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_FRAME_FLUSH: u32 = 3;

/// One configured camera. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraSource {
    id: String,
    name: String,
    url: String,
    reconnect_delay: Duration,
    frame_flush: u32,
    target_fps: u32,
}

impl CameraSource {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            frame_flush: DEFAULT_FRAME_FLUSH,
            target_fps: 0,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Buffered frames discarded before each decode.
    pub fn with_frame_flush(mut self, frames: u32) -> Self {
        self.frame_flush = frames;
        self
    }

    /// Upper bound on frames per second forwarded for this camera. 0 = unlimited.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = fps;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn frame_flush(&self) -> u32 {
        self.frame_flush
    }

    pub fn target_fps(&self) -> u32 {
        self.target_fps
    }

    /// Minimum spacing between forwarded frames.
    pub fn frame_interval(&self) -> Duration {
        if self.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis((1000 / self.target_fps).max(1) as u64)
        }
    }

    /// URL with any `user:password@` userinfo removed, for logs.
    pub fn redacted_url(&self) -> String {
        redact_url(&self.url)
    }
}

/// A video connection that can skip ahead cheaply and decode on demand.
///
/// Mirrors the grab/retrieve split of capture libraries: `grab` advances the
/// stream by one frame without decoding it, `retrieve` decodes the most
/// recently grabbed frame. Implementations must make `close` idempotent and
/// must release their connection on drop.
pub trait FrameTransport: Send {
    /// Open (or reopen) the connection.
    fn open(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Advance one frame without decoding.
    fn grab(&mut self) -> Result<()>;

    /// Decode the last grabbed frame.
    fn retrieve(&mut self) -> Result<RawImage>;

    fn close(&mut self);
}

/// Build the transport for a camera's URL scheme.
///
/// An unsupported scheme, or a scheme whose feature is not compiled in, is a
/// configuration defect and fails here rather than inside the reconnect loop.
pub fn open_transport(source: &CameraSource) -> Result<Box<dyn FrameTransport>> {
    let url = source.url();
    let scheme = url
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .ok_or_else(|| anyhow!("camera {} has no URL scheme: {}", source.id(), redact_url(url)))?;

    match scheme.as_str() {
        "stub" => Ok(Box::new(SyntheticTransport::from_url(url)?)),
        "http" | "https" => {
            #[cfg(feature = "ingest-mjpeg")]
            {
                Ok(Box::new(mjpeg::MjpegTransport::new(url)?))
            }
            #[cfg(not(feature = "ingest-mjpeg"))]
            {
                Err(anyhow!(
                    "camera {}: http streams require the ingest-mjpeg feature",
                    source.id()
                ))
            }
        }
        "rtsp" | "rtsps" => Ok(Box::new(rtsp::RtspTransport::new(url)?)),
        other => Err(anyhow!(
            "camera {}: unsupported stream scheme '{}'",
            source.id(),
            other
        )),
    }
}

pub(crate) fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", scheme, &rest[at + 1..]),
        None => url.to_string(),
    }
}
