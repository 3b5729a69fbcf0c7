//! Self-healing stream reader.
//!
//! `StreamReader` drives one `FrameTransport` through
//! `Disconnected -> Connecting -> Streaming`. Any failure is an explicit move
//! back to `Disconnected` with a "retry not before" deadline, so the owning
//! thread can keep checking its shutdown flag while a camera is down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use super::{CameraSource, FrameTransport};
use crate::frame::Frame;
use crate::telemetry::LogSink;

const TARGET: &str = "camwatch::reader";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    Disconnected,
    Connecting,
    Streaming,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReaderStats {
    pub frames_captured: u64,
    /// Frames skipped by the bounded-staleness flush.
    pub frames_discarded: u64,
    pub connect_attempts: u64,
    pub failures: u64,
    pub state: ReaderState,
}

pub struct StreamReader {
    source: CameraSource,
    transport: Box<dyn FrameTransport>,
    state: ReaderState,
    retry_at: Option<Instant>,
    released: bool,
    frames_captured: u64,
    frames_discarded: u64,
    connect_attempts: u64,
    failures: u64,
    sink: Arc<dyn LogSink>,
}

impl StreamReader {
    /// Wrap a transport. Nothing is opened until the first `connect` or `step`.
    pub fn new(
        source: CameraSource,
        transport: Box<dyn FrameTransport>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            source,
            transport,
            state: ReaderState::Disconnected,
            retry_at: None,
            released: false,
            frames_captured: 0,
            frames_discarded: 0,
            connect_attempts: 0,
            failures: 0,
            sink,
        }
    }

    pub fn source(&self) -> &CameraSource {
        &self.source
    }

    /// Establish or re-establish the connection.
    ///
    /// Any existing connection is closed first, so calling this twice never
    /// leaves two connections open for the same camera.
    pub fn connect(&mut self) -> Result<()> {
        self.released = false;
        if self.transport.is_open() {
            self.transport.close();
        }
        self.state = ReaderState::Connecting;
        self.connect_attempts += 1;
        match self.transport.open() {
            Ok(()) => {
                self.state = ReaderState::Streaming;
                self.retry_at = None;
                self.sink.info(
                    TARGET,
                    format_args!(
                        "{} ({}) connected to {}",
                        self.source.id(),
                        self.source.name(),
                        self.source.redacted_url()
                    ),
                );
                Ok(())
            }
            Err(err) => {
                let message = format!("{:#}", err);
                self.fail("connect", &message);
                Err(err)
            }
        }
    }

    /// Advance the state machine by one step.
    ///
    /// Returns a frame only from `Streaming`. Never blocks on the reconnect
    /// delay: while the retry deadline is in the future this returns `None`
    /// immediately and `retry_in` reports how long is left.
    pub fn step(&mut self) -> Option<Frame> {
        if self.released {
            return None;
        }
        match self.state {
            ReaderState::Disconnected | ReaderState::Connecting => {
                if self.retry_in().is_some_and(|wait| !wait.is_zero()) {
                    return None;
                }
                // Failure is already logged and scheduled by connect().
                let _ = self.connect();
                None
            }
            ReaderState::Streaming => self.pull(),
        }
    }

    fn pull(&mut self) -> Option<Frame> {
        if !self.transport.is_open() {
            self.fail("stream", "connection is not open");
            return None;
        }
        for _ in 0..self.source.frame_flush() {
            if let Err(err) = self.transport.grab() {
                self.fail("flush", &format!("{:#}", err));
                return None;
            }
            self.frames_discarded += 1;
        }
        let decoded = self
            .transport
            .grab()
            .and_then(|()| self.transport.retrieve());
        match decoded {
            Ok(image) => {
                self.frames_captured += 1;
                Some(Frame::new(self.source.id(), image, self.frames_captured))
            }
            Err(err) => {
                self.fail("decode", &format!("{:#}", err));
                None
            }
        }
    }

    fn fail(&mut self, stage: &str, reason: &str) {
        self.failures += 1;
        self.transport.close();
        self.state = ReaderState::Disconnected;
        let delay = self.source.reconnect_delay();
        self.retry_at = Some(Instant::now() + delay);
        self.sink.warn(
            TARGET,
            format_args!(
                "{} {} failed: {}; reconnecting in {:.1}s",
                self.source.id(),
                stage,
                reason,
                delay.as_secs_f64()
            ),
        );
    }

    /// Lazy, endless frame sequence.
    ///
    /// Sleeps through reconnect delays and never yields `None`. Acquisition
    /// threads that must observe shutdown drive `step` instead.
    pub fn frames(&mut self) -> Frames<'_> {
        self.released = false;
        Frames { reader: self }
    }

    /// Tear down the connection. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.transport.close();
        self.state = ReaderState::Disconnected;
        self.retry_at = None;
        self.released = true;
        self.sink.debug(
            TARGET,
            format_args!("{} released", self.source.id()),
        );
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn is_connected(&self) -> bool {
        self.state == ReaderState::Streaming && self.transport.is_open()
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Time until the next reconnect attempt, when one is scheduled.
    pub fn retry_in(&self) -> Option<Duration> {
        if self.state == ReaderState::Streaming {
            return None;
        }
        self.retry_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn stats(&self) -> ReaderStats {
        ReaderStats {
            frames_captured: self.frames_captured,
            frames_discarded: self.frames_discarded,
            connect_attempts: self.connect_attempts,
            failures: self.failures,
            state: self.state,
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.release();
    }
}

/// Iterator returned by [`StreamReader::frames`].
pub struct Frames<'a> {
    reader: &'a mut StreamReader,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.reader.step() {
                return Some(frame);
            }
            if let Some(wait) = self.reader.retry_in() {
                std::thread::sleep(wait);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawImage;
    use crate::ingest::SyntheticTransport;
    use crate::telemetry::MemorySink;
    use anyhow::anyhow;
    use log::Level;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counters {
        opens: AtomicU32,
        closes: AtomicU32,
        grabs: AtomicU32,
    }

    struct ScriptedTransport {
        counters: Arc<Counters>,
        open: bool,
        open_failures: u32,
        fail_grab: Option<u32>,
    }

    impl ScriptedTransport {
        fn new(counters: Arc<Counters>) -> Self {
            Self {
                counters,
                open: false,
                open_failures: 0,
                fail_grab: None,
            }
        }
    }

    impl FrameTransport for ScriptedTransport {
        fn open(&mut self) -> Result<()> {
            let n = self.counters.opens.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.open_failures {
                return Err(anyhow!("connection refused"));
            }
            self.open = true;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn grab(&mut self) -> Result<()> {
            let n = self.counters.grabs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_grab == Some(n) {
                return Err(anyhow!("stream ended"));
            }
            Ok(())
        }

        fn retrieve(&mut self) -> Result<RawImage> {
            Ok(RawImage::filled(2, 2, [9, 9, 9]))
        }

        fn close(&mut self) {
            if self.open {
                self.counters.closes.fetch_add(1, Ordering::SeqCst);
            }
            self.open = false;
        }
    }

    fn source(flush: u32, delay: Duration) -> CameraSource {
        CameraSource::new("cam1", "Driveway", "stub://driveway")
            .with_frame_flush(flush)
            .with_reconnect_delay(delay)
    }

    #[test]
    fn flush_discards_buffered_frames_before_decoding() {
        let counters = Arc::new(Counters::default());
        let transport = ScriptedTransport::new(counters.clone());
        let mut reader = StreamReader::new(
            source(3, Duration::from_secs(5)),
            Box::new(transport),
            MemorySink::new(),
        );

        assert!(reader.step().is_none(), "first step only connects");
        assert_eq!(reader.state(), ReaderState::Streaming);

        let frame = reader.step().expect("frame after connect");
        assert_eq!(frame.camera_id(), "cam1");
        assert_eq!(frame.sequence(), 1);
        assert_eq!(counters.grabs.load(Ordering::SeqCst), 4);
        assert_eq!(reader.stats().frames_discarded, 3);
    }

    #[test]
    fn failed_connect_waits_for_retry_deadline() {
        let counters = Arc::new(Counters::default());
        let mut transport = ScriptedTransport::new(counters.clone());
        transport.open_failures = 1;
        let sink = MemorySink::new();
        let mut reader = StreamReader::new(
            source(0, Duration::from_secs(60)),
            Box::new(transport),
            sink.clone(),
        );

        assert!(reader.step().is_none());
        assert_eq!(reader.state(), ReaderState::Disconnected);
        assert!(reader.retry_in().is_some_and(|d| d > Duration::from_secs(50)));
        assert!(sink.contains(Level::Warn, "connection refused"));

        // Still inside the delay: no new attempt.
        assert!(reader.step().is_none());
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);

        reader.connect().expect("second attempt succeeds");
        assert!(reader.is_connected());
        assert_eq!(reader.stats().connect_attempts, 2);
        assert_eq!(reader.retry_in(), None);
    }

    #[test]
    fn decode_failure_releases_connection() {
        let counters = Arc::new(Counters::default());
        let mut transport = ScriptedTransport::new(counters.clone());
        transport.fail_grab = Some(1);
        let mut reader = StreamReader::new(
            source(0, Duration::from_secs(60)),
            Box::new(transport),
            MemorySink::new(),
        );

        reader.connect().expect("connect");
        assert!(reader.step().is_none());
        assert_eq!(reader.state(), ReaderState::Disconnected);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(reader.stats().failures, 1);
    }

    #[test]
    fn connect_is_idempotent() {
        let counters = Arc::new(Counters::default());
        let transport = ScriptedTransport::new(counters.clone());
        let mut reader = StreamReader::new(
            source(0, Duration::ZERO),
            Box::new(transport),
            MemorySink::new(),
        );
        reader.connect().expect("connect");
        reader.connect().expect("reconnect");
        assert!(reader.is_connected());
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_is_idempotent_and_stops_stepping() {
        let counters = Arc::new(Counters::default());
        let transport = ScriptedTransport::new(counters.clone());
        let mut reader = StreamReader::new(
            source(0, Duration::ZERO),
            Box::new(transport),
            MemorySink::new(),
        );
        reader.connect().expect("connect");
        reader.release();
        reader.release();
        assert!(reader.is_released());
        assert!(!reader.is_connected());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(reader.step().is_none());
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn frames_recover_from_injected_failures() -> Result<()> {
        let transport = SyntheticTransport::from_url("stub://yard?width=4&height=4&fail_every=2")?;
        let mut reader = StreamReader::new(
            source(0, Duration::ZERO),
            Box::new(transport),
            MemorySink::new(),
        );
        let sequences: Vec<u64> = reader.frames().take(3).map(|f| f.sequence()).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(reader.stats().failures, 2);
        Ok(())
    }
}
