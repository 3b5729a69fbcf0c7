//! Fan-in of many camera readers onto one bounded channel.
//!
//! One named acquisition thread per camera drives its `StreamReader` and pushes
//! frames into a shared `crossbeam_channel::bounded` queue. A push waits at
//! most `push_timeout`; after that the frame is dropped and counted, so a slow
//! consumer costs frames, never memory. Shutdown is a single shared flag
//! checked between pulls.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender};

use crate::error::PipelineError;
use crate::frame::Frame;
use crate::ingest::{open_transport, CameraSource, FrameTransport, StreamReader};
use crate::telemetry::LogSink;

const TARGET: &str = "camwatch::mux";

pub const DEFAULT_CHANNEL_CAPACITY: usize = 30;
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultiplexerOptions {
    /// Maximum frames queued across all cameras.
    pub channel_capacity: usize,
    /// How long a full channel may block a reader before its frame is dropped.
    pub push_timeout: Duration,
    /// Pause after a pull that produced nothing.
    pub idle_sleep: Duration,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
            idle_sleep: DEFAULT_IDLE_SLEEP,
        }
    }
}

/// Point-in-time view of one acquisition thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceStats {
    pub camera_id: String,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub reader_failures: u64,
    pub connected: bool,
    pub released: bool,
}

#[derive(Debug, Default)]
struct SourceCounters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    failures: AtomicU64,
    connected: AtomicBool,
    released: AtomicBool,
}

struct Worker {
    camera_id: String,
    counters: Arc<SourceCounters>,
    join: Option<JoinHandle<()>>,
}

/// Something the orchestrator can pull frames from.
pub trait FrameFeed {
    /// Next frame, or `None` when nothing arrived within `timeout`.
    fn next_frame(&self, timeout: Duration) -> Option<Frame>;

    /// One-line health summary for periodic logging.
    fn health_report(&self) -> Option<String> {
        None
    }
}

pub struct StreamMultiplexer {
    receiver: Receiver<Frame>,
    workers: Vec<Worker>,
    stop: Arc<AtomicBool>,
    capacity: usize,
    stopped: bool,
    sink: Arc<dyn LogSink>,
}

impl StreamMultiplexer {
    /// Spawn one acquisition thread per camera using the URL-selected transport.
    pub fn start(
        sources: Vec<CameraSource>,
        options: MultiplexerOptions,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self> {
        Self::start_with(sources, options, sink, open_transport)
    }

    /// Like [`start`](Self::start) with a caller-supplied transport factory.
    ///
    /// Every transport is built before any thread starts, so a bad camera URL
    /// fails construction without leaving threads behind.
    pub fn start_with<F>(
        sources: Vec<CameraSource>,
        options: MultiplexerOptions,
        sink: Arc<dyn LogSink>,
        mut factory: F,
    ) -> Result<Self>
    where
        F: FnMut(&CameraSource) -> Result<Box<dyn FrameTransport>>,
    {
        if options.channel_capacity == 0 {
            return Err(PipelineError::InvalidConfig("channel capacity must be > 0".into()).into());
        }
        let mut seen = BTreeSet::new();
        for source in &sources {
            if !seen.insert(source.id().to_string()) {
                return Err(PipelineError::DuplicateCamera(source.id().to_string()).into());
            }
        }

        let mut readers = Vec::with_capacity(sources.len());
        for source in sources {
            let transport = factory(&source)
                .with_context(|| format!("build transport for camera {}", source.id()))?;
            readers.push(StreamReader::new(source, transport, sink.clone()));
        }

        let (sender, receiver) = crossbeam_channel::bounded(options.channel_capacity);
        let mut mux = Self {
            receiver,
            workers: Vec::with_capacity(readers.len()),
            stop: Arc::new(AtomicBool::new(false)),
            capacity: options.channel_capacity,
            stopped: false,
            sink: sink.clone(),
        };

        for reader in readers {
            let camera_id = reader.source().id().to_string();
            let counters = Arc::new(SourceCounters::default());
            let ctx = Acquisition {
                reader,
                sender: sender.clone(),
                stop: mux.stop.clone(),
                counters: counters.clone(),
                options: options.clone(),
                sink: sink.clone(),
            };
            // On spawn failure `mux` is dropped here, which stops the threads already running.
            let join = std::thread::Builder::new()
                .name(format!("acquire-{}", camera_id))
                .spawn(move || ctx.run())
                .with_context(|| format!("spawn acquisition thread for {}", camera_id))?;
            mux.workers.push(Worker {
                camera_id,
                counters,
                join: Some(join),
            });
        }

        sink.info(
            TARGET,
            format_args!(
                "started {} acquisition thread(s), channel capacity {}",
                mux.workers.len(),
                mux.capacity
            ),
        );
        Ok(mux)
    }

    /// Next frame from any camera, or `None` on timeout.
    pub fn next(&self, timeout: Duration) -> Option<Frame> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Signal every thread, join them all, then discard queued frames.
    ///
    /// Returns only after every reader has released its connection. Calling it
    /// again is a no-op. A panicked acquisition thread is reported after all
    /// other threads have been joined.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.stop.store(true, Ordering::SeqCst);

        let mut panicked = None;
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                if join.join().is_err() {
                    self.sink.error(
                        TARGET,
                        format_args!("acquisition thread for {} panicked", worker.camera_id),
                    );
                    panicked.get_or_insert_with(|| worker.camera_id.clone());
                }
            }
        }

        let mut drained = 0usize;
        while self.receiver.try_recv().is_ok() {
            drained += 1;
        }
        self.sink.info(
            TARGET,
            format_args!(
                "stopped {} acquisition thread(s), discarded {} queued frame(s)",
                self.workers.len(),
                drained
            ),
        );

        match panicked {
            Some(camera_id) => Err(PipelineError::AcquisitionPanicked(camera_id).into()),
            None => Ok(()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn source_stats(&self) -> Vec<SourceStats> {
        self.workers
            .iter()
            .map(|w| SourceStats {
                camera_id: w.camera_id.clone(),
                frames_forwarded: w.counters.forwarded.load(Ordering::Relaxed),
                frames_dropped: w.counters.dropped.load(Ordering::Relaxed),
                reader_failures: w.counters.failures.load(Ordering::Relaxed),
                connected: w.counters.connected.load(Ordering::Relaxed),
                released: w.counters.released.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Whether the reader for `camera_id` has released its connection.
    pub fn is_released(&self, camera_id: &str) -> Option<bool> {
        self.workers
            .iter()
            .find(|w| w.camera_id == camera_id)
            .map(|w| w.counters.released.load(Ordering::SeqCst))
    }

    pub fn camera_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.camera_id.clone()).collect()
    }

    /// Frames currently waiting in the channel.
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for StreamMultiplexer {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            self.sink.error(TARGET, format_args!("multiplexer shutdown: {:#}", err));
        }
    }
}

impl FrameFeed for StreamMultiplexer {
    fn next_frame(&self, timeout: Duration) -> Option<Frame> {
        self.next(timeout)
    }

    fn health_report(&self) -> Option<String> {
        let parts: Vec<String> = self
            .source_stats()
            .iter()
            .map(|s| {
                format!(
                    "{}[{} fwd={} drop={} fail={}]",
                    s.camera_id,
                    if s.connected { "up" } else { "down" },
                    s.frames_forwarded,
                    s.frames_dropped,
                    s.reader_failures
                )
            })
            .collect();
        Some(format!(
            "queue {}/{} {}",
            self.queued(),
            self.capacity,
            parts.join(" ")
        ))
    }
}

impl FrameFeed for Receiver<Frame> {
    fn next_frame(&self, timeout: Duration) -> Option<Frame> {
        self.recv_timeout(timeout).ok()
    }
}

/// Everything one acquisition thread owns.
struct Acquisition {
    reader: StreamReader,
    sender: Sender<Frame>,
    stop: Arc<AtomicBool>,
    counters: Arc<SourceCounters>,
    options: MultiplexerOptions,
    sink: Arc<dyn LogSink>,
}

impl Acquisition {
    fn run(mut self) {
        let interval = self.reader.source().frame_interval();
        let mut last_forward: Option<Instant> = None;

        while !self.stop.load(Ordering::SeqCst) {
            if let Some(last) = last_forward {
                let since = last.elapsed();
                if since < interval {
                    std::thread::sleep((interval - since).min(self.options.idle_sleep));
                    continue;
                }
            }

            let pulled = self.reader.step();
            let stats = self.reader.stats();
            self.counters.failures.store(stats.failures, Ordering::Relaxed);
            self.counters
                .connected
                .store(self.reader.is_connected(), Ordering::Relaxed);

            let Some(frame) = pulled else {
                std::thread::sleep(self.options.idle_sleep);
                continue;
            };

            match self.sender.send_timeout(frame, self.options.push_timeout) {
                Ok(()) => {
                    self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                    last_forward = Some(Instant::now());
                }
                Err(SendTimeoutError::Timeout(dropped)) => {
                    let total = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    self.sink.warn(
                        TARGET,
                        format_args!(
                            "frame queue full; dropped frame {} from {} ({} dropped so far)",
                            dropped.sequence(),
                            dropped.camera_id(),
                            total
                        ),
                    );
                }
                Err(SendTimeoutError::Disconnected(_)) => break,
            }
        }
    }
}

impl Drop for Acquisition {
    // Runs on normal exit and on unwind, so the released flag is always truthful.
    fn drop(&mut self) {
        self.reader.release();
        self.counters.released.store(true, Ordering::SeqCst);
        self.sink.debug(
            TARGET,
            format_args!("acquisition for {} exited", self.reader.source().id()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;

    fn stub(id: &str) -> CameraSource {
        CameraSource::new(id, id, format!("stub://{}?width=8&height=8", id))
            .with_frame_flush(0)
            .with_reconnect_delay(Duration::ZERO)
    }

    fn fast_options(capacity: usize) -> MultiplexerOptions {
        MultiplexerOptions {
            channel_capacity: capacity,
            push_timeout: Duration::from_millis(5),
            idle_sleep: Duration::from_millis(1),
        }
    }

    #[test]
    fn rejects_duplicate_ids_and_zero_capacity() {
        let err = StreamMultiplexer::start(
            vec![stub("cam1"), stub("cam1")],
            fast_options(4),
            MemorySink::new(),
        )
        .err()
        .expect("duplicate ids must fail");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DuplicateCamera(id)) if id == "cam1"
        ));

        assert!(StreamMultiplexer::start(vec![stub("cam1")], fast_options(0), MemorySink::new()).is_err());
    }

    #[test]
    fn unsupported_scheme_fails_before_spawning() {
        let sources = vec![stub("cam1"), CameraSource::new("cam2", "Back", "gopher://x")];
        assert!(StreamMultiplexer::start(sources, fast_options(4), MemorySink::new()).is_err());
    }

    #[test]
    fn frames_are_tagged_with_their_camera() -> Result<()> {
        let mut mux = StreamMultiplexer::start(
            vec![stub("cam1"), stub("cam2")],
            fast_options(8),
            MemorySink::new(),
        )?;
        let mut seen = BTreeSet::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.len() < 2 && Instant::now() < deadline {
            if let Some(frame) = mux.next(Duration::from_millis(100)) {
                seen.insert(frame.camera_id().to_string());
            }
        }
        mux.stop()?;
        assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec!["cam1", "cam2"]);
        Ok(())
    }

    #[test]
    fn stop_is_idempotent() -> Result<()> {
        let mut mux = StreamMultiplexer::start(vec![stub("cam1")], fast_options(2), MemorySink::new())?;
        mux.stop()?;
        mux.stop()?;
        assert!(mux.is_stopped());
        assert_eq!(mux.queued(), 0);
        assert!(mux.next(Duration::from_millis(10)).is_none());
        Ok(())
    }
}
