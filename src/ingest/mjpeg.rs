//! MJPEG / JPEG-over-HTTP transport.
//!
//! Covers the common cheap-camera endpoints: a `multipart/x-mixed-replace`
//! MJPEG stream (ESP32-CAM `/stream`, most NVR "mjpg" URLs) or a plain JPEG
//! snapshot URL that is polled once per grab. `grab` only splits out the next
//! JPEG; `retrieve` decodes it.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use url::Url;

use super::FrameTransport;
use crate::frame::RawImage;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MjpegTransport {
    url: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    pending: Option<Vec<u8>>,
}

enum HttpStream {
    Multipart(MjpegStream),
    Snapshot,
}

impl MjpegTransport {
    pub fn new(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).context("parse camera http url")?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => return Err(anyhow!("unsupported http camera scheme '{}'", other)),
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        Ok(Self {
            url: url.to_string(),
            agent,
            stream: None,
            pending: None,
        })
    }
}

impl FrameTransport for MjpegTransport {
    fn open(&mut self) -> Result<()> {
        self.close();
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to {}", super::redact_url(&self.url)))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        self.stream = Some(if content_type.to_lowercase().contains("multipart") {
            HttpStream::Multipart(MjpegStream::new(response.into_reader()))
        } else {
            HttpStream::Snapshot
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn grab(&mut self) -> Result<()> {
        let jpeg = match &mut self.stream {
            Some(HttpStream::Multipart(stream)) => stream.read_next_jpeg()?,
            Some(HttpStream::Snapshot) => fetch_snapshot(&self.agent, &self.url)?,
            None => return Err(anyhow!("http camera is not connected")),
        };
        self.pending = Some(jpeg);
        Ok(())
    }

    fn retrieve(&mut self) -> Result<RawImage> {
        let bytes = self
            .pending
            .take()
            .ok_or_else(|| anyhow!("no grabbed jpeg to decode"))?;
        decode_jpeg(&bytes)
    }

    fn close(&mut self) {
        self.stream = None;
        self.pending = None;
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                // Garbage with no end marker; keep the tail in case an SOI straddles it.
                let drain_len = self.buffer.len() - 2;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", super::redact_url(url)))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

fn decode_jpeg(bytes: &[u8]) -> Result<RawImage> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    Ok(RawImage::from_rgb_image(image.into_rgb8()))
}

/// Byte range of the first complete JPEG (SOI .. EOI inclusive).
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w[0] == 0xFF && w[1] == 0xD8)?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w[0] == 0xFF && w[1] == 0xD9)?;
    Some((start, start + 2 + end + 2))
}
