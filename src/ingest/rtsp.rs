//! RTSP transport.
//!
//! Decodes IP camera streams through GStreamer:
//! `rtspsrc ! decodebin ! videoconvert ! video/x-raw,format=RGB ! appsink`.
//! The appsink keeps a single buffer and drops older ones, so `grab` pulls and
//! discards a sample while `retrieve` pulls the one that is decoded.
//!
//! Without the `rtsp-gstreamer` feature the constructor fails, which turns an
//! `rtsp://` camera into a configuration error at startup.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;

use crate::frame::RawImage;

#[cfg(feature = "rtsp-gstreamer")]
const SAMPLE_TIMEOUT_MS: u64 = 2_000;

pub struct RtspTransport {
    url: String,
    #[cfg(feature = "rtsp-gstreamer")]
    session: Option<GstreamerSession>,
    #[cfg(feature = "rtsp-gstreamer")]
    pending: Option<gstreamer::Sample>,
}

impl RtspTransport {
    pub fn new(url: &str) -> Result<Self> {
        #[cfg(feature = "rtsp-gstreamer")]
        {
            gstreamer::init().context("initialize gstreamer")?;
            Ok(Self {
                url: url.to_string(),
                session: None,
                pending: None,
            })
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            anyhow::bail!(
                "RTSP camera {} requires the rtsp-gstreamer feature",
                super::redact_url(url)
            )
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl super::FrameTransport for RtspTransport {
    fn open(&mut self) -> Result<()> {
        self.close();
        self.session = Some(GstreamerSession::start(&self.url)?);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.healthy)
    }

    fn grab(&mut self) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("RTSP session is not open"))?;
        self.pending = Some(session.pull()?);
        Ok(())
    }

    fn retrieve(&mut self) -> Result<RawImage> {
        let sample = self
            .pending
            .take()
            .ok_or_else(|| anyhow::anyhow!("no grabbed RTSP sample to decode"))?;
        sample_to_image(&sample)
    }

    fn close(&mut self) {
        self.pending = None;
        if let Some(session) = self.session.take() {
            session.stop();
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for RtspTransport {
    fn drop(&mut self) {
        use super::FrameTransport;
        self.close();
    }
}

#[cfg(not(feature = "rtsp-gstreamer"))]
impl super::FrameTransport for RtspTransport {
    fn open(&mut self) -> Result<()> {
        anyhow::bail!("RTSP support is not compiled in")
    }

    fn is_open(&self) -> bool {
        false
    }

    fn grab(&mut self) -> Result<()> {
        anyhow::bail!("RTSP support is not compiled in")
    }

    fn retrieve(&mut self) -> Result<RawImage> {
        anyhow::bail!("RTSP support is not compiled in")
    }

    fn close(&mut self) {}
}

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerSession {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    healthy: bool,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerSession {
    fn start(url: &str) -> Result<Self> {
        use gstreamer::prelude::*;

        let description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            url
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;
        appsink.set_max_buffers(1);
        appsink.set_drop(true);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;

        Ok(Self {
            pipeline,
            appsink,
            healthy: true,
        })
    }

    fn pull(&mut self) -> Result<gstreamer::Sample> {
        self.poll_bus()?;
        match self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(SAMPLE_TIMEOUT_MS))
        {
            Some(sample) => Ok(sample),
            None => {
                self.healthy = false;
                anyhow::bail!("RTSP stream stalled")
            }
        }
    }

    fn poll_bus(&mut self) -> Result<()> {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.healthy = false;
                    anyhow::bail!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    );
                }
                MessageView::Eos(..) => {
                    self.healthy = false;
                    anyhow::bail!("gstreamer reached end of stream");
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn stop(self) {
        use gstreamer::prelude::*;

        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("failed to stop RTSP pipeline: {}", err);
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_image(sample: &gstreamer::Sample) -> Result<RawImage> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("RTSP buffer shorter than frame")?
            .to_vec();
        return RawImage::new(pixels, width, height);
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("RTSP buffer row is out of bounds")?,
        );
    }
    RawImage::new(pixels, width, height)
}
