//! Synthetic `stub://` transport.
//!
//! Produces a static background with a bright block that appears and sweeps
//! across the scene on a fixed cadence, so the motion filter sees real change
//! without a camera. Query parameters tune the scene and inject faults:
//!
//! - `width`, `height`: frame size (default 320x240)
//! - `motion_every`: frames per static/moving phase, 0 disables motion (default 50)
//! - `fail_every`: every Nth grab fails, 0 never (default 0)
//! - `open_failures`: number of initial `open` calls that fail (default 0)

use anyhow::{anyhow, Result};

use super::FrameTransport;
use crate::frame::RawImage;

const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const DEFAULT_MOTION_EVERY: u64 = 50;
const BLOCK_STEP_PX: u64 = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub motion_every: u64,
    pub fail_every: u64,
    pub open_failures: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "synthetic".to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            motion_every: DEFAULT_MOTION_EVERY,
            fail_every: 0,
            open_failures: 0,
        }
    }
}

impl SyntheticConfig {
    /// Parse `stub://name?key=value&...`.
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("not a stub:// url: {}", url))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut cfg = Self {
            name: if name.is_empty() {
                "synthetic".to_string()
            } else {
                name.to_string()
            },
            ..Self::default()
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("stub parameter '{}' has no value", pair))?;
            let parse = |v: &str| -> Result<u64> {
                v.parse::<u64>()
                    .map_err(|_| anyhow!("stub parameter {} must be an integer, got '{}'", key, v))
            };
            match key {
                "width" => cfg.width = parse(value)? as u32,
                "height" => cfg.height = parse(value)? as u32,
                "motion_every" => cfg.motion_every = parse(value)?,
                "fail_every" => cfg.fail_every = parse(value)?,
                "open_failures" => cfg.open_failures = parse(value)? as u32,
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        if cfg.width == 0 || cfg.height == 0 {
            return Err(anyhow!("stub frame size must be non-zero"));
        }
        Ok(cfg)
    }
}

/// Synthetic frame transport for tests and dry runs.
pub struct SyntheticTransport {
    config: SyntheticConfig,
    open: bool,
    open_calls: u32,
    frame_count: u64,
    grabbed: bool,
}

impl SyntheticTransport {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            open: false,
            open_calls: 0,
            frame_count: 0,
            grabbed: false,
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(SyntheticConfig::from_url(url)?))
    }

    pub fn frames_grabbed(&self) -> u64 {
        self.frame_count
    }

    fn render(&self) -> RawImage {
        let (w, h) = (self.config.width as u64, self.config.height as u64);
        let mut pixels = vec![0u8; (w * h * 3) as usize];
        for y in 0..h {
            for x in 0..w {
                let shade = (64 + (x + y) % 64) as u8;
                let idx = ((y * w + x) * 3) as usize;
                pixels[idx] = shade;
                pixels[idx + 1] = shade;
                pixels[idx + 2] = shade;
            }
        }

        let every = self.config.motion_every;
        if every > 0 && (self.frame_count / every) % 2 == 1 {
            let block_w = (w / 4).max(1);
            let block_h = (h / 4).max(1);
            let span = w.saturating_sub(block_w).max(1);
            let x0 = (self.frame_count * BLOCK_STEP_PX) % span;
            let y0 = (h - block_h) / 2;
            for y in y0..(y0 + block_h) {
                for x in x0..(x0 + block_w).min(w) {
                    let idx = ((y * w + x) * 3) as usize;
                    pixels[idx..idx + 3].copy_from_slice(&[240, 240, 240]);
                }
            }
        }

        RawImage {
            pixels,
            width: self.config.width,
            height: self.config.height,
        }
    }
}

impl FrameTransport for SyntheticTransport {
    fn open(&mut self) -> Result<()> {
        self.open_calls += 1;
        if self.open_calls <= self.config.open_failures {
            self.open = false;
            return Err(anyhow!(
                "synthetic source {} refused connection (attempt {})",
                self.config.name,
                self.open_calls
            ));
        }
        self.open = true;
        self.grabbed = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn grab(&mut self) -> Result<()> {
        if !self.open {
            return Err(anyhow!("synthetic source {} is not open", self.config.name));
        }
        self.frame_count += 1;
        if self.config.fail_every > 0 && self.frame_count % self.config.fail_every == 0 {
            self.grabbed = false;
            return Err(anyhow!(
                "synthetic grab failure at frame {}",
                self.frame_count
            ));
        }
        self.grabbed = true;
        Ok(())
    }

    fn retrieve(&mut self) -> Result<RawImage> {
        if !self.open || !self.grabbed {
            return Err(anyhow!("no grabbed frame to decode"));
        }
        self.grabbed = false;
        Ok(self.render())
    }

    fn close(&mut self) {
        self.open = false;
        self.grabbed = false;
    }
}
