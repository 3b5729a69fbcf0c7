//! Frame-differencing motion pre-filter.
//!
//! Each camera keeps its previous intensity plane. A frame counts as motion
//! when more than `min_area` pixels moved by more than `pixel_threshold`
//! intensity levels since the previous frame. No background model: slow
//! lighting drift is not tracked.

use crate::frame::Frame;

pub const DEFAULT_PIXEL_THRESHOLD: u8 = 25;
pub const DEFAULT_MIN_AREA: u64 = 1500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotionThresholds {
    /// Per-pixel intensity difference that counts as "changed".
    pub pixel_threshold: u8,
    /// Changed-pixel count that must be exceeded to report motion.
    pub min_area: u64,
}

impl Default for MotionThresholds {
    fn default() -> Self {
        Self {
            pixel_threshold: DEFAULT_PIXEL_THRESHOLD,
            min_area: DEFAULT_MIN_AREA,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotionReading {
    pub motion_detected: bool,
    /// Number of changed pixels.
    pub score: u64,
}

impl MotionReading {
    const BASELINE: Self = Self {
        motion_detected: false,
        score: 0,
    };
}

struct Baseline {
    luma: Vec<u8>,
    width: u32,
    height: u32,
}

pub struct MotionDetector {
    thresholds: MotionThresholds,
    previous: Option<Baseline>,
}

impl MotionDetector {
    pub fn new(thresholds: MotionThresholds) -> Self {
        Self {
            thresholds,
            previous: None,
        }
    }

    pub fn thresholds(&self) -> MotionThresholds {
        self.thresholds
    }

    pub fn has_baseline(&self) -> bool {
        self.previous.is_some()
    }

    /// Compare `frame` against the previous one and keep it as the new baseline.
    ///
    /// The first frame, and any frame whose size differs from the baseline,
    /// only seeds the baseline and reports no motion.
    pub fn detect(&mut self, frame: &Frame) -> MotionReading {
        let current = Baseline {
            luma: frame.luma(),
            width: frame.width(),
            height: frame.height(),
        };
        let reading = match &self.previous {
            Some(prev) if prev.width == current.width && prev.height == current.height => {
                let score = changed_pixels(&prev.luma, &current.luma, self.thresholds.pixel_threshold);
                MotionReading {
                    motion_detected: score > self.thresholds.min_area,
                    score,
                }
            }
            _ => MotionReading::BASELINE,
        };
        self.previous = Some(current);
        reading
    }

    /// Forget the baseline; the next frame re-seeds it.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

fn changed_pixels(previous: &[u8], current: &[u8], threshold: u8) -> u64 {
    previous
        .iter()
        .zip(current)
        .filter(|(a, b)| a.abs_diff(**b) > threshold)
        .count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawImage;

    fn grey(width: u32, height: u32, level: u8) -> Frame {
        Frame::new("cam1", RawImage::filled(width, height, [level; 3]), 1)
    }

    /// 100x100 grey frame with the first `changed` pixels raised by 100 levels.
    fn with_changed(changed: usize) -> Frame {
        let mut image = RawImage::filled(100, 100, [50; 3]);
        for px in image.pixels.chunks_exact_mut(3).take(changed) {
            px.copy_from_slice(&[150; 3]);
        }
        Frame::new("cam1", image, 2)
    }

    #[test]
    fn first_frame_only_seeds_baseline() {
        let mut detector = MotionDetector::new(MotionThresholds::default());
        assert!(!detector.has_baseline());
        let reading = detector.detect(&grey(10, 10, 200));
        assert_eq!(reading, MotionReading { motion_detected: false, score: 0 });
        assert!(detector.has_baseline());
    }

    #[test]
    fn same_score_judged_against_min_area() {
        for (min_area, expected) in [(1500, true), (2500, false)] {
            let mut detector = MotionDetector::new(MotionThresholds {
                pixel_threshold: 25,
                min_area,
            });
            detector.detect(&grey(100, 100, 50));
            let reading = detector.detect(&with_changed(2000));
            assert_eq!(reading.score, 2000);
            assert_eq!(reading.motion_detected, expected, "min_area {}", min_area);
        }
    }

    #[test]
    fn differences_at_threshold_do_not_count() {
        let mut detector = MotionDetector::new(MotionThresholds {
            pixel_threshold: 25,
            min_area: 0,
        });
        detector.detect(&grey(4, 4, 100));
        assert_eq!(detector.detect(&grey(4, 4, 125)).score, 0);
        assert_eq!(detector.detect(&grey(4, 4, 99)).score, 16);
    }

    #[test]
    fn latest_frame_becomes_baseline() {
        let mut detector = MotionDetector::new(MotionThresholds {
            pixel_threshold: 25,
            min_area: 10,
        });
        detector.detect(&grey(10, 10, 0));
        assert!(detector.detect(&grey(10, 10, 200)).motion_detected);
        assert!(!detector.detect(&grey(10, 10, 200)).motion_detected);
    }

    #[test]
    fn resolution_change_reseeds() {
        let mut detector = MotionDetector::new(MotionThresholds::default());
        detector.detect(&grey(10, 10, 0));
        let reading = detector.detect(&grey(20, 10, 255));
        assert_eq!(reading, MotionReading { motion_detected: false, score: 0 });
        assert_eq!(detector.detect(&grey(20, 10, 255)).score, 0);
    }
}
