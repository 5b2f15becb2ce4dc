//! Keyframe selection.
//!
//! Frames are compared against the last analyzed frame with a windowed SSIM on a small
//! grayscale thumbnail. A frame is sent for analysis when it differs enough from the reference
//! or when the maximum interval has passed, but never sooner than the minimum interval.

use crate::config_loader::Settings;
use crate::types::Frame;
use image::imageops::FilterType;
use image::GrayImage;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const THUMB_WIDTH: u32 = 64;
const THUMB_HEIGHT: u32 = 48;
const WINDOW: u32 = 8;
const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub threshold: f32,
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl From<&Settings> for SamplerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            threshold: settings.similarity_threshold,
            min_interval: settings.min_analysis_interval(),
            max_interval: settings.max_analysis_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleOutcome {
    pub analyze: bool,
    pub similarity: Option<f32>,
}

impl SampleOutcome {
    fn skip() -> Self {
        Self {
            analyze: false,
            similarity: None,
        }
    }
}

pub struct FrameSampler {
    config: SamplerConfig,
    /// Thumbnail of the last analyzed frame and when it was taken.
    reference: Option<(GrayImage, Instant)>,
    frames_seen: u64,
    frames_analyzed: u64,
}

impl FrameSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            reference: None,
            frames_seen: 0,
            frames_analyzed: 0,
        }
    }

    /// Decide whether `frame` should go to the perception gateway.
    ///
    /// The very first readable frame only primes the reference and starts the interval clock.
    /// Unreadable frames never trigger.
    pub fn sample(&mut self, frame: &mut Frame) -> SampleOutcome {
        self.frames_seen += 1;

        let thumb = match thumbnail(&frame.image) {
            Ok(t) => t,
            Err(e) => {
                warn!("Sampler: unreadable frame skipped: {}", e);
                return SampleOutcome::skip();
            }
        };

        if self.reference.is_none() {
            debug!("Sampler: reference primed");
            self.reference = Some((thumb, frame.timestamp));
            return SampleOutcome::skip();
        }
        let (reference, last) = match &self.reference {
            Some((r, t)) => (r, *t),
            None => return SampleOutcome::skip(),
        };

        let elapsed = frame.timestamp.saturating_duration_since(last);
        if elapsed < self.config.min_interval {
            return SampleOutcome::skip();
        }

        let similarity = ssim(reference, &thumb);
        frame.similarity = Some(similarity);

        let changed = similarity < self.config.threshold;
        let stale = elapsed >= self.config.max_interval;
        if !(changed || stale) {
            return SampleOutcome {
                analyze: false,
                similarity: Some(similarity),
            };
        }

        if changed {
            debug!("Sampler: scene change (ssim {:.3})", similarity);
        } else {
            debug!("Sampler: max interval reached ({:.1}s)", elapsed.as_secs_f32());
        }
        self.reference = Some((thumb, frame.timestamp));
        self.frames_analyzed += 1;
        SampleOutcome {
            analyze: true,
            similarity: Some(similarity),
        }
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn frames_analyzed(&self) -> u64 {
        self.frames_analyzed
    }
}

fn thumbnail(bytes: &[u8]) -> Result<GrayImage, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    let gray = img.to_luma8();
    Ok(image::imageops::resize(&gray, THUMB_WIDTH, THUMB_HEIGHT, FilterType::Triangle))
}

/// Mean SSIM over non-overlapping windows. Both images must share dimensions.
pub fn ssim(a: &GrayImage, b: &GrayImage) -> f32 {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let (width, height) = a.dimensions();
    let mut total = 0.0f64;
    let mut windows = 0u32;

    let mut y = 0;
    while y + WINDOW <= height {
        let mut x = 0;
        while x + WINDOW <= width {
            total += window_ssim(a, b, x, y);
            windows += 1;
            x += WINDOW;
        }
        y += WINDOW;
    }

    if windows == 0 {
        return 1.0;
    }
    (total / windows as f64) as f32
}

fn window_ssim(a: &GrayImage, b: &GrayImage, x0: u32, y0: u32) -> f64 {
    let n = (WINDOW * WINDOW) as f64;
    let (mut sum_a, mut sum_b) = (0.0f64, 0.0f64);
    for y in y0..y0 + WINDOW {
        for x in x0..x0 + WINDOW {
            sum_a += a.get_pixel(x, y).0[0] as f64;
            sum_b += b.get_pixel(x, y).0[0] as f64;
        }
    }
    let (mean_a, mean_b) = (sum_a / n, sum_b / n);

    let (mut var_a, mut var_b, mut cov) = (0.0f64, 0.0f64, 0.0f64);
    for y in y0..y0 + WINDOW {
        for x in x0..x0 + WINDOW {
            let da = a.get_pixel(x, y).0[0] as f64 - mean_a;
            let db = b.get_pixel(x, y).0[0] as f64 - mean_b;
            var_a += da * da;
            var_b += db * db;
            cov += da * db;
        }
    }
    var_a /= n - 1.0;
    var_b /= n - 1.0;
    cov /= n - 1.0;

    ((2.0 * mean_a * mean_b + C1) * (2.0 * cov + C2))
        / ((mean_a * mean_a + mean_b * mean_b + C1) * (var_a + var_b + C2))
}
