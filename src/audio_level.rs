//! Loudness tracking for the dialogue-active flag.
//!
//! Levels are on a 0..100 scale: -60 dBFS maps to 0 and full scale to 100.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const HISTORY: usize = 50;
const FLOOR_DBFS: f32 = -60.0;

/// Level of a block of 16-bit PCM samples.
pub fn level_db(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum / samples.len() as f64).sqrt();
    if rms <= 0.0 {
        return 0.0;
    }
    let dbfs = 20.0 * (rms / 32768.0).log10() as f32;
    ((dbfs - FLOOR_DBFS) * 100.0 / -FLOOR_DBFS).clamp(0.0, 100.0)
}

pub struct LevelMonitor {
    threshold_db: f32,
    quiet_duration: Duration,
    current_db: f32,
    last_loud: Option<Instant>,
    history: VecDeque<f32>,
}

impl LevelMonitor {
    pub fn new(threshold_db: f32, quiet_duration: Duration) -> Self {
        Self {
            threshold_db,
            quiet_duration,
            current_db: 0.0,
            last_loud: None,
            history: VecDeque::with_capacity(HISTORY),
        }
    }

    /// Feed a block; returns its level.
    pub fn observe(&mut self, samples: &[i16], at: Instant) -> f32 {
        let db = level_db(samples);
        self.current_db = db;
        if self.history.len() >= HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(db);
        if db >= self.threshold_db {
            self.last_loud = Some(at);
        }
        db
    }

    /// Quiet once nothing has crossed the threshold for `quiet_duration`.
    pub fn is_quiet(&self, now: Instant) -> bool {
        match self.last_loud {
            Some(at) => now.saturating_duration_since(at) >= self.quiet_duration,
            None => true,
        }
    }

    pub fn current_db(&self) -> f32 {
        self.current_db
    }

    pub fn average_db(&self) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().sum::<f32>() / self.history.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_and_full_scale() {
        assert_eq!(level_db(&[0; 256]), 0.0);
        assert_eq!(level_db(&[]), 0.0);
        assert!((level_db(&[i16::MAX; 256]) - 100.0).abs() < 0.1);
    }

    #[test]
    fn half_scale_sits_around_ninety() {
        let db = level_db(&[16384; 256]);
        assert!((db - 90.0).abs() < 0.5, "got {}", db);
    }

    #[test]
    fn quiet_after_hold_time() {
        let start = Instant::now();
        let mut monitor = LevelMonitor::new(70.0, Duration::from_millis(500));
        assert!(monitor.is_quiet(start));

        monitor.observe(&[20000; 256], start);
        assert!(!monitor.is_quiet(start + Duration::from_millis(100)));
        monitor.observe(&[10; 256], start + Duration::from_millis(250));
        assert!(!monitor.is_quiet(start + Duration::from_millis(400)));
        assert!(monitor.is_quiet(start + Duration::from_millis(500)));
        assert!(monitor.average_db() > 0.0);
    }
}
