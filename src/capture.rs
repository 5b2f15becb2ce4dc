//! Frame and audio sources feeding the sensor loops.

use crate::backends::AudioChunk;
use crate::types::Frame;
use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use std::env;
use std::io::{Cursor, Read};
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

pub const SAMPLE_RATE: u32 = 16_000;

#[async_trait]
pub trait FrameSource: Send {
    /// `None` once the source is exhausted. A failed capture should log and retry, not end.
    async fn next_frame(&mut self) -> Option<Frame>;
}

#[async_trait]
pub trait AudioSource: Send {
    async fn next_chunk(&mut self) -> Option<AudioChunk>;
}

#[async_trait]
impl FrameSource for mpsc::Receiver<Frame> {
    async fn next_frame(&mut self) -> Option<Frame> {
        self.recv().await
    }
}

#[async_trait]
impl AudioSource for mpsc::Receiver<AudioChunk> {
    async fn next_chunk(&mut self) -> Option<AudioChunk> {
        self.recv().await
    }
}

/// Grabs the desktop with whatever tool fits the session.
pub struct ScreenCapture {
    /// Upper bound on a single grab; a hung tool is killed when it runs past this.
    timeout: Duration,
}

impl ScreenCapture {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn capture(limit: Duration) -> Result<Vec<u8>, String> {
        let session_type = env::var("XDG_SESSION_TYPE").unwrap_or_default().to_uppercase();
        if session_type.contains("WAYLAND") {
            run_with_timeout("grim", &["-t", "png", "-"], limit).or_else(|e| {
                debug!("Capture: grim failed ({}), trying X11 import", e);
                run_with_timeout("import", &["-window", "root", "png:-"], limit)
            })
        } else {
            run_with_timeout("import", &["-window", "root", "png:-"], limit)
        }
    }
}

/// Runs a capture tool and returns its stdout, killing it after `limit`.
///
/// Stdout is drained on a separate thread so a screenshot larger than the pipe buffer cannot
/// stall the child while we wait on it.
fn run_with_timeout(program: &str, args: &[&str], limit: Duration) -> Result<Vec<u8>, String> {
    use wait_timeout::ChildExt;

    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to start {}: {}", program, e))?;

    let drain = |pipe: Option<Box<dyn Read + Send>>| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut pipe) = pipe {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        })
    };
    let stdout = drain(child.stdout.take().map(|p| Box::new(p) as Box<dyn Read + Send>));
    let stderr = drain(child.stderr.take().map(|p| Box::new(p) as Box<dyn Read + Send>));

    let status = match child.wait_timeout(limit) {
        Ok(Some(status)) => status,
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(format!("{} timed out after {:?}", program, limit));
        }
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(format!("waiting on {} failed: {}", program, e));
        }
    };
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    if !status.success() || stdout.is_empty() {
        return Err(format!(
            "{} exited with {:?}: {}",
            program,
            status.code(),
            String::from_utf8_lossy(&stderr).trim()
        ));
    }
    Ok(stdout)
}

#[async_trait]
impl FrameSource for ScreenCapture {
    async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let limit = self.timeout;
            match tokio::task::spawn_blocking(move || Self::capture(limit)).await {
                Ok(Ok(bytes)) => return Some(Frame::new(Instant::now(), bytes)),
                Ok(Err(e)) => warn!("Capture: screen grab failed: {}", e),
                Err(e) => warn!("Capture: capture task failed: {}", e),
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Draws a new picture every `scene_length`, standing in for a video in simulated mode.
pub struct SyntheticFrames {
    start: Instant,
    scene_length: Duration,
}

const PALETTE: &[[u8; 3]] = &[
    [40, 60, 110],
    [200, 170, 120],
    [240, 200, 60],
    [20, 20, 30],
    [180, 90, 120],
];

impl SyntheticFrames {
    pub fn new(scene_length: Duration) -> Self {
        Self {
            start: Instant::now(),
            scene_length,
        }
    }

    pub fn render(scene: usize) -> Vec<u8> {
        let [r, g, b] = PALETTE[scene % PALETTE.len()];
        let stripe = 8 + (scene as u32 % 4) * 8;
        let img = RgbImage::from_fn(160, 120, |x, y| {
            let shade = if (x / stripe + y / stripe) % 2 == 0 { 0 } else { 40 };
            Rgb([r.saturating_add(shade), g.saturating_add(shade), b.saturating_add(shade)])
        });
        let mut bytes = Vec::new();
        if let Err(e) = img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png) {
            warn!("Capture: could not encode synthetic frame: {}", e);
        }
        bytes
    }
}

#[async_trait]
impl FrameSource for SyntheticFrames {
    async fn next_frame(&mut self) -> Option<Frame> {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.start);
        let scene = (elapsed.as_millis() / self.scene_length.as_millis().max(1)) as usize;
        Some(Frame::new(now, Self::render(scene)))
    }
}

/// Microphone capture through `arecord` (16 kHz mono S16_LE).
pub struct MicCapture {
    chunk_samples: usize,
    child: Option<tokio::process::Child>,
}

impl MicCapture {
    pub fn new(chunk: Duration) -> Self {
        Self {
            chunk_samples: (SAMPLE_RATE as u128 * chunk.as_millis() / 1000).max(1) as usize,
            child: None,
        }
    }

    fn start(&mut self) -> std::io::Result<()> {
        let child = tokio::process::Command::new("arecord")
            .args(["-q", "-f", "S16_LE", "-r", "16000", "-c", "1", "-t", "raw"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        info!("Capture: microphone open");
        self.child = Some(child);
        Ok(())
    }
}

#[async_trait]
impl AudioSource for MicCapture {
    async fn next_chunk(&mut self) -> Option<AudioChunk> {
        if self.child.is_none() {
            if let Err(e) = self.start() {
                warn!("Capture: cannot start arecord: {}", e);
                return None;
            }
        }
        let stdout = self.child.as_mut()?.stdout.as_mut()?;
        let mut buf = vec![0u8; self.chunk_samples * 2];
        let read = stdout.read_exact(&mut buf).await;
        if let Err(e) = read {
            warn!("Capture: microphone stream ended: {}", e);
            self.child = None;
            return None;
        }
        let pcm = buf
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Some(AudioChunk {
            pcm,
            sample_rate: SAMPLE_RATE,
            captured_at: Instant::now(),
        })
    }
}

/// Alternates quiet and loud stretches in real time, for simulated and demo sessions.
pub struct ScriptedAudio {
    /// (length, loud) segments, repeated forever.
    pattern: Vec<(Duration, bool)>,
    chunk: Duration,
    position: Duration,
}

impl ScriptedAudio {
    pub fn new(pattern: Vec<(Duration, bool)>, chunk: Duration) -> Self {
        Self {
            pattern,
            chunk,
            position: Duration::ZERO,
        }
    }

    fn loud_at(&self, at: Duration) -> bool {
        let cycle: Duration = self.pattern.iter().map(|(d, _)| *d).sum();
        if cycle.is_zero() {
            return false;
        }
        let mut t = Duration::from_nanos((at.as_nanos() % cycle.as_nanos()) as u64);
        for (length, loud) in &self.pattern {
            if t < *length {
                return *loud;
            }
            t -= *length;
        }
        false
    }
}

#[async_trait]
impl AudioSource for ScriptedAudio {
    async fn next_chunk(&mut self) -> Option<AudioChunk> {
        sleep(self.chunk).await;
        let loud = self.loud_at(self.position);
        self.position += self.chunk;

        let samples = (SAMPLE_RATE as u128 * self.chunk.as_millis() / 1000) as usize;
        let amplitude = if loud { 12_000.0 } else { 40.0 };
        let pcm = (0..samples)
            .map(|i| {
                let phase = i as f32 * 2.0 * std::f32::consts::PI * 220.0 / SAMPLE_RATE as f32;
                (phase.sin() * amplitude) as i16
            })
            .collect();
        Some(AudioChunk {
            pcm,
            sample_rate: SAMPLE_RATE,
            captured_at: Instant::now(),
        })
    }
}
