pub mod espeak;
pub mod mock;
pub mod ollama;
pub mod wyoming;

use crate::error::ServiceError;
use crate::types::{Emotion, Frame, Priority, SceneDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Audio produced by a speech backend, ready to be played.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    /// WAV bytes. Empty for backends that only simulate playback.
    pub wav: Vec<u8>,
    pub duration: Duration,
    pub text: String,
}

/// A block of mono 16-bit PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
    pub captured_at: Instant,
}

impl AudioChunk {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.pcm.len() as f64 / self.sample_rate as f64)
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.pcm.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: f32,
}

/// Everything a reasoning backend gets to see for one decision.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReasoningContext {
    /// Oldest first; the last entry is the scene being decided on.
    pub scenes: Vec<String>,
    pub dialogue_active: bool,
    pub query: Option<String>,
    pub user_comments: Vec<String>,
    pub characters: BTreeMap<String, String>,
    /// The locally drafted line, which the backend may rephrase.
    pub draft: String,
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningReply {
    pub speak: bool,
    pub text: String,
    pub emotion: Emotion,
}

/// Turns a frame into a structured scene description.
#[async_trait]
pub trait PerceptionGateway: Send + Sync {
    async fn describe(&self, frame: &Frame) -> Result<SceneDescription, ServiceError>;
}

/// Language reasoning used to phrase what the companion says.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn reason(&self, context: &ReasoningContext) -> Result<ReasoningReply, ServiceError>;
}

/// Speech synthesis, playback and recognition.
#[async_trait]
pub trait SpeechService: Send + Sync {
    async fn synthesize(&self, text: &str, emotion: Emotion) -> Result<SynthesizedAudio, ServiceError>;

    /// Play until finished. Dropping the future stops playback.
    async fn play(&self, audio: &SynthesizedAudio) -> Result<(), ServiceError>;

    async fn transcribe(&self, chunk: &AudioChunk) -> Result<Transcript, ServiceError>;

    /// Acoustic wake-word spotting. Backends without a spotter rely on the transcript check.
    async fn detect_wake_word(&self, _chunk: &AudioChunk) -> Result<bool, ServiceError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_duration_and_bytes() {
        let chunk = AudioChunk {
            pcm: vec![1, -1, 256, 0],
            sample_rate: 8,
            captured_at: Instant::now(),
        };
        assert_eq!(chunk.duration(), Duration::from_millis(500));
        assert_eq!(chunk.to_le_bytes(), vec![1, 0, 0xff, 0xff, 0, 1, 0, 0]);
    }
}
