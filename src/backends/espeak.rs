use super::wyoming::WyomingClient;
use super::{AudioChunk, SpeechService, SynthesizedAudio, Transcript};
use crate::config_loader::Settings;
use crate::error::ServiceError;
use crate::types::Emotion;
use async_trait::async_trait;
use std::io::Cursor;
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// espeak-ng for synthesis, `aplay` for playback and a Wyoming server for recognition.
pub struct EspeakSpeech {
    voice: String,
    timeout: Duration,
    wyoming_host: String,
    wyoming_port: u16,
}

/// Words per minute and pitch (0-99) for each tone.
pub fn prosody(emotion: Emotion) -> (u32, u32) {
    match emotion {
        Emotion::Neutral => (165, 50),
        Emotion::Calm => (150, 45),
        Emotion::Warm => (155, 55),
        Emotion::Cheerful => (180, 65),
        Emotion::Tense => (175, 40),
        Emotion::Empathetic => (140, 45),
        Emotion::Concerned => (145, 40),
    }
}

impl EspeakSpeech {
    pub fn new(settings: &Settings) -> Self {
        Self {
            voice: settings.tts_voice_profile.clone(),
            timeout: settings.service_timeout(),
            wyoming_host: settings.wyoming_host.clone(),
            wyoming_port: settings.wyoming_port,
        }
    }

    fn run_espeak(voice: &str, text: &str, emotion: Emotion, limit: Duration) -> Result<Vec<u8>, ServiceError> {
        use wait_timeout::ChildExt;

        let (speed, pitch) = prosody(emotion);
        let mut child = Command::new("espeak-ng")
            .arg("-v")
            .arg(voice)
            .arg("-s")
            .arg(speed.to_string())
            .arg("-p")
            .arg(pitch.to_string())
            .arg("--stdout")
            .arg(text)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ServiceError::unavailable("espeak-ng", e))?;

        match child
            .wait_timeout(limit)
            .map_err(|e| ServiceError::unavailable("espeak-ng", e))?
        {
            Some(status) => {
                let output = child
                    .wait_with_output()
                    .map_err(|e| ServiceError::unavailable("espeak-ng", e))?;
                if status.success() {
                    Ok(output.stdout)
                } else {
                    Err(ServiceError::unavailable(
                        "espeak-ng",
                        String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    ))
                }
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(ServiceError::Timeout {
                    service: "espeak-ng".to_string(),
                    after: limit,
                })
            }
        }
    }
}

/// Length of a WAV clip. espeak-ng writes an unknown data length when streaming to stdout, so
/// the sample count is derived from the byte length when the header is not usable.
pub fn wav_duration(wav: &[u8]) -> Result<Duration, ServiceError> {
    let reader = hound::WavReader::new(Cursor::new(wav)).map_err(|e| ServiceError::malformed("espeak-ng", e))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 || spec.channels == 0 {
        return Err(ServiceError::malformed("espeak-ng", "invalid WAV header"));
    }
    let frame_bytes = (spec.bits_per_sample as u64 / 8).max(1) * spec.channels as u64;
    let header_frames = reader.duration() as u64;
    let body_frames = (wav.len().saturating_sub(44) as u64) / frame_bytes;
    let frames = if header_frames == 0 || header_frames > body_frames {
        body_frames
    } else {
        header_frames
    };
    Ok(Duration::from_secs_f64(frames as f64 / spec.sample_rate as f64))
}

#[async_trait]
impl SpeechService for EspeakSpeech {
    async fn synthesize(&self, text: &str, emotion: Emotion) -> Result<SynthesizedAudio, ServiceError> {
        let voice = self.voice.clone();
        let owned = text.to_string();
        let limit = self.timeout;
        let wav = tokio::task::spawn_blocking(move || Self::run_espeak(&voice, &owned, emotion, limit))
            .await
            .map_err(|e| ServiceError::unavailable("espeak-ng", e))??;
        let duration = wav_duration(&wav)?;
        debug!("espeak-ng: {:.1}s of audio for '{}'", duration.as_secs_f32(), text);
        Ok(SynthesizedAudio {
            wav,
            duration,
            text: text.to_string(),
        })
    }

    async fn play(&self, audio: &SynthesizedAudio) -> Result<(), ServiceError> {
        let mut child = tokio::process::Command::new("aplay")
            .arg("-q")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServiceError::unavailable("aplay", e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&audio.wav)
                .await
                .map_err(|e| ServiceError::unavailable("aplay", e))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ServiceError::unavailable("aplay", e))?;
        if !output.status.success() {
            return Err(ServiceError::unavailable(
                "aplay",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn transcribe(&self, chunk: &AudioChunk) -> Result<Transcript, ServiceError> {
        let mut client = WyomingClient::connect(&self.wyoming_host, self.wyoming_port).await?;
        let text = client.transcribe(&chunk.pcm, chunk.sample_rate).await?;
        Ok(Transcript {
            confidence: if text.is_empty() { 0.0 } else { 1.0 },
            text,
        })
    }
}
