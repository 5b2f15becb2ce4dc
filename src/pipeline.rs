//! Sensor loops. Each runs on its own task and only talks to the orchestrator through proposals.

use crate::audio_level::LevelMonitor;
use crate::backends::{AudioChunk, SpeechService};
use crate::capture::{AudioSource, FrameSource};
use crate::orchestrator::Proposal;
use crate::retry::{call_with_retry, CallPolicy};
use crate::sampler::FrameSampler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Longest stretch of speech sent to recognition in one piece.
const MAX_SEGMENT: Duration = Duration::from_secs(15);

pub async fn frame_loop(
    mut frames: Box<dyn FrameSource>,
    mut sampler: FrameSampler,
    every: Duration,
    tx: Sender<Proposal>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if tx.is_closed() {
            break;
        }
        let Some(mut frame) = frames.next_frame().await else {
            info!("Frames: source ended after {} frames", sampler.frames_seen());
            break;
        };
        if sampler.sample(&mut frame).analyze && tx.send(Proposal::Keyframe(frame)).await.is_err() {
            break;
        }
    }
    debug!("Frames: loop stopped ({} analyzed)", sampler.frames_analyzed());
}

pub async fn audio_loop(
    mut audio: Box<dyn AudioSource>,
    mut level: LevelMonitor,
    speech: Arc<dyn SpeechService>,
    policy: CallPolicy,
    tx: Sender<Proposal>,
) {
    let mut dialogue = false;
    let mut segment: Vec<i16> = Vec::new();
    let mut segment_rate = 0u32;
    let mut segment_start = None;

    while let Some(chunk) = audio.next_chunk().await {
        if tx.is_closed() {
            break;
        }
        level.observe(&chunk.pcm, chunk.captured_at);
        let active = !level.is_quiet(chunk.captured_at);
        if active != dialogue {
            dialogue = active;
            if tx.send(Proposal::DialogueActivity(active)).await.is_err() {
                break;
            }
        }

        match timeout(policy.timeout, speech.detect_wake_word(&chunk)).await {
            Ok(Ok(true)) => {
                if tx.send(Proposal::WakeWord).await.is_err() {
                    break;
                }
            }
            Ok(Ok(false)) => {}
            Ok(Err(e)) => debug!("Audio: wake word check failed: {}", e),
            Err(_) => debug!("Audio: wake word check timed out"),
        }

        if active {
            segment.extend_from_slice(&chunk.pcm);
            segment_rate = chunk.sample_rate;
            segment_start.get_or_insert(chunk.captured_at);
        }

        let too_long = segment_start
            .map(|start| chunk.captured_at.saturating_duration_since(start) >= MAX_SEGMENT)
            .unwrap_or(false);
        if !segment.is_empty() && (!active || too_long) {
            let speech_chunk = AudioChunk {
                pcm: std::mem::take(&mut segment),
                sample_rate: segment_rate,
                captured_at: segment_start.take().unwrap_or(chunk.captured_at),
            };
            tokio::spawn(transcribe(speech_chunk, speech.clone(), policy, tx.clone()));
        }
    }
    debug!("Audio: loop stopped (average level {:.0})", level.average_db());
}

async fn transcribe(chunk: AudioChunk, speech: Arc<dyn SpeechService>, policy: CallPolicy, tx: Sender<Proposal>) {
    debug!("Audio: transcribing {:.1}s of speech", chunk.duration().as_secs_f32());
    match call_with_retry("stt", &policy, || speech.transcribe(&chunk)).await {
        Ok(transcript) if !transcript.text.trim().is_empty() => {
            let _ = tx
                .send(Proposal::Heard {
                    text: transcript.text,
                    confidence: transcript.confidence,
                })
                .await;
        }
        Ok(_) => debug!("Audio: nothing recognized"),
        Err(e) => warn!("Audio: transcription failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::MockSpeech;
    use crate::sampler::SamplerConfig;
    use crate::types::Frame;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn chunk(amplitude: i16, at: Instant) -> AudioChunk {
        AudioChunk {
            pcm: vec![amplitude; 8000],
            sample_rate: 16000,
            captured_at: at,
        }
    }

    fn policy() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(3),
            backoff: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn speech_segment_is_transcribed_after_it_ends() {
        let (audio_tx, audio_rx) = mpsc::channel(16);
        let (tx, mut rx) = mpsc::channel(16);
        let speech: Arc<dyn SpeechService> = Arc::new(MockSpeech::with_transcripts(["is that her sister?"]));
        let level = LevelMonitor::new(70.0, Duration::from_millis(500));
        tokio::spawn(audio_loop(Box::new(audio_rx), level, speech, policy(), tx));

        let start = Instant::now();
        audio_tx.send(chunk(20000, start)).await.unwrap();
        audio_tx.send(chunk(20000, start + Duration::from_millis(500))).await.unwrap();
        audio_tx.send(chunk(5, start + Duration::from_millis(1000))).await.unwrap();
        audio_tx.send(chunk(5, start + Duration::from_millis(1500))).await.unwrap();

        assert!(matches!(rx.recv().await, Some(Proposal::DialogueActivity(true))));
        assert!(matches!(rx.recv().await, Some(Proposal::DialogueActivity(false))));
        match rx.recv().await {
            Some(Proposal::Heard { text, .. }) => assert_eq!(text, "is that her sister?"),
            other => panic!("expected a transcript, got {:?}", other),
        }
    }

    fn png(shade: u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        RgbImage::from_pixel(64, 48, Rgb([shade, shade, shade]))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[tokio::test(start_paused = true)]
    async fn only_keyframes_reach_the_orchestrator() {
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (tx, mut rx) = mpsc::channel(16);
        let sampler = FrameSampler::new(SamplerConfig {
            threshold: 0.85,
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(5),
        });
        tokio::spawn(frame_loop(Box::new(frame_rx), sampler, Duration::from_millis(10), tx));

        let start = Instant::now();
        for i in 0..6u64 {
            frame_tx
                .send(Frame::new(start + Duration::from_millis(500 * i), png(10)))
                .await
                .unwrap();
        }
        frame_tx
            .send(Frame::new(start + Duration::from_millis(3000), png(240)))
            .await
            .unwrap();
        drop(frame_tx);

        match rx.recv().await {
            Some(Proposal::Keyframe(frame)) => assert_eq!(frame.timestamp, start + Duration::from_millis(3000)),
            other => panic!("expected a keyframe, got {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }
}
