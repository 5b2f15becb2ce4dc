//! Deterministic collaborators for the `demo` and `simulated` modes.

use super::{
    AudioChunk, PerceptionGateway, ReasoningContext, ReasoningReply, ReasoningService, SpeechService,
    SynthesizedAudio, Transcript,
};
use crate::error::ServiceError;
use crate::types::{Emotion, Frame, SceneDescription};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct ScriptedScene {
    pub caption: &'static str,
    pub objects: &'static [&'static str],
    pub people: u32,
    pub emotion: Emotion,
    pub remark: &'static str,
}

pub const SIMULATED_SCENES: &[ScriptedScene] = &[
    ScriptedScene {
        caption: "two people talking on a couch in a living room",
        objects: &["couch", "television", "lamp"],
        people: 2,
        emotion: Emotion::Calm,
        remark: "They're settling in for a long talk on the couch.",
    },
    ScriptedScene {
        caption: "an elderly man sitting alone by a rainy window",
        objects: &["window", "armchair"],
        people: 1,
        emotion: Emotion::Empathetic,
        remark: "He's sitting by the window on his own. It feels a little lonely, doesn't it?",
    },
    ScriptedScene {
        caption: "a family gathering around a dining table with a birthday cake",
        objects: &["dining table", "cake", "candles"],
        people: 5,
        emotion: Emotion::Cheerful,
        remark: "Oh, a birthday! The whole family is there around the cake.",
    },
    ScriptedScene {
        caption: "a car chase through dark city streets at night",
        objects: &["car", "street lights"],
        people: 2,
        emotion: Emotion::Tense,
        remark: "Hold on, this chase is getting intense.",
    },
    ScriptedScene {
        caption: "a couple hugging at a train station",
        objects: &["train", "suitcase"],
        people: 2,
        emotion: Emotion::Warm,
        remark: "What a lovely reunion at the station.",
    },
];

/// Demo timeline: each scene starts at the given second of the session.
pub const DEMO_TIMELINE: &[(u64, ScriptedScene)] = &[
    (
        0,
        ScriptedScene {
            caption: "a small fishing village wakes up at sunrise",
            objects: &["boats", "harbor"],
            people: 0,
            emotion: Emotion::Calm,
            remark: "What a peaceful morning over the harbor.",
        },
    ),
    (
        12,
        ScriptedScene {
            caption: "a girl and her grandfather repairing a fishing boat together",
            objects: &["boat", "hammer", "paint"],
            people: 2,
            emotion: Emotion::Warm,
            remark: "She's helping her grandfather fix up the old boat. You can tell how close they are.",
        },
    ),
    (
        24,
        ScriptedScene {
            caption: "the two of them laughing as they launch the boat",
            objects: &["boat", "water"],
            people: 2,
            emotion: Emotion::Cheerful,
            remark: "They did it! The boat floats, and they can't stop laughing.",
        },
    ),
    (
        36,
        ScriptedScene {
            caption: "a storm rolls in and the boat fights the waves",
            objects: &["storm", "waves", "boat"],
            people: 2,
            emotion: Emotion::Tense,
            remark: "Uh oh, that storm came in fast. Hold on tight.",
        },
    ),
    (
        48,
        ScriptedScene {
            caption: "the grandfather alone in the hospital, the girl holding his hand",
            objects: &["hospital bed", "flowers"],
            people: 2,
            emotion: Emotion::Empathetic,
            remark: "This is a tender moment. She hasn't left his side.",
        },
    ),
    (
        60,
        ScriptedScene {
            caption: "the girl sailing the repaired boat out to sea at sunset",
            objects: &["boat", "sunset"],
            people: 1,
            emotion: Emotion::Warm,
            remark: "She's sailing it on her own now. He'd be so proud of her.",
        },
    ),
];

fn describe(scene: &ScriptedScene, at: Instant) -> SceneDescription {
    SceneDescription {
        caption: scene.caption.to_string(),
        objects: scene.objects.iter().map(|o| o.to_string()).collect(),
        people_count: scene.people,
        confidence: 0.95,
        timestamp: at,
    }
}

fn lookup(caption: &str) -> Option<&'static ScriptedScene> {
    SIMULATED_SCENES
        .iter()
        .chain(DEMO_TIMELINE.iter().map(|(_, s)| s))
        .find(|s| s.caption.eq_ignore_ascii_case(caption.trim()))
}

enum Script {
    Rotating(AtomicUsize),
    Timeline(Instant),
}

pub struct MockPerception {
    script: Script,
}

impl MockPerception {
    /// Each call describes the next simulated scene.
    pub fn rotating() -> Self {
        Self {
            script: Script::Rotating(AtomicUsize::new(0)),
        }
    }

    /// The scene is chosen by the frame's offset from `start` on the demo timeline.
    pub fn timeline(start: Instant) -> Self {
        Self {
            script: Script::Timeline(start),
        }
    }
}

#[async_trait]
impl PerceptionGateway for MockPerception {
    async fn describe(&self, frame: &Frame) -> Result<SceneDescription, ServiceError> {
        let scene = match &self.script {
            Script::Rotating(next) => {
                let i = next.fetch_add(1, Ordering::Relaxed) % SIMULATED_SCENES.len();
                &SIMULATED_SCENES[i]
            }
            Script::Timeline(start) => {
                let offset = frame.timestamp.saturating_duration_since(*start).as_secs();
                DEMO_TIMELINE
                    .iter()
                    .rev()
                    .find(|(from, _)| offset >= *from)
                    .map(|(_, s)| s)
                    .unwrap_or(&DEMO_TIMELINE[0].1)
            }
        };
        Ok(describe(scene, frame.timestamp))
    }
}

/// Answers from the scripted remarks, following the same rules as the real model.
pub struct MockReasoner;

#[async_trait]
impl ReasoningService for MockReasoner {
    async fn reason(&self, context: &ReasoningContext) -> Result<ReasoningReply, ServiceError> {
        let current = context.scenes.last().map(String::as_str).unwrap_or_default();
        let scripted = lookup(current);

        if let Some(query) = &context.query {
            let text = match scripted {
                Some(scene) => format!("You asked \"{}\". Right now it's {}.", query.trim(), scene.caption),
                None if !context.draft.is_empty() => context.draft.clone(),
                None => "I'm happy to help. Let me take a closer look at the screen.".to_string(),
            };
            return Ok(ReasoningReply {
                speak: true,
                text,
                emotion: scripted.map(|s| s.emotion).unwrap_or(Emotion::Calm),
            });
        }

        if context.dialogue_active {
            return Ok(ReasoningReply {
                speak: false,
                text: String::new(),
                emotion: Emotion::Neutral,
            });
        }

        Ok(match scripted {
            Some(scene) => ReasoningReply {
                speak: true,
                text: scene.remark.to_string(),
                emotion: scene.emotion,
            },
            None => ReasoningReply {
                speak: !context.draft.is_empty(),
                text: context.draft.clone(),
                emotion: Emotion::Neutral,
            },
        })
    }
}

/// Prints instead of speaking; playback takes as long as reading the line aloud would.
pub struct MockSpeech {
    transcripts: Mutex<VecDeque<String>>,
    words_per_minute: u32,
}

impl MockSpeech {
    pub fn new() -> Self {
        Self::with_transcripts(Vec::<String>::new())
    }

    /// Successive `transcribe` calls return these lines, then silence.
    pub fn with_transcripts<S: Into<String>>(lines: impl IntoIterator<Item = S>) -> Self {
        Self {
            transcripts: Mutex::new(lines.into_iter().map(Into::into).collect()),
            words_per_minute: 165,
        }
    }

    pub fn speaking_time(&self, text: &str) -> Duration {
        let words = text.split_whitespace().count().max(1) as u64;
        Duration::from_millis((words * 60_000 / self.words_per_minute as u64).max(800))
    }
}

impl Default for MockSpeech {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechService for MockSpeech {
    async fn synthesize(&self, text: &str, _emotion: Emotion) -> Result<SynthesizedAudio, ServiceError> {
        Ok(SynthesizedAudio {
            wav: Vec::new(),
            duration: self.speaking_time(text),
            text: text.to_string(),
        })
    }

    async fn play(&self, audio: &SynthesizedAudio) -> Result<(), ServiceError> {
        info!(target: "cinemate::speech", "🔊 {}", audio.text);
        sleep(audio.duration).await;
        Ok(())
    }

    async fn transcribe(&self, _chunk: &AudioChunk) -> Result<Transcript, ServiceError> {
        let next = self
            .transcripts
            .lock()
            .map_err(|_| ServiceError::unavailable("mock-stt", "transcript script poisoned"))?
            .pop_front()
            .unwrap_or_default();
        Ok(Transcript {
            confidence: if next.is_empty() { 0.0 } else { 0.95 },
            text: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rotating_perception_cycles() {
        let perception = MockPerception::rotating();
        let frame = Frame::new(Instant::now(), Vec::new());
        let first = perception.describe(&frame).await.unwrap();
        for _ in 1..SIMULATED_SCENES.len() {
            perception.describe(&frame).await.unwrap();
        }
        let again = perception.describe(&frame).await.unwrap();
        assert_eq!(first.caption, again.caption);
    }

    #[tokio::test]
    async fn timeline_follows_elapsed_time() {
        let start = Instant::now();
        let perception = MockPerception::timeline(start);
        let early = perception.describe(&Frame::new(start + Duration::from_secs(5), Vec::new())).await.unwrap();
        let storm = perception.describe(&Frame::new(start + Duration::from_secs(40), Vec::new())).await.unwrap();
        assert_eq!(early.caption, DEMO_TIMELINE[0].1.caption);
        assert!(storm.caption.contains("storm"));
    }

    #[tokio::test]
    async fn reasoner_stays_quiet_during_dialogue() {
        let context = ReasoningContext {
            scenes: vec![SIMULATED_SCENES[0].caption.to_string()],
            dialogue_active: true,
            ..Default::default()
        };
        let reply = MockReasoner.reason(&context).await.unwrap();
        assert!(!reply.speak);
    }

    #[tokio::test]
    async fn reasoner_answers_questions_with_the_scene() {
        let context = ReasoningContext {
            scenes: vec![SIMULATED_SCENES[3].caption.to_string()],
            dialogue_active: true,
            query: Some("what's going on?".into()),
            ..Default::default()
        };
        let reply = MockReasoner.reason(&context).await.unwrap();
        assert!(reply.speak);
        assert!(reply.text.contains("car chase"));
        assert_eq!(reply.emotion, Emotion::Tense);
    }

    #[tokio::test(start_paused = true)]
    async fn mock_playback_takes_speaking_time() {
        let speech = MockSpeech::new();
        let audio = speech.synthesize("one two three four five six", Emotion::Calm).await.unwrap();
        let started = Instant::now();
        speech.play(&audio).await.unwrap();
        assert!(started.elapsed() >= audio.duration);
    }

    #[tokio::test]
    async fn scripted_transcripts_run_out_into_silence() {
        let speech = MockSpeech::with_transcripts(["who is that?"]);
        let chunk = AudioChunk {
            pcm: vec![0; 16],
            sample_rate: 16000,
            captured_at: Instant::now(),
        };
        assert_eq!(speech.transcribe(&chunk).await.unwrap().text, "who is that?");
        assert_eq!(speech.transcribe(&chunk).await.unwrap().text, "");
    }
}
