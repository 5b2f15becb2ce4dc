//! Shared data model of the decision core.
//!
//! All timestamps are `tokio::time::Instant` so that timing behavior can be driven by a paused
//! runtime clock in tests.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

static NEXT_UTTERANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Priority class of an utterance. The derived ordering is the preemption order:
/// `Autonomous < Query < Safety`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Autonomous,
    Query,
    Safety,
}

/// Advisory emotional tone for the speech renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    #[default]
    Neutral,
    Calm,
    Warm,
    Cheerful,
    Tense,
    Empathetic,
    Concerned,
}

impl Emotion {
    /// Lenient parse of a tone name. Unknown names fall back to `Neutral`.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "calm" => Self::Calm,
            "warm" | "supportive" => Self::Warm,
            "cheerful" | "happy" | "joyful" => Self::Cheerful,
            "tense" | "excited" => Self::Tense,
            "empathetic" | "sad" => Self::Empathetic,
            "concerned" | "worried" => Self::Concerned,
            _ => Self::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::Calm => "calm",
            Self::Warm => "warm",
            Self::Cheerful => "cheerful",
            Self::Tense => "tense",
            Self::Empathetic => "empathetic",
            Self::Concerned => "concerned",
        }
    }

    /// Dashboard mood label.
    pub fn mood(&self) -> &'static str {
        match self {
            Self::Neutral | Self::Calm => "Calm",
            Self::Warm => "Warm",
            Self::Cheerful => "Happy",
            Self::Tense => "Tense",
            Self::Empathetic | Self::Concerned => "Sad",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtteranceState {
    Proposed,
    Queued,
    Speaking,
    /// Preempted before it ever reached `Speaking`.
    Superseded,
    /// Cut off mid-playback by a Safety interruption.
    Interrupted,
    Delivered,
}

/// Where a user query came from. Only `Ambient` queries are subject to wake-word gating
/// under the default scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryOrigin {
    /// Typed or sent through the control interface.
    Explicit,
    /// Spoken right after the wake word.
    WakeWord,
    /// A question overheard in ambient speech.
    Ambient,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: Instant,
    /// Encoded image (PNG or JPEG).
    pub image: Vec<u8>,
    /// Similarity against the last analyzed frame, filled in by the sampler.
    pub similarity: Option<f32>,
}

impl Frame {
    pub fn new(timestamp: Instant, image: Vec<u8>) -> Self {
        Self {
            timestamp,
            image,
            similarity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneDescription {
    pub caption: String,
    pub objects: Vec<String>,
    pub people_count: u32,
    pub confidence: f32,
    pub timestamp: Instant,
}

impl SceneDescription {
    /// Content hash used to tell whether the scene changed materially. Case, whitespace and
    /// object order do not count as change.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        let caption: Vec<String> = self
            .caption
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        caption.hash(&mut hasher);
        let mut objects: Vec<String> = self.objects.iter().map(|o| o.to_lowercase()).collect();
        objects.sort();
        objects.dedup();
        objects.hash(&mut hasher);
        self.people_count.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserQuery {
    pub text: String,
    pub timestamp: Instant,
    pub confidence: f32,
    pub origin: QueryOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Moderate,
    High,
}

impl Severity {
    pub fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Moderate,
            Self::Moderate | Self::High => Self::High,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "moderate" | "medium" => Some(Self::Moderate),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistressEvent {
    pub term: String,
    pub severity: Severity,
    pub timestamp: Instant,
    /// The term only matched inside a larger word. Still reported: a false alarm is cheaper
    /// than a missed one.
    pub ambiguous: bool,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: u64,
    pub text: String,
    pub emotion: Emotion,
    pub priority: Priority,
    pub source_timestamp: Instant,
    pub state: UtteranceState,
    /// Ask the video player to pause while this is delivered.
    pub pause_playback: bool,
    pub origin: Option<QueryOrigin>,
}

impl Utterance {
    pub fn new(priority: Priority, text: impl Into<String>, emotion: Emotion, source_timestamp: Instant) -> Self {
        Self {
            id: NEXT_UTTERANCE_ID.fetch_add(1, Ordering::Relaxed),
            text: text.into(),
            emotion,
            priority,
            source_timestamp,
            state: UtteranceState::Proposed,
            pause_playback: false,
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: QueryOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_pause(mut self) -> Self {
        self.pause_playback = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Hold,
    Speak(Utterance),
}

/// Orchestrator state. `Listening` is not an exclusive state: ambient capture runs alongside
/// every other state and is tracked by `ConversationState::listening`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompanionState {
    #[default]
    Idle,
    Listening,
    Analyzing,
    Speaking,
    SafetyOverride,
}

impl fmt::Display for CompanionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Analyzing => "analyzing",
            Self::Speaking => "speaking",
            Self::SafetyOverride => "safety_override",
        };
        f.write_str(name)
    }
}

/// Process-wide conversation state. Only the orchestrator holds a mutable reference.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    pub last_spoken: Option<Instant>,
    pub last_scene_hash: Option<u64>,
    pub dialogue_active: bool,
    pub cooldown_deadline: Option<Instant>,
    pub mode: CompanionState,
    pub listening: bool,
}

impl ConversationState {
    /// Record the end of a speech act. Timestamps never move backwards.
    ///
    /// `dialogue_active` is left alone: it tracks the live audio level and only the audio loop
    /// clears it.
    pub fn commit_spoken(&mut self, now: Instant, cooldown: Duration) {
        let spoken = match self.last_spoken {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        self.last_spoken = Some(spoken);
        let deadline = spoken + cooldown;
        self.cooldown_deadline = Some(match self.cooldown_deadline {
            Some(prev) if prev > deadline => prev,
            _ => deadline,
        });
    }

    pub fn cooldown_elapsed(&self, now: Instant, cooldown: Duration) -> bool {
        match self.last_spoken {
            Some(last) => now.saturating_duration_since(last) >= cooldown,
            None => true,
        }
    }
}
