//! The decision policy: whether to speak, at which priority, and with which tone.
//!
//! `ReasoningArbiter::decide` is pure. It drafts the utterance locally so that a reply is always
//! available; the orchestrator may refine the draft's wording through a reasoning service.

use crate::config_loader::Settings;
use crate::types::{ConversationState, Decision, Emotion, Priority, SceneDescription, UserQuery, Utterance};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const TENSE_WORDS: &[&str] = &[
    "fight", "gun", "weapon", "chase", "storm", "scream", "fire", "explosion", "danger", "police",
    "crash", "blood", "dark", "running", "knife",
];
const SAD_WORDS: &[&str] = &[
    "sad", "crying", "tears", "alone", "funeral", "hospital", "grief", "lonely", "goodbye", "empty",
];
const WARM_WORDS: &[&str] = &[
    "family", "hug", "wedding", "love", "kiss", "baby", "together", "couple", "holding hands",
];
const CHEERFUL_WORDS: &[&str] = &[
    "happy", "party", "laugh", "dance", "celebration", "funny", "playing", "smile", "cake",
];

pub struct ReasoningArbiter {
    cooldown: Duration,
}

impl ReasoningArbiter {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.autonomous_cooldown())
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Policy, first match wins:
    /// 1. dialogue on screen and no query: hold
    /// 2. a query: answer it, ignoring cooldown
    /// 3. a materially new scene after the cooldown: comment on it
    /// 4. otherwise hold
    pub fn decide(
        &self,
        scene: Option<&SceneDescription>,
        query: Option<&UserQuery>,
        state: &ConversationState,
        dialogue_active: bool,
        now: Instant,
    ) -> Decision {
        if dialogue_active && query.is_none() {
            debug!("Arbiter: dialogue in progress, holding");
            return Decision::Hold;
        }

        if let Some(query) = query {
            let (text, emotion) = match scene {
                Some(scene) => (
                    format!("Right now I can see {}.", describe(scene)),
                    infer_emotion(scene),
                ),
                None => (
                    "I haven't had a good look at the screen yet, give me a moment.".to_string(),
                    Emotion::Calm,
                ),
            };
            let utterance = Utterance::new(Priority::Query, text, emotion, query.timestamp).with_origin(query.origin);
            return Decision::Speak(utterance);
        }

        let Some(scene) = scene else {
            return Decision::Hold;
        };

        if state.last_scene_hash == Some(scene.content_hash()) {
            debug!("Arbiter: scene unchanged, holding");
            return Decision::Hold;
        }

        if !state.cooldown_elapsed(now, self.cooldown) {
            debug!("Arbiter: autonomous cooldown active, holding");
            return Decision::Hold;
        }

        let emotion = infer_emotion(scene);
        let text = opener(emotion, &describe(scene));
        Decision::Speak(Utterance::new(Priority::Autonomous, text, emotion, scene.timestamp))
    }
}

/// Infer an advisory tone from the scene's caption and objects.
pub fn infer_emotion(scene: &SceneDescription) -> Emotion {
    let haystack = format!("{} {}", scene.caption, scene.objects.join(" ")).to_lowercase();
    let hits = |words: &[&str]| words.iter().filter(|w| haystack.contains(*w)).count();

    let scores = [
        (hits(TENSE_WORDS), Emotion::Tense),
        (hits(SAD_WORDS), Emotion::Empathetic),
        (hits(WARM_WORDS), Emotion::Warm),
        (hits(CHEERFUL_WORDS), Emotion::Cheerful),
    ];
    // Earlier entries win ties: a tense scene outranks a warm one.
    scores
        .iter()
        .filter(|(n, _)| *n > 0)
        .fold(None::<(usize, Emotion)>, |best, &(n, e)| match best {
            Some((bn, _)) if bn >= n => best,
            _ => Some((n, e)),
        })
        .map(|(_, e)| e)
        .unwrap_or(Emotion::Neutral)
}

fn describe(scene: &SceneDescription) -> String {
    let caption = scene
        .caption
        .trim()
        .trim_start_matches("Scene:")
        .trim()
        .trim_end_matches('.')
        .to_string();
    if !caption.is_empty() {
        return caption;
    }
    if !scene.objects.is_empty() {
        return scene.objects.join(", ");
    }
    "a quiet moment".to_string()
}

fn opener(emotion: Emotion, description: &str) -> String {
    match emotion {
        Emotion::Tense => format!("Things are getting intense: {}.", description),
        Emotion::Empathetic | Emotion::Concerned => format!("This is a tender moment. {}.", capitalize(description)),
        Emotion::Warm => format!("Oh, that's lovely. {}.", capitalize(description)),
        Emotion::Cheerful => format!("Ha, look at that! {}.", capitalize(description)),
        Emotion::Neutral | Emotion::Calm => format!("Now on screen: {}.", description),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
