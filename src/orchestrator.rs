//! The scheduler and sole writer of conversation state.
//!
//! Sensor loops, external calls and the control surface all talk to the orchestrator through
//! `Proposal` messages. Every external call runs on its own task and reports back with a
//! ticket; the loop itself never awaits a collaborator.

use crate::arbiter::ReasoningArbiter;
use crate::audio_level::LevelMonitor;
use crate::backends::{PerceptionGateway, ReasoningContext, ReasoningReply, ReasoningService, SpeechService};
use crate::capture::{AudioSource, FrameSource};
use crate::config_loader::Settings;
use crate::coordinator::{CoordinatorConfig, Disposition, SpeechCoordinator};
use crate::dashboard::{DashboardEvent, DashboardSink};
use crate::error::ServiceError;
use crate::memory::ContextMemory;
use crate::pipeline;
use crate::playback::PlaybackControl;
use crate::retry::{call_with_retry, CallPolicy};
use crate::safety::{SafetyConfig, SafetyMonitor};
use crate::sampler::{FrameSampler, SamplerConfig};
use crate::types::{
    CompanionState, ConversationState, Decision, Emotion, Frame, Priority, QueryOrigin, SceneDescription, Severity,
    UserQuery, Utterance,
};
use deunicode::deunicode;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

const PROPOSAL_QUEUE: usize = 128;
const SCENES_IN_CONTEXT: usize = 5;
const FAREWELL_LIMIT: Duration = Duration::from_secs(10);

pub const GREETING: &str = "Hello! I'm CineMate, your movie companion. Just say my name if you need me.";
pub const FAREWELL: &str = "It was lovely watching with you. Take care!";
pub const WAKE_ACK: &str = "Yes, I'm here! What can I help you with?";

#[derive(Debug)]
pub enum Proposal {
    /// The sampler picked a frame for analysis.
    Keyframe(Frame),
    SceneReady {
        ticket: u64,
        result: Result<SceneDescription, ServiceError>,
    },
    Refined {
        epoch: u64,
        draft: Utterance,
        result: Result<ReasoningReply, ServiceError>,
    },
    /// Recognized speech from the microphone.
    Heard { text: String, confidence: f32 },
    /// Acoustic wake-word detection.
    WakeWord,
    DialogueActivity(bool),
    SpeechFinished {
        id: u64,
        result: Result<(), ServiceError>,
    },
    /// A typed question from the control interface.
    Ask(String),
    Resume,
    Remember { name: String, description: String },
    Status(oneshot::Sender<StatusSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub mode: CompanionState,
    pub listening: bool,
    pub dialogue_active: bool,
    pub speaking: Option<String>,
    pub queued: usize,
    pub wake_window_open: bool,
    pub video_paused: bool,
    pub last_scene: Option<String>,
    pub scenes_analyzed: u64,
    pub utterances_delivered: u64,
    pub uptime_secs: u64,
}

/// The collaborators chosen at startup.
#[derive(Clone)]
pub struct Services {
    pub perception: Arc<dyn PerceptionGateway>,
    /// Optional: without it the locally drafted lines are spoken as-is.
    pub reasoning: Option<Arc<dyn ReasoningService>>,
    pub speech: Arc<dyn SpeechService>,
    pub dashboard: Arc<dyn DashboardSink>,
    pub playback: Arc<dyn PlaybackControl>,
}

pub struct Sources {
    pub frames: Box<dyn FrameSource>,
    pub audio: Option<Box<dyn AudioSource>>,
}

/// Cloneable handle for everything outside the loop.
#[derive(Clone)]
pub struct CompanionHandle {
    tx: mpsc::Sender<Proposal>,
}

impl From<mpsc::Sender<Proposal>> for CompanionHandle {
    fn from(tx: mpsc::Sender<Proposal>) -> Self {
        Self { tx }
    }
}

impl CompanionHandle {
    pub async fn ask(&self, question: &str) -> bool {
        self.tx.send(Proposal::Ask(question.to_string())).await.is_ok()
    }

    pub async fn resume(&self) -> bool {
        self.tx.send(Proposal::Resume).await.is_ok()
    }

    pub async fn remember(&self, name: &str, description: &str) -> bool {
        self.tx
            .send(Proposal::Remember {
                name: name.to_string(),
                description: description.to_string(),
            })
            .await
            .is_ok()
    }

    pub async fn status(&self) -> Option<StatusSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Proposal::Status(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Proposal::Shutdown).await;
    }

    /// Raw access for sensor loops and tests.
    pub async fn propose(&self, proposal: Proposal) -> bool {
        self.tx.send(proposal).await.is_ok()
    }
}

pub struct Orchestrator {
    settings: Settings,
    services: Services,
    policy: CallPolicy,
    arbiter: ReasoningArbiter,
    safety: SafetyMonitor,
    coordinator: SpeechCoordinator,
    memory: ContextMemory,
    state: ConversationState,
    wake_phrase: String,
    resume_phrases: Vec<String>,

    tx: mpsc::Sender<Proposal>,
    rx: mpsc::Receiver<Proposal>,

    next_ticket: u64,
    /// Ticket and task of the newest scene analysis; older results are discarded on arrival.
    analysis_in_flight: Option<(u64, JoinHandle<()>)>,
    refinements_in_flight: usize,
    /// Bumped whenever a Query or Safety utterance is accepted; autonomous drafts from an
    /// older epoch are dropped.
    epoch: u64,
    latest_scene: Option<SceneDescription>,
    playing: Option<(u64, JoinHandle<()>)>,
    safety_severity: HashMap<u64, Severity>,
    video_paused: bool,
    started: Instant,
    scenes_analyzed: u64,
    utterances_delivered: u64,
}

impl Orchestrator {
    pub fn new(settings: &Settings, services: Services) -> (Self, CompanionHandle) {
        let (tx, rx) = mpsc::channel(PROPOSAL_QUEUE);
        let orchestrator = Self {
            settings: settings.clone(),
            services,
            policy: CallPolicy::from(settings),
            arbiter: ReasoningArbiter::from_settings(settings),
            safety: SafetyMonitor::new(SafetyConfig::from_settings(settings)),
            coordinator: SpeechCoordinator::new(CoordinatorConfig::from(settings)),
            memory: ContextMemory::new(),
            state: ConversationState::default(),
            wake_phrase: normalize(&settings.wake_word_phrase),
            resume_phrases: settings.resume_phrases.iter().map(|p| normalize(p)).collect(),
            tx: tx.clone(),
            rx,
            next_ticket: 0,
            analysis_in_flight: None,
            refinements_in_flight: 0,
            epoch: 0,
            latest_scene: None,
            playing: None,
            safety_severity: HashMap::new(),
            video_paused: false,
            started: Instant::now(),
            scenes_analyzed: 0,
            utterances_delivered: 0,
        };
        (orchestrator, CompanionHandle { tx })
    }

    /// Start the frame and audio loops. They stop on their own once the orchestrator is gone.
    pub fn spawn_sensors(&mut self, sources: Sources) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        let sampler = FrameSampler::new(SamplerConfig::from(&self.settings));
        tasks.push(tokio::spawn(pipeline::frame_loop(
            sources.frames,
            sampler,
            self.settings.frame_interval(),
            self.tx.clone(),
        )));

        if let Some(audio) = sources.audio {
            self.state.listening = true;
            let level = LevelMonitor::new(self.settings.loud_threshold_db, self.settings.quiet_duration());
            tasks.push(tokio::spawn(pipeline::audio_loop(
                audio,
                level,
                self.services.speech.clone(),
                self.policy,
                self.tx.clone(),
            )));
        }
        tasks
    }

    pub async fn run(mut self) {
        info!("Orchestrator: session started in {:?} mode", self.settings.mode);
        if self.settings.greeting_enabled {
            let now = Instant::now();
            let greeting = Utterance::new(Priority::Query, GREETING, Emotion::Cheerful, now)
                .with_origin(QueryOrigin::Explicit);
            self.submit(greeting);
            self.settle_mode();
        }

        while let Some(proposal) = self.rx.recv().await {
            if matches!(proposal, Proposal::Shutdown) {
                break;
            }
            self.handle(proposal);
            self.settle_mode();
        }

        self.finish().await;
    }

    fn handle(&mut self, proposal: Proposal) {
        let now = Instant::now();
        match proposal {
            Proposal::Keyframe(frame) => self.on_keyframe(frame),
            Proposal::SceneReady { ticket, result } => self.on_scene(ticket, result, now),
            Proposal::Refined { epoch, draft, result } => self.on_refined(epoch, draft, result, now),
            Proposal::Heard { text, confidence } => self.on_heard(&text, confidence, now),
            Proposal::WakeWord => {
                self.coordinator.note_wake_word(now);
                self.acknowledge_wake(now);
            }
            Proposal::DialogueActivity(active) => {
                if self.state.dialogue_active != active {
                    debug!("Orchestrator: dialogue {}", if active { "started" } else { "ended" });
                }
                self.state.dialogue_active = active;
            }
            Proposal::SpeechFinished { id, result } => self.on_speech_finished(id, result, now),
            Proposal::Ask(text) => self.on_user_text(&text, 1.0, Some(QueryOrigin::Explicit), now),
            Proposal::Resume => self.resume_video(),
            Proposal::Remember { name, description } => {
                info!("Orchestrator: remembering {} as {}", name, description);
                self.memory.remember_character(&name, &description);
            }
            Proposal::Status(reply) => {
                let _ = reply.send(self.snapshot(now));
            }
            Proposal::Shutdown => {}
        }
    }

    /// The newest keyframe always wins: a slower analysis of an older frame is cancelled so
    /// the remark describes what is on screen now.
    fn on_keyframe(&mut self, frame: Frame) {
        if let Some((stale, task)) = self.analysis_in_flight.take() {
            debug!("Orchestrator: newer keyframe supersedes analysis {}", stale);
            task.abort();
        }
        self.next_ticket += 1;
        let ticket = self.next_ticket;

        let perception = self.services.perception.clone();
        let policy = self.policy;
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let result = call_with_retry("vision", &policy, || perception.describe(&frame)).await;
            let _ = tx.send(Proposal::SceneReady { ticket, result }).await;
        });
        self.analysis_in_flight = Some((ticket, task));
    }

    fn on_scene(&mut self, ticket: u64, result: Result<SceneDescription, ServiceError>, now: Instant) {
        if self.analysis_in_flight.as_ref().map(|(current, _)| *current) != Some(ticket) {
            debug!("Orchestrator: discarding overtaken analysis {}", ticket);
            return;
        }
        self.analysis_in_flight = None;

        let scene = match result {
            Ok(scene) => scene,
            Err(e) => {
                self.report_failure("vision", &e);
                return;
            }
        };
        self.scenes_analyzed += 1;
        info!("Scene: {}", scene.caption);
        self.memory.add_scene(&scene.caption);
        self.services.dashboard.publish(DashboardEvent::Scene {
            caption: scene.caption.clone(),
            emotion: crate::arbiter::infer_emotion(&scene),
        });

        let decision = self
            .arbiter
            .decide(Some(&scene), None, &self.state, self.state.dialogue_active, now);
        self.state.last_scene_hash = Some(scene.content_hash());
        self.latest_scene = Some(scene);

        if let Decision::Speak(draft) = decision {
            self.propose(draft, None);
        }
    }

    /// Send a draft through the reasoning service, or straight to the coordinator without one.
    fn propose(&mut self, draft: Utterance, query: Option<String>) {
        let Some(reasoning) = self.services.reasoning.clone() else {
            self.commit(draft, Instant::now());
            return;
        };

        let context = ReasoningContext {
            scenes: self.memory.recent_scenes(SCENES_IN_CONTEXT),
            dialogue_active: self.state.dialogue_active,
            query,
            user_comments: self.memory.recent_comments(),
            characters: self.memory.characters().clone(),
            draft: draft.text.clone(),
            priority: Some(draft.priority),
        };
        self.refinements_in_flight += 1;
        let epoch = self.epoch;
        let policy = self.policy;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = call_with_retry("reasoning", &policy, || reasoning.reason(&context)).await;
            let _ = tx.send(Proposal::Refined { epoch, draft, result }).await;
        });
    }

    fn on_refined(
        &mut self,
        epoch: u64,
        mut draft: Utterance,
        result: Result<ReasoningReply, ServiceError>,
        now: Instant,
    ) {
        self.refinements_in_flight = self.refinements_in_flight.saturating_sub(1);

        if draft.priority == Priority::Autonomous {
            if epoch != self.epoch {
                debug!("Orchestrator: autonomous draft {} overtaken, discarding", draft.id);
                return;
            }
            match result {
                Ok(reply) if reply.speak => {
                    draft.text = reply.text;
                    draft.emotion = reply.emotion;
                }
                Ok(_) => {
                    debug!("Orchestrator: reasoning chose to hold");
                    return;
                }
                Err(e) => {
                    self.report_failure("reasoning", &e);
                    return;
                }
            }
        } else {
            match result {
                Ok(reply) if reply.speak => {
                    draft.text = reply.text;
                    draft.emotion = reply.emotion;
                }
                Ok(_) => {}
                Err(e) => self.report_failure("reasoning", &e),
            }
        }
        self.commit(draft, now);
    }

    /// Final checks before an utterance reaches the coordinator. Time has passed since the
    /// arbiter drafted it, so autonomous lines are held again if dialogue or cooldown now apply.
    fn commit(&mut self, draft: Utterance, now: Instant) {
        if draft.priority == Priority::Autonomous {
            if self.state.dialogue_active {
                debug!("Orchestrator: dialogue started meanwhile, holding");
                return;
            }
            if !self.state.cooldown_elapsed(now, self.arbiter.cooldown()) {
                debug!("Orchestrator: cooldown started meanwhile, holding");
                return;
            }
        }
        self.submit(draft);
    }

    fn submit(&mut self, utterance: Utterance) {
        let now = Instant::now();
        let priority = utterance.priority;
        let submission = self.coordinator.submit(utterance, now);

        for dropped in &submission.superseded {
            info!("Orchestrator: '{}' superseded", dropped.text);
        }

        match submission.disposition {
            Disposition::Started(u) => {
                self.bump_epoch(priority);
                self.start_speaking(u);
            }
            Disposition::Interrupted { stopped, started } => {
                self.bump_epoch(priority);
                if let Some((id, handle)) = self.playing.take() {
                    if id == stopped.id {
                        handle.abort();
                    } else {
                        self.playing = Some((id, handle));
                    }
                }
                warn!("Orchestrator: interrupted '{}' for a safety message", stopped.text);
                self.start_speaking(started);
            }
            Disposition::Queued(id) => {
                self.bump_epoch(priority);
                debug!("Orchestrator: utterance {} queued", id);
            }
            Disposition::Gated => info!("Orchestrator: not answering without the wake word"),
            Disposition::Busy => debug!("Orchestrator: speech busy, autonomous remark dropped"),
        }
    }

    fn bump_epoch(&mut self, priority: Priority) {
        if priority > Priority::Autonomous {
            self.epoch += 1;
        }
    }

    fn start_speaking(&mut self, utterance: Utterance) {
        info!(
            "Speaking ({:?}, {}): {}",
            utterance.priority, utterance.emotion, utterance.text
        );
        self.services.dashboard.publish(DashboardEvent::Utterance {
            priority: utterance.priority,
            text: utterance.text.clone(),
            emotion: utterance.emotion,
        });

        if utterance.pause_playback && !self.video_paused {
            self.video_paused = true;
            let playback = self.services.playback.clone();
            tokio::spawn(async move {
                if let Err(e) = playback.pause().await {
                    warn!("Playback: pause failed: {}", e);
                }
            });
        }

        let speech = self.services.speech.clone();
        let policy = self.policy;
        let tx = self.tx.clone();
        let id = utterance.id;
        let handle = tokio::spawn(async move {
            let result: Result<(), ServiceError> = async {
                let audio =
                    call_with_retry("tts", &policy, || speech.synthesize(&utterance.text, utterance.emotion)).await?;
                let limit = audio.duration + policy.timeout;
                match timeout(limit, speech.play(&audio)).await {
                    Ok(played) => played,
                    Err(_) => Err(ServiceError::Timeout {
                        service: "playback".to_string(),
                        after: limit,
                    }),
                }
            }
            .await;
            let _ = tx.send(Proposal::SpeechFinished { id, result }).await;
        });
        self.playing = Some((id, handle));
    }

    fn on_speech_finished(&mut self, id: u64, result: Result<(), ServiceError>, now: Instant) {
        if matches!(&self.playing, Some((playing, _)) if *playing == id) {
            self.playing = None;
        }
        let Some(completion) = self.coordinator.complete(id, result.is_ok()) else {
            return;
        };

        let severity = self.safety_severity.remove(&id);
        match result {
            Ok(()) => {
                self.utterances_delivered += 1;
                self.state.commit_spoken(now, self.arbiter.cooldown());
                if let Some(severity) = severity {
                    self.safety.on_delivered(severity, now);
                }
            }
            Err(e) => {
                if severity.is_some() {
                    self.safety.on_failed();
                }
                self.report_failure("speech", &e);
            }
        }

        if let Some(next) = completion.next {
            self.start_speaking(next);
        }
    }

    fn on_heard(&mut self, text: &str, confidence: f32, now: Instant) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.services.dashboard.publish(DashboardEvent::Heard {
            text: text.to_string(),
        });
        self.on_user_text(text, confidence, None, now);
    }

    /// Recognized or typed text: distress first, then resume requests, wake word and questions.
    fn on_user_text(&mut self, text: &str, confidence: f32, origin: Option<QueryOrigin>, now: Instant) {
        self.memory.add_comment(text);

        if let Some(event) = self.safety.scan(text, now) {
            self.services.dashboard.publish(DashboardEvent::Safety {
                term: event.term.clone(),
                severity: event.severity,
            });
            if let Some(comfort) = self.safety.respond(&event) {
                self.safety_severity.insert(comfort.id, event.severity);
                self.submit(comfort);
            }
            return;
        }

        let normalized = normalize(text);
        if self.video_paused && self.resume_phrases.iter().any(|p| contains_phrase(&normalized, p)) {
            self.resume_video();
            return;
        }

        let (question, origin) = match origin {
            Some(origin) => (text.to_string(), origin),
            None => match strip_wake_phrase(text, &self.wake_phrase) {
                Some(rest) => {
                    self.coordinator.note_wake_word(now);
                    if rest.is_empty() {
                        self.acknowledge_wake(now);
                        return;
                    }
                    (rest, QueryOrigin::WakeWord)
                }
                None if text.ends_with('?') => (text.to_string(), QueryOrigin::Ambient),
                None => return,
            },
        };

        let query = UserQuery {
            text: question.clone(),
            timestamp: now,
            confidence,
            origin,
        };
        info!("Query ({:?}): {}", origin, question);
        let decision = self.arbiter.decide(
            self.latest_scene.as_ref(),
            Some(&query),
            &self.state,
            self.state.dialogue_active,
            now,
        );
        if let Decision::Speak(draft) = decision {
            self.propose(draft, Some(question));
        }
    }

    fn acknowledge_wake(&mut self, now: Instant) {
        let ack = Utterance::new(Priority::Query, WAKE_ACK, Emotion::Warm, now).with_origin(QueryOrigin::WakeWord);
        self.submit(ack);
    }

    fn resume_video(&mut self) {
        if !self.video_paused {
            debug!("Orchestrator: resume requested but video is not paused");
        }
        self.video_paused = false;
        let playback = self.services.playback.clone();
        tokio::spawn(async move {
            if let Err(e) = playback.resume().await {
                warn!("Playback: resume failed: {}", e);
            }
        });
    }

    fn report_failure(&self, service: &str, error: &ServiceError) {
        match error {
            ServiceError::MalformedResponse { .. } => warn!("{}: {}, skipping this cycle", service, error),
            ServiceError::Authentication { .. } => error!("{}: {}", service, error),
            _ => warn!("{}: {}, holding", service, error),
        }
        self.services.dashboard.publish(DashboardEvent::ServiceFailure {
            service: service.to_string(),
            error: error.to_string(),
        });
    }

    fn settle_mode(&mut self) {
        let safety_pending = self.coordinator.speaking().map_or(false, |u| u.priority == Priority::Safety)
            || self.coordinator.queued().any(|u| u.priority == Priority::Safety);
        let next = if safety_pending {
            CompanionState::SafetyOverride
        } else if self.coordinator.currently_speaking() {
            CompanionState::Speaking
        } else if self.analysis_in_flight.is_some() || self.refinements_in_flight > 0 {
            CompanionState::Analyzing
        } else {
            CompanionState::Idle
        };
        if next != self.state.mode {
            info!("State: {} -> {}", self.state.mode, next);
            self.services.dashboard.publish(DashboardEvent::StateChanged {
                from: self.state.mode,
                to: next,
            });
            self.state.mode = next;
        }
    }

    fn snapshot(&self, now: Instant) -> StatusSnapshot {
        StatusSnapshot {
            mode: self.state.mode,
            listening: self.state.listening,
            dialogue_active: self.state.dialogue_active,
            speaking: self.coordinator.speaking().map(|u| u.text.clone()),
            queued: self.coordinator.queued_len(),
            wake_window_open: self.coordinator.wake_word_detected(now),
            video_paused: self.video_paused,
            last_scene: self.memory.last_scene().map(str::to_string),
            scenes_analyzed: self.scenes_analyzed,
            utterances_delivered: self.utterances_delivered,
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
        }
    }

    async fn finish(mut self) {
        info!("Orchestrator: shutting down");
        if let Some((_, handle)) = self.playing.take() {
            handle.abort();
        }
        self.coordinator.clear_queue();

        if self.video_paused {
            if let Err(e) = self.services.playback.resume().await {
                warn!("Playback: resume failed: {}", e);
            }
        }

        if self.settings.greeting_enabled {
            let speech = self.services.speech.clone();
            let farewell = async {
                match speech.synthesize(FAREWELL, Emotion::Warm).await {
                    Ok(audio) => speech.play(&audio).await,
                    Err(e) => Err(e),
                }
            };
            match timeout(FAREWELL_LIMIT, farewell).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Farewell failed: {}", e),
                Err(_) => warn!("Farewell timed out"),
            }
        }
        info!("Orchestrator: stopped");
    }
}

fn normalize(text: &str) -> String {
    deunicode(text)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    !phrase.is_empty() && format!(" {} ", normalized).contains(&format!(" {} ", phrase))
}

/// If `text` mentions the wake phrase, return what was said after it (or around it).
fn strip_wake_phrase(text: &str, phrase: &str) -> Option<String> {
    let normalized = normalize(text);
    if !contains_phrase(&normalized, phrase) {
        return None;
    }
    let padded = format!(" {} ", normalized);
    let needle = format!(" {} ", phrase);
    let at = padded.find(&needle)?;
    let before = padded[..at].trim();
    let after = padded[at + needle.len()..].trim();
    let rest = match (before.is_empty(), after.is_empty()) {
        (_, false) => after.to_string(),
        (false, true) => before.to_string(),
        (true, true) => String::new(),
    };
    // Greetings around the name are not questions.
    let filler = ["hey", "hi", "hello", "ok", "okay"];
    if filler.contains(&rest.as_str()) {
        return Some(String::new());
    }
    Some(rest)
}
