use async_trait::async_trait;
use cinemate::backends::{
    AudioChunk, PerceptionGateway, ReasoningContext, ReasoningReply, ReasoningService, SpeechService,
    SynthesizedAudio, Transcript,
};
use cinemate::config_loader::{Settings, WakeWordScope};
use cinemate::dashboard::{DashboardEvent, DashboardSink};
use cinemate::error::ServiceError;
use cinemate::orchestrator::{CompanionHandle, Orchestrator, Proposal, Services};
use cinemate::playback::PlaybackControl;
use cinemate::types::{CompanionState, Emotion, Frame, Priority, SceneDescription};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

mockall::mock! {
    pub Vision {}
    #[async_trait]
    impl PerceptionGateway for Vision {
        async fn describe(&self, frame: &Frame) -> Result<SceneDescription, ServiceError>;
    }
}

mockall::mock! {
    pub Reasoner {}
    #[async_trait]
    impl ReasoningService for Reasoner {
        async fn reason(&self, context: &ReasoningContext) -> Result<ReasoningReply, ServiceError>;
    }
}

mockall::mock! {
    pub Player {}
    #[async_trait]
    impl PlaybackControl for Player {
        async fn pause(&self) -> Result<(), ServiceError>;
        async fn resume(&self) -> Result<(), ServiceError>;
    }
}

const CAPTIONS: &[&str] = &[
    "a girl reading a letter by the window",
    "two men arguing in a kitchen",
    "a dog running across a beach",
    "a crowd cheering at a football match",
];

/// Speaks by waiting; remembers what was said and when it started.
struct FakeSpeech {
    line_length: Duration,
    spoken: Mutex<Vec<(Instant, String)>>,
}

impl FakeSpeech {
    fn new(line_length: Duration) -> Self {
        Self {
            line_length,
            spoken: Mutex::new(Vec::new()),
        }
    }

    fn spoken(&self) -> Vec<(Instant, String)> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechService for FakeSpeech {
    async fn synthesize(&self, text: &str, _emotion: Emotion) -> Result<SynthesizedAudio, ServiceError> {
        Ok(SynthesizedAudio {
            wav: Vec::new(),
            duration: self.line_length,
            text: text.to_string(),
        })
    }

    async fn play(&self, audio: &SynthesizedAudio) -> Result<(), ServiceError> {
        self.spoken.lock().unwrap().push((Instant::now(), audio.text.clone()));
        sleep(audio.duration).await;
        Ok(())
    }

    async fn transcribe(&self, _chunk: &AudioChunk) -> Result<Transcript, ServiceError> {
        Ok(Transcript {
            text: String::new(),
            confidence: 0.0,
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<DashboardEvent>>,
}

impl RecordingSink {
    fn utterances(&self) -> Vec<(Priority, String)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                DashboardEvent::Utterance { priority, text, .. } => Some((*priority, text.clone())),
                _ => None,
            })
            .collect()
    }

    fn contains(&self, predicate: impl Fn(&DashboardEvent) -> bool) -> bool {
        self.events.lock().unwrap().iter().any(predicate)
    }
}

impl DashboardSink for RecordingSink {
    fn publish(&self, event: DashboardEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn settings() -> Settings {
    Settings {
        greeting_enabled: false,
        activity_log_path: String::new(),
        wake_word_scope: WakeWordScope::Off,
        ..Settings::default()
    }
}

/// Scenes are picked by the first byte of the frame.
fn scripted_vision() -> MockVision {
    let mut vision = MockVision::new();
    vision.expect_describe().returning(|frame| Ok(describe_scene(frame)));
    vision
}

fn describe_scene(frame: &Frame) -> SceneDescription {
    SceneDescription {
        caption: CAPTIONS[frame.image.first().copied().unwrap_or(0) as usize % CAPTIONS.len()].to_string(),
        objects: Vec::new(),
        people_count: 1,
        confidence: 0.9,
        timestamp: frame.timestamp,
    }
}

/// A vision model that takes its time.
struct SlowVision {
    latency: Duration,
}

#[async_trait]
impl PerceptionGateway for SlowVision {
    async fn describe(&self, frame: &Frame) -> Result<SceneDescription, ServiceError> {
        sleep(self.latency).await;
        Ok(describe_scene(frame))
    }
}

fn quiet_player() -> MockPlayer {
    let mut player = MockPlayer::new();
    player.expect_pause().returning(|| Ok(()));
    player.expect_resume().returning(|| Ok(()));
    player
}

struct Session {
    handle: CompanionHandle,
    speech: Arc<FakeSpeech>,
    dashboard: Arc<RecordingSink>,
    task: JoinHandle<()>,
}

impl Session {
    fn start(
        settings: Settings,
        vision: impl PerceptionGateway + 'static,
        reasoning: Option<Arc<dyn ReasoningService>>,
        player: MockPlayer,
    ) -> Self {
        let speech = Arc::new(FakeSpeech::new(Duration::from_secs(1)));
        let dashboard = Arc::new(RecordingSink::default());
        let services = Services {
            perception: Arc::new(vision),
            reasoning,
            speech: speech.clone(),
            dashboard: dashboard.clone(),
            playback: Arc::new(player),
        };
        let (orchestrator, handle) = Orchestrator::new(&settings, services);
        let task = tokio::spawn(orchestrator.run());
        Self {
            handle,
            speech,
            dashboard,
            task,
        }
    }

    async fn show(&self, scene: u8) {
        assert!(self.handle.propose(Proposal::Keyframe(Frame::new(Instant::now(), vec![scene]))).await);
    }

    async fn hear(&self, text: &str) {
        assert!(
            self.handle
                .propose(Proposal::Heard {
                    text: text.to_string(),
                    confidence: 0.9,
                })
                .await
        );
    }

    async fn stop(self) {
        self.handle.shutdown().await;
        self.task.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn new_scene_gets_a_remark() {
    let session = Session::start(settings(), scripted_vision(), None, quiet_player());
    session.show(0).await;
    sleep(Duration::from_secs(2)).await;

    let spoken = session.speech.spoken();
    assert_eq!(spoken.len(), 1);
    assert!(spoken[0].1.contains("reading a letter"));
    assert_eq!(session.dashboard.utterances()[0].0, Priority::Autonomous);

    let status = session.handle.status().await.unwrap();
    assert_eq!(status.scenes_analyzed, 1);
    assert_eq!(status.utterances_delivered, 1);
    assert_eq!(status.mode, CompanionState::Idle);
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dialogue_on_screen_keeps_the_companion_quiet() {
    let session = Session::start(settings(), scripted_vision(), None, quiet_player());
    session.handle.propose(Proposal::DialogueActivity(true)).await;
    session.show(1).await;
    sleep(Duration::from_secs(5)).await;

    assert!(session.speech.spoken().is_empty());
    assert_eq!(session.handle.status().await.unwrap().scenes_analyzed, 1);

    // Once the dialogue is over a new scene is fair game again.
    session.handle.propose(Proposal::DialogueActivity(false)).await;
    session.show(2).await;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(session.speech.spoken().len(), 1);
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn answering_a_question_does_not_end_the_dialogue() {
    let session = Session::start(settings(), scripted_vision(), None, quiet_player());
    session.handle.propose(Proposal::DialogueActivity(true)).await;
    session.show(0).await;
    sleep(Duration::from_millis(500)).await;
    assert!(session.handle.ask("what is she reading?").await);
    sleep(Duration::from_secs(5)).await;

    // The audio loop never reported quiet, so the characters are still talking.
    assert!(session.handle.status().await.unwrap().dialogue_active);

    // Well past the cooldown, a new scene still gets no commentary over them.
    session.show(2).await;
    sleep(Duration::from_secs(2)).await;
    let said = session.dashboard.utterances();
    assert_eq!(said.len(), 1);
    assert_eq!(said[0].0, Priority::Query);
    assert_eq!(session.handle.status().await.unwrap().scenes_analyzed, 2);
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn the_latest_keyframe_is_the_one_described() {
    let vision = SlowVision {
        latency: Duration::from_millis(2500),
    };
    let session = Session::start(settings(), vision, None, quiet_player());
    session.show(0).await;
    sleep(Duration::from_millis(1200)).await;
    session.show(2).await;
    sleep(Duration::from_secs(5)).await;

    let spoken = session.speech.spoken();
    assert_eq!(spoken.len(), 1);
    assert!(spoken[0].1.contains("dog running"), "stale scene narrated: {}", spoken[0].1);

    let status = session.handle.status().await.unwrap();
    assert_eq!(status.scenes_analyzed, 1);
    assert_eq!(status.last_scene.as_deref(), Some("a dog running across a beach"));
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn autonomous_remarks_respect_the_cooldown() {
    let session = Session::start(settings(), scripted_vision(), None, quiet_player());
    session.show(0).await;
    sleep(Duration::from_secs(2)).await;
    session.show(1).await;
    sleep(Duration::from_secs(3)).await;
    session.show(2).await;
    sleep(Duration::from_secs(2)).await;

    let spoken = session.speech.spoken();
    assert_eq!(spoken.len(), 2, "the remark on scene 1 falls inside the cooldown");
    assert!(spoken[1].0.duration_since(spoken[0].0) >= Duration::from_secs(3));
    assert!(spoken[1].1.contains("dog running"));
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn explicit_question_bypasses_the_cooldown() {
    let session = Session::start(settings(), scripted_vision(), None, quiet_player());
    session.show(0).await;
    sleep(Duration::from_millis(1500)).await;
    assert!(session.handle.ask("what is she reading?").await);
    sleep(Duration::from_secs(2)).await;

    let said = session.dashboard.utterances();
    assert_eq!(said.len(), 2);
    assert_eq!(said[1].0, Priority::Query);
    assert!(said[1].1.contains("reading a letter"));
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn distress_interrupts_commentary_and_pauses_the_video() {
    let pauses = Arc::new(AtomicUsize::new(0));
    let resumes = Arc::new(AtomicUsize::new(0));
    let mut player = MockPlayer::new();
    let p = pauses.clone();
    player.expect_pause().returning(move || {
        p.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let r = resumes.clone();
    player.expect_resume().returning(move || {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let session = Session::start(settings(), scripted_vision(), None, player);
    session.show(3).await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(session.speech.spoken().len(), 1);

    session.hear("please help me").await;
    sleep(Duration::from_millis(100)).await;
    assert!(session.dashboard.contains(|e| matches!(
        e,
        DashboardEvent::StateChanged { to: CompanionState::SafetyOverride, .. }
    )));
    sleep(Duration::from_secs(2)).await;

    let said = session.dashboard.utterances();
    assert_eq!(said.last().map(|(p, _)| *p), Some(Priority::Safety));
    assert_eq!(pauses.load(Ordering::SeqCst), 1);
    assert!(session.handle.status().await.unwrap().video_paused);

    // Saying the same thing again right away does not repeat the comfort message.
    session.hear("help me").await;
    sleep(Duration::from_secs(2)).await;
    let safety_lines = session
        .dashboard
        .utterances()
        .iter()
        .filter(|(p, _)| *p == Priority::Safety)
        .count();
    assert_eq!(safety_lines, 1);

    session.hear("I'm okay now").await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(resumes.load(Ordering::SeqCst), 1);
    assert!(!session.handle.status().await.unwrap().video_paused);
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn ambient_questions_wait_for_the_wake_word() {
    let settings = Settings {
        wake_word_scope: WakeWordScope::Ambient,
        ..settings()
    };
    let session = Session::start(settings, scripted_vision(), None, quiet_player());
    session.handle.propose(Proposal::DialogueActivity(true)).await;
    session.show(1).await;
    sleep(Duration::from_secs(1)).await;

    session.hear("is that his brother?").await;
    sleep(Duration::from_secs(2)).await;
    assert!(session.speech.spoken().is_empty());

    session.hear("CineMate, is that his brother?").await;
    sleep(Duration::from_secs(2)).await;
    let said = session.dashboard.utterances();
    assert_eq!(said.len(), 1);
    assert_eq!(said[0].0, Priority::Query);
    assert!(session.handle.status().await.unwrap().wake_window_open);
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn vision_outage_degrades_to_silence() {
    let mut vision = MockVision::new();
    vision
        .expect_describe()
        .returning(|_| Err(ServiceError::unavailable("vision", "connection refused")));
    let session = Session::start(settings(), vision, None, quiet_player());

    session.show(0).await;
    sleep(Duration::from_secs(5)).await;
    session.show(1).await;
    sleep(Duration::from_secs(5)).await;

    assert!(session.speech.spoken().is_empty());
    assert!(session
        .dashboard
        .contains(|e| matches!(e, DashboardEvent::ServiceFailure { service, .. } if service == "vision")));
    let status = session.handle.status().await.unwrap();
    assert_eq!(status.scenes_analyzed, 0);
    assert_eq!(status.mode, CompanionState::Idle);

    // Questions are still answered.
    session.handle.ask("are you there?").await;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(session.speech.spoken().len(), 1);
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reasoning_shapes_autonomous_remarks() {
    let mut reasoner = MockReasoner::new();
    reasoner.expect_reason().returning(|context| {
        Ok(ReasoningReply {
            speak: context.query.is_some(),
            text: "She has been waiting for that letter for years.".to_string(),
            emotion: Emotion::Warm,
        })
    });
    let session = Session::start(settings(), scripted_vision(), Some(Arc::new(reasoner) as Arc<dyn ReasoningService>), quiet_player());

    // The model decides the scene is not worth a remark.
    session.show(0).await;
    sleep(Duration::from_secs(2)).await;
    assert!(session.speech.spoken().is_empty());

    session.handle.ask("why is she smiling?").await;
    sleep(Duration::from_secs(2)).await;
    let spoken = session.speech.spoken();
    assert_eq!(spoken.len(), 1);
    assert_eq!(spoken[0].1, "She has been waiting for that letter for years.");
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn query_falls_back_to_the_local_draft_when_reasoning_fails() {
    let mut reasoner = MockReasoner::new();
    reasoner
        .expect_reason()
        .returning(|_| Err(ServiceError::malformed("reasoning", "not JSON")));
    let session = Session::start(settings(), scripted_vision(), Some(Arc::new(reasoner) as Arc<dyn ReasoningService>), quiet_player());

    session.show(2).await;
    sleep(Duration::from_secs(2)).await;
    assert!(session.speech.spoken().is_empty(), "autonomous drafts are dropped on failure");

    session.handle.ask("what's happening?").await;
    sleep(Duration::from_secs(2)).await;
    let spoken = session.speech.spoken();
    assert_eq!(spoken.len(), 1);
    assert!(spoken[0].1.contains("dog running"));
    session.stop().await;
}
