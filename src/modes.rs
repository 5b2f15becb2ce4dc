//! Chooses the collaborators behind the core for each run mode.

use crate::backends::espeak::EspeakSpeech;
use crate::backends::mock::{MockPerception, MockReasoner, MockSpeech, DEMO_TIMELINE};
use crate::backends::ollama::{self, OllamaReasoner, OllamaVision};
use crate::backends::ReasoningService;
use crate::capture::{MicCapture, ScreenCapture, ScriptedAudio, SyntheticFrames};
use crate::config_loader::{RunMode, Settings};
use crate::dashboard::{ActivityLog, DashboardSink, TracingSink};
use crate::error::{CompanionError, ServiceError};
use crate::orchestrator::{Services, Sources};
use crate::playback::{self, PlaybackControl};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// What the user says during a demo session, one line per loud stretch of scripted audio.
const DEMO_LINES: &[&str] = &[
    "Hey CineMate, who is the old man with her?",
    "Is that her grandfather?",
    "This storm is a bit too much for me.",
    "I'm okay, keep watching.",
];

pub struct Assembly {
    pub services: Services,
    pub sources: Sources,
    /// Writer tasks that outlive the orchestrator briefly to flush their output.
    pub background: Vec<JoinHandle<()>>,
}

pub async fn assemble(settings: &Settings) -> Result<Assembly, CompanionError> {
    let mut background = Vec::new();
    let dashboard: Arc<dyn DashboardSink> = if settings.activity_log_path.trim().is_empty() {
        Arc::new(TracingSink)
    } else {
        let (log, writer) = ActivityLog::spawn(PathBuf::from(&settings.activity_log_path));
        background.push(writer);
        Arc::new(log)
    };
    let playback: Arc<dyn PlaybackControl> = Arc::from(playback::from_settings(settings));

    let (services, sources) = match settings.mode {
        RunMode::Demo => {
            let scene_length = DEMO_TIMELINE
                .get(1)
                .map(|(at, _)| Duration::from_secs(*at))
                .unwrap_or(Duration::from_secs(12));
            let services = Services {
                perception: Arc::new(MockPerception::timeline(Instant::now())),
                reasoning: Some(Arc::new(MockReasoner) as Arc<dyn ReasoningService>),
                speech: Arc::new(MockSpeech::with_transcripts(DEMO_LINES.iter().copied())),
                dashboard,
                playback,
            };
            let sources = Sources {
                frames: Box::new(SyntheticFrames::new(scene_length)),
                audio: Some(Box::new(ScriptedAudio::new(
                    vec![(Duration::from_secs(14), false), (Duration::from_secs(2), true)],
                    settings.audio_chunk(),
                ))),
            };
            (services, sources)
        }
        RunMode::Simulated => {
            let services = Services {
                perception: Arc::new(MockPerception::rotating()),
                reasoning: Some(Arc::new(MockReasoner) as Arc<dyn ReasoningService>),
                speech: Arc::new(MockSpeech::new()),
                dashboard,
                playback,
            };
            let sources = Sources {
                frames: Box::new(SyntheticFrames::new(Duration::from_secs(8))),
                audio: Some(Box::new(ScriptedAudio::new(
                    vec![(Duration::from_secs(10), false), (Duration::from_secs(3), true)],
                    settings.audio_chunk(),
                ))),
            };
            (services, sources)
        }
        RunMode::Full => {
            let timeout = settings.service_timeout();
            match ollama::health_check(&settings.ollama_url, timeout).await {
                Ok(()) => {}
                Err(e @ ServiceError::Authentication { .. }) => return Err(e.into()),
                Err(e) => warn!("Ollama not reachable yet ({}); scene analysis will degrade until it is", e),
            }
            let reasoning: Arc<dyn ReasoningService> =
                Arc::new(OllamaReasoner::new(&settings.ollama_url, &settings.ollama_model, timeout)?);
            let services = Services {
                perception: Arc::new(OllamaVision::new(
                    &settings.ollama_url,
                    &settings.ollama_vision_model,
                    timeout,
                )?),
                reasoning: Some(reasoning),
                speech: Arc::new(EspeakSpeech::new(settings)),
                dashboard,
                playback,
            };
            let sources = Sources {
                frames: Box::new(ScreenCapture::new(timeout)),
                audio: Some(Box::new(MicCapture::new(settings.audio_chunk()))),
            };
            (services, sources)
        }
    };

    info!("Assembled {:?} mode", settings.mode);
    Ok(Assembly {
        services,
        sources,
        background,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_mode_needs_no_services() {
        let settings = Settings {
            activity_log_path: String::new(),
            ..Settings::default()
        };
        let assembly = assemble(&settings).await.unwrap();
        assert!(assembly.services.reasoning.is_some());
        assert!(assembly.sources.audio.is_some());
        assert!(assembly.background.is_empty());
    }

    #[tokio::test]
    async fn activity_log_starts_a_writer() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            mode: RunMode::Demo,
            activity_log_path: dir.path().join("activity.json").to_string_lossy().into_owned(),
            ..Settings::default()
        };
        let assembly = assemble(&settings).await.unwrap();
        assert_eq!(assembly.background.len(), 1);
    }

    #[tokio::test]
    async fn rejected_credentials_stop_full_mode() {
        let mut server = mockito::Server::new_async().await;
        let _tags = server.mock("GET", "/api/tags").with_status(401).create_async().await;
        let settings = Settings {
            mode: RunMode::Full,
            ollama_url: server.url(),
            activity_log_path: String::new(),
            ..Settings::default()
        };
        assert!(matches!(
            assemble(&settings).await,
            Err(CompanionError::Authentication { .. })
        ));
    }
}
