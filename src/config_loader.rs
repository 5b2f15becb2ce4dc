use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which concrete collaborators back the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Scripted timeline, no external services.
    Demo,
    /// Rotating mock scenes and responses with synthetic frames.
    Simulated,
    /// Ollama, espeak-ng, Wyoming STT, screen and microphone capture.
    Full,
}

/// Which interactions need the wake word before the companion answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeWordScope {
    Off,
    /// Only questions overheard in ambient speech.
    Ambient,
    /// Query and autonomous speech both wait for an open wake window.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub mode: RunMode,
    // Frame sampling
    pub max_analysis_interval_ms: u64,
    pub min_analysis_interval_ms: u64,
    pub similarity_threshold: f32,
    pub frame_interval_ms: u64,
    // Arbitration
    pub autonomous_cooldown_ms: u64,
    pub greeting_enabled: bool,
    // Safety
    pub distress_refractory_ms: u64,
    pub distress_window_ms: u64,
    pub distress_escalation_count: usize,
    /// Entries of the form `tier:term`, e.g. `high:help me`.
    pub distress_lexicon: Vec<String>,
    pub safety_interrupts: bool,
    // Wake word
    pub wake_word_phrase: String,
    pub wake_word_scope: WakeWordScope,
    pub wake_window_ms: u64,
    // Speech
    pub tts_voice_profile: String,
    pub wyoming_host: String,
    pub wyoming_port: u16,
    pub audio_chunk_ms: u64,
    pub loud_threshold_db: f32,
    pub quiet_duration_ms: u64,
    // External calls
    pub service_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub ollama_url: String,
    pub ollama_model: String,
    pub ollama_vision_model: String,
    // Playback control and outer surfaces
    pub pause_command: String,
    pub resume_command: String,
    pub resume_phrases: Vec<String>,
    pub activity_log_path: String,
    pub control_port: u16,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: RunMode::Simulated,
            max_analysis_interval_ms: 5000,
            min_analysis_interval_ms: 1000,
            similarity_threshold: 0.85,
            frame_interval_ms: 500,
            autonomous_cooldown_ms: 3000,
            greeting_enabled: true,
            distress_refractory_ms: 30_000,
            distress_window_ms: 60_000,
            distress_escalation_count: 3,
            distress_lexicon: default_lexicon(),
            safety_interrupts: true,
            wake_word_phrase: "cinemate".to_string(),
            wake_word_scope: WakeWordScope::Ambient,
            wake_window_ms: 30_000,
            tts_voice_profile: "en-us".to_string(),
            wyoming_host: "127.0.0.1".to_string(),
            wyoming_port: 10300,
            audio_chunk_ms: 500,
            loud_threshold_db: 70.0,
            quiet_duration_ms: 500,
            service_timeout_ms: 3000,
            retry_backoff_ms: 500,
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3".to_string(),
            ollama_vision_model: "llava".to_string(),
            pause_command: String::new(),
            resume_command: String::new(),
            resume_phrases: vec![
                "resume".to_string(),
                "keep watching".to_string(),
                "play the movie".to_string(),
                "i'm okay".to_string(),
            ],
            activity_log_path: "activity_log.json".to_string(),
            control_port: 6570,
            log_format: LogFormat::Pretty,
        }
    }
}

fn default_lexicon() -> Vec<String> {
    [
        "high:help",
        "high:help me",
        "high:emergency",
        "high:can't breathe",
        "moderate:scared",
        "moderate:afraid",
        "moderate:too much",
        "moderate:overwhelming",
        "moderate:can't watch",
        "moderate:crying",
        "moderate:upset",
        "low:stop",
        "low:pause",
        "low:don't like",
        "low:turn off",
        "low:feeling bad",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Settings {
    /// Load settings from compiled defaults, `Cinemate.*` in the working directory, the user
    /// config directory, an optional explicit file, and `CINEMATE_*` environment variables,
    /// in that order of precedence (last wins).
    pub fn load(explicit: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::with_name("Cinemate").required(false));

        if let Some(dir) = dirs::config_dir() {
            let user_file = dir.join("cinemate").join("Cinemate");
            builder = builder.add_source(File::with_name(&user_file.to_string_lossy()).required(false));
        }

        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }

        // e.g. CINEMATE_MODE=full, CINEMATE_OLLAMA_URL=http://gpu-box:11434
        builder = builder.add_source(config::Environment::with_prefix("CINEMATE"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(config::ConfigError::Message(format!(
                "Invalid similarity_threshold: {}. Must be between 0.0 and 1.0",
                self.similarity_threshold
            )));
        }
        if self.min_analysis_interval_ms > self.max_analysis_interval_ms {
            return Err(config::ConfigError::Message(format!(
                "min_analysis_interval_ms ({}) exceeds max_analysis_interval_ms ({})",
                self.min_analysis_interval_ms, self.max_analysis_interval_ms
            )));
        }
        if self.max_analysis_interval_ms == 0 || self.frame_interval_ms == 0 || self.audio_chunk_ms == 0 {
            return Err(config::ConfigError::Message(
                "analysis, frame and audio intervals must be greater than 0".to_string(),
            ));
        }
        if self.service_timeout_ms == 0 {
            return Err(config::ConfigError::Message(
                "service_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.distress_escalation_count == 0 {
            return Err(config::ConfigError::Message(
                "distress_escalation_count must be greater than 0".to_string(),
            ));
        }
        if self.wake_word_phrase.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "wake_word_phrase must not be empty".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.loud_threshold_db) {
            return Err(config::ConfigError::Message(format!(
                "Invalid loud_threshold_db: {}. Must be between 0 and 100",
                self.loud_threshold_db
            )));
        }
        Ok(())
    }

    pub fn max_analysis_interval(&self) -> Duration {
        Duration::from_millis(self.max_analysis_interval_ms)
    }

    pub fn min_analysis_interval(&self) -> Duration {
        Duration::from_millis(self.min_analysis_interval_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn autonomous_cooldown(&self) -> Duration {
        Duration::from_millis(self.autonomous_cooldown_ms)
    }

    pub fn distress_refractory(&self) -> Duration {
        Duration::from_millis(self.distress_refractory_ms)
    }

    pub fn distress_window(&self) -> Duration {
        Duration::from_millis(self.distress_window_ms)
    }

    pub fn wake_window(&self) -> Duration {
        Duration::from_millis(self.wake_window_ms)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_millis(self.service_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn audio_chunk(&self) -> Duration {
        Duration::from_millis(self.audio_chunk_ms)
    }

    pub fn quiet_duration(&self) -> Duration {
        Duration::from_millis(self.quiet_duration_ms)
    }
}
