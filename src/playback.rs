use crate::config_loader::Settings;
use crate::error::ServiceError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::info;

/// Pause and resume the video being watched.
#[async_trait]
pub trait PlaybackControl: Send + Sync {
    async fn pause(&self) -> Result<(), ServiceError>;
    async fn resume(&self) -> Result<(), ServiceError>;
}

/// Runs user-configured shell commands, e.g. `playerctl pause`.
pub struct CommandPlayback {
    pause_command: String,
    resume_command: String,
    timeout: Duration,
}

impl CommandPlayback {
    pub fn new(pause_command: &str, resume_command: &str, timeout: Duration) -> Self {
        Self {
            pause_command: pause_command.to_string(),
            resume_command: resume_command.to_string(),
            timeout,
        }
    }

    async fn run(&self, command: &str) -> Result<(), ServiceError> {
        if command.trim().is_empty() {
            return Ok(());
        }
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output();
        let output = match timeout(self.timeout, child).await {
            Ok(result) => result.map_err(|e| ServiceError::unavailable("playback", e))?,
            Err(_) => {
                return Err(ServiceError::Timeout {
                    service: "playback".to_string(),
                    after: self.timeout,
                })
            }
        };
        if !output.status.success() {
            return Err(ServiceError::unavailable(
                "playback",
                format!(
                    "'{}' exited with {:?}: {}",
                    command,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PlaybackControl for CommandPlayback {
    async fn pause(&self) -> Result<(), ServiceError> {
        info!("Playback: pausing video");
        self.run(&self.pause_command).await
    }

    async fn resume(&self) -> Result<(), ServiceError> {
        info!("Playback: resuming video");
        self.run(&self.resume_command).await
    }
}

/// Used when no player commands are configured: the request is only logged.
pub struct LoggedPlayback;

#[async_trait]
impl PlaybackControl for LoggedPlayback {
    async fn pause(&self) -> Result<(), ServiceError> {
        info!("Playback: pause requested (no pause_command configured)");
        Ok(())
    }

    async fn resume(&self) -> Result<(), ServiceError> {
        info!("Playback: resume requested (no resume_command configured)");
        Ok(())
    }
}

pub fn from_settings(settings: &Settings) -> Box<dyn PlaybackControl> {
    if settings.pause_command.trim().is_empty() && settings.resume_command.trim().is_empty() {
        Box::new(LoggedPlayback)
    } else {
        Box::new(CommandPlayback::new(
            &settings.pause_command,
            &settings.resume_command,
            settings.service_timeout(),
        ))
    }
}
