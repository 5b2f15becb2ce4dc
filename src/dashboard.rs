//! Fire-and-forget status events for whatever UI is watching.
//!
//! `ActivityLog` keeps a small JSON document up to date on disk (last 50 log lines, the current
//! scene, mood, last thing said and the intervention count). Writes happen on a background task;
//! `publish` never waits.

use crate::types::{CompanionState, Emotion, Priority, Severity};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LOG_ENTRIES: usize = 50;
const QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    StateChanged { from: CompanionState, to: CompanionState },
    Scene { caption: String, emotion: Emotion },
    Utterance { priority: Priority, text: String, emotion: Emotion },
    Safety { term: String, severity: Severity },
    Heard { text: String },
    ServiceFailure { service: String, error: String },
}

pub trait DashboardSink: Send + Sync {
    fn publish(&self, event: DashboardEvent);
}

/// Emits events as debug-level log records.
pub struct TracingSink;

impl DashboardSink for TracingSink {
    fn publish(&self, event: DashboardEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => debug!(target: "cinemate::dashboard", "{}", json),
            Err(e) => warn!("Dashboard: could not encode event: {}", e),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub time: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityDocument {
    pub logs: VecDeque<LogEntry>,
    pub scene: String,
    pub mood: String,
    pub thought: String,
    pub interventions: u64,
}

impl Default for ActivityDocument {
    fn default() -> Self {
        Self {
            logs: VecDeque::new(),
            scene: String::new(),
            mood: Emotion::Calm.mood().to_string(),
            thought: String::new(),
            interventions: 0,
        }
    }
}

impl ActivityDocument {
    fn apply(&mut self, event: DashboardEvent, time: String) {
        let (kind, message) = match event {
            DashboardEvent::StateChanged { from, to } => ("STATE", format!("{} -> {}", from, to)),
            DashboardEvent::Scene { caption, emotion } => {
                self.scene = caption.clone();
                self.mood = emotion.mood().to_string();
                ("VISION", caption)
            }
            DashboardEvent::Utterance { priority, text, emotion } => {
                self.thought = text.clone();
                self.mood = emotion.mood().to_string();
                self.interventions += 1;
                let kind = if priority == Priority::Safety { "SAFETY" } else { "ACTION" };
                (kind, text)
            }
            DashboardEvent::Safety { term, severity } => {
                ("DISTRESS", format!("'{}' ({:?})", term, severity))
            }
            DashboardEvent::Heard { text } => ("AUDIO", text),
            DashboardEvent::ServiceFailure { service, error } => ("ERROR", format!("{}: {}", service, error)),
        };

        if self.logs.len() >= LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            time,
            kind: kind.to_string(),
            message,
        });
    }
}

pub struct ActivityLog {
    tx: mpsc::Sender<DashboardEvent>,
}

impl ActivityLog {
    /// Start the writer task. It exits once every `ActivityLog` handle is dropped.
    pub fn spawn(path: PathBuf) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<DashboardEvent>(QUEUE_DEPTH);
        let handle = tokio::spawn(async move {
            info!("Dashboard: writing activity log to {}", path.display());
            let mut document = ActivityDocument::default();
            while let Some(event) = rx.recv().await {
                document.apply(event, chrono::Local::now().format("%H:%M:%S").to_string());
                // Collapse bursts into a single write.
                while let Ok(event) = rx.try_recv() {
                    document.apply(event, chrono::Local::now().format("%H:%M:%S").to_string());
                }
                if let Err(e) = write_document(&path, &document).await {
                    warn!("Dashboard: failed to write {}: {}", path.display(), e);
                }
            }
            debug!("Dashboard: activity log writer stopped");
        });
        (Self { tx }, handle)
    }
}

impl DashboardSink for ActivityLog {
    fn publish(&self, event: DashboardEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!("Dashboard: dropping event ({})", e);
        }
    }
}

async fn write_document(path: &PathBuf, document: &ActivityDocument) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(document)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_keeps_last_entries_and_counts_interventions() {
        let mut doc = ActivityDocument::default();
        for i in 0..60 {
            doc.apply(
                DashboardEvent::Heard {
                    text: format!("line {}", i),
                },
                "12:00:00".into(),
            );
        }
        doc.apply(
            DashboardEvent::Utterance {
                priority: Priority::Autonomous,
                text: "What a view.".into(),
                emotion: Emotion::Cheerful,
            },
            "12:00:01".into(),
        );
        assert_eq!(doc.logs.len(), LOG_ENTRIES);
        assert_eq!(doc.logs.front().map(|e| e.message.as_str()), Some("line 11"));
        assert_eq!(doc.interventions, 1);
        assert_eq!(doc.thought, "What a view.");
        assert_eq!(doc.mood, "Happy");
    }

    #[tokio::test]
    async fn activity_log_writes_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity_log.json");
        let (log, writer) = ActivityLog::spawn(path.clone());

        log.publish(DashboardEvent::Scene {
            caption: "a lighthouse at dusk".into(),
            emotion: Emotion::Calm,
        });
        log.publish(DashboardEvent::Safety {
            term: "scared".into(),
            severity: Severity::Moderate,
        });
        drop(log);
        writer.await.unwrap();

        let doc: ActivityDocument = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc.scene, "a lighthouse at dusk");
        assert_eq!(doc.logs.len(), 2);
        assert_eq!(doc.logs[1].kind, "DISTRESS");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(DashboardEvent::Heard { text: "hi".into() }).unwrap();
        assert_eq!(json["type"], "heard");
    }
}
