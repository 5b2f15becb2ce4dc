//! Distress detection and the comfort response.
//!
//! Safety responses bypass cooldown, dialogue suppression and wake-word gating. After a comfort
//! message has been delivered a refractory period keeps repeated signals of the same or lower
//! severity from flooding the user; a more severe signal still gets through.

use crate::config_loader::Settings;
use crate::types::{DistressEvent, Emotion, Priority, Severity, Utterance};
use deunicode::deunicode;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

lazy_static! {
    static ref ENTRY: Regex = Regex::new(r"^\s*(low|moderate|medium|high)\s*:\s*(.+?)\s*$").unwrap();
    static ref SPACES: Regex = Regex::new(r"\s+").unwrap();
}

struct LexiconEntry {
    term: String,
    severity: Severity,
    word: Regex,
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub lexicon: Vec<(String, Severity)>,
    pub window: Duration,
    pub escalation_count: usize,
    pub refractory: Duration,
}

impl SafetyConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let lexicon = settings
            .distress_lexicon
            .iter()
            .filter_map(|entry| match parse_entry(entry) {
                Some(parsed) => Some(parsed),
                None => {
                    warn!("Safety: ignoring malformed lexicon entry '{}'", entry);
                    None
                }
            })
            .collect();
        Self {
            lexicon,
            window: settings.distress_window(),
            escalation_count: settings.distress_escalation_count,
            refractory: settings.distress_refractory(),
        }
    }
}

/// Parse `tier:term`. A bare term is treated as moderate.
pub fn parse_entry(entry: &str) -> Option<(String, Severity)> {
    if let Some(caps) = ENTRY.captures(entry) {
        let severity = Severity::parse(&caps[1])?;
        return Some((normalize(&caps[2]), severity));
    }
    let term = normalize(entry);
    if term.is_empty() || term.contains(':') {
        return None;
    }
    Some((term, Severity::Moderate))
}

fn normalize(text: &str) -> String {
    SPACES.replace_all(&deunicode(text).to_lowercase(), " ").trim().to_string()
}

pub struct SafetyMonitor {
    entries: Vec<LexiconEntry>,
    window: Duration,
    escalation_count: usize,
    refractory: Duration,
    recent: VecDeque<Instant>,
    refractory_until: Option<Instant>,
    refractory_severity: Option<Severity>,
    /// Severity of a comfort message submitted but not yet delivered.
    in_flight: Option<Severity>,
}

impl SafetyMonitor {
    pub fn new(config: SafetyConfig) -> Self {
        let entries = config
            .lexicon
            .into_iter()
            .filter_map(|(term, severity)| {
                let pattern = format!(r"\b{}\b", regex::escape(&term));
                Regex::new(&pattern).ok().map(|word| LexiconEntry { term, severity, word })
            })
            .collect();
        Self {
            entries,
            window: config.window,
            escalation_count: config.escalation_count.max(1),
            refractory: config.refractory,
            recent: VecDeque::new(),
            refractory_until: None,
            refractory_severity: None,
            in_flight: None,
        }
    }

    /// Look for distress in recognized speech.
    ///
    /// Whole-word matches win over substring matches; among them the most severe term is
    /// reported. Repetition inside the sliding window escalates the tier.
    pub fn scan(&mut self, text: &str, now: Instant) -> Option<DistressEvent> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return None;
        }

        let strict = self
            .entries
            .iter()
            .filter(|e| e.word.is_match(&normalized))
            .max_by_key(|e| (e.severity, e.term.len()));

        let (entry, ambiguous) = match strict {
            Some(e) => (e, false),
            None => {
                let loose = self
                    .entries
                    .iter()
                    .filter(|e| normalized.contains(e.term.as_str()))
                    .max_by_key(|e| (e.severity, e.term.len()))?;
                (loose, true)
            }
        };

        while let Some(front) = self.recent.front() {
            if now.saturating_duration_since(*front) > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        // Repeats already answered by a pending or recent comfort message do not count
        // towards escalation.
        let mut severity = entry.severity;
        if !self.covers(severity, now) {
            self.recent.push_back(now);
            if self.recent.len() >= self.escalation_count {
                severity = severity.escalate();
            }
        }

        if ambiguous {
            warn!("Safety: ambiguous match '{}' in '{}', treating as distress", entry.term, text);
        } else {
            warn!("Safety: distress term '{}' ({:?}) in '{}'", entry.term, severity, text);
        }

        Some(DistressEvent {
            term: entry.term.clone(),
            severity,
            timestamp: now,
            ambiguous,
            text: text.to_string(),
        })
    }

    /// Turn an event into a comfort utterance unless the refractory period (or an undelivered
    /// comfort message) already covers it.
    pub fn respond(&mut self, event: &DistressEvent) -> Option<Utterance> {
        if self.in_flight.map_or(false, |pending| event.severity <= pending) {
            info!("Safety: comfort already on its way, not repeating");
            return None;
        }
        if self.in_refractory(event.timestamp) {
            if self.covers(event.severity, event.timestamp) {
                info!("Safety: within refractory period, suppressing repeat");
                return None;
            }
            info!("Safety: higher severity overrides refractory period");
        }

        self.in_flight = Some(event.severity);
        Some(
            Utterance::new(Priority::Safety, comfort_script(event.severity), Emotion::Empathetic, event.timestamp)
                .with_pause(),
        )
    }

    /// Whether a pending comfort message or the refractory period already answers `severity`.
    fn covers(&self, severity: Severity, now: Instant) -> bool {
        let pending = self.in_flight.map_or(false, |s| severity <= s);
        let refractory = self.in_refractory(now) && self.refractory_severity.map_or(false, |s| severity <= s);
        pending || refractory
    }

    /// Comfort message finished playing: start the refractory period.
    pub fn on_delivered(&mut self, severity: Severity, now: Instant) {
        self.in_flight = None;
        self.recent.clear();
        let still_covered = self.in_refractory(now);
        self.refractory_severity = Some(match self.refractory_severity {
            Some(prev) if still_covered && prev > severity => prev,
            _ => severity,
        });
        let until = now + self.refractory;
        self.refractory_until = Some(match self.refractory_until {
            Some(prev) if prev > until => prev,
            _ => until,
        });
        info!("Safety: refractory period started ({:?})", self.refractory);
    }

    /// Comfort message never made it out; allow the next signal to try again.
    pub fn on_failed(&mut self) {
        self.in_flight = None;
    }

    pub fn in_refractory(&self, now: Instant) -> bool {
        self.refractory_until.map_or(false, |until| now < until)
    }
}

pub fn comfort_script(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "Would you like me to pause for a moment? Just say the word.",
        Severity::Moderate => {
            "I noticed you might be feeling overwhelmed. I've paused the movie. Take all the time you need."
        }
        Severity::High => {
            "I'm right here with you. I've paused the movie. Take a slow breath; we can stop for as long as you like."
        }
    }
}
