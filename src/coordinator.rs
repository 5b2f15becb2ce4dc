//! Turn-taking gate for speech output.
//!
//! At most one utterance is `Speaking`. Waiting utterances are ordered by priority, then arrival.
//! A submission supersedes every queued utterance of strictly lower priority. A speaking
//! utterance runs to completion unless a Safety submission arrives and interruptions are allowed.

use crate::config_loader::{Settings, WakeWordScope};
use crate::types::{Priority, QueryOrigin, Utterance, UtteranceState};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub scope: WakeWordScope,
    pub wake_window: Duration,
    pub safety_interrupts: bool,
}

impl From<&Settings> for CoordinatorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            scope: settings.wake_word_scope,
            wake_window: settings.wake_window(),
            safety_interrupts: settings.safety_interrupts,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Nothing was speaking; this utterance is now `Speaking`.
    Started(Utterance),
    /// Waiting behind the current speaker.
    Queued(u64),
    /// A Safety utterance cut off the current speaker.
    Interrupted { stopped: Utterance, started: Utterance },
    /// Needs an open wake window first.
    Gated,
    /// Autonomous commentary never waits in line.
    Busy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub disposition: Disposition,
    /// Queued utterances dropped by this submission, already marked `Superseded`.
    pub superseded: Vec<Utterance>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub finished: Utterance,
    /// Promoted from the queue, now `Speaking`.
    pub next: Option<Utterance>,
}

pub struct SpeechCoordinator {
    config: CoordinatorConfig,
    speaking: Option<Utterance>,
    queue: VecDeque<Utterance>,
    wake_until: Option<Instant>,
}

impl SpeechCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            speaking: None,
            queue: VecDeque::new(),
            wake_until: None,
        }
    }

    pub fn submit(&mut self, mut utterance: Utterance, now: Instant) -> Submission {
        if self.is_gated(&utterance, now) {
            debug!("Coordinator: utterance {} waits for the wake word", utterance.id);
            return Submission {
                disposition: Disposition::Gated,
                superseded: Vec::new(),
            };
        }

        if utterance.priority == Priority::Autonomous && (self.speaking.is_some() || !self.queue.is_empty()) {
            debug!("Coordinator: busy, dropping autonomous utterance {}", utterance.id);
            return Submission {
                disposition: Disposition::Busy,
                superseded: Vec::new(),
            };
        }

        let superseded = self.supersede_below(utterance.priority);

        let disposition = match self.speaking.take() {
            None => {
                utterance.state = UtteranceState::Speaking;
                info!("Coordinator: speaking {:?} utterance {}", utterance.priority, utterance.id);
                self.speaking = Some(utterance.clone());
                Disposition::Started(utterance)
            }
            Some(mut current)
                if utterance.priority == Priority::Safety
                    && self.config.safety_interrupts
                    && current.priority < Priority::Safety =>
            {
                current.state = UtteranceState::Interrupted;
                utterance.state = UtteranceState::Speaking;
                info!(
                    "Coordinator: safety utterance {} interrupts {:?} utterance {}",
                    utterance.id, current.priority, current.id
                );
                self.speaking = Some(utterance.clone());
                Disposition::Interrupted {
                    stopped: current,
                    started: utterance,
                }
            }
            Some(current) => {
                self.speaking = Some(current);
                utterance.state = UtteranceState::Queued;
                let id = utterance.id;
                let at = self
                    .queue
                    .iter()
                    .position(|queued| queued.priority < utterance.priority)
                    .unwrap_or(self.queue.len());
                self.queue.insert(at, utterance);
                debug!("Coordinator: queued utterance {} at position {}", id, at);
                Disposition::Queued(id)
            }
        };

        Submission {
            disposition,
            superseded,
        }
    }

    /// The speaking utterance finished (or failed). Ids that are not speaking are ignored.
    pub fn complete(&mut self, id: u64, delivered: bool) -> Option<Completion> {
        if self.speaking.as_ref().map(|u| u.id) != Some(id) {
            debug!("Coordinator: ignoring completion of stale utterance {}", id);
            return None;
        }
        let mut finished = self.speaking.take()?;
        finished.state = if delivered {
            UtteranceState::Delivered
        } else {
            UtteranceState::Interrupted
        };

        let next = self.queue.pop_front().map(|mut u| {
            u.state = UtteranceState::Speaking;
            info!("Coordinator: promoting {:?} utterance {}", u.priority, u.id);
            self.speaking = Some(u.clone());
            u
        });

        Some(Completion { finished, next })
    }

    /// Drop everything queued and mark it superseded, e.g. on shutdown.
    pub fn clear_queue(&mut self) -> Vec<Utterance> {
        self.queue
            .drain(..)
            .map(|mut u| {
                u.state = UtteranceState::Superseded;
                u
            })
            .collect()
    }

    /// Open the wake window.
    pub fn note_wake_word(&mut self, now: Instant) {
        self.wake_until = Some(now + self.config.wake_window);
        info!("Coordinator: wake word heard, listening for {:?}", self.config.wake_window);
    }

    pub fn wake_word_detected(&self, now: Instant) -> bool {
        self.wake_until.map_or(false, |until| now < until)
    }

    pub fn currently_speaking(&self) -> bool {
        self.speaking.is_some()
    }

    pub fn speaking(&self) -> Option<&Utterance> {
        self.speaking.as_ref()
    }

    pub fn queued(&self) -> impl Iterator<Item = &Utterance> {
        self.queue.iter()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    fn is_gated(&self, utterance: &Utterance, now: Instant) -> bool {
        if utterance.priority == Priority::Safety || self.wake_word_detected(now) {
            return false;
        }
        match self.config.scope {
            WakeWordScope::Off => false,
            WakeWordScope::Ambient => utterance.origin == Some(QueryOrigin::Ambient),
            WakeWordScope::All => match utterance.priority {
                Priority::Autonomous => true,
                Priority::Query => utterance.origin != Some(QueryOrigin::Explicit),
                Priority::Safety => false,
            },
        }
    }

    fn supersede_below(&mut self, priority: Priority) -> Vec<Utterance> {
        let mut dropped = Vec::new();
        self.queue.retain(|queued| {
            if queued.priority < priority {
                let mut u = queued.clone();
                u.state = UtteranceState::Superseded;
                dropped.push(u);
                false
            } else {
                true
            }
        });
        for u in &dropped {
            info!("Coordinator: utterance {} superseded by {:?}", u.id, priority);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Emotion;

    fn coordinator(scope: WakeWordScope, interrupts: bool) -> SpeechCoordinator {
        SpeechCoordinator::new(CoordinatorConfig {
            scope,
            wake_window: Duration::from_secs(30),
            safety_interrupts: interrupts,
        })
    }

    fn utterance(priority: Priority) -> Utterance {
        Utterance::new(priority, format!("{:?}", priority), Emotion::Neutral, Instant::now())
    }

    #[test]
    fn first_submission_speaks_immediately() {
        let mut c = coordinator(WakeWordScope::Off, true);
        let s = c.submit(utterance(Priority::Autonomous), Instant::now());
        assert!(matches!(s.disposition, Disposition::Started(ref u) if u.state == UtteranceState::Speaking));
        assert!(c.currently_speaking());
    }

    #[test]
    fn autonomous_is_dropped_when_busy() {
        let mut c = coordinator(WakeWordScope::Off, true);
        let now = Instant::now();
        c.submit(utterance(Priority::Query), now);
        let s = c.submit(utterance(Priority::Autonomous), now);
        assert_eq!(s.disposition, Disposition::Busy);
        assert_eq!(c.queued_len(), 0);
    }

    #[test]
    fn queued_lower_priority_is_superseded() {
        let mut c = coordinator(WakeWordScope::Off, false);
        let now = Instant::now();
        c.submit(utterance(Priority::Autonomous), now);
        let query = utterance(Priority::Query);
        let query_id = query.id;
        assert_eq!(c.submit(query, now).disposition, Disposition::Queued(query_id));

        let s = c.submit(utterance(Priority::Safety), now);
        assert!(matches!(s.disposition, Disposition::Queued(_)));
        assert_eq!(s.superseded.len(), 1);
        assert_eq!(s.superseded[0].id, query_id);
        assert_eq!(s.superseded[0].state, UtteranceState::Superseded);
    }

    #[test]
    fn safety_interrupts_when_allowed() {
        let mut c = coordinator(WakeWordScope::Off, true);
        let now = Instant::now();
        let auto = utterance(Priority::Autonomous);
        let auto_id = auto.id;
        c.submit(auto, now);
        match c.submit(utterance(Priority::Safety), now).disposition {
            Disposition::Interrupted { stopped, started } => {
                assert_eq!(stopped.id, auto_id);
                assert_eq!(stopped.state, UtteranceState::Interrupted);
                assert_eq!(started.priority, Priority::Safety);
            }
            other => panic!("expected interruption, got {:?}", other),
        }
        assert_eq!(c.speaking().map(|u| u.priority), Some(Priority::Safety));
    }

    #[test]
    fn safety_does_not_interrupt_safety() {
        let mut c = coordinator(WakeWordScope::Off, true);
        let now = Instant::now();
        c.submit(utterance(Priority::Safety), now);
        assert!(matches!(
            c.submit(utterance(Priority::Safety), now).disposition,
            Disposition::Queued(_)
        ));
    }

    #[test]
    fn completion_promotes_by_priority_then_arrival() {
        let mut c = coordinator(WakeWordScope::Off, false);
        let now = Instant::now();
        let first = utterance(Priority::Query);
        let first_id = first.id;
        c.submit(first, now);
        let q2 = utterance(Priority::Query);
        let q2_id = q2.id;
        c.submit(q2, now);
        let q3 = utterance(Priority::Query);
        c.submit(q3, now);

        let done = c.complete(first_id, true).unwrap();
        assert_eq!(done.finished.state, UtteranceState::Delivered);
        assert_eq!(done.next.map(|u| u.id), Some(q2_id));
        assert_eq!(c.queued_len(), 1);
    }

    #[test]
    fn stale_completion_is_ignored() {
        let mut c = coordinator(WakeWordScope::Off, true);
        c.submit(utterance(Priority::Query), Instant::now());
        assert!(c.complete(u64::MAX, true).is_none());
        assert!(c.currently_speaking());
    }

    #[test]
    fn ambient_queries_need_the_wake_word() {
        let mut c = coordinator(WakeWordScope::Ambient, true);
        let now = Instant::now();
        let overheard = utterance(Priority::Query).with_origin(QueryOrigin::Ambient);
        assert_eq!(c.submit(overheard, now).disposition, Disposition::Gated);

        let typed = utterance(Priority::Query).with_origin(QueryOrigin::Explicit);
        assert!(matches!(c.submit(typed, now).disposition, Disposition::Started(_)));

        c.note_wake_word(now);
        assert!(c.wake_word_detected(now + Duration::from_secs(29)));
        assert!(!c.wake_word_detected(now + Duration::from_secs(31)));
    }

    #[test]
    fn scope_all_gates_autonomous_but_never_safety() {
        let mut c = coordinator(WakeWordScope::All, true);
        let now = Instant::now();
        assert_eq!(c.submit(utterance(Priority::Autonomous), now).disposition, Disposition::Gated);
        assert!(matches!(
            c.submit(utterance(Priority::Safety), now).disposition,
            Disposition::Started(_)
        ));
    }
}
