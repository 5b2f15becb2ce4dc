use cinemate::config_loader::WakeWordScope;
use cinemate::coordinator::{CoordinatorConfig, Disposition, SpeechCoordinator};
use cinemate::types::{Emotion, Priority, Utterance, UtteranceState};
use proptest::prelude::*;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Op {
    Submit(Priority),
    Finish,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => prop_oneof![
            Just(Priority::Autonomous),
            Just(Priority::Query),
            Just(Priority::Safety),
        ]
        .prop_map(Op::Submit),
        2 => Just(Op::Finish),
    ]
}

fn coordinator(safety_interrupts: bool) -> SpeechCoordinator {
    SpeechCoordinator::new(CoordinatorConfig {
        scope: WakeWordScope::Off,
        wake_window: Duration::from_secs(30),
        safety_interrupts,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn turn_taking_invariants_hold(ops in prop::collection::vec(op(), 1..40), interrupts in any::<bool>()) {
        let mut coordinator = coordinator(interrupts);
        let now = Instant::now();

        for op in ops {
            match op {
                Op::Submit(priority) => {
                    let was_speaking = coordinator.speaking().map(|u| u.priority);
                    let utterance = Utterance::new(priority, "line", Emotion::Neutral, now);
                    let id = utterance.id;
                    let submission = coordinator.submit(utterance, now);

                    for dropped in &submission.superseded {
                        prop_assert!(dropped.priority < priority);
                        prop_assert_eq!(dropped.state, UtteranceState::Superseded);
                    }
                    match submission.disposition {
                        Disposition::Busy => prop_assert_eq!(priority, Priority::Autonomous),
                        Disposition::Gated => prop_assert!(false, "nothing is gated with the wake word off"),
                        Disposition::Started(u) => {
                            prop_assert!(was_speaking.is_none());
                            prop_assert_eq!(u.id, id);
                        }
                        Disposition::Interrupted { stopped, started } => {
                            prop_assert!(interrupts);
                            prop_assert_eq!(priority, Priority::Safety);
                            prop_assert!(stopped.priority < Priority::Safety);
                            prop_assert_eq!(stopped.state, UtteranceState::Interrupted);
                            prop_assert_eq!(started.id, id);
                        }
                        Disposition::Queued(queued) => {
                            prop_assert_eq!(queued, id);
                            prop_assert!(priority != Priority::Autonomous);
                        }
                    }
                    // Nothing of lower priority survives in the queue.
                    prop_assert!(coordinator.queued().all(|u| u.priority >= priority || u.id == id));
                }
                Op::Finish => {
                    if let Some(id) = coordinator.speaking().map(|u| u.id) {
                        let completion = coordinator.complete(id, true);
                        prop_assert!(completion.is_some());
                    }
                }
            }

            // Waiting utterances are ordered by priority.
            let queued: Vec<Priority> = coordinator.queued().map(|u| u.priority).collect();
            prop_assert!(queued.windows(2).all(|w| w[0] >= w[1]));
            prop_assert!(queued.iter().all(|p| *p != Priority::Autonomous));
            // A queue only exists behind a speaker.
            prop_assert!(queued.is_empty() || coordinator.currently_speaking());
            prop_assert!(coordinator.queued().all(|u| u.state == UtteranceState::Queued));
            if let Some(speaking) = coordinator.speaking() {
                prop_assert_eq!(speaking.state, UtteranceState::Speaking);
            }
        }
    }

    #[test]
    fn safety_reaches_the_user_before_anything_else(
        before in prop::collection::vec(prop_oneof![Just(Priority::Autonomous), Just(Priority::Query)], 1..8)
    ) {
        let mut coordinator = coordinator(false);
        let now = Instant::now();
        for priority in before {
            coordinator.submit(Utterance::new(priority, "chatter", Emotion::Neutral, now), now);
        }
        let safety = Utterance::new(Priority::Safety, "Are you all right?", Emotion::Empathetic, now);
        let safety_id = safety.id;
        coordinator.submit(safety, now);

        // Whatever was speaking finishes; the safety line is next.
        let speaking = coordinator.speaking().map(|u| u.id);
        if speaking != Some(safety_id) {
            let completion = coordinator.complete(speaking.unwrap(), true).unwrap();
            prop_assert_eq!(completion.next.map(|u| u.id), Some(safety_id));
        }
        prop_assert_eq!(coordinator.queued_len(), 0);
    }
}
