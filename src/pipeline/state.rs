//! Message state machine.
//!
//! `Pending → Processing → {Sent, Failed}`, `Failed → Processing`, and
//! `Processing → Processing` for messages left mid-attempt by an interrupted
//! process. `Sent` is terminal.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::PipelineError;
use crate::model::{Message, MessageState};

impl MessageState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: MessageState) -> bool {
        use MessageState::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Processing) |
            // From Processing (re-entry recovers an interrupted attempt)
            (Processing, Processing) | (Processing, Sent) | (Processing, Failed) |
            // From Failed (retry)
            (Failed, Processing)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

fn transition(message: &mut Message, to: MessageState) -> Result<(), PipelineError> {
    if !message.message_state.can_transition_to(to) {
        return Err(PipelineError::InvalidTransition {
            key: message.message_key.clone(),
            from: message.message_state,
            to,
        });
    }
    message.message_state = to;
    Ok(())
}

/// Enter `Processing` in memory. The dispatcher persists only the outcome.
pub fn begin_attempt(message: &mut Message) -> Result<(), PipelineError> {
    if message.id.is_none() {
        return Err(PipelineError::Unsaved(message.message_key.clone()));
    }
    if message.is_disabled {
        return Err(PipelineError::Disabled {
            key: message.message_key.clone(),
        });
    }
    transition(message, MessageState::Processing)
}

/// A provider accepted the message.
pub fn record_sent(message: &mut Message) -> Result<(), PipelineError> {
    transition(message, MessageState::Sent)
}

/// No provider accepted the message. Increments `error_count`.
pub fn record_failed(message: &mut Message) -> Result<(), PipelineError> {
    transition(message, MessageState::Failed)?;
    message.error_count = message.error_count.saturating_add(1);
    Ok(())
}

pub fn is_retry_eligible(message: &Message, max_error_count: u32) -> bool {
    !message.is_disabled
        && message.message_state == MessageState::Failed
        && message.error_count < max_error_count
}

/// Archive bound passed, or the message outlived `max_days_to_live`.
pub fn is_archive_eligible(message: &Message, max_days_to_live: u32, now: DateTime<Utc>) -> bool {
    if message.is_disabled {
        return false;
    }
    let expires = message.created_on_utc + ChronoDuration::days(i64::from(max_days_to_live));
    message.archive_after_utc <= now || expires <= now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageContent, TextContent};

    fn saved() -> Message {
        let mut msg = Message::new(
            "k",
            MessageContent::Text(TextContent {
                from: "a".into(),
                to: "b".into(),
                body: "c".into(),
            }),
        );
        msg.id = Some(1);
        msg.archive_after_utc = Utc::now() + ChronoDuration::days(30);
        msg
    }

    #[test]
    fn transition_table() {
        use MessageState::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Sent));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Processing));
        assert!(Failed.can_transition_to(Processing));

        assert!(!Pending.can_transition_to(Sent));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Sent));
        for target in [Pending, Processing, Sent, Failed] {
            assert!(!Sent.can_transition_to(target));
        }
        assert!(Sent.is_terminal());
        assert!(!Failed.is_terminal());
    }

    #[test]
    fn successful_attempt() {
        let mut msg = saved();
        begin_attempt(&mut msg).unwrap();
        assert_eq!(msg.message_state, MessageState::Processing);
        record_sent(&mut msg).unwrap();
        assert_eq!(msg.message_state, MessageState::Sent);
        assert_eq!(msg.error_count, 0);
    }

    #[test]
    fn failed_attempt_counts_and_can_retry() {
        let mut msg = saved();
        begin_attempt(&mut msg).unwrap();
        record_failed(&mut msg).unwrap();
        assert_eq!(msg.error_count, 1);
        assert!(is_retry_eligible(&msg, 3));

        begin_attempt(&mut msg).unwrap();
        record_failed(&mut msg).unwrap();
        begin_attempt(&mut msg).unwrap();
        record_failed(&mut msg).unwrap();
        assert_eq!(msg.error_count, 3);
        assert!(!is_retry_eligible(&msg, 3));
    }

    #[test]
    fn sent_cannot_restart() {
        let mut msg = saved();
        msg.message_state = MessageState::Sent;
        let err = begin_attempt(&mut msg).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: MessageState::Sent,
                to: MessageState::Processing,
                ..
            }
        ));
    }

    #[test]
    fn outcome_requires_processing() {
        let mut msg = saved();
        assert!(record_sent(&mut msg).is_err());
        assert!(record_failed(&mut msg).is_err());
        assert_eq!(msg.error_count, 0);
    }

    #[test]
    fn disabled_and_unsaved_are_refused() {
        let mut msg = saved();
        msg.is_disabled = true;
        assert!(matches!(
            begin_attempt(&mut msg),
            Err(PipelineError::Disabled { .. })
        ));

        let mut msg = saved();
        msg.id = None;
        assert!(matches!(
            begin_attempt(&mut msg),
            Err(PipelineError::Unsaved(_))
        ));
    }

    #[test]
    fn archive_eligibility() {
        let now = Utc::now();
        let mut msg = saved();
        assert!(!is_archive_eligible(&msg, 7, now));

        msg.created_on_utc = now - ChronoDuration::days(8);
        assert!(is_archive_eligible(&msg, 7, now));

        let mut msg = saved();
        msg.archive_after_utc = now - ChronoDuration::seconds(1);
        assert!(is_archive_eligible(&msg, 7, now));

        msg.is_disabled = true;
        assert!(!is_archive_eligible(&msg, 7, now));
    }
}
