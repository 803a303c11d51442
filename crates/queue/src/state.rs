use access_point::AuthorityMessage;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceptionOutcome {
    Accepted,
    Returned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuthorizationOutcome {
    Authorized {
        number: String,
        date: Option<String>,
    },
    NotAuthorized {
        messages: Vec<AuthorityMessage>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Signing { error: String },
    Returned { messages: Vec<AuthorityMessage> },
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Signing { error } => write!(f, "signing failed: {error}"),
            FailureReason::Returned { messages } => {
                write!(f, "returned by the authority")?;
                for m in messages {
                    write!(f, "; {m}")?;
                }
                Ok(())
            }
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Where an invoice stands on its way to the authority.
///
/// Transitions only move forward. `Authorized` (either outcome) and `Failed`
/// are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionState {
    Built,
    Signed,
    Sent,
    Received { outcome: ReceptionOutcome },
    Authorized { outcome: AuthorizationOutcome },
    Failed { reason: FailureReason },
}

impl SubmissionState {
    pub fn name(&self) -> &'static str {
        match self {
            SubmissionState::Built => "built",
            SubmissionState::Signed => "signed",
            SubmissionState::Sent => "sent",
            SubmissionState::Received {
                outcome: ReceptionOutcome::Accepted,
            } => "received.accepted",
            SubmissionState::Received {
                outcome: ReceptionOutcome::Returned,
            } => "received.returned",
            SubmissionState::Authorized {
                outcome: AuthorizationOutcome::Authorized { .. },
            } => "authorized.authorized",
            SubmissionState::Authorized {
                outcome: AuthorizationOutcome::NotAuthorized { .. },
            } => "authorized.not_authorized",
            SubmissionState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionState::Authorized { .. } | SubmissionState::Failed { .. }
        )
    }

    /// True until the document has been handed to the transport.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, SubmissionState::Built | SubmissionState::Signed)
    }

    pub fn can_transition_to(&self, next: &SubmissionState) -> bool {
        use SubmissionState::*;
        match (self, next) {
            (Built, Signed) => true,
            (Built, Failed { reason: FailureReason::Signing { .. } }) => true,
            (Built | Signed, Failed { reason: FailureReason::Cancelled }) => true,
            (Signed, Sent) => true,
            (Sent, Received { .. }) => true,
            (Received { outcome: ReceptionOutcome::Accepted }, Authorized { .. }) => true,
            (
                Received { outcome: ReceptionOutcome::Returned },
                Failed { reason: FailureReason::Returned { .. } },
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionState::Authorized {
                outcome: AuthorizationOutcome::Authorized { number, .. },
            } => write!(f, "{} ({number})", self.name()),
            SubmissionState::Failed { reason } => write!(f, "failed: {reason}"),
            _ => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authorized() -> SubmissionState {
        SubmissionState::Authorized {
            outcome: AuthorizationOutcome::Authorized {
                number: "123".into(),
                date: None,
            },
        }
    }

    #[test]
    fn happy_path_moves_forward() {
        let path = [
            SubmissionState::Built,
            SubmissionState::Signed,
            SubmissionState::Sent,
            SubmissionState::Received { outcome: ReceptionOutcome::Accepted },
            authorized(),
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].can_transition_to(&pair[0]), "{} -> {}", pair[1], pair[0]);
        }
    }

    #[test]
    fn terminal_states_refuse_everything() {
        let cancelled = SubmissionState::Failed { reason: FailureReason::Cancelled };
        let candidates = [
            SubmissionState::Built,
            SubmissionState::Signed,
            SubmissionState::Sent,
            SubmissionState::Received { outcome: ReceptionOutcome::Accepted },
            authorized(),
            cancelled.clone(),
        ];
        for terminal in [authorized(), cancelled] {
            assert!(terminal.is_terminal());
            for next in &candidates {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn cancel_only_before_sending() {
        let cancel = SubmissionState::Failed { reason: FailureReason::Cancelled };
        assert!(SubmissionState::Built.can_transition_to(&cancel));
        assert!(SubmissionState::Signed.can_transition_to(&cancel));
        assert!(!SubmissionState::Sent.can_transition_to(&cancel));
        let received = SubmissionState::Received { outcome: ReceptionOutcome::Accepted };
        assert!(!received.can_transition_to(&cancel));
    }

    #[test]
    fn returned_reception_resolves_to_failure() {
        let returned = SubmissionState::Received { outcome: ReceptionOutcome::Returned };
        assert!(returned.can_transition_to(&SubmissionState::Failed {
            reason: FailureReason::Returned { messages: vec![] }
        }));
        assert!(!returned.can_transition_to(&authorized()));
    }

    #[test]
    fn serialized_form_is_tagged() {
        let json = serde_json::to_string(&authorized()).unwrap();
        assert!(json.contains(r#""state":"authorized""#));
        assert!(json.contains(r#""outcome":"authorized""#));
        let back: SubmissionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, authorized());
    }
}
