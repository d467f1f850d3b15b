//! Session lifecycle states and the status notifications derived from them

use std::fmt;
use std::sync::Arc;

/// Lifecycle of one outbound session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    AwaitingAnswer,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    /// A session in this state holds (or is acquiring) a peer connection.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::AwaitingAnswer | SessionState::Connected
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Closed) => self != Closed,
            (Idle | Failed | Closed, Starting) => true,
            (Starting, AwaitingAnswer) => true,
            (AwaitingAnswer, Connected) => true,
            (Starting | AwaitingAnswer | Connected, Failed) => true,
            _ => false,
        }
    }

    pub fn status(self) -> SessionStatus {
        match self {
            SessionState::Idle => SessionStatus::Stopped,
            SessionState::Starting => SessionStatus::Starting,
            SessionState::AwaitingAnswer => SessionStatus::Connecting,
            SessionState::Connected => SessionStatus::Connected,
            SessionState::Failed => SessionStatus::Failed,
            SessionState::Closed => SessionStatus::Closed,
        }
    }
}

/// User-facing status reported to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Stopped,
    Starting,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionStatus::Stopped => "Detection: Stopped",
            SessionStatus::Starting => "Detection: Starting...",
            SessionStatus::Connecting => "Detection: Connecting...",
            SessionStatus::Connected => "Detection: Connected",
            SessionStatus::Failed => "Detection: Failed",
            SessionStatus::Closed => "Detection: Closed",
        };
        f.write_str(text)
    }
}

/// Non-blocking status notification sink
pub type StatusSink = Arc<dyn Fn(SessionStatus) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::SessionState::*;

    #[test]
    fn happy_path_is_allowed() {
        assert!(Idle.can_transition_to(Starting));
        assert!(Starting.can_transition_to(AwaitingAnswer));
        assert!(AwaitingAnswer.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closed));
    }

    #[test]
    fn terminal_states_do_not_regress() {
        assert!(!Closed.can_transition_to(Failed));
        assert!(!Closed.can_transition_to(Closed));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Idle.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(AwaitingAnswer));
    }

    #[test]
    fn close_is_reachable_from_anywhere_else() {
        for state in [Idle, Starting, AwaitingAnswer, Connected, Failed] {
            assert!(state.can_transition_to(Closed), "{:?}", state);
        }
    }

    #[test]
    fn restart_after_terminal() {
        assert!(Failed.can_transition_to(Starting));
        assert!(Closed.can_transition_to(Starting));
        assert!(!Connected.can_transition_to(Starting));
    }
}
