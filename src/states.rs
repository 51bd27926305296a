//! Container and task lifecycle states
//!
//! State indices are wire-stable: they appear verbatim in persisted
//! documents and in callback payloads, so the discriminants must never
//! be reordered.

use serde::{Deserialize, Serialize};

/// Raw state value carried by documents before their first transition.
pub const STATE_NEW: i64 = -1;

/// Lifecycle state shared by tasks, task groups and both container kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum State {
    Created,
    Waiting,
    Processing,
    Success,
    Failed,
    Cancelled,
}

impl State {
    /// Wire index of this state.
    pub fn index(self) -> i64 {
        match self {
            State::Created => 0,
            State::Waiting => 1,
            State::Processing => 2,
            State::Success => 3,
            State::Failed => 4,
            State::Cancelled => 5,
        }
    }

    pub fn from_index(index: i64) -> Option<State> {
        match index {
            0 => Some(State::Created),
            1 => Some(State::Waiting),
            2 => Some(State::Processing),
            3 => Some(State::Success),
            4 => Some(State::Failed),
            5 => Some(State::Cancelled),
            _ => None,
        }
    }

    /// Success, failed and cancelled are terminal: no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Success | State::Failed | State::Cancelled)
    }
}

/// Wire indices of all terminal states.
pub fn end_states() -> [i64; 3] {
    [
        State::Success.index(),
        State::Failed.index(),
        State::Cancelled.index(),
    ]
}

/// Whether a raw document state value is terminal.
pub fn is_end_state(index: i64) -> bool {
    State::from_index(index).map(State::is_terminal).unwrap_or(false)
}

impl From<State> for i64 {
    fn from(state: State) -> i64 {
        state.index()
    }
}

impl TryFrom<i64> for State {
    type Error = String;

    fn try_from(index: i64) -> Result<State, Self::Error> {
        State::from_index(index).ok_or_else(|| format!("invalid state index: {}", index))
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Created => "created",
            State::Waiting => "waiting",
            State::Processing => "processing",
            State::Success => "success",
            State::Failed => "failed",
            State::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// A single recorded state change on a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Unix timestamp (seconds) of the change
    pub timestamp: f64,

    /// New state index
    pub state: i64,

    /// Human-readable reason
    pub description: String,

    /// Captured error chain, if the transition was caused by a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,

    /// Reference to the entity that triggered this transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<serde_json::Value>,
}

impl Transition {
    pub fn new(state: State, description: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            state: state.index(),
            description: description.into(),
            exception: None,
            caused_by: None,
        }
    }

    pub fn with_exception(mut self, exception: Option<String>) -> Self {
        self.exception = exception;
        self
    }

    pub fn with_caused_by(mut self, caused_by: serde_json::Value) -> Self {
        self.caused_by = Some(caused_by);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_wire_stable() {
        assert_eq!(State::Created.index(), 0);
        assert_eq!(State::Waiting.index(), 1);
        assert_eq!(State::Processing.index(), 2);
        assert_eq!(State::Success.index(), 3);
        assert_eq!(State::Failed.index(), 4);
        assert_eq!(State::Cancelled.index(), 5);
    }

    #[test]
    fn test_round_trip() {
        for i in 0..6 {
            let state = State::from_index(i).unwrap();
            assert_eq!(state.index(), i);
        }
        assert!(State::from_index(6).is_none());
        assert!(State::from_index(-1).is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!State::Created.is_terminal());
        assert!(!State::Waiting.is_terminal());
        assert!(!State::Processing.is_terminal());
        assert!(State::Success.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(State::Cancelled.is_terminal());
        assert_eq!(end_states(), [3, 4, 5]);
    }

    #[test]
    fn test_serde_as_integer() {
        let json = serde_json::to_string(&State::Processing).unwrap();
        assert_eq!(json, "2");
        let state: State = serde_json::from_str("4").unwrap();
        assert_eq!(state, State::Failed);
        assert!(serde_json::from_str::<State>("9").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(State::Waiting.to_string(), "waiting");
        assert_eq!(State::Cancelled.to_string(), "cancelled");
    }
}
