//! Values surfaced to the embedding client.
//!
//! The core never writes to the terminal. Chat lines and short status strings
//! are delivered over channels; the embedding UI decides how to render them.

use chrono::{DateTime, Utc};

/// A chat line delivered to the external chat sink.
///
/// `channel` is the empty string for mainline chat and the party id for party
/// chat. `id` is the full id of the author, `time` the local receipt time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub time: DateTime<Utc>,
    pub id: String,
    pub channel: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPriority {
    /// Diagnostics: drop reasons, transport noise. Safe to hide.
    Low,
    /// Operator-visible: state transitions the user should see.
    High,
}

/// A short status string delivered to the external status sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub priority: StatusPriority,
    pub text: String,
}

impl Status {
    pub fn low(text: impl Into<String>) -> Self {
        Self {
            priority: StatusPriority::Low,
            text: text.into(),
        }
    }

    pub fn high(text: impl Into<String>) -> Self {
        Self {
            priority: StatusPriority::High,
            text: text.into(),
        }
    }
}

/// Current wall-clock time. Used for ordering tokens compared across peers
/// and for chat timestamps; staleness checks use `std::time::Instant`.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
