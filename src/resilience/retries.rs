//! Log-storm suppression for self-healing retry loops.
//!
//! # Responsibilities
//! - Let the first occurrence of a failure through
//! - Suppress identical repeats until the failure changes or the loop recovers

/// Remembers the last failure a retry loop reported.
#[derive(Debug, Default)]
pub struct ErrorLogGate {
    last: Option<String>,
}

impl ErrorLogGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `message` differs from the last reported failure.
    pub fn should_log(&mut self, message: &str) -> bool {
        if self.last.as_deref() == Some(message) {
            return false;
        }
        self.last = Some(message.to_string());
        true
    }

    /// Forget the last failure (called after a success).
    pub fn reset(&mut self) {
        self.last = None;
    }
}
