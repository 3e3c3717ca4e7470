//! Maps free-text engine failure descriptions to an [`ErrorKind`].
//!
//! The engine is not required to emit structured errors, so matching is an
//! ordered substring scan over a fixed phrase table. The first matching phrase
//! wins; a message matching nothing is an [`ErrorKind::InternalError`].

use crate::error::ErrorKind;

/// Ordered phrase table. More specific phrases must precede generic ones
/// ("Dead man's switch" before the network phrases).
const PHRASES: &[(&str, ErrorKind)] = &[
    ("not in a private network range", ErrorKind::InvalidTargetIp),
    ("Invalid target", ErrorKind::InvalidTargetIp),
    ("already running", ErrorKind::TestAlreadyRunning),
    ("Rate limit exceeded", ErrorKind::RateLimitExceeded),
    ("duration too long", ErrorKind::DurationTooLong),
    ("Cooldown period active", ErrorKind::CooldownActive),
    ("resource limit exceeded", ErrorKind::ResourceLimitExceeded),
    ("Dead man's switch", ErrorKind::DeadMansSwitchTriggered),
    ("Network error", ErrorKind::NetworkError),
    ("connection", ErrorKind::NetworkError),
    ("timed out", ErrorKind::NetworkError),
];

/// Classify a failure description.
pub fn classify(message: &str) -> ErrorKind {
    PHRASES
        .iter()
        .find(|(phrase, _)| message.contains(phrase))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::InternalError)
}
