//! Safety gate: configuration validation and start preconditions.
//!
//! Nothing with a real network effect is issued unless the operator has
//! confirmed consent, the configuration passes [`validate`], and
//! [`can_start`] allows it. Consent is checked by the orchestrator itself.

use std::net::Ipv4Addr;

use serde::Serialize;

use crate::error::{ErrorKind, OrchestratorError};
use crate::model::{TestConfiguration, TestStatus};

/// Upper bound on a single test's duration.
pub const MAX_DURATION_SECONDS: i64 = 300;

pub const MSG_TARGET_REQUIRED: &str = "Target IP is required";
pub const MSG_TARGET_NOT_PRIVATE: &str =
    "Target must be in a private network range (10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16)";
pub const MSG_DURATION_RANGE: &str = "Duration must be between 1 and 300 seconds";
pub const MSG_CONSENT_REQUIRED: &str = "Safety confirmation is required before running a test";
pub const MSG_CONSENT_INCOMPLETE: &str = "Every safety acknowledgement must be given";

/// A single reason a configuration is refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Violation {
    TargetRequired,
    TargetNotPrivate,
    DurationOutOfRange,
}

impl Violation {
    pub fn message(&self) -> &'static str {
        match self {
            Violation::TargetRequired => MSG_TARGET_REQUIRED,
            Violation::TargetNotPrivate => MSG_TARGET_NOT_PRIVATE,
            Violation::DurationOutOfRange => MSG_DURATION_RANGE,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Violation::TargetRequired | Violation::TargetNotPrivate => ErrorKind::InvalidTargetIp,
            Violation::DurationOutOfRange => ErrorKind::DurationTooLong,
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Outcome of [`can_start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

/// RFC 1918 check: 10/8, 172.16/12, 192.168/16.
pub fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    a == 10 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168)
}

/// Collect every violation in `config`; never short-circuits.
pub fn validate(config: &TestConfiguration) -> Vec<Violation> {
    let mut violations = Vec::new();
    let target = config.target_ip.trim();

    if target.is_empty() {
        violations.push(Violation::TargetRequired);
    }

    let private = target
        .parse::<Ipv4Addr>()
        .map(|ip| is_private_ipv4(&ip))
        .unwrap_or(false);
    if !private {
        violations.push(Violation::TargetNotPrivate);
    }

    if config.duration_seconds <= 0 || config.duration_seconds > MAX_DURATION_SECONDS {
        violations.push(Violation::DurationOutOfRange);
    }

    violations
}

/// Fold a non-empty violation list into one error. The first violation
/// decides the kind; every message is kept.
pub fn violations_error(violations: &[Violation]) -> Option<OrchestratorError> {
    let first = violations.first()?;
    let message = violations
        .iter()
        .map(Violation::message)
        .collect::<Vec<_>>()
        .join("; ");
    Some(OrchestratorError::new(first.kind(), message))
}

/// A new test may start only from `Idle`.
pub fn can_start(status: TestStatus) -> StartCheck {
    match status {
        TestStatus::Idle => StartCheck {
            allowed: true,
            reason: None,
        },
        TestStatus::Running | TestStatus::Paused => StartCheck {
            allowed: false,
            reason: Some("A test is already running".to_string()),
        },
        TestStatus::Completed | TestStatus::Failed => StartCheck {
            allowed: false,
            reason: Some(format!("Previous test is {status}; reset before starting another")),
        },
    }
}
