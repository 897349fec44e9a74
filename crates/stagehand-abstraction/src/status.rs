//! Execution status taxonomy.
//!
//! Every state instance, activity and child notification reports one of these
//! statuses. Terminal statuses never change once reached.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a state execution, an activity or a delegate result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Instance created, not yet started.
    New,
    /// Waiting for capacity before starting.
    Queued,
    /// Start has been claimed by an executor.
    Starting,
    /// Running, possibly suspended on correlation ids.
    Running,
    /// Waiting for manual intervention.
    Waiting,
    /// Abort requested, not yet finalized.
    Aborting,
    /// Completed successfully.
    Success,
    /// Completed with a failure reported by the work itself.
    Failed,
    /// Completed with an infrastructure or protocol error.
    Error,
    /// Cancelled before completion.
    Aborted,
}

impl ExecutionStatus {
    /// Returns `true` for SUCCESS, FAILED, ERROR and ABORTED.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Error | Self::Aborted)
    }

    /// Returns `true` only for SUCCESS.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Checks if a record in this status may move to `to`.
    ///
    /// # Arguments
    /// * `to` - The target status
    ///
    /// # Returns
    /// Returns `true` if the transition is valid, `false` otherwise.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm represents a distinct transition rule
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            // Terminal statuses are sticky
            (from, _) if from.is_final() => false,
            // Same status is always valid
            (a, b) if *a == b => true,
            // Nothing goes back to New
            (_, Self::New) => false,
            // Aborting may only finish as Aborted (or any terminal on a racing resume)
            (Self::Aborting, to) => to.is_final(),
            // Everything else that is not terminal may progress freely
            _ => true,
        }
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Queued => "QUEUED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Aborting => "ABORTING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "QUEUED" => Ok(Self::Queued),
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "WAITING" => Ok(Self::Waiting),
            "ABORTING" => Ok(Self::Aborting),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "ERROR" => Ok(Self::Error),
            "ABORTED" => Ok(Self::Aborted),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_statuses() {
        assert!(ExecutionStatus::Success.is_final());
        assert!(ExecutionStatus::Failed.is_final());
        assert!(ExecutionStatus::Error.is_final());
        assert!(ExecutionStatus::Aborted.is_final());
        assert!(!ExecutionStatus::Running.is_final());
        assert!(!ExecutionStatus::Queued.is_final());
        assert!(!ExecutionStatus::Aborting.is_final());
    }

    #[test]
    fn test_transitions() {
        assert!(ExecutionStatus::New.can_transition_to(ExecutionStatus::Starting));
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Success));
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Aborting));
        assert!(ExecutionStatus::Aborting.can_transition_to(ExecutionStatus::Aborted));

        // Terminal statuses are sticky
        assert!(!ExecutionStatus::Success.can_transition_to(ExecutionStatus::Aborted));
        assert!(!ExecutionStatus::Aborted.can_transition_to(ExecutionStatus::Aborted));
        assert!(!ExecutionStatus::Failed.can_transition_to(ExecutionStatus::Running));

        assert!(!ExecutionStatus::Running.can_transition_to(ExecutionStatus::New));
        assert!(!ExecutionStatus::Aborting.can_transition_to(ExecutionStatus::Running));
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("success".parse::<ExecutionStatus>(), Ok(ExecutionStatus::Success));
        assert_eq!(" ABORTED ".parse::<ExecutionStatus>(), Ok(ExecutionStatus::Aborted));
        assert!("DONE".parse::<ExecutionStatus>().is_err());
        assert_eq!(ExecutionStatus::Error.to_string(), "ERROR");

        let json = serde_json::to_string(&ExecutionStatus::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }
}
