//! Throw-or-log handling for recoverable storage failures

use crate::error::StoreResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What to do with a policy-governed failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Propagate to the caller, aborting the current operation
    #[default]
    Throw,
    /// Record the failure and continue as if the operation had no effect
    Log,
}

impl ErrorPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPolicy::Throw => "throw",
            ErrorPolicy::Log => "log",
        }
    }

    /// Apply the policy to the outcome of `operation`.
    ///
    /// Errors that are not policy-governed always propagate. Under `Log` the
    /// in-memory state of the caller is left as it is.
    pub fn apply(&self, operation: &str, result: StoreResult<()>) -> StoreResult<()> {
        match result {
            Err(err) if *self == ErrorPolicy::Log && err.is_policy_governed() => {
                tracing::error!(operation, error = %err, "storage operation failed, continuing");
                crate::metrics::record_suppressed_error(operation);
                Ok(())
            }
            other => other,
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "throw" => Ok(ErrorPolicy::Throw),
            "log" => Ok(ErrorPolicy::Log),
            other => Err(format!("unknown error policy '{}', expected throw or log", other)),
        }
    }
}
