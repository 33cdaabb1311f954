//! Error taxonomy for a scan run. Distinguishes failures that happen before any
//! billable resource exists (recoverable with a hint) from failures that leave
//! resources behind and therefore require cleanup.

use std::fmt;
use std::time::Duration;

/// Errors raised by the scan engines.
#[derive(Debug)]
pub enum ScanError {
    /// Failed before anything billable was created. Carries a remediation hint
    /// shown to the user; the run aborts cleanly with no cleanup needed.
    Precondition { message: String, hint: String },
    /// A create call failed partway; anything already created gets rolled back.
    ResourceCreation(String),
    /// The flow log was created but never reached ACTIVE delivery.
    ActivationTimeout { flow_log_id: String, waited: Duration },
    /// A log query failed or timed out.
    Query(String),
    /// An AWS CLI invocation failed outright.
    Aws { command: String, message: String },
    /// The published address-range document could not be fetched or parsed.
    RangeDocument(String),
    /// The stop signal fired; the orchestrator routes this into cleanup.
    Cancelled,
}

impl ScanError {
    pub fn precondition(message: impl Into<String>, hint: impl Into<String>) -> Self {
        ScanError::Precondition {
            message: message.into(),
            hint: hint.into(),
        }
    }

    /// True for errors that by construction occur before resource creation.
    pub fn is_precondition(&self) -> bool {
        matches!(self, ScanError::Precondition { .. })
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::Precondition { message, .. } => write!(f, "{}", message),
            ScanError::ResourceCreation(msg) => write!(f, "resource creation failed: {}", msg),
            ScanError::ActivationTimeout { flow_log_id, waited } => write!(
                f,
                "flow log {} did not become active within {}s",
                flow_log_id,
                waited.as_secs()
            ),
            ScanError::Query(msg) => write!(f, "log query failed: {}", msg),
            ScanError::Aws { command, message } => {
                write!(f, "aws {} failed: {}", command, message)
            }
            ScanError::RangeDocument(msg) => {
                write!(f, "address-range document unavailable: {}", msg)
            }
            ScanError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for ScanError {}
