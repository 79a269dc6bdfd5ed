//! Replicated entity types.
//!
//! All three kinds are plain value types referenced by string id. They
//! serialize to the JSON shapes served by the HTTP API, so field names
//! here are the wire contract.

use crate::error::DomainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A 3D printer. Immutable after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Printer {
    pub id: String,
    pub company: String,
    pub model: String,
}

/// Material a filament roll is made of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilamentKind {
    PLA,
    PETG,
    ABS,
    TPU,
}

/// A roll of filament. `remaining_weight_in_grams` only decreases, and
/// only as the side effect of a print job reaching [`JobStatus::Done`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filament {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FilamentKind,
    pub color: String,
    pub total_weight_in_grams: u32,
    pub remaining_weight_in_grams: u32,
}

/// Lifecycle state of a print job.
///
/// `Done` and `Canceled` are absorbing: no transition leaves them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Canceled,
}

impl JobStatus {
    /// Whether a job in this status still reserves filament.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// The status-transition predicate. Pure; no I/O.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Canceled) | (Running, Done) | (Running, Canceled)
        )
    }

    /// Parse a status string carried verbatim from the API.
    pub fn parse(s: &str) -> Result<JobStatus, DomainError> {
        match s {
            "Queued" => Ok(JobStatus::Queued),
            "Running" => Ok(JobStatus::Running),
            "Done" => Ok(JobStatus::Done),
            "Canceled" => Ok(JobStatus::Canceled),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
            JobStatus::Done => "Done",
            JobStatus::Canceled => "Canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a proposed status transition, with a descriptive rejection.
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), DomainError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(DomainError::InvalidTransition { from, to })
    }
}

/// A print job tying a printer and a filament roll to a sliced file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: String,
    pub printer_id: String,
    pub filament_id: String,
    pub filepath: String,
    pub print_weight_in_grams: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
