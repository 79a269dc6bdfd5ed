//! Domain error taxonomy.

use crate::entities::JobStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejection of a command during state-machine application.
///
/// These are results, not failures: a rejected command still counts as
/// an applied log entry, and every replica computes the same rejection.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DomainError {
    #[error("printer with id {0} does not exist")]
    UnknownPrinter(String),

    #[error("filament with id {0} does not exist")]
    UnknownFilament(String),

    #[error("print job with id {0} does not exist")]
    UnknownPrintJob(String),

    #[error("{kind} with id {id} already exists")]
    IdInUse { kind: String, id: String },

    #[error("not enough filament: needs {needed} grams but only {available} grams available")]
    InsufficientFilament { needed: u32, available: i64 },

    #[error("print job cannot transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("unknown print job status: {0}")]
    UnknownStatus(String),

    #[error("print weight must be greater than zero")]
    ZeroPrintWeight,

    #[error("remaining weight {remaining} exceeds total weight {total}")]
    RemainingExceedsTotal { remaining: u32, total: u32 },
}

impl DomainError {
    /// Whether the rejection names an entity that was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DomainError::UnknownPrinter(_)
                | DomainError::UnknownFilament(_)
                | DomainError::UnknownPrintJob(_)
        )
    }
}

/// A store that fails its own invariants. Raised when a restored
/// snapshot is internally inconsistent; fatal to the node.
#[derive(Debug, Error)]
#[error("store integrity violated: {0}")]
pub struct IntegrityError(pub String);
