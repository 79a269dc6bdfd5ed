//! Commands replicated through the consensus log.
//!
//! A command is a tagged variant per operation so the state machine's
//! apply is a single match. Timestamps for print jobs are stamped by
//! the leader's gateway before replication; nothing downstream reads a
//! clock, which keeps application deterministic across replicas.

use crate::entities::{Filament, FilamentKind, PrintJob, Printer};
use crate::error::DomainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client-supplied printer fields. An empty id asks the allocator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterSpec {
    #[serde(default)]
    pub id: String,
    pub company: String,
    pub model: String,
}

/// Client-supplied filament fields. A zero remaining weight defaults
/// to the total weight at application time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilamentSpec {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FilamentKind,
    pub color: String,
    pub total_weight_in_grams: u32,
    #[serde(default)]
    pub remaining_weight_in_grams: u32,
}

/// Client-supplied print job fields. Status and timestamps are owned
/// by the state machine, not the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintJobSpec {
    #[serde(default)]
    pub id: String,
    pub printer_id: String,
    pub filament_id: String,
    pub filepath: String,
    pub print_weight_in_grams: u32,
}

/// A mutation to be applied to every replica in log order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    CreatePrinter {
        printer: PrinterSpec,
    },
    CreateFilament {
        filament: FilamentSpec,
    },
    CreatePrintJob {
        job: PrintJobSpec,
        submitted_at: DateTime<Utc>,
    },
    /// The status travels verbatim as a string; parsing and transition
    /// validation happen inside the state machine.
    UpdatePrintJob {
        id: String,
        status: String,
        updated_at: DateTime<Utc>,
    },
}

/// Result of applying one command.
///
/// `Rejected` is a first-class outcome: the log entry is applied, the
/// rejection is the command's result on every replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CommandResponse {
    Printer(Printer),
    Filament(Filament),
    PrintJob(PrintJob),
    Rejected(DomainError),
    /// Blank and membership log entries carry no domain effect.
    Noop,
}

impl CommandResponse {
    pub fn rejected(err: DomainError) -> Self {
        CommandResponse::Rejected(err)
    }

    /// Split the response into the success payload or the rejection.
    pub fn into_result(self) -> Result<CommandResponse, DomainError> {
        match self {
            CommandResponse::Rejected(err) => Err(err),
            other => Ok(other),
        }
    }
}
