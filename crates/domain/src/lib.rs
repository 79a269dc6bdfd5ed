//! Core domain model for the replicated 3D-print workflow store.
//!
//! This crate defines the entities that make up the replicated state
//! (printers, filament rolls, print jobs), the validators that guard
//! mutations (status transitions, filament budget), and the command
//! model that travels through the consensus log. It is deliberately
//! free of any consensus- or transport-level types so the state machine
//! can be driven from synthetic command streams in tests.

pub mod command;
pub mod entities;
pub mod error;
pub mod store;

pub use command::{Command, CommandResponse, FilamentSpec, PrinterSpec, PrintJobSpec};
pub use entities::{Filament, FilamentKind, JobStatus, Printer, PrintJob};
pub use error::{DomainError, IntegrityError};
pub use store::{EntityKind, Store};
