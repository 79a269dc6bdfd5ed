//! The deterministic state machine applied on every replica.
//!
//! [`PrintFsm`] owns the [`Store`] behind a readers/writer lock and is
//! the only component that mutates it. Application is a pure function
//! of the store and the command: no clock, randomness, or host state is
//! consulted, so replicas that apply the same log prefix hold identical
//! stores.
//!
//! The crate knows nothing about the consensus library. The consensus
//! adapter calls [`PrintFsm::apply`] from its apply loop (one entry at
//! a time, per the library's contract) and uses
//! [`PrintFsm::snapshot`] / [`PrintFsm::restore`] for state transfer.

use domain::{
    entities::validate_transition, Command, CommandResponse, DomainError, EntityKind, Filament,
    FilamentSpec, IntegrityError, JobStatus, PrintJob, PrintJobSpec, Printer, PrinterSpec, Store,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Current snapshot schema version. Bump on any change to the store's
/// serialized shape; restore rejects versions it does not understand.
pub const SNAPSHOT_VERSION: u32 = 1;

/// A self-describing, version-tagged carrier for a snapshotted store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedStore {
    pub snapshot_version: u32,
    pub store: Store,
}

/// Failure to restore a snapshot. Always fatal to the node: a replica
/// that cannot trust its snapshot must not serve.
#[derive(Debug, Error)]
pub enum FsmError {
    #[error("unsupported snapshot version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("snapshot decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The replicated state machine.
#[derive(Debug, Default)]
pub struct PrintFsm {
    store: RwLock<Store>,
}

impl PrintFsm {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(Store::new()),
        }
    }

    /// Apply one committed command under the writer lock.
    ///
    /// Rejections come back as [`CommandResponse::Rejected`]; the entry
    /// still counts as applied.
    pub fn apply(&self, cmd: &Command) -> CommandResponse {
        let mut store = self.store.write();
        let response = match cmd {
            Command::CreatePrinter { printer } => Self::apply_create_printer(&mut store, printer),
            Command::CreateFilament { filament } => {
                Self::apply_create_filament(&mut store, filament)
            }
            Command::CreatePrintJob { job, submitted_at } => {
                Self::apply_create_print_job(&mut store, job, *submitted_at)
            }
            Command::UpdatePrintJob {
                id,
                status,
                updated_at,
            } => Self::apply_update_print_job(&mut store, id, status, *updated_at),
        };
        if let CommandResponse::Rejected(err) = &response {
            debug!(%err, "command rejected");
        }
        response
    }

    fn apply_create_printer(store: &mut Store, spec: &PrinterSpec) -> CommandResponse {
        let id = match Self::resolve_id(store, EntityKind::Printer, &spec.id) {
            Ok(id) => id,
            Err(err) => return CommandResponse::Rejected(err),
        };
        let printer = Printer {
            id: id.clone(),
            company: spec.company.clone(),
            model: spec.model.clone(),
        };
        store.printers.insert(id, printer.clone());
        CommandResponse::Printer(printer)
    }

    fn apply_create_filament(store: &mut Store, spec: &FilamentSpec) -> CommandResponse {
        if spec.remaining_weight_in_grams > spec.total_weight_in_grams {
            return CommandResponse::Rejected(DomainError::RemainingExceedsTotal {
                remaining: spec.remaining_weight_in_grams,
                total: spec.total_weight_in_grams,
            });
        }
        let id = match Self::resolve_id(store, EntityKind::Filament, &spec.id) {
            Ok(id) => id,
            Err(err) => return CommandResponse::Rejected(err),
        };
        // A fresh roll starts full.
        let remaining = if spec.remaining_weight_in_grams == 0 {
            spec.total_weight_in_grams
        } else {
            spec.remaining_weight_in_grams
        };
        let filament = Filament {
            id: id.clone(),
            kind: spec.kind,
            color: spec.color.clone(),
            total_weight_in_grams: spec.total_weight_in_grams,
            remaining_weight_in_grams: remaining,
        };
        store.filaments.insert(id, filament.clone());
        CommandResponse::Filament(filament)
    }

    fn apply_create_print_job(
        store: &mut Store,
        spec: &PrintJobSpec,
        submitted_at: chrono::DateTime<chrono::Utc>,
    ) -> CommandResponse {
        if !store.printers.contains_key(&spec.printer_id) {
            return CommandResponse::Rejected(DomainError::UnknownPrinter(
                spec.printer_id.clone(),
            ));
        }
        if !store.filaments.contains_key(&spec.filament_id) {
            return CommandResponse::Rejected(DomainError::UnknownFilament(
                spec.filament_id.clone(),
            ));
        }
        if spec.print_weight_in_grams == 0 {
            return CommandResponse::Rejected(DomainError::ZeroPrintWeight);
        }
        if let Err(err) = store.check_filament_budget(&spec.filament_id, spec.print_weight_in_grams)
        {
            return CommandResponse::Rejected(err);
        }
        let id = match Self::resolve_id(store, EntityKind::PrintJob, &spec.id) {
            Ok(id) => id,
            Err(err) => return CommandResponse::Rejected(err),
        };
        let job = PrintJob {
            id: id.clone(),
            printer_id: spec.printer_id.clone(),
            filament_id: spec.filament_id.clone(),
            filepath: spec.filepath.clone(),
            print_weight_in_grams: spec.print_weight_in_grams,
            status: JobStatus::Queued,
            created_at: submitted_at,
            updated_at: submitted_at,
        };
        store.print_jobs.insert(id, job.clone());
        CommandResponse::PrintJob(job)
    }

    fn apply_update_print_job(
        store: &mut Store,
        id: &str,
        status: &str,
        updated_at: chrono::DateTime<chrono::Utc>,
    ) -> CommandResponse {
        let Some(job) = store.print_jobs.get(id).cloned() else {
            return CommandResponse::Rejected(DomainError::UnknownPrintJob(id.to_string()));
        };
        let next = match JobStatus::parse(status) {
            Ok(next) => next,
            Err(err) => return CommandResponse::Rejected(err),
        };
        if let Err(err) = validate_transition(job.status, next) {
            return CommandResponse::Rejected(err);
        }

        let mut job = job;
        job.status = next;
        job.updated_at = updated_at;

        if next == JobStatus::Done {
            if let Some(filament) = store.filaments.get_mut(&job.filament_id) {
                filament.remaining_weight_in_grams = filament
                    .remaining_weight_in_grams
                    .saturating_sub(job.print_weight_in_grams);
            }
        }

        store.print_jobs.insert(job.id.clone(), job.clone());
        CommandResponse::PrintJob(job)
    }

    /// Resolve a client-supplied or allocator-assigned id.
    fn resolve_id(
        store: &mut Store,
        kind: EntityKind,
        requested: &str,
    ) -> Result<String, DomainError> {
        if requested.is_empty() {
            return Ok(store.allocate(kind));
        }
        let taken = match kind {
            EntityKind::Printer => store.printers.contains_key(requested),
            EntityKind::Filament => store.filaments.contains_key(requested),
            EntityKind::PrintJob => store.print_jobs.contains_key(requested),
        };
        if taken {
            return Err(DomainError::IdInUse {
                kind: kind.name().to_string(),
                id: requested.to_string(),
            });
        }
        store.observe_id(kind, requested);
        Ok(requested.to_string())
    }

    /// Deep-copy the store under a read lock. The lock is released
    /// before the caller serializes or persists the clone.
    pub fn snapshot(&self) -> VersionedStore {
        let store = self.store.read().clone();
        VersionedStore {
            snapshot_version: SNAPSHOT_VERSION,
            store,
        }
    }

    /// Serialize the current store into the snapshot wire form.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.snapshot())
    }

    /// Replace the store with a restored snapshot.
    ///
    /// The payload's version and the store's invariants are verified
    /// before the swap; a failure leaves the current store untouched
    /// and must abort the node.
    pub fn restore(&self, payload: VersionedStore) -> Result<(), FsmError> {
        if payload.snapshot_version != SNAPSHOT_VERSION {
            return Err(FsmError::UnsupportedVersion {
                found: payload.snapshot_version,
                expected: SNAPSHOT_VERSION,
            });
        }
        payload.store.verify()?;
        let mut store = self.store.write();
        *store = payload.store;
        info!(
            printers = store.printers.len(),
            filaments = store.filaments.len(),
            print_jobs = store.print_jobs.len(),
            "store restored from snapshot"
        );
        Ok(())
    }

    /// Decode and restore a snapshot from its wire form.
    pub fn restore_bytes(&self, data: &[u8]) -> Result<(), FsmError> {
        let payload: VersionedStore = serde_json::from_slice(data)?;
        self.restore(payload)
    }

    // Read accessors. Each takes the shared lock for the duration of
    // the copy-out; none holds it across I/O.

    pub fn printers(&self) -> Vec<Printer> {
        self.store.read().printers.values().cloned().collect()
    }

    pub fn printer(&self, id: &str) -> Option<Printer> {
        self.store.read().printers.get(id).cloned()
    }

    pub fn filaments(&self) -> Vec<Filament> {
        self.store.read().filaments.values().cloned().collect()
    }

    pub fn filament(&self, id: &str) -> Option<Filament> {
        self.store.read().filaments.get(id).cloned()
    }

    /// List print jobs, optionally filtered by exact status string.
    pub fn print_jobs(&self, status: Option<&str>) -> Vec<PrintJob> {
        self.store
            .read()
            .print_jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status.as_str() == s))
            .cloned()
            .collect()
    }

    pub fn print_job(&self, id: &str) -> Option<PrintJob> {
        self.store.read().print_jobs.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn at(secs: i64) -> chrono::DateTime<chrono::Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn create_printer(fsm: &PrintFsm) -> Printer {
        let resp = fsm.apply(&Command::CreatePrinter {
            printer: PrinterSpec {
                id: String::new(),
                company: "Creality".into(),
                model: "Ender 3".into(),
            },
        });
        match resp {
            CommandResponse::Printer(p) => p,
            other => panic!("unexpected response: {other:?}"),
        }
    }

    fn create_filament(fsm: &PrintFsm, total: u32) -> Filament {
        let resp = fsm.apply(&Command::CreateFilament {
            filament: FilamentSpec {
                id: String::new(),
                kind: domain::FilamentKind::PLA,
                color: "black".into(),
                total_weight_in_grams: total,
                remaining_weight_in_grams: 0,
            },
        });
        match resp {
            CommandResponse::Filament(f) => f,
            other => panic!("unexpected response: {other:?}"),
        }
    }

    fn create_job(fsm: &PrintFsm, printer: &str, filament: &str, weight: u32) -> CommandResponse {
        fsm.apply(&Command::CreatePrintJob {
            job: PrintJobSpec {
                id: String::new(),
                printer_id: printer.into(),
                filament_id: filament.into(),
                filepath: "/prints/part.gcode".into(),
                print_weight_in_grams: weight,
            },
            submitted_at: at(100),
        })
    }

    fn update_job(fsm: &PrintFsm, id: &str, status: &str) -> CommandResponse {
        fsm.apply(&Command::UpdatePrintJob {
            id: id.into(),
            status: status.into(),
            updated_at: at(200),
        })
    }

    #[test]
    fn create_printer_allocates_sequential_ids() {
        let fsm = PrintFsm::new();
        assert_eq!(create_printer(&fsm).id, "1");
        assert_eq!(create_printer(&fsm).id, "2");
    }

    #[test]
    fn explicit_id_is_kept_and_duplicates_rejected() {
        let fsm = PrintFsm::new();
        let resp = fsm.apply(&Command::CreatePrinter {
            printer: PrinterSpec {
                id: "7".into(),
                company: "Prusa".into(),
                model: "MK4".into(),
            },
        });
        assert!(matches!(resp, CommandResponse::Printer(p) if p.id == "7"));

        let resp = fsm.apply(&Command::CreatePrinter {
            printer: PrinterSpec {
                id: "7".into(),
                company: "Prusa".into(),
                model: "MK4".into(),
            },
        });
        assert!(matches!(
            resp,
            CommandResponse::Rejected(DomainError::IdInUse { .. })
        ));

        // The allocator continues past the observed explicit id.
        assert_eq!(create_printer(&fsm).id, "8");
    }

    #[test]
    fn fresh_filament_starts_full() {
        let fsm = PrintFsm::new();
        let filament = create_filament(&fsm, 1000);
        assert_eq!(filament.remaining_weight_in_grams, 1000);
    }

    #[test]
    fn filament_remaining_above_total_rejected() {
        let fsm = PrintFsm::new();
        let resp = fsm.apply(&Command::CreateFilament {
            filament: FilamentSpec {
                id: String::new(),
                kind: domain::FilamentKind::TPU,
                color: "clear".into(),
                total_weight_in_grams: 100,
                remaining_weight_in_grams: 150,
            },
        });
        assert!(matches!(
            resp,
            CommandResponse::Rejected(DomainError::RemainingExceedsTotal { .. })
        ));
    }

    #[test]
    fn job_requires_existing_printer_and_filament() {
        let fsm = PrintFsm::new();
        assert!(matches!(
            create_job(&fsm, "1", "1", 10),
            CommandResponse::Rejected(DomainError::UnknownPrinter(_))
        ));
        let printer = create_printer(&fsm);
        assert!(matches!(
            create_job(&fsm, &printer.id, "9", 10),
            CommandResponse::Rejected(DomainError::UnknownFilament(_))
        ));
    }

    #[test]
    fn budget_rejection_counts_pending_jobs() {
        let fsm = PrintFsm::new();
        let printer = create_printer(&fsm);
        let filament = create_filament(&fsm, 100);

        let first = create_job(&fsm, &printer.id, &filament.id, 60);
        assert!(matches!(
            first,
            CommandResponse::PrintJob(ref j) if j.status == JobStatus::Queued
        ));

        let second = create_job(&fsm, &printer.id, &filament.id, 50);
        match second {
            CommandResponse::Rejected(err) => assert_eq!(
                err.to_string(),
                "not enough filament: needs 50 grams but only 40 grams available"
            ),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn done_subtracts_filament_weight() {
        let fsm = PrintFsm::new();
        let printer = create_printer(&fsm);
        let filament = create_filament(&fsm, 100);
        let job = match create_job(&fsm, &printer.id, &filament.id, 60) {
            CommandResponse::PrintJob(j) => j,
            other => panic!("unexpected: {other:?}"),
        };

        update_job(&fsm, &job.id, "Running").into_result().unwrap();
        let done = match update_job(&fsm, &job.id, "Done") {
            CommandResponse::PrintJob(j) => j,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.updated_at, at(200));
        assert_eq!(
            fsm.filament(&filament.id).unwrap().remaining_weight_in_grams,
            40
        );

        // Terminal: no further transitions.
        assert!(matches!(
            update_job(&fsm, &job.id, "Canceled"),
            CommandResponse::Rejected(DomainError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn queued_job_cannot_jump_to_done() {
        let fsm = PrintFsm::new();
        let printer = create_printer(&fsm);
        let filament = create_filament(&fsm, 100);
        let job = match create_job(&fsm, &printer.id, &filament.id, 10) {
            CommandResponse::PrintJob(j) => j,
            other => panic!("unexpected: {other:?}"),
        };
        assert!(matches!(
            update_job(&fsm, &job.id, "Done"),
            CommandResponse::Rejected(DomainError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn unknown_status_string_rejected() {
        let fsm = PrintFsm::new();
        let printer = create_printer(&fsm);
        let filament = create_filament(&fsm, 100);
        let job = match create_job(&fsm, &printer.id, &filament.id, 10) {
            CommandResponse::PrintJob(j) => j,
            other => panic!("unexpected: {other:?}"),
        };
        assert!(matches!(
            update_job(&fsm, &job.id, "Paused"),
            CommandResponse::Rejected(DomainError::UnknownStatus(_))
        ));
    }

    #[test]
    fn update_of_missing_job_rejected() {
        let fsm = PrintFsm::new();
        assert!(matches!(
            update_job(&fsm, "42", "Running"),
            CommandResponse::Rejected(DomainError::UnknownPrintJob(_))
        ));
    }

    #[test]
    fn zero_weight_job_rejected() {
        let fsm = PrintFsm::new();
        let printer = create_printer(&fsm);
        let filament = create_filament(&fsm, 100);
        assert!(matches!(
            create_job(&fsm, &printer.id, &filament.id, 0),
            CommandResponse::Rejected(DomainError::ZeroPrintWeight)
        ));
    }

    #[test]
    fn snapshot_restore_preserves_bytes() {
        let fsm = PrintFsm::new();
        let printer = create_printer(&fsm);
        let filament = create_filament(&fsm, 500);
        create_job(&fsm, &printer.id, &filament.id, 200);

        let bytes = fsm.snapshot_bytes().unwrap();
        let fresh = PrintFsm::new();
        fresh.restore_bytes(&bytes).unwrap();
        assert_eq!(fresh.snapshot_bytes().unwrap(), bytes);
    }

    #[test]
    fn restore_rejects_future_version() {
        let fsm = PrintFsm::new();
        let payload = VersionedStore {
            snapshot_version: SNAPSHOT_VERSION + 1,
            store: Store::new(),
        };
        assert!(matches!(
            fsm.restore(payload),
            Err(FsmError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn restore_rejects_inconsistent_store() {
        let fsm = PrintFsm::new();
        let printer = create_printer(&fsm);
        let filament = create_filament(&fsm, 100);
        create_job(&fsm, &printer.id, &filament.id, 50);

        let mut payload = fsm.snapshot();
        payload.store.printers.clear();
        assert!(matches!(fsm.restore(payload), Err(FsmError::Integrity(_))));

        // The failed restore left the original store in place.
        assert_eq!(fsm.printers().len(), 1);
    }

    #[test]
    fn status_filter_is_exact() {
        let fsm = PrintFsm::new();
        let printer = create_printer(&fsm);
        let filament = create_filament(&fsm, 100);
        let job = match create_job(&fsm, &printer.id, &filament.id, 10) {
            CommandResponse::PrintJob(j) => j,
            other => panic!("unexpected: {other:?}"),
        };
        update_job(&fsm, &job.id, "Running").into_result().unwrap();

        assert_eq!(fsm.print_jobs(Some("Running")).len(), 1);
        assert_eq!(fsm.print_jobs(Some("Queued")).len(), 0);
        assert_eq!(fsm.print_jobs(Some("running")).len(), 0);
        assert_eq!(fsm.print_jobs(None).len(), 1);
    }
}
