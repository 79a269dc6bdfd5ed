//! The replicated store and its accounting helpers.

use crate::entities::{Filament, PrintJob, Printer};
use crate::error::{DomainError, IntegrityError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The entity kinds the id allocator distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Printer,
    Filament,
    PrintJob,
}

impl EntityKind {
    /// Key under which the kind's sequence is stored.
    pub fn key(self) -> &'static str {
        match self {
            EntityKind::Printer => "printer",
            EntityKind::Filament => "filament",
            EntityKind::PrintJob => "printjob",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Printer => "printer",
            EntityKind::Filament => "filament",
            EntityKind::PrintJob => "print job",
        }
    }
}

/// The complete replicated state.
///
/// BTreeMaps keep iteration and serialization order canonical, so two
/// stores with equal contents serialize to identical bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub printers: BTreeMap<String, Printer>,
    pub filaments: BTreeMap<String, Filament>,
    pub print_jobs: BTreeMap<String, PrintJob>,
    pub next_id: BTreeMap<String, u64>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let mut next_id = BTreeMap::new();
        for kind in [EntityKind::Printer, EntityKind::Filament, EntityKind::PrintJob] {
            next_id.insert(kind.key().to_string(), 1);
        }
        Self {
            printers: BTreeMap::new(),
            filaments: BTreeMap::new(),
            print_jobs: BTreeMap::new(),
            next_id,
        }
    }

    /// Return the next id for `kind` as a decimal string and advance
    /// the sequence. Must run under the owning state machine's lock.
    pub fn allocate(&mut self, kind: EntityKind) -> String {
        let seq = self.next_id.entry(kind.key().to_string()).or_insert(1);
        let id = seq.to_string();
        *seq += 1;
        id
    }

    /// Record a client-supplied id so the allocator never re-emits it.
    /// Non-numeric ids cannot collide with allocator output and are
    /// left alone.
    pub fn observe_id(&mut self, kind: EntityKind, id: &str) {
        if let Ok(n) = id.parse::<u64>() {
            let seq = self.next_id.entry(kind.key().to_string()).or_insert(1);
            if n >= *seq {
                *seq = n + 1;
            }
        }
    }

    /// Grams of `filament_id` already reserved by Queued and Running jobs.
    pub fn reserved_weight(&self, filament_id: &str) -> i64 {
        self.print_jobs
            .values()
            .filter(|job| job.filament_id == filament_id && job.status.is_active())
            .map(|job| i64::from(job.print_weight_in_grams))
            .sum()
    }

    /// Check whether a new job of `needed` grams fits the filament's
    /// budget: remaining weight minus what active jobs already reserve.
    pub fn check_filament_budget(
        &self,
        filament_id: &str,
        needed: u32,
    ) -> Result<(), DomainError> {
        let filament = self
            .filaments
            .get(filament_id)
            .ok_or_else(|| DomainError::UnknownFilament(filament_id.to_string()))?;

        let available =
            i64::from(filament.remaining_weight_in_grams) - self.reserved_weight(filament_id);
        if available < i64::from(needed) {
            return Err(DomainError::InsufficientFilament { needed, available });
        }
        Ok(())
    }

    /// Verify the global invariants. Used after snapshot restore, where
    /// a violation means the snapshot cannot be trusted.
    pub fn verify(&self) -> Result<(), IntegrityError> {
        for job in self.print_jobs.values() {
            if !self.printers.contains_key(&job.printer_id) {
                return Err(IntegrityError(format!(
                    "print job {} references missing printer {}",
                    job.id, job.printer_id
                )));
            }
            if !self.filaments.contains_key(&job.filament_id) {
                return Err(IntegrityError(format!(
                    "print job {} references missing filament {}",
                    job.id, job.filament_id
                )));
            }
            if job.print_weight_in_grams == 0 {
                return Err(IntegrityError(format!(
                    "print job {} has zero print weight",
                    job.id
                )));
            }
        }

        for filament in self.filaments.values() {
            if filament.remaining_weight_in_grams > filament.total_weight_in_grams {
                return Err(IntegrityError(format!(
                    "filament {} has remaining {} above total {}",
                    filament.id,
                    filament.remaining_weight_in_grams,
                    filament.total_weight_in_grams
                )));
            }
            let reserved = self.reserved_weight(&filament.id);
            if reserved > i64::from(filament.remaining_weight_in_grams) {
                return Err(IntegrityError(format!(
                    "filament {} has {} grams reserved but only {} remaining",
                    filament.id, reserved, filament.remaining_weight_in_grams
                )));
            }
        }

        for (kind, ids) in [
            (
                EntityKind::Printer,
                self.printers.keys().collect::<Vec<_>>(),
            ),
            (
                EntityKind::Filament,
                self.filaments.keys().collect::<Vec<_>>(),
            ),
            (
                EntityKind::PrintJob,
                self.print_jobs.keys().collect::<Vec<_>>(),
            ),
        ] {
            let next = self.next_id.get(kind.key()).copied().unwrap_or(0);
            if next == 0 {
                return Err(IntegrityError(format!(
                    "missing id sequence for kind {}",
                    kind.key()
                )));
            }
            for id in ids {
                if let Ok(n) = id.parse::<u64>() {
                    if n >= next {
                        return Err(IntegrityError(format!(
                            "{} id {} is not below the next sequence {}",
                            kind.key(),
                            id,
                            next
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{FilamentKind, JobStatus};
    use chrono::DateTime;

    fn epoch() -> chrono::DateTime<chrono::Utc> {
        DateTime::from_timestamp(0, 0).unwrap()
    }

    fn store_with_filament(remaining: u32) -> Store {
        let mut store = Store::new();
        store.printers.insert(
            "1".into(),
            Printer {
                id: "1".into(),
                company: "Prusa".into(),
                model: "MK4".into(),
            },
        );
        store.observe_id(EntityKind::Printer, "1");
        store.filaments.insert(
            "1".into(),
            Filament {
                id: "1".into(),
                kind: FilamentKind::PLA,
                color: "red".into(),
                total_weight_in_grams: 1000,
                remaining_weight_in_grams: remaining,
            },
        );
        store.observe_id(EntityKind::Filament, "1");
        store
    }

    fn job(id: &str, weight: u32, status: JobStatus) -> PrintJob {
        PrintJob {
            id: id.into(),
            printer_id: "1".into(),
            filament_id: "1".into(),
            filepath: "/models/benchy.gcode".into(),
            print_weight_in_grams: weight,
            status,
            created_at: epoch(),
            updated_at: epoch(),
        }
    }

    #[test]
    fn allocator_is_monotonic_per_kind() {
        let mut store = Store::new();
        assert_eq!(store.allocate(EntityKind::Printer), "1");
        assert_eq!(store.allocate(EntityKind::Printer), "2");
        // Other kinds run their own sequence.
        assert_eq!(store.allocate(EntityKind::Filament), "1");
        assert_eq!(store.allocate(EntityKind::PrintJob), "1");
        assert_eq!(store.allocate(EntityKind::Printer), "3");
    }

    #[test]
    fn observe_id_advances_past_client_ids() {
        let mut store = Store::new();
        store.observe_id(EntityKind::Printer, "7");
        assert_eq!(store.allocate(EntityKind::Printer), "8");
        // Non-numeric ids never collide with allocator output.
        store.observe_id(EntityKind::Printer, "ender-3");
        assert_eq!(store.allocate(EntityKind::Printer), "9");
    }

    #[test]
    fn budget_counts_active_jobs_only() {
        let mut store = store_with_filament(100);
        store
            .print_jobs
            .insert("1".into(), job("1", 60, JobStatus::Queued));
        store
            .print_jobs
            .insert("2".into(), job("2", 30, JobStatus::Canceled));

        // 100 remaining, 60 reserved by the queued job; the canceled
        // job's 30 grams are free again.
        assert!(store.check_filament_budget("1", 40).is_ok());
        let err = store.check_filament_budget("1", 50).unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientFilament {
                needed: 50,
                available: 40
            }
        );
    }

    #[test]
    fn budget_rejects_unknown_filament() {
        let store = Store::new();
        assert_eq!(
            store.check_filament_budget("42", 1).unwrap_err(),
            DomainError::UnknownFilament("42".into())
        );
    }

    #[test]
    fn verify_accepts_consistent_store() {
        let mut store = store_with_filament(100);
        store
            .print_jobs
            .insert("1".into(), job("1", 60, JobStatus::Running));
        store.observe_id(EntityKind::PrintJob, "1");
        store.verify().unwrap();
    }

    #[test]
    fn verify_rejects_dangling_reference() {
        let mut store = store_with_filament(100);
        let mut orphan = job("1", 10, JobStatus::Queued);
        orphan.printer_id = "99".into();
        store.print_jobs.insert("1".into(), orphan);
        assert!(store.verify().is_err());
    }

    #[test]
    fn verify_rejects_overreserved_filament() {
        let mut store = store_with_filament(50);
        store
            .print_jobs
            .insert("1".into(), job("1", 60, JobStatus::Queued));
        store.observe_id(EntityKind::PrintJob, "1");
        assert!(store.verify().is_err());
    }

    #[test]
    fn verify_rejects_stale_sequence() {
        let mut store = store_with_filament(100);
        // An id at or above the sequence means the allocator could
        // re-emit it.
        store.next_id.insert("printer".into(), 1);
        assert!(store.verify().is_err());
    }
}
