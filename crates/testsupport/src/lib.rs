//! Property-based test generators shared across the workspace.
//!
//! Provides strategies for random entity specs and, more importantly,
//! [`arb_script`]: abstract operation sequences that tests lower into
//! concrete command streams against an evolving store. Script
//! operations reference entities by index rather than id, so generated
//! sequences exercise both hits and misses regardless of how many
//! entities the prefix happened to create.

use chrono::{DateTime, Utc};
use domain::{FilamentKind, FilamentSpec, JobStatus, PrinterSpec, PrintJobSpec};
use proptest::prelude::*;

/// A deterministic timestamp for replicated commands in tests.
pub fn fixed_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("valid epoch")
}

/// Strategy for printer specs with allocator-assigned ids.
pub fn arb_printer_spec() -> impl Strategy<Value = PrinterSpec> {
    ("[A-Z][a-z]{2,8}", "[A-Z][a-z0-9 ]{1,8}").prop_map(|(company, model)| PrinterSpec {
        id: String::new(),
        company,
        model,
    })
}

/// Strategy for filament kinds.
pub fn arb_filament_kind() -> impl Strategy<Value = FilamentKind> {
    prop_oneof![
        Just(FilamentKind::PLA),
        Just(FilamentKind::PETG),
        Just(FilamentKind::ABS),
        Just(FilamentKind::TPU),
    ]
}

/// Strategy for filament specs. Remaining weight is left at zero so
/// fresh rolls start full, mirroring how clients create them.
pub fn arb_filament_spec() -> impl Strategy<Value = FilamentSpec> {
    (arb_filament_kind(), "[a-z]{3,8}", 1u32..2000).prop_map(|(kind, color, total)| FilamentSpec {
        id: String::new(),
        kind,
        color,
        total_weight_in_grams: total,
        remaining_weight_in_grams: 0,
    })
}

/// Strategy for job specs missing their references; tests fill
/// `printer_id`/`filament_id` from entities the script already made.
pub fn arb_print_job_spec() -> impl Strategy<Value = PrintJobSpec> {
    ("[a-z]{3,10}", 1u32..500).prop_map(|(name, weight)| PrintJobSpec {
        id: String::new(),
        printer_id: String::new(),
        filament_id: String::new(),
        filepath: format!("/prints/{name}.gcode"),
        print_weight_in_grams: weight,
    })
}

/// Strategy for proposed statuses: usually legal ones, occasionally a
/// string the state machine must reject.
pub fn arb_status_string() -> impl Strategy<Value = String> {
    prop_oneof![
        4 => prop_oneof![
            Just(JobStatus::Running),
            Just(JobStatus::Done),
            Just(JobStatus::Canceled),
            Just(JobStatus::Queued),
        ]
        .prop_map(|s| s.as_str().to_string()),
        1 => "[A-Z][a-z]{3,8}",
    ]
}

/// One abstract operation in a generated command script.
///
/// Entity references are indexes into the set of entities created so
/// far, resolved modulo the live count at execution time.
#[derive(Clone, Debug)]
pub enum ScriptOp {
    CreatePrinter(PrinterSpec),
    CreateFilament(FilamentSpec),
    CreatePrintJob {
        spec: PrintJobSpec,
        printer_ref: usize,
        filament_ref: usize,
    },
    UpdatePrintJob {
        job_ref: usize,
        status: String,
    },
}

fn arb_script_op() -> impl Strategy<Value = ScriptOp> {
    prop_oneof![
        2 => arb_printer_spec().prop_map(ScriptOp::CreatePrinter),
        2 => arb_filament_spec().prop_map(ScriptOp::CreateFilament),
        4 => (arb_print_job_spec(), any::<usize>(), any::<usize>()).prop_map(
            |(spec, printer_ref, filament_ref)| ScriptOp::CreatePrintJob {
                spec,
                printer_ref,
                filament_ref,
            }
        ),
        4 => (any::<usize>(), arb_status_string())
            .prop_map(|(job_ref, status)| ScriptOp::UpdatePrintJob { job_ref, status }),
    ]
}

/// A random operation script of up to `max_len` steps.
pub fn arb_script(max_len: usize) -> impl Strategy<Value = Vec<ScriptOp>> {
    prop::collection::vec(arb_script_op(), 1..=max_len)
}
