//! Gateway handlers.
//!
//! Writes marshal the body into a [`Command`] and submit it through
//! the consensus node; the leader stamps print-job timestamps into the
//! command here, before replication, so application stays
//! deterministic. Reads come straight from the local state machine.

use crate::error::ApiError;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use domain::{
    Command, CommandResponse, Filament, FilamentSpec, PrintJob, PrintJobSpec, Printer, PrinterSpec,
};
use raft::ClusterStatus;
use serde::Deserialize;
use tracing::info;

/// Unwrap a JSON body, turning axum's rejection into a 400.
fn require_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(inner)| inner)
        .map_err(|rejection| ApiError::InvalidRequest(rejection.body_text()))
}

pub async fn create_printer(
    State(state): State<AppState>,
    body: Result<Json<PrinterSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<Printer>), ApiError> {
    let spec = require_body(body)?;
    let response = state
        .node
        .apply(Command::CreatePrinter { printer: spec })
        .await?;
    match response.into_result().map_err(ApiError::Domain)? {
        CommandResponse::Printer(printer) => Ok((StatusCode::CREATED, Json(printer))),
        other => Err(ApiError::Internal(format!(
            "unexpected apply response: {other:?}"
        ))),
    }
}

pub async fn list_printers(State(state): State<AppState>) -> Json<Vec<Printer>> {
    Json(state.node.fsm().printers())
}

pub async fn get_printer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Printer>, ApiError> {
    state
        .node
        .fsm()
        .printer(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("printer with id {id} does not exist")))
}

pub async fn create_filament(
    State(state): State<AppState>,
    body: Result<Json<FilamentSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<Filament>), ApiError> {
    let spec = require_body(body)?;
    let response = state
        .node
        .apply(Command::CreateFilament { filament: spec })
        .await?;
    match response.into_result().map_err(ApiError::Domain)? {
        CommandResponse::Filament(filament) => Ok((StatusCode::CREATED, Json(filament))),
        other => Err(ApiError::Internal(format!(
            "unexpected apply response: {other:?}"
        ))),
    }
}

pub async fn list_filaments(State(state): State<AppState>) -> Json<Vec<Filament>> {
    Json(state.node.fsm().filaments())
}

pub async fn get_filament(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Filament>, ApiError> {
    state
        .node
        .fsm()
        .filament(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("filament with id {id} does not exist")))
}

pub async fn create_print_job(
    State(state): State<AppState>,
    body: Result<Json<PrintJobSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<PrintJob>), ApiError> {
    let spec = require_body(body)?;
    // The leader stamps the submission time; replicas never read a
    // clock during apply.
    let response = state
        .node
        .apply(Command::CreatePrintJob {
            job: spec,
            submitted_at: Utc::now(),
        })
        .await?;
    match response.into_result().map_err(ApiError::Domain)? {
        CommandResponse::PrintJob(job) => Ok((StatusCode::CREATED, Json(job))),
        other => Err(ApiError::Internal(format!(
            "unexpected apply response: {other:?}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub status: Option<String>,
}

pub async fn list_print_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Json<Vec<PrintJob>> {
    Json(state.node.fsm().print_jobs(query.status.as_deref()))
}

pub async fn get_print_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PrintJob>, ApiError> {
    state
        .node
        .fsm()
        .print_job(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("print job with id {id} does not exist")))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub status: Option<String>,
}

pub async fn update_print_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<PrintJob>, ApiError> {
    let status = query
        .status
        .ok_or_else(|| ApiError::InvalidRequest("status query parameter is required".into()))?;

    let response = state
        .node
        .apply(Command::UpdatePrintJob {
            id,
            status,
            updated_at: Utc::now(),
        })
        .await?;
    match response.into_result().map_err(ApiError::Domain)? {
        CommandResponse::PrintJob(job) => Ok(Json(job)),
        other => Err(ApiError::Internal(format!(
            "unexpected apply response: {other:?}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub node_id: u64,
    pub addr: String,
}

pub async fn join_cluster(
    State(state): State<AppState>,
    body: Result<Json<JoinRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req = require_body(body)?;
    info!(node_id = req.node_id, addr = %req.addr, "join requested");
    state.node.add_voter(req.node_id, req.addr).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn cluster_info(State(state): State<AppState>) -> Json<ClusterStatus> {
    Json(state.node.status())
}
