//! Certificate request API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use certflow_core::{
    CertificateRequest, HistoryEntry, QueryError, RawCertificateRequest, RecordFilter, RequestState,
    RevokeError, SubmitError,
};

use crate::state::AppState;

/// Maximum allowed limit for certificate queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for certificate queries
const DEFAULT_LIMIT: i64 = 100;

/// Actor recorded on revocations that do not name one.
const DEFAULT_REVOKED_BY: &str = "anonymous";

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for listing certificate requests
#[derive(Debug, Deserialize)]
pub struct ListCertificatesParams {
    /// Filter by composite state (e.g. `ISSUED`)
    pub state: Option<String>,
    /// Filter by requester
    pub requester: Option<String>,
    /// Maximum number of records to return
    pub limit: Option<i64>,
    /// Pagination offset
    pub offset: Option<i64>,
}

/// Request body for revoking a certificate
#[derive(Debug, Default, Deserialize)]
pub struct RevokeCertificateBody {
    pub revoked_by: Option<String>,
    pub reason: Option<String>,
}

/// Response for an accepted submission
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: String,
}

/// Response for certificate request reads
#[derive(Debug, Serialize)]
pub struct CertificateResponse {
    pub id: String,
    pub requester: String,
    pub subject_name: String,
    pub subject_alt_names: Vec<String>,
    pub ttl_secs: u64,
    pub key_usage: Vec<String>,
    pub state: RequestState,
    pub issuance_status: String,
    pub ticket_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_pem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_ttl_hours: Option<i64>,
    /// Request whose certificate this one replaces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_from: Option<String>,
    /// Request submitted to replace this certificate (single reads only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_to: Option<String>,
    /// Every transition, oldest first.
    pub history: Vec<HistoryEntry>,
    pub created_at: String,
    pub updated_at: String,
}

impl CertificateResponse {
    fn from_record(record: CertificateRequest, now: DateTime<Utc>) -> Self {
        Self {
            serial_number: record.certificate_serial().map(str::to_string),
            certificate_pem: record.certificate_pem().map(str::to_string),
            issued_at: record.issued_at().map(|t| t.to_rfc3339()),
            expires_at: record.expires_at().map(|t| t.to_rfc3339()),
            remaining_ttl_hours: record.remaining_ttl(now).map(|ttl| ttl.num_hours()),
            ticket_id: record.ticket_id().map(str::to_string),
            issuance_status: record.issuance.status_name().to_string(),
            ticket_status: record.ticket.status_name().to_string(),
            rotated_from: record.rotated_from,
            rotated_to: None,
            history: record.history,
            state: record.state,
            key_usage: record
                .requested
                .key_usage
                .iter()
                .map(|usage| usage.as_str().to_string())
                .collect(),
            ttl_secs: record.requested.ttl_secs,
            subject_alt_names: record.requested.subject_alt_names,
            subject_name: record.requested.subject_name,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
            id: record.id,
            requester: record.requester,
        }
    }
}

/// Response for listing certificate requests
#[derive(Debug, Serialize)]
pub struct ListCertificatesResponse {
    pub certificates: Vec<CertificateResponse>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct CertificateErrorResponse {
    pub error: String,
}

/// Validation failure response
#[derive(Debug, Serialize)]
pub struct ValidationErrorResponse {
    pub field: String,
    pub reason: String,
}

fn error_response(
    status: StatusCode,
    error: impl Into<String>,
) -> (StatusCode, Json<CertificateErrorResponse>) {
    (
        status,
        Json(CertificateErrorResponse {
            error: error.into(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit a certificate request
pub async fn submit_certificate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RawCertificateRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), axum::response::Response> {
    match state.orchestrator().submit(body).await {
        Ok(id) => Ok((StatusCode::ACCEPTED, Json(SubmitResponse { id }))),
        Err(SubmitError::Validation(e)) => Err((
            StatusCode::BAD_REQUEST,
            Json(ValidationErrorResponse {
                field: e.field,
                reason: e.reason,
            }),
        )
            .into_response()),
        Err(e) => Err(
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        ),
    }
}

/// Get a certificate request by ID
pub async fn get_certificate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CertificateResponse>, (StatusCode, Json<CertificateErrorResponse>)> {
    let orchestrator = state.orchestrator();
    let record = match orchestrator.get(&id) {
        Ok(record) => record,
        Err(QueryError::NotFound(e)) => {
            return Err(error_response(StatusCode::NOT_FOUND, e.to_string()))
        }
        Err(e) => {
            return Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
            ))
        }
    };

    let rotated_to = orchestrator
        .successor(&id)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let mut response = CertificateResponse::from_record(record, Utc::now());
    response.rotated_to = rotated_to;
    Ok(Json(response))
}

/// List certificate requests with optional filters
pub async fn list_certificates(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListCertificatesParams>,
) -> Result<Json<ListCertificatesResponse>, (StatusCode, Json<CertificateErrorResponse>)> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut base_filter = RecordFilter::new();

    if let Some(ref state_filter) = params.state {
        match state_filter.parse::<RequestState>() {
            Ok(request_state) => base_filter = base_filter.with_state(request_state),
            Err(e) => return Err(error_response(StatusCode::BAD_REQUEST, e)),
        }
    }

    if let Some(ref requester) = params.requester {
        base_filter = base_filter.with_requester(requester);
    }

    let query_filter = base_filter.clone().with_limit(limit).with_offset(offset);

    let orchestrator = state.orchestrator();
    let records = orchestrator
        .list(&query_filter)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let total = orchestrator
        .count(&base_filter)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let now = Utc::now();
    Ok(Json(ListCertificatesResponse {
        certificates: records
            .into_iter()
            .map(|record| CertificateResponse::from_record(record, now))
            .collect(),
        total,
        limit,
        offset,
    }))
}

/// Revoke the certificate issued for a request
pub async fn revoke_certificate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<RevokeCertificateBody>>,
) -> Result<Json<CertificateResponse>, impl IntoResponse> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let revoked_by = body
        .revoked_by
        .unwrap_or_else(|| DEFAULT_REVOKED_BY.to_string());

    match state
        .orchestrator()
        .revoke(&id, &revoked_by, body.reason)
        .await
    {
        Ok(record) => Ok(Json(CertificateResponse::from_record(record, Utc::now()))),
        Err(e @ RevokeError::NotFound(_)) => Err(error_response(StatusCode::NOT_FOUND, e.to_string())),
        Err(e @ RevokeError::NotRevocable { .. }) => {
            Err(error_response(StatusCode::CONFLICT, e.to_string()))
        }
        Err(e @ RevokeError::Backend(_)) => {
            Err(error_response(StatusCode::BAD_GATEWAY, e.to_string()))
        }
        Err(e) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
        )),
    }
}
