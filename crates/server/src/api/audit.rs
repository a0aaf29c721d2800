//! Audit trail query handler.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use certflow_core::{AuditFilter, AuditRecord};

use crate::state::AppState;

const MAX_LIMIT: i64 = 1000;
const DEFAULT_LIMIT: i64 = 100;

/// Query parameters for audit endpoint
#[derive(Debug, Default, Deserialize)]
pub struct AuditQueryParams {
    /// Events about one certificate request
    pub request_id: Option<String>,
    /// Event type, e.g. `certificate_revoked`
    pub event_type: Option<String>,
    /// Acting user (requester or revoker)
    pub user_id: Option<String>,
    /// Lower bound on the event timestamp (ISO 8601)
    pub from: Option<DateTime<Utc>>,
    /// Upper bound on the event timestamp (ISO 8601)
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuditQueryParams {
    /// Filter without pagination, shared by the page query and the total count.
    fn base_filter(&self) -> AuditFilter {
        let mut filter = AuditFilter::new();
        if let Some(ref request_id) = self.request_id {
            filter = filter.with_request_id(request_id);
        }
        if let Some(ref event_type) = self.event_type {
            filter = filter.with_event_type(event_type);
        }
        if let Some(ref user_id) = self.user_id {
            filter = filter.with_user_id(user_id);
        }
        if self.from.is_some() || self.to.is_some() {
            filter = filter.with_time_range(self.from, self.to);
        }
        filter
    }
}

/// Response for audit query endpoint
#[derive(Debug, Serialize)]
pub struct AuditQueryResponse {
    pub events: Vec<AuditRecord>,
    /// Total number of matching events
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct AuditErrorResponse {
    pub error: String,
}

fn storage_error(
    context: &str,
    err: impl std::fmt::Display,
) -> (StatusCode, Json<AuditErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(AuditErrorResponse {
            error: format!("{}: {}", context, err),
        }),
    )
}

/// Query audit events
pub async fn query_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQueryParams>,
) -> Result<Json<AuditQueryResponse>, (StatusCode, Json<AuditErrorResponse>)> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let base_filter = params.base_filter();
    let page_filter = base_filter.clone().with_limit(limit).with_offset(offset);

    let store = state.audit_store();
    let events = store
        .query(&page_filter)
        .map_err(|e| storage_error("Failed to query audit events", e))?;
    let total = store
        .count(&base_filter)
        .map_err(|e| storage_error("Failed to count audit events", e))?;

    Ok(Json(AuditQueryResponse {
        events,
        total,
        limit,
        offset,
    }))
}
