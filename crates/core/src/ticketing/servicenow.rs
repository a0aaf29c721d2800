//! ServiceNow Table API client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::{TicketRecord, TicketSpec, TicketStatus, TicketUpdate, TicketingSystem};
use crate::backend::BackendError;
use crate::config::ServiceNowConfig;

const FIELDS: &str = "sys_id,number,u_status,correlation_id";

/// ServiceNow client operating on one table.
///
/// Tickets are addressed by their human-readable `number`; the `sys_id`
/// needed for updates is looked up once and cached.
pub struct ServiceNowClient {
    client: Client,
    config: ServiceNowConfig,
    sys_ids: RwLock<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TableResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    sys_id: String,
    number: String,
    #[serde(default)]
    u_status: String,
    #[serde(default)]
    correlation_id: String,
}

impl TableRow {
    fn into_record(self) -> TicketRecord {
        TicketRecord {
            ticket_id: self.number,
            status: TicketStatus::parse_remote(&self.u_status),
            correlation_id: Some(self.correlation_id).filter(|c| !c.is_empty()),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    short_description: &'a str,
    description: &'a str,
    correlation_id: &'a str,
    u_common_name: &'a str,
    u_requester: &'a str,
    u_status: &'static str,
}

#[derive(Debug, Serialize)]
struct UpdateBody<'a> {
    u_status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    work_notes: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    detail: Option<String>,
}

impl ServiceNowClient {
    pub fn new(config: ServiceNowConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BackendError::permanent(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            sys_ids: RwLock::new(HashMap::new()),
        })
    }

    fn table_url(&self) -> String {
        format!(
            "{}/api/now/table/{}",
            self.config.instance_url.trim_end_matches('/'),
            self.config.table
        )
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("Accept", "application/json")
    }

    async fn read_result<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from(status.as_u16(), &body));
        }
        let body: TableResponse<T> = response.json().await?;
        Ok(body.result)
    }

    /// Run an encoded `sysparm_query` and return the first matching row.
    async fn query_one(&self, query: &str) -> Result<Option<TableRow>, BackendError> {
        let url = format!(
            "{}?sysparm_query={}&sysparm_limit=1&sysparm_fields={}",
            self.table_url(),
            urlencoding::encode(query),
            FIELDS
        );
        let response = self.authed(self.client.get(url)).send().await?;
        let rows: Vec<TableRow> = Self::read_result(response).await?;
        Ok(rows.into_iter().next())
    }

    async fn remember(&self, row: &TableRow) {
        self.sys_ids
            .write()
            .await
            .insert(row.number.clone(), row.sys_id.clone());
    }

    async fn sys_id_for(&self, ticket_id: &str) -> Result<String, BackendError> {
        if let Some(sys_id) = self.sys_ids.read().await.get(ticket_id) {
            return Ok(sys_id.clone());
        }

        let row = self
            .query_one(&format!("number={}", ticket_id))
            .await?
            .ok_or_else(|| BackendError::permanent(format!("ticket {} not found", ticket_id)))?;
        self.remember(&row).await;
        Ok(row.sys_id)
    }
}

/// Classify a non-success Table API response.
fn error_from(status: u16, body: &str) -> BackendError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .map(|b| match b.error.detail {
            Some(detail) if !detail.is_empty() => format!("{}: {}", b.error.message, detail),
            _ => b.error.message,
        })
        .unwrap_or_else(|_| body.chars().take(200).collect());
    BackendError::from_status(status, detail)
}

#[async_trait]
impl TicketingSystem for ServiceNowClient {
    fn name(&self) -> &str {
        "servicenow"
    }

    async fn create_ticket(&self, spec: &TicketSpec) -> Result<TicketRecord, BackendError> {
        let body = CreateBody {
            short_description: &spec.short_description,
            description: &spec.description,
            correlation_id: &spec.correlation_id,
            u_common_name: &spec.common_name,
            u_requester: &spec.requester,
            u_status: spec.status.as_str(),
        };

        let url = format!("{}?sysparm_fields={}", self.table_url(), FIELDS);
        let response = self.authed(self.client.post(url)).json(&body).send().await?;
        let row: TableRow = Self::read_result(response).await?;

        debug!(ticket_id = %row.number, correlation_id = %spec.correlation_id, "Created ServiceNow ticket");
        self.remember(&row).await;
        Ok(row.into_record())
    }

    async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<TicketRecord>, BackendError> {
        let row = self
            .query_one(&format!("correlation_id={}", correlation_id))
            .await?;
        match row {
            Some(row) => {
                self.remember(&row).await;
                Ok(Some(row.into_record()))
            }
            None => Ok(None),
        }
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<TicketRecord, BackendError> {
        let row = self
            .query_one(&format!("number={}", ticket_id))
            .await?
            .ok_or_else(|| BackendError::permanent(format!("ticket {} not found", ticket_id)))?;
        self.remember(&row).await;
        Ok(row.into_record())
    }

    async fn update_ticket(
        &self,
        ticket_id: &str,
        update: &TicketUpdate,
    ) -> Result<TicketRecord, BackendError> {
        let sys_id = self.sys_id_for(ticket_id).await?;
        let body = UpdateBody {
            u_status: update.status.as_str(),
            work_notes: update.note.as_deref(),
        };

        let url = format!("{}/{}?sysparm_fields={}", self.table_url(), sys_id, FIELDS);
        let response = self.authed(self.client.patch(url)).json(&body).send().await?;
        let row: TableRow = Self::read_result(response).await?;
        Ok(row.into_record())
    }
}
