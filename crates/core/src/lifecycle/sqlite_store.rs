//! SQLite-backed record store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode};

use super::{LifecycleError, RecordFilter, RecordStore};
use crate::request::CertificateRequest;

const SELECT_COLUMNS: &str =
    "id, created_at, updated_at, requester, state, requested, issuance, ticket, history, rotated_from";

/// SQLite-backed certificate request store.
///
/// Facets and history are stored as JSON; the columns used for filtering
/// (state, serial, expiry, ticket settlement) are denormalized on every save.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Create a new store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, LifecycleError> {
        let conn = Connection::open(path).map_err(|e| LifecycleError::Database(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| LifecycleError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, LifecycleError> {
        let conn =
            Connection::open_in_memory().map_err(|e| LifecycleError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), LifecycleError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS certificate_requests (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                requester TEXT NOT NULL,
                subject_name TEXT NOT NULL,
                state TEXT NOT NULL,
                certificate_serial TEXT,
                expires_at INTEGER,
                ticket_id TEXT,
                ticket_settled INTEGER NOT NULL DEFAULT 0,
                requested TEXT NOT NULL,
                issuance TEXT NOT NULL,
                ticket TEXT NOT NULL,
                history TEXT NOT NULL,
                rotated_from TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_certificate_requests_serial
                ON certificate_requests(certificate_serial);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_certificate_requests_rotated_from
                ON certificate_requests(rotated_from);
            CREATE INDEX IF NOT EXISTS idx_certificate_requests_state ON certificate_requests(state);
            CREATE INDEX IF NOT EXISTS idx_certificate_requests_requester ON certificate_requests(requester);
            CREATE INDEX IF NOT EXISTS idx_certificate_requests_expires_at ON certificate_requests(expires_at);
            "#,
        )
        .map_err(|e| LifecycleError::Database(e.to_string()))?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LifecycleError> {
        self.conn
            .lock()
            .map_err(|_| LifecycleError::Database("connection mutex poisoned".to_string()))
    }

    fn build_where_clause(filter: &RecordFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !filter.states.is_empty() {
            let placeholders = vec!["?"; filter.states.len()].join(", ");
            conditions.push(format!("state IN ({})", placeholders));
            for state in &filter.states {
                params.push(Box::new(state.as_str().to_string()));
            }
        }

        if let Some(ref requester) = filter.requester {
            conditions.push("requester = ?".to_string());
            params.push(Box::new(requester.clone()));
        }

        if let Some(expires_before) = filter.expires_before {
            conditions.push("expires_at IS NOT NULL AND expires_at <= ?".to_string());
            params.push(Box::new(expires_before.timestamp()));
        }

        if filter.unsettled_ticket {
            conditions.push("ticket_settled = 0".to_string());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<CertificateRequest> {
        fn json_col<T: serde::de::DeserializeOwned>(
            row: &rusqlite::Row,
            idx: usize,
        ) -> rusqlite::Result<T> {
            let raw: String = row.get(idx)?;
            serde_json::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        }

        fn time_col(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
            let raw: String = row.get(idx)?;
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        idx,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
        }

        let state_raw: String = row.get(4)?;
        let state = state_raw.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?;

        Ok(CertificateRequest {
            id: row.get(0)?,
            created_at: time_col(row, 1)?,
            updated_at: time_col(row, 2)?,
            requester: row.get(3)?,
            state,
            requested: json_col(row, 5)?,
            issuance: json_col(row, 6)?,
            ticket: json_col(row, 7)?,
            history: json_col(row, 8)?,
            rotated_from: row.get(9)?,
        })
    }

    fn to_json<T: serde::Serialize>(value: &T) -> Result<String, LifecycleError> {
        serde_json::to_string(value).map_err(|e| LifecycleError::Database(e.to_string()))
    }

    fn timestamp(at: DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Map a write failure, resolving unique serial and rotation conflicts to
    /// the record already holding the value.
    fn write_error(conn: &Connection, record: &CertificateRequest, e: rusqlite::Error) -> LifecycleError {
        let is_constraint = matches!(
            &e,
            rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
        );

        if is_constraint {
            if let Some(ref predecessor) = record.rotated_from {
                let successor: Option<String> = conn
                    .query_row(
                        "SELECT id FROM certificate_requests WHERE rotated_from = ? AND id != ?",
                        params![predecessor, record.id],
                        |row| row.get(0),
                    )
                    .ok();
                if let Some(successor) = successor {
                    return LifecycleError::AlreadyRotated {
                        request_id: predecessor.clone(),
                        successor,
                    };
                }
            }
            if let Some(serial) = record.issuance.certificate().map(|c| &c.serial_number) {
                let holder: Option<String> = conn
                    .query_row(
                        "SELECT id FROM certificate_requests WHERE certificate_serial = ? AND id != ?",
                        params![serial, record.id],
                        |row| row.get(0),
                    )
                    .ok();
                if let Some(holder) = holder {
                    return LifecycleError::DuplicateSerial {
                        serial: serial.clone(),
                        holder,
                    };
                }
            }
        }

        LifecycleError::Database(e.to_string())
    }
}

impl RecordStore for SqliteRecordStore {
    fn insert(&self, record: &CertificateRequest) -> Result<(), LifecycleError> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO certificate_requests (id, created_at, updated_at, requester, subject_name, state, certificate_serial, expires_at, ticket_id, ticket_settled, requested, issuance, ticket, history, rotated_from) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.id,
                Self::timestamp(record.created_at),
                Self::timestamp(record.updated_at),
                record.requester,
                record.requested.subject_name,
                record.state.as_str(),
                record.issuance.certificate().map(|c| c.serial_number.clone()),
                record.issuance.certificate().map(|c| c.expires_at.timestamp()),
                record.ticket_id(),
                record.ticket_settled(),
                Self::to_json(&record.requested)?,
                Self::to_json(&record.issuance)?,
                Self::to_json(&record.ticket)?,
                Self::to_json(&record.history)?,
                record.rotated_from,
            ],
        )
        .map_err(|e| Self::write_error(&conn, record, e))?;

        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<CertificateRequest>, LifecycleError> {
        let conn = self.conn()?;

        let sql = format!(
            "SELECT {} FROM certificate_requests WHERE id = ?",
            SELECT_COLUMNS
        );
        let result = conn.query_row(&sql, params![id], Self::row_to_record);

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(LifecycleError::Database(e.to_string())),
        }
    }

    fn save(&self, record: &CertificateRequest) -> Result<(), LifecycleError> {
        let conn = self.conn()?;

        let updated = conn
            .execute(
                "UPDATE certificate_requests SET updated_at = ?, state = ?, certificate_serial = ?, expires_at = ?, ticket_id = ?, ticket_settled = ?, issuance = ?, ticket = ?, history = ? WHERE id = ?",
                params![
                    Self::timestamp(record.updated_at),
                    record.state.as_str(),
                    record.issuance.certificate().map(|c| c.serial_number.clone()),
                    record.issuance.certificate().map(|c| c.expires_at.timestamp()),
                    record.ticket_id(),
                    record.ticket_settled(),
                    Self::to_json(&record.issuance)?,
                    Self::to_json(&record.ticket)?,
                    Self::to_json(&record.history)?,
                    record.id,
                ],
            )
            .map_err(|e| Self::write_error(&conn, record, e))?;

        if updated == 0 {
            return Err(LifecycleError::NotFound(record.id.clone()));
        }

        Ok(())
    }

    fn list(&self, filter: &RecordFilter) -> Result<Vec<CertificateRequest>, LifecycleError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT {} FROM certificate_requests {} ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?",
            SELECT_COLUMNS, where_clause
        );

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| LifecycleError::Database(e.to_string()))?;

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));

        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_record)
            .map_err(|e| LifecycleError::Database(e.to_string()))?;

        let mut records = Vec::new();
        for row_result in rows {
            records.push(row_result.map_err(|e| LifecycleError::Database(e.to_string()))?);
        }

        Ok(records)
    }

    fn count(&self, filter: &RecordFilter) -> Result<i64, LifecycleError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM certificate_requests {}", where_clause);

        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(|e| LifecycleError::Database(e.to_string()))
    }

    fn find_by_serial(&self, serial: &str) -> Result<Option<String>, LifecycleError> {
        let conn = self.conn()?;

        let result = conn.query_row(
            "SELECT id FROM certificate_requests WHERE certificate_serial = ?",
            params![serial],
            |row| row.get(0),
        );

        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(LifecycleError::Database(e.to_string())),
        }
    }

    fn find_successor(&self, id: &str) -> Result<Option<String>, LifecycleError> {
        let conn = self.conn()?;

        let result = conn.query_row(
            "SELECT id FROM certificate_requests WHERE rotated_from = ?",
            params![id],
            |row| row.get(0),
        );

        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(LifecycleError::Database(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{apply_event, LifecycleEvent, RequestState};
    use crate::testing::fixtures;
    use chrono::Duration;

    fn create_test_store() -> SqliteRecordStore {
        SqliteRecordStore::in_memory().unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let store = create_test_store();
        let record = fixtures::pending_request("svc.example.com");

        store.insert(&record).unwrap();
        let fetched = store.get(&record.id).unwrap().unwrap();

        assert_eq!(fetched.id, record.id);
        assert_eq!(fetched.state, RequestState::Pending);
        assert_eq!(fetched.requested, record.requested);
        assert_eq!(fetched.history, record.history);
    }

    #[test]
    fn test_get_nonexistent_record() {
        let store = create_test_store();
        assert!(store.get("nonexistent-id").unwrap().is_none());
    }

    #[test]
    fn test_insert_duplicate_id_fails() {
        let store = create_test_store();
        let record = fixtures::pending_request("svc.example.com");
        store.insert(&record).unwrap();
        assert!(matches!(
            store.insert(&record),
            Err(LifecycleError::Database(_))
        ));
    }

    #[test]
    fn test_save_roundtrips_facets() {
        let store = create_test_store();
        let record = fixtures::pending_request("svc.example.com");
        store.insert(&record).unwrap();

        let issued = fixtures::issued_request_from(record, "AA:BB:CC");
        store.save(&issued).unwrap();

        let fetched = store.get(&issued.id).unwrap().unwrap();
        assert_eq!(fetched, issued);
        assert_eq!(fetched.certificate_serial(), Some("AA:BB:CC"));
        assert_eq!(
            store.find_by_serial("AA:BB:CC").unwrap(),
            Some(issued.id.clone())
        );
    }

    #[test]
    fn test_save_unknown_record() {
        let store = create_test_store();
        let record = fixtures::pending_request("svc.example.com");
        assert!(matches!(
            store.save(&record),
            Err(LifecycleError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_serial_rejected() {
        let store = create_test_store();
        let first = fixtures::issued_request("a.example.com", "01:02");
        store.insert(&first).unwrap();

        let second = fixtures::pending_request("b.example.com");
        store.insert(&second).unwrap();
        let second = fixtures::issued_request_from(second, "01:02");

        match store.save(&second) {
            Err(LifecycleError::DuplicateSerial { serial, holder }) => {
                assert_eq!(serial, "01:02");
                assert_eq!(holder, first.id);
            }
            other => panic!("expected duplicate serial, got {:?}", other),
        }
    }

    #[test]
    fn test_successor_link_is_unique() {
        let store = create_test_store();
        let original = fixtures::issued_request("svc.example.com", "0D:01");
        store.insert(&original).unwrap();
        assert!(store.find_successor(&original.id).unwrap().is_none());

        let now = Utc::now();
        let successor = original.successor("succ-1", now);
        store.insert(&successor).unwrap();

        let fetched = store.get("succ-1").unwrap().unwrap();
        assert_eq!(fetched.rotated_from.as_deref(), Some(original.id.as_str()));
        assert_eq!(
            store.find_successor(&original.id).unwrap().as_deref(),
            Some("succ-1")
        );

        match store.insert(&original.successor("succ-2", now)) {
            Err(LifecycleError::AlreadyRotated {
                request_id,
                successor,
            }) => {
                assert_eq!(request_id, original.id);
                assert_eq!(successor, "succ-1");
            }
            other => panic!("expected already rotated, got {:?}", other),
        }
    }

    #[test]
    fn test_list_with_state_filter() {
        let store = create_test_store();
        store
            .insert(&fixtures::pending_request("a.example.com"))
            .unwrap();
        store
            .insert(&fixtures::issued_request("b.example.com", "0A"))
            .unwrap();
        store
            .insert(&fixtures::issued_request("c.example.com", "0B"))
            .unwrap();

        let issued = store
            .list(&RecordFilter::new().with_state(RequestState::Issued))
            .unwrap();
        assert_eq!(issued.len(), 2);

        let either = RecordFilter::new()
            .with_state(RequestState::Issued)
            .with_state(RequestState::Pending);
        assert_eq!(store.count(&either).unwrap(), 3);
    }

    #[test]
    fn test_list_with_requester_filter() {
        let store = create_test_store();
        let mut alice = fixtures::pending_request("a.example.com");
        alice.requester = "alice".to_string();
        store.insert(&alice).unwrap();
        store
            .insert(&fixtures::pending_request("b.example.com"))
            .unwrap();

        let records = store
            .list(&RecordFilter::new().with_requester("alice"))
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].requester, "alice");
    }

    #[test]
    fn test_list_pagination_and_order() {
        let store = create_test_store();
        let base = Utc::now();
        for i in 0..5 {
            let mut record = fixtures::pending_request(&format!("h{}.example.com", i));
            record.created_at = base + Duration::seconds(i);
            store.insert(&record).unwrap();
        }

        let page = store
            .list(&RecordFilter::new().with_limit(2).with_offset(0))
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].requested.subject_name, "h0.example.com");

        let last = store
            .list(&RecordFilter::new().with_limit(2).with_offset(4))
            .unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].requested.subject_name, "h4.example.com");
    }

    #[test]
    fn test_expires_before_filter() {
        let store = create_test_store();
        let now = Utc::now();

        let mut soon = fixtures::issued_request("soon.example.com", "01");
        if let crate::lifecycle::IssuanceFacet::Issued { certificate } = &mut soon.issuance {
            certificate.expires_at = now - Duration::minutes(1);
        }
        store.insert(&soon).unwrap();
        store
            .insert(&fixtures::issued_request("later.example.com", "02"))
            .unwrap();
        store
            .insert(&fixtures::pending_request("none.example.com"))
            .unwrap();

        let due = store
            .list(&RecordFilter::new().with_expires_before(now))
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, soon.id);
    }

    #[test]
    fn test_unsettled_ticket_filter() {
        let store = create_test_store();
        let pending = fixtures::pending_request("a.example.com");
        store.insert(&pending).unwrap();

        let issued = fixtures::issued_request("b.example.com", "0C");
        let synced = apply_event(
            &issued,
            &LifecycleEvent::TicketStatusSynced {
                status: crate::ticketing::TicketStatus::Issued,
            },
            Utc::now(),
        )
        .unwrap();
        store.insert(&synced).unwrap();

        let unsettled = store
            .list(&RecordFilter::new().with_unsettled_ticket())
            .unwrap();
        assert_eq!(unsettled.len(), 1);
        assert_eq!(unsettled[0].id, pending.id);
    }

    #[test]
    fn test_file_based_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("certflow.db");

        let record = fixtures::pending_request("svc.example.com");
        {
            let store = SqliteRecordStore::new(&db_path).unwrap();
            store.insert(&record).unwrap();
        }

        assert!(db_path.exists());
        let reopened = SqliteRecordStore::new(&db_path).unwrap();
        assert!(reopened.get(&record.id).unwrap().is_some());
    }
}
