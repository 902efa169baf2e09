#![deny(unused)]
//! SQLite-backed audit store for ctrl.
//!
//! Three tables: `requests` (one row per intercepted intent, mutable
//! status), `decisions` (append-only policy evaluations) and `events`
//! (append-only audit log). Status writes are guarded compare-and-set
//! updates, so the request lifecycle can only move along the edges of
//! [`RequestStatus::can_transition_to`] and terminal states never change.
//!
//! The connection is shared behind a mutex and every call runs on the
//! blocking pool, keeping the async pipeline free of synchronous I/O.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use ctrl_core::canonical::canonical_json;
use ctrl_core::events::now_iso;
use ctrl_core::{DecisionRow, Error, EventRow, EventType, RequestRow, RequestStatus, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS requests (
    id              TEXT PRIMARY KEY,
    created_at      TEXT NOT NULL,
    server          TEXT NOT NULL,
    tool            TEXT NOT NULL,
    arguments_json  TEXT NOT NULL,
    arguments_hash  TEXT NOT NULL,
    actor           TEXT,
    env             TEXT NOT NULL,
    status          TEXT NOT NULL,
    risk_score      INTEGER,
    risk_mode       TEXT,
    approved_at     TEXT,
    approved_by     TEXT
);
CREATE INDEX IF NOT EXISTS idx_requests_status ON requests (status);

CREATE TABLE IF NOT EXISTS decisions (
    id                 TEXT PRIMARY KEY,
    request_id         TEXT NOT NULL REFERENCES requests (id),
    decided_at         TEXT NOT NULL,
    decision           TEXT NOT NULL,
    matched_policy_id  TEXT,
    matched_condition  TEXT NOT NULL,
    reason             TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_decisions_request ON decisions (request_id);

CREATE TABLE IF NOT EXISTS events (
    id          TEXT PRIMARY KEY,
    created_at  TEXT NOT NULL,
    request_id  TEXT REFERENCES requests (id),
    type        TEXT NOT NULL,
    data_json   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_request ON events (request_id);
";

/// Fields of a new request row; `created_at` is stamped at insert.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub id: String,
    pub server: String,
    pub tool: String,
    pub arguments_json: String,
    pub arguments_hash: String,
    pub actor: Option<String>,
    pub env: String,
    pub status: RequestStatus,
    pub risk_score: Option<i64>,
    pub risk_mode: Option<String>,
}

/// Fields of a new decision row; `decided_at` is stamped at insert.
#[derive(Debug, Clone)]
pub struct NewDecision {
    pub id: String,
    pub request_id: String,
    pub decision: String,
    pub matched_policy_id: Option<String>,
    pub matched_condition: String,
    pub reason: String,
}

/// Snapshot-consistent view served by `/status/{id}`: the request, its
/// latest decision, and the preview from the newest `tool.result` event.
#[derive(Debug, Clone)]
pub struct StatusView {
    pub request: RequestRow,
    pub decision: Option<DecisionRow>,
    pub result_preview: Option<String>,
}

/// Relational persistence for requests, decisions and audit events.
#[derive(Clone)]
pub struct AuditStore {
    conn: Arc<Mutex<Connection>>,
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> Error {
    Error::internal(e.to_string())
}

fn map_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRow> {
    let status_str: String = row.get(8)?;
    let status = RequestStatus::parse(&status_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })?;
    Ok(RequestRow {
        id: row.get(0)?,
        created_at: row.get(1)?,
        server: row.get(2)?,
        tool: row.get(3)?,
        arguments_json: row.get(4)?,
        arguments_hash: row.get(5)?,
        actor: row.get(6)?,
        env: row.get(7)?,
        status,
        risk_score: row.get(9)?,
        risk_mode: row.get(10)?,
        approved_at: row.get(11)?,
        approved_by: row.get(12)?,
    })
}

const REQUEST_COLUMNS: &str = "id, created_at, server, tool, arguments_json, arguments_hash, \
                               actor, env, status, risk_score, risk_mode, approved_at, approved_by";

fn insert_event_tx(
    tx: &rusqlite::Connection,
    request_id: Option<&str>,
    event_type: EventType,
    data: &serde_json::Value,
) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO events (id, created_at, request_id, type, data_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, now_iso(), request_id, event_type.as_str(), canonical_json(data)],
    )?;
    Ok(id)
}

/// Guarded status update inside a transaction. Returns `InvalidState` /
/// `NotFound` errors through a rusqlite-compatible channel so callers can
/// keep the whole transition in one transaction.
fn cas_status_tx(
    tx: &rusqlite::Connection,
    request_id: &str,
    from: RequestStatus,
    to: RequestStatus,
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(Error::invalid_state(format!(
            "illegal transition {from} -> {to}"
        )));
    }

    let changed = tx
        .execute(
            "UPDATE requests SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![to.as_str(), request_id, from.as_str()],
        )
        .map_err(db_err)?;

    if changed == 0 {
        let actual: Option<String> = tx
            .query_row(
                "SELECT status FROM requests WHERE id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        return match actual {
            None => Err(Error::not_found(format!("request {request_id}"))),
            Some(actual) => Err(Error::invalid_state(format!(
                "request {request_id} not {from} (status={actual})"
            ))),
        };
    }
    Ok(())
}

impl AuditStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::storage(format!("create {}: {e}", parent.display())))?;
            }
        }
        tracing::debug!(path = %path.display(), "opening audit store");
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn insert_request(&self, req: NewRequest) -> Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO requests (id, created_at, server, tool, arguments_json, arguments_hash, \
                 actor, env, status, risk_score, risk_mode) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    req.id,
                    now_iso(),
                    req.server,
                    req.tool,
                    req.arguments_json,
                    req.arguments_hash,
                    req.actor,
                    req.env,
                    req.status.as_str(),
                    req.risk_score,
                    req.risk_mode,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    pub async fn insert_decision(&self, decision: NewDecision) -> Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO decisions (id, request_id, decided_at, decision, matched_policy_id, \
                 matched_condition, reason) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    decision.id,
                    decision.request_id,
                    now_iso(),
                    decision.decision,
                    decision.matched_policy_id,
                    decision.matched_condition,
                    decision.reason,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    /// Append an audit event. Data is stored as canonical JSON.
    pub async fn insert_event(
        &self,
        request_id: Option<String>,
        event_type: EventType,
        data: serde_json::Value,
    ) -> Result<String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            insert_event_tx(&conn, request_id.as_deref(), event_type, &data).map_err(db_err)
        })
        .await
        .map_err(join_err)?
    }

    /// Compare-and-set status transition.
    pub async fn transition(
        &self,
        request_id: impl Into<String>,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<()> {
        let request_id = request_id.into();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn.transaction().map_err(db_err)?;
            cas_status_tx(&tx, &request_id, from, to)?;
            tx.commit().map_err(db_err)
        })
        .await
        .map_err(join_err)?
    }

    /// Status transition plus its audit event, committed atomically.
    pub async fn transition_with_event(
        &self,
        request_id: impl Into<String>,
        from: RequestStatus,
        to: RequestStatus,
        event_type: EventType,
        data: serde_json::Value,
    ) -> Result<()> {
        let request_id = request_id.into();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn.transaction().map_err(db_err)?;
            cas_status_tx(&tx, &request_id, from, to)?;
            insert_event_tx(&tx, Some(&request_id), event_type, &data).map_err(db_err)?;
            tx.commit().map_err(db_err)
        })
        .await
        .map_err(join_err)?
    }

    /// Move a pending request to `approved`, recording who approved it and
    /// the `approval.granted` event in the same transaction. The approval
    /// must be durable before any remote execution starts.
    pub async fn approve(
        &self,
        request_id: impl Into<String>,
        approved_by: impl Into<String>,
    ) -> Result<()> {
        let request_id = request_id.into();
        let approved_by = approved_by.into();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn.transaction().map_err(db_err)?;
            cas_status_tx(&tx, &request_id, RequestStatus::Pending, RequestStatus::Approved)?;
            tx.execute(
                "UPDATE requests SET approved_at = ?1, approved_by = ?2 WHERE id = ?3",
                params![now_iso(), approved_by, request_id],
            )
            .map_err(db_err)?;
            insert_event_tx(
                &tx,
                Some(&request_id),
                EventType::ApprovalGranted,
                &serde_json::json!({"by": approved_by}),
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)
        })
        .await
        .map_err(join_err)?
    }

    pub async fn get_request(&self, request_id: impl Into<String>) -> Result<Option<RequestRow>> {
        let request_id = request_id.into();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
                params![request_id],
                map_request,
            )
            .optional()
            .map_err(db_err)
        })
        .await
        .map_err(join_err)?
    }

    /// List requests, newest first. `limit` is clamped to `1..=500`.
    pub async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        limit: i64,
    ) -> Result<Vec<RequestRow>> {
        let limit = limit.clamp(1, 500);
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut rows = Vec::new();
            match status {
                Some(status) => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT {REQUEST_COLUMNS} FROM requests WHERE status = ?1 \
                             ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                        ))
                        .map_err(db_err)?;
                    let mapped = stmt
                        .query_map(params![status.as_str(), limit], map_request)
                        .map_err(db_err)?;
                    for row in mapped {
                        rows.push(row.map_err(db_err)?);
                    }
                }
                None => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT {REQUEST_COLUMNS} FROM requests \
                             ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                        ))
                        .map_err(db_err)?;
                    let mapped = stmt.query_map(params![limit], map_request).map_err(db_err)?;
                    for row in mapped {
                        rows.push(row.map_err(db_err)?);
                    }
                }
            }
            Ok(rows)
        })
        .await
        .map_err(join_err)?
    }

    /// Request + latest decision + result preview, read under one lock so
    /// the combination is never inconsistent.
    pub async fn status_view(&self, request_id: impl Into<String>) -> Result<Option<StatusView>> {
        let request_id = request_id.into();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            let request = conn
                .query_row(
                    &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
                    params![request_id],
                    map_request,
                )
                .optional()
                .map_err(db_err)?;
            let Some(request) = request else {
                return Ok(None);
            };

            let decision = conn
                .query_row(
                    "SELECT id, request_id, decided_at, decision, matched_policy_id, \
                     matched_condition, reason FROM decisions WHERE request_id = ?1 \
                     ORDER BY decided_at DESC, rowid DESC LIMIT 1",
                    params![request_id],
                    |row| {
                        Ok(DecisionRow {
                            id: row.get(0)?,
                            request_id: row.get(1)?,
                            decided_at: row.get(2)?,
                            decision: row.get(3)?,
                            matched_policy_id: row.get(4)?,
                            matched_condition: row.get(5)?,
                            reason: row.get(6)?,
                        })
                    },
                )
                .optional()
                .map_err(db_err)?;

            let result_preview: Option<String> = conn
                .query_row(
                    "SELECT data_json FROM events WHERE request_id = ?1 AND type = ?2 \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    params![request_id, EventType::ToolResult.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(db_err)?
                .and_then(|data| serde_json::from_str::<serde_json::Value>(&data).ok())
                .and_then(|data| {
                    data.get("result_preview")
                        .and_then(|p| p.as_str())
                        .map(str::to_string)
                });

            Ok(Some(StatusView {
                request,
                decision,
                result_preview,
            }))
        })
        .await
        .map_err(join_err)?
    }

    /// All events for a request in append order.
    pub async fn events_for(&self, request_id: impl Into<String>) -> Result<Vec<EventRow>> {
        let request_id = request_id.into();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT id, created_at, request_id, type, data_json FROM events \
                     WHERE request_id = ?1 ORDER BY rowid ASC",
                )
                .map_err(db_err)?;
            let mapped = stmt
                .query_map(params![request_id], |row| {
                    Ok(EventRow {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        request_id: row.get(2)?,
                        event_type: row.get(3)?,
                        data_json: row.get(4)?,
                    })
                })
                .map_err(db_err)?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row.map_err(db_err)?);
            }
            Ok(rows)
        })
        .await
        .map_err(join_err)?
    }
}
