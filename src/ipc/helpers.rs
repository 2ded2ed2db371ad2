use crate::grading::GradingError;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::tenant::SchoolScope;
use rusqlite::Connection;

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn grading_err(req: &Request, e: GradingError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

/// Resolves `params.schoolId` into the tenant every scoped handler runs under.
pub fn school_scope(conn: &Connection, req: &Request) -> Result<SchoolScope, serde_json::Value> {
    let school_id = required_str(req, "schoolId")?;
    SchoolScope::resolve(conn, &school_id).map_err(|e| grading_err(req, e))
}

/// Runs `f` inside one transaction; any error rolls the whole unit back.
pub fn in_transaction<T>(
    conn: &Connection,
    req: &Request,
    f: impl FnOnce(&Connection) -> Result<T, GradingError>,
) -> Result<T, serde_json::Value> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    match f(&*tx) {
        Ok(v) => {
            tx.commit()
                .map_err(|e| err(&req.id, "db_commit_failed", e.to_string(), None))?;
            Ok(v)
        }
        Err(e) => {
            let _ = tx.rollback();
            Err(grading_err(req, e))
        }
    }
}
