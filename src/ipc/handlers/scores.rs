use crate::ipc::error::ok;
use crate::ipc::helpers::{db_conn, grading_err, in_transaction, required_str, school_scope};
use crate::ipc::types::{AppState, Request};
use crate::reports::{self, ScoreInput};
use serde_json::json;

fn handle_scores_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school = match school_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let report_id = match required_str(req, "reportId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let input = match ScoreInput::from_json(&req.params) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };
    match in_transaction(conn, req, |tx| {
        reports::upsert_score(tx, &school, &report_id, &input)
    }) {
        Ok(outcome) => ok(&req.id, json!(outcome)),
        Err(e) => e,
    }
}

fn handle_scores_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school = match school_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let score_id = match required_str(req, "scoreId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match in_transaction(conn, req, |tx| reports::delete_score(tx, &school, &score_id)) {
        Ok(outcome) => ok(&req.id, json!(outcome)),
        Err(e) => e,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.upsert" => Some(handle_scores_upsert(state, req)),
        "scores.delete" => Some(handle_scores_delete(state, req)),
        _ => None,
    }
}
