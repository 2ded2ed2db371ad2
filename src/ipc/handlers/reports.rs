use crate::grading::{build_broadsheet, recalculate_positions, TermScope};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, grading_err, in_transaction, required_str, school_scope};
use crate::ipc::types::{AppState, Request};
use crate::reports::{self, ReportCardInput, ReportDetailsPatch, ReportFilters};
use serde_json::json;
use std::path::PathBuf;

fn handle_reports_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school = match school_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let input = match ReportCardInput::from_params(&req.params) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };
    match in_transaction(conn, req, |tx| reports::upsert_report_card(tx, &school, &input)) {
        Ok(outcome) => {
            tracing::info!(
                report_id = %outcome.report_id,
                created = outcome.created,
                total = outcome.total_score,
                "report card saved"
            );
            ok(&req.id, json!(outcome))
        }
        Err(e) => e,
    }
}

fn handle_reports_get(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match reports::load_report_card(conn, &school, &report_id) {
        Ok(view) => ok(&req.id, json!({ "report": view })),
        Err(e) => grading_err(req, e),
    }
}

fn handle_reports_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school = match school_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let filters = match ReportFilters::from_params(&req.params) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };
    match reports::list_report_cards(conn, &school, &filters) {
        Ok(rows) => ok(&req.id, json!({ "reports": rows })),
        Err(e) => grading_err(req, e),
    }
}

fn handle_reports_update_remarks(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let patch = match ReportDetailsPatch::from_params(&req.params) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };
    match reports::update_report_details(conn, &school, &report_id, &patch) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => grading_err(req, e),
    }
}

fn handle_reports_promote(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let Some(promoted) = req.params.get("promoted").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "promoted must be a boolean", None);
    };
    match reports::set_promotion(conn, &school, &report_id, promoted) {
        Ok(promoted_at) => ok(
            &req.id,
            json!({ "ok": true, "isPromoted": promoted, "promotedAt": promoted_at }),
        ),
        Err(e) => grading_err(req, e),
    }
}

fn handle_reports_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match in_transaction(conn, req, |tx| {
        reports::delete_report_card(tx, &school, &report_id)
    }) {
        Ok(reranked) => ok(&req.id, json!({ "ok": true, "reranked": reranked })),
        Err(e) => e,
    }
}

fn handle_reports_recalculate_positions(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school = match school_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match TermScope::from_params(&school, &req.params) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };
    match in_transaction(conn, req, |tx| {
        school.ensure_class(tx, &scope.class_id)?;
        recalculate_positions(tx, &scope)
    }) {
        Ok(count) => ok(&req.id, json!({ "ok": true, "count": count })),
        Err(e) => e,
    }
}

fn handle_reports_broadsheet(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school = match school_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match TermScope::from_params(&school, &req.params) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };
    match build_broadsheet(conn, &scope) {
        Ok(sheet) => ok(&req.id, json!(sheet)),
        Err(e) => grading_err(req, e),
    }
}

fn handle_reports_broadsheet_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school = match school_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match TermScope::from_params(&school, &req.params) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sheet = match build_broadsheet(conn, &scope) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };

    let out = PathBuf::from(&out_path);
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            );
        }
    }
    let file = match std::fs::File::create(&out) {
        Ok(f) => f,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };
    let rows_exported = match sheet.write_csv(file) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };

    tracing::info!(path = %out_path, rows = rows_exported, "broadsheet exported");
    ok(
        &req.id,
        json!({ "ok": true, "path": out_path, "rowsExported": rows_exported }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.upsert" => Some(handle_reports_upsert(state, req)),
        "reports.get" => Some(handle_reports_get(state, req)),
        "reports.list" => Some(handle_reports_list(state, req)),
        "reports.updateRemarks" => Some(handle_reports_update_remarks(state, req)),
        "reports.promote" => Some(handle_reports_promote(state, req)),
        "reports.delete" => Some(handle_reports_delete(state, req)),
        "reports.recalculatePositions" => Some(handle_reports_recalculate_positions(state, req)),
        "reports.broadsheet" => Some(handle_reports_broadsheet(state, req)),
        "reports.broadsheetExport" => Some(handle_reports_broadsheet_export(state, req)),
        _ => None,
    }
}
