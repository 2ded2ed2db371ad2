use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn workspace_path(state: &AppState, req: &Request) -> Result<PathBuf, serde_json::Value> {
    req.params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone())
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn handle_backup_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match required_str(req, "outPath") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let workspace = match workspace_path(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace.join(db::DB_FILE_NAME), &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                format!("{:#}", e),
                Some(json!({ "path": out_path })),
            )
        }
    };

    tracing::info!(path = %out_path, sha256 = %export.db_sha256, "workspace bundle exported");
    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256
        }),
    )
}

fn handle_backup_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match required_str(req, "inPath") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let workspace = match workspace_path(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }

    // The open handle must be closed before its file is replaced.
    state.db = None;

    let import = match backup::import_workspace_bundle(&src, &workspace.join(db::DB_FILE_NAME)) {
        Ok(v) => v,
        Err(e) => {
            // Reopen whatever is on disk so the session stays usable.
            if let Some(current) = state.workspace.clone() {
                state.db = db::open_db(&current).ok();
            }
            return err(
                &req.id,
                "io_failed",
                format!("{:#}", e),
                Some(json!({ "path": in_path })),
            );
        }
    };

    match db::open_db(&workspace) {
        Ok(conn) => {
            state.workspace = Some(workspace.clone());
            state.db = Some(conn);
            tracing::info!(
                workspace = %workspace.display(),
                format = %import.bundle_format_detected,
                "workspace bundle imported"
            );
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "workspacePath": workspace.to_string_lossy(),
                    "bundleFormatDetected": import.bundle_format_detected
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{:#}", e), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import_workspace_bundle(state, req)),
        _ => None,
    }
}
