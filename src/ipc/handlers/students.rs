use crate::grading::{recalculate_positions, TermScope};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, grading_err, required_str, school_scope};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn optional_trimmed(v: Option<&serde_json::Value>) -> Option<String> {
    v.and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school = match school_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = optional_trimmed(req.params.get("classId"));

    let mut stmt = match conn.prepare(
        "SELECT id, class_id, first_name, last_name, student_no
         FROM students
         WHERE school_id = ?1 AND (?2 IS NULL OR class_id = ?2)
         ORDER BY last_name, first_name, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((school.id(), class_id.as_deref()), |r| {
            let id: String = r.get(0)?;
            let class_id: String = r.get(1)?;
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            let student_no: Option<String> = r.get(4)?;
            Ok(json!({
                "id": id,
                "classId": class_id,
                "firstName": first,
                "lastName": last,
                "displayName": format!("{} {}", first, last),
                "studentNo": student_no
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school = match school_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_no = optional_trimmed(req.params.get("studentNo"));
    if let Err(e) = school.ensure_class(conn, &class_id) {
        return grading_err(req, e);
    }

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, school_id, class_id, first_name, last_name, student_no, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            school.id(),
            &class_id,
            &first_name,
            &last_name,
            &student_no,
            chrono::Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

/// Moving a student changes which broadsheet they appear on; existing report
/// cards keep the class they were filed under.
fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school = match school_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch", None);
    };
    if let Err(e) = school.student_class(conn, &student_id) {
        return grading_err(req, e);
    }

    let mut first_name: Option<String> = None;
    let mut last_name: Option<String> = None;
    let mut student_no: Option<Option<String>> = None;
    let mut class_id: Option<String> = None;
    for (k, v) in patch {
        match k.as_str() {
            "firstName" | "lastName" | "classId" => {
                let Some(s) = optional_trimmed(Some(v)) else {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("patch.{} must be a non-empty string", k),
                        None,
                    );
                };
                match k.as_str() {
                    "firstName" => first_name = Some(s),
                    "lastName" => last_name = Some(s),
                    _ => class_id = Some(s),
                }
            }
            "studentNo" => {
                if v.is_null() {
                    student_no = Some(None);
                } else if v.is_string() {
                    student_no = Some(optional_trimmed(Some(v)));
                } else {
                    return err(&req.id, "bad_params", "patch.studentNo must be string or null", None);
                }
            }
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown patch field: {}", k),
                    None,
                )
            }
        }
    }

    if let Some(cid) = class_id.as_deref() {
        if let Err(e) = school.ensure_class(conn, cid) {
            return grading_err(req, e);
        }
    }

    let (set_student_no, student_no) = match student_no {
        Some(v) => (1_i64, v),
        None => (0_i64, None),
    };
    if let Err(e) = conn.execute(
        "UPDATE students SET
           first_name = COALESCE(?, first_name),
           last_name = COALESCE(?, last_name),
           class_id = COALESCE(?, class_id),
           student_no = CASE WHEN ? = 1 THEN ? ELSE student_no END,
           updated_at = ?
         WHERE id = ?",
        (
            &first_name,
            &last_name,
            &class_id,
            set_student_no,
            &student_no,
            chrono::Utc::now().to_rfc3339(),
            &student_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school = match school_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND school_id = ?",
            (&student_id, school.id()),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let scopes = {
        let mut stmt = match tx.prepare(
            "SELECT DISTINCT class_id, session, term FROM report_cards WHERE student_id = ?",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([&student_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        rows
    };
    let scopes = match scopes {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    };

    let steps: [(&str, &str); 3] = [
        (
            "subject_scores",
            "DELETE FROM subject_scores
             WHERE report_card_id IN (SELECT id FROM report_cards WHERE student_id = ?)",
        ),
        ("report_cards", "DELETE FROM report_cards WHERE student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&student_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    for (class_id, session, term) in scopes {
        if let Err(e) = recalculate_positions(&tx, &TermScope::new(&school, class_id, session, term)) {
            let _ = tx.rollback();
            return grading_err(req, e);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
