use crate::grading::{recalculate_positions, TermScope};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, grading_err, required_str, school_scope};
use crate::ipc::types::{AppState, Request};
use crate::reports;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school = match school_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.teacher_name,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM report_cards rc WHERE rc.class_id = c.id) AS report_count
         FROM classes c
         WHERE c.school_id = ?
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([school.id()], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let teacher_name: Option<String> = row.get(2)?;
            let student_count: i64 = row.get(3)?;
            let report_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "teacherName": teacher_name,
                "studentCount": student_count,
                "reportCount": report_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn subject_names(req: &Request) -> Result<Vec<String>, serde_json::Value> {
    let Some(raw) = req.params.get("subjects").filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };
    let Some(arr) = raw.as_array() else {
        return Err(err(&req.id, "bad_params", "subjects must be an array of names", None));
    };
    let mut names: Vec<String> = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(name) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(err(
                &req.id,
                "bad_params",
                "subjects must be non-empty strings",
                Some(json!({ "value": v })),
            ));
        };
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school = match school_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_name = req
        .params
        .get("teacherName")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let subjects = match subject_names(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO classes(id, school_id, name, teacher_name) VALUES(?, ?, ?, ?)",
        (&class_id, school.id(), &name, &teacher_name),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    let mut subject_ids = Vec::with_capacity(subjects.len());
    for (i, subject) in subjects.iter().enumerate() {
        let subject_id = match reports::find_or_create_subject(&tx, &school, subject) {
            Ok((id, _)) => id,
            Err(e) => {
                let _ = tx.rollback();
                return grading_err(req, e);
            }
        };
        if let Err(e) = tx.execute(
            "INSERT INTO class_subjects(class_id, subject_id, sort_order) VALUES(?, ?, ?)",
            (&class_id, &subject_id, i as i64),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "class_subjects" })),
            );
        }
        subject_ids.push(subject_id);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "classId": class_id, "name": name, "subjectIds": subject_ids }),
    )
}

fn handle_classes_get(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let row: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT name, teacher_name FROM classes WHERE id = ? AND school_id = ?",
            (&class_id, school.id()),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((name, teacher_name)) = row else {
        return err(&req.id, "not_found", "class not found", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT sub.id, sub.name
         FROM class_subjects cs
         JOIN subjects sub ON sub.id = cs.subject_id
         WHERE cs.class_id = ?
         ORDER BY cs.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subjects = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            Ok(json!({ "id": id, "name": name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match subjects {
        Ok(subjects) => ok(
            &req.id,
            json!({
                "classId": class_id,
                "name": name,
                "teacherName": teacher_name,
                "subjects": subjects
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    if let Err(e) = school.ensure_class(conn, &class_id) {
        return grading_err(req, e);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Report cards of this class's students filed under another class leave
    // gaps in that class's ranking once deleted.
    let other_scopes = {
        let mut stmt = match tx.prepare(
            "SELECT DISTINCT class_id, session, term
             FROM report_cards
             WHERE class_id <> ?1
               AND student_id IN (SELECT id FROM students WHERE class_id = ?1)",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([&class_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        rows
    };
    let other_scopes = match other_scopes {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    };

    // Explicitly delete in dependency order.
    let steps: [(&str, &str); 5] = [
        (
            "subject_scores",
            "DELETE FROM subject_scores
             WHERE report_card_id IN (
               SELECT id FROM report_cards
               WHERE class_id = ?1
                  OR student_id IN (SELECT id FROM students WHERE class_id = ?1)
             )",
        ),
        (
            "report_cards",
            "DELETE FROM report_cards
             WHERE class_id = ?1
                OR student_id IN (SELECT id FROM students WHERE class_id = ?1)",
        ),
        ("students", "DELETE FROM students WHERE class_id = ?1"),
        ("class_subjects", "DELETE FROM class_subjects WHERE class_id = ?1"),
        ("classes", "DELETE FROM classes WHERE id = ?1"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    for (other_class, session, term) in other_scopes {
        let scope = TermScope::new(&school, other_class, session, term);
        if let Err(e) = recalculate_positions(&tx, &scope) {
            let _ = tx.rollback();
            return grading_err(req, e);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(class_id = %class_id, "class deleted");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.get" => Some(handle_classes_get(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
