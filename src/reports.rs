use crate::grading::{
    recalculate_positions, recompute_report_totals, resolve_grade, GradingError, ReportTotals,
    ScoreComponents, TermScope,
};
use crate::tenant::SchoolScope;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn opt_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, GradingError> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| GradingError::new("bad_params", format!("{} must be a string", key))),
    }
}

fn opt_count(params: &serde_json::Value, key: &str) -> Result<Option<i64>, GradingError> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Ok(Some(n)),
            _ => Err(GradingError::new(
                "bad_params",
                format!("{} must be a non-negative integer", key),
            )),
        },
    }
}

fn mark(params: &serde_json::Value, key: &str) -> Result<f64, GradingError> {
    match params.get(key) {
        None => Ok(0.0),
        Some(v) if v.is_null() => Ok(0.0),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| GradingError::new("bad_params", format!("{} must be a number", key))),
    }
}

fn required(params: &serde_json::Value, key: &str) -> Result<String, GradingError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GradingError::new("bad_params", format!("missing {}", key)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectRef {
    Id(String),
    Name(String),
}

#[derive(Debug, Clone)]
pub struct ScoreInput {
    pub subject: SubjectRef,
    pub components: ScoreComponents,
    pub grade: Option<String>,
    pub comment: Option<String>,
}

impl ScoreInput {
    /// Accepts `subjectId` or `subject` (a name). Missing marks count as 0;
    /// any submitted `total` is ignored.
    pub fn from_json(v: &serde_json::Value) -> Result<Self, GradingError> {
        let subject = match (opt_str(v, "subjectId")?, opt_str(v, "subject")?) {
            (Some(id), _) if !id.trim().is_empty() => SubjectRef::Id(id.trim().to_string()),
            (_, Some(name)) if !name.trim().is_empty() => SubjectRef::Name(name.trim().to_string()),
            _ => return Err(GradingError::new("bad_params", "missing subjectId or subject")),
        };
        let components = ScoreComponents::new(mark(v, "ca1")?, mark(v, "ca2")?, mark(v, "exam")?)?;
        Ok(Self {
            subject,
            components,
            grade: opt_str(v, "grade")?,
            comment: opt_str(v, "comment")?,
        })
    }
}

pub fn find_or_create_subject(
    conn: &Connection,
    school: &SchoolScope,
    name: &str,
) -> Result<(String, bool), GradingError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(GradingError::new("bad_params", "subject name must not be empty"));
    }
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM subjects WHERE school_id = ? AND name = ?",
            (school.id(), name),
            |r| r.get(0),
        )
        .optional()
        .map_err(GradingError::db("db_query_failed"))?;
    if let Some(id) = existing {
        return Ok((id, false));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, school_id, name) VALUES(?, ?, ?)",
        (&id, school.id(), name),
    )
    .map_err(|e| {
        GradingError::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "subjects" }))
    })?;
    Ok((id, true))
}

pub fn resolve_subject(
    conn: &Connection,
    school: &SchoolScope,
    subject: &SubjectRef,
) -> Result<String, GradingError> {
    match subject {
        SubjectRef::Name(name) => Ok(find_or_create_subject(conn, school, name)?.0),
        SubjectRef::Id(id) => {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM subjects WHERE id = ? AND school_id = ?",
                    (id, school.id()),
                    |r| r.get(0),
                )
                .optional()
                .map_err(GradingError::db("db_query_failed"))?;
            match exists {
                Some(_) => Ok(id.clone()),
                None => Err(GradingError::new("not_found", "subject not found")
                    .with_details(json!({ "subjectId": id }))),
            }
        }
    }
}

/// Identity and ranking scope of a stored report card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportKey {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub session: String,
    pub term: String,
}

impl ReportKey {
    pub fn load(conn: &Connection, school: &SchoolScope, report_id: &str) -> Result<Self, GradingError> {
        let row: Option<ReportKey> = conn
            .query_row(
                "SELECT id, student_id, class_id, session, term
                 FROM report_cards
                 WHERE id = ? AND school_id = ?",
                (report_id, school.id()),
                |r| {
                    Ok(ReportKey {
                        id: r.get(0)?,
                        student_id: r.get(1)?,
                        class_id: r.get(2)?,
                        session: r.get(3)?,
                        term: r.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(GradingError::db("db_query_failed"))?;
        row.ok_or_else(|| {
            GradingError::new("not_found", "report card not found")
                .with_details(json!({ "reportId": report_id }))
        })
    }

    pub fn term_scope<'a>(&self, school: &'a SchoolScope) -> TermScope<'a> {
        TermScope::new(school, self.class_id.clone(), self.session.clone(), self.term.clone())
    }
}

/// Writes one score record, creating it if the report has none for this
/// subject yet. The total is always recomputed from the components.
pub fn write_score(
    conn: &Connection,
    report_id: &str,
    subject_id: &str,
    input: &ScoreInput,
) -> Result<String, GradingError> {
    let existing: Option<(String, Option<String>, String)> = conn
        .query_row(
            "SELECT id, grade, comment FROM subject_scores WHERE report_card_id = ? AND subject_id = ?",
            (report_id, subject_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(GradingError::db("db_query_failed"))?;

    let c = input.components;
    let total = c.total();
    match existing {
        Some((score_id, stored_grade, stored_comment)) => {
            let grade = resolve_grade(input.grade.as_deref(), stored_grade.as_deref(), total);
            let comment = input.comment.clone().unwrap_or(stored_comment);
            conn.execute(
                "UPDATE subject_scores
                 SET ca1 = ?, ca2 = ?, exam = ?, total = ?, grade = ?, comment = ?
                 WHERE id = ?",
                (c.ca1, c.ca2, c.exam, total, &grade, &comment, &score_id),
            )
            .map_err(|e| {
                GradingError::new("db_update_failed", e.to_string())
                    .with_details(json!({ "table": "subject_scores" }))
            })?;
            Ok(score_id)
        }
        None => {
            let score_id = Uuid::new_v4().to_string();
            let grade = resolve_grade(input.grade.as_deref(), None, total);
            conn.execute(
                "INSERT INTO subject_scores(id, report_card_id, subject_id, ca1, ca2, exam, total, grade, comment)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &score_id,
                    report_id,
                    subject_id,
                    c.ca1,
                    c.ca2,
                    c.exam,
                    total,
                    &grade,
                    input.comment.as_deref().unwrap_or(""),
                ),
            )
            .map_err(|e| {
                GradingError::new("db_insert_failed", e.to_string())
                    .with_details(json!({ "table": "subject_scores" }))
            })?;
            Ok(score_id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub written: usize,
    pub removed: usize,
}

/// Makes the report's score set exactly match `inputs`: listed subjects are
/// written, every other score record under the report is deleted.
pub fn sync_scores(
    conn: &Connection,
    school: &SchoolScope,
    report_id: &str,
    inputs: &[ScoreInput],
) -> Result<SyncSummary, GradingError> {
    let mut keep: HashSet<String> = HashSet::new();
    let mut resolved = Vec::with_capacity(inputs.len());
    for input in inputs {
        let subject_id = resolve_subject(conn, school, &input.subject)?;
        if !keep.insert(subject_id.clone()) {
            return Err(GradingError::new("bad_params", "duplicate subject in scores")
                .with_details(json!({ "subjectId": subject_id })));
        }
        resolved.push((subject_id, input));
    }

    for (subject_id, input) in &resolved {
        write_score(conn, report_id, subject_id, input)?;
    }

    let mut stmt = conn
        .prepare("SELECT id, subject_id FROM subject_scores WHERE report_card_id = ?")
        .map_err(GradingError::db("db_query_failed"))?;
    let current = stmt
        .query_map([report_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(GradingError::db("db_query_failed"))?;

    let mut removed = 0usize;
    for (score_id, subject_id) in current {
        if keep.contains(&subject_id) {
            continue;
        }
        conn.execute("DELETE FROM subject_scores WHERE id = ?", [&score_id])
            .map_err(|e| {
                GradingError::new("db_delete_failed", e.to_string())
                    .with_details(json!({ "table": "subject_scores" }))
            })?;
        removed += 1;
    }

    Ok(SyncSummary {
        written: resolved.len(),
        removed,
    })
}

/// Re-aggregates one report card and re-ranks its scope.
pub fn refresh_standing(
    conn: &Connection,
    school: &SchoolScope,
    key: &ReportKey,
) -> Result<ReportTotals, GradingError> {
    let totals = recompute_report_totals(conn, &key.id)?;
    recalculate_positions(conn, &key.term_scope(school))?;
    Ok(totals)
}

fn load_position(conn: &Connection, report_id: &str) -> Result<Option<i64>, GradingError> {
    conn.query_row(
        "SELECT position FROM report_cards WHERE id = ?",
        [report_id],
        |r| r.get(0),
    )
    .map_err(GradingError::db("db_query_failed"))
}

#[derive(Debug, Clone, Default)]
pub struct ReportDetailsPatch {
    pub attendance_present: Option<i64>,
    pub attendance_total: Option<i64>,
    pub teacher_remark: Option<String>,
    pub principal_remark: Option<String>,
}

impl ReportDetailsPatch {
    pub fn from_params(params: &serde_json::Value) -> Result<Self, GradingError> {
        let patch = Self {
            attendance_present: opt_count(params, "attendancePresent")?,
            attendance_total: opt_count(params, "attendanceTotal")?,
            teacher_remark: opt_str(params, "teacherRemark")?,
            principal_remark: opt_str(params, "principalRemark")?,
        };
        if let (Some(present), Some(total)) = (patch.attendance_present, patch.attendance_total) {
            if present > total {
                return Err(GradingError::new(
                    "bad_params",
                    "attendancePresent must not exceed attendanceTotal",
                )
                .with_details(json!({ "attendancePresent": present, "attendanceTotal": total })));
            }
        }
        Ok(patch)
    }

    /// Only one attendance side supplied: check it against the stored
    /// counterpart so present never ends up above total.
    fn check_attendance(&self, conn: &Connection, report_id: &str) -> Result<(), GradingError> {
        if self.attendance_present.is_some() == self.attendance_total.is_some() {
            return Ok(());
        }
        let (present, total): (i64, i64) = conn
            .query_row(
                "SELECT attendance_present, attendance_total FROM report_cards WHERE id = ?",
                [report_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(GradingError::db("db_query_failed"))?;
        let present = self.attendance_present.unwrap_or(present);
        let total = self.attendance_total.unwrap_or(total);
        if present > total {
            return Err(GradingError::new(
                "bad_params",
                "attendancePresent must not exceed attendanceTotal",
            )
            .with_details(json!({ "attendancePresent": present, "attendanceTotal": total })));
        }
        Ok(())
    }

    fn apply(&self, conn: &Connection, report_id: &str) -> Result<(), GradingError> {
        self.check_attendance(conn, report_id)?;
        conn.execute(
            "UPDATE report_cards SET
               attendance_present = COALESCE(?, attendance_present),
               attendance_total = COALESCE(?, attendance_total),
               teacher_remark = COALESCE(?, teacher_remark),
               principal_remark = COALESCE(?, principal_remark),
               updated_at = ?
             WHERE id = ?",
            (
                self.attendance_present,
                self.attendance_total,
                self.teacher_remark.as_deref(),
                self.principal_remark.as_deref(),
                now_stamp(),
                report_id,
            ),
        )
        .map_err(|e| {
            GradingError::new("db_update_failed", e.to_string())
                .with_details(json!({ "table": "report_cards" }))
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ReportCardInput {
    pub student_id: String,
    pub class_id: Option<String>,
    pub session: String,
    pub term: String,
    pub details: ReportDetailsPatch,
    /// `None` leaves existing scores alone; `Some` replaces the whole set.
    pub scores: Option<Vec<ScoreInput>>,
}

impl ReportCardInput {
    pub fn from_params(params: &serde_json::Value) -> Result<Self, GradingError> {
        let scores = match params.get("scores") {
            None => None,
            Some(v) if v.is_null() => None,
            Some(v) => {
                let Some(arr) = v.as_array() else {
                    return Err(GradingError::new("bad_params", "scores must be an array"));
                };
                let mut out = Vec::with_capacity(arr.len());
                for (i, item) in arr.iter().enumerate() {
                    out.push(ScoreInput::from_json(item).map_err(|e| {
                        let mut details = e.details.clone().unwrap_or_else(|| json!({}));
                        details["index"] = json!(i);
                        e.with_details(details)
                    })?);
                }
                Some(out)
            }
        };
        Ok(Self {
            student_id: required(params, "studentId")?,
            class_id: opt_str(params, "classId")?
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            session: required(params, "session")?,
            term: required(params, "term")?,
            details: ReportDetailsPatch::from_params(params)?,
            scores,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOutcome {
    pub report_id: String,
    pub created: bool,
    pub total_score: f64,
    pub average: f64,
    pub position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores: Option<SyncSummary>,
}

/// Finds the report card for (student, session, term) or creates it, applies
/// the submitted details and scores, then re-aggregates and re-ranks. The
/// caller owns the transaction.
pub fn upsert_report_card(
    conn: &Connection,
    school: &SchoolScope,
    input: &ReportCardInput,
) -> Result<UpsertOutcome, GradingError> {
    let student_class = school.student_class(conn, &input.student_id)?;
    let class_id = input.class_id.clone().unwrap_or(student_class);
    school.ensure_class(conn, &class_id)?;

    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT id, class_id FROM report_cards
             WHERE student_id = ? AND session = ? AND term = ? AND school_id = ?",
            (&input.student_id, &input.session, &input.term, school.id()),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(GradingError::db("db_query_failed"))?;

    let (report_id, created, previous_class) = match existing {
        Some((id, prev_class)) => {
            conn.execute(
                "UPDATE report_cards SET class_id = ?, updated_at = ? WHERE id = ?",
                (&class_id, now_stamp(), &id),
            )
            .map_err(|e| {
                GradingError::new("db_update_failed", e.to_string())
                    .with_details(json!({ "table": "report_cards" }))
            })?;
            (id, false, Some(prev_class))
        }
        None => {
            let id = Uuid::new_v4().to_string();
            let stamp = now_stamp();
            conn.execute(
                "INSERT INTO report_cards(id, school_id, student_id, class_id, session, term, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &id,
                    school.id(),
                    &input.student_id,
                    &class_id,
                    &input.session,
                    &input.term,
                    &stamp,
                    &stamp,
                ),
            )
            .map_err(|e| {
                GradingError::new("db_insert_failed", e.to_string())
                    .with_details(json!({ "table": "report_cards" }))
            })?;
            (id, true, None)
        }
    };

    input.details.apply(conn, &report_id)?;

    let synced = match &input.scores {
        Some(scores) => Some(sync_scores(conn, school, &report_id, scores)?),
        None => None,
    };

    let key = ReportKey {
        id: report_id.clone(),
        student_id: input.student_id.clone(),
        class_id: class_id.clone(),
        session: input.session.clone(),
        term: input.term.clone(),
    };
    let totals = refresh_standing(conn, school, &key)?;

    // Moving a report card between classes leaves a gap in the old ranking.
    if let Some(prev) = previous_class.filter(|p| *p != class_id) {
        recalculate_positions(
            conn,
            &TermScope::new(school, prev, input.session.clone(), input.term.clone()),
        )?;
    }

    Ok(UpsertOutcome {
        position: load_position(conn, &report_id)?,
        report_id,
        created,
        total_score: totals.total_score,
        average: totals.average,
        scores: synced,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreWriteOutcome {
    pub score_id: String,
    pub report_id: String,
    pub total_score: f64,
    pub average: f64,
    pub position: Option<i64>,
}

pub fn upsert_score(
    conn: &Connection,
    school: &SchoolScope,
    report_id: &str,
    input: &ScoreInput,
) -> Result<ScoreWriteOutcome, GradingError> {
    let key = ReportKey::load(conn, school, report_id)?;
    let subject_id = resolve_subject(conn, school, &input.subject)?;
    let score_id = write_score(conn, &key.id, &subject_id, input)?;
    let totals = refresh_standing(conn, school, &key)?;
    Ok(ScoreWriteOutcome {
        score_id,
        position: load_position(conn, &key.id)?,
        report_id: key.id,
        total_score: totals.total_score,
        average: totals.average,
    })
}

pub fn delete_score(
    conn: &Connection,
    school: &SchoolScope,
    score_id: &str,
) -> Result<ScoreWriteOutcome, GradingError> {
    let report_id: Option<String> = conn
        .query_row(
            "SELECT sc.report_card_id
             FROM subject_scores sc
             JOIN report_cards rc ON rc.id = sc.report_card_id
             WHERE sc.id = ? AND rc.school_id = ?",
            (score_id, school.id()),
            |r| r.get(0),
        )
        .optional()
        .map_err(GradingError::db("db_query_failed"))?;
    let Some(report_id) = report_id else {
        return Err(GradingError::new("not_found", "score not found")
            .with_details(json!({ "scoreId": score_id })));
    };
    let key = ReportKey::load(conn, school, &report_id)?;

    conn.execute("DELETE FROM subject_scores WHERE id = ?", [score_id])
        .map_err(|e| {
            GradingError::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "subject_scores" }))
        })?;

    let totals = refresh_standing(conn, school, &key)?;
    Ok(ScoreWriteOutcome {
        score_id: score_id.to_string(),
        position: load_position(conn, &key.id)?,
        report_id: key.id,
        total_score: totals.total_score,
        average: totals.average,
    })
}

/// Deletes a report card with its scores and re-ranks what remains of its
/// scope. Returns the number of report cards re-ranked.
pub fn delete_report_card(
    conn: &Connection,
    school: &SchoolScope,
    report_id: &str,
) -> Result<usize, GradingError> {
    let key = ReportKey::load(conn, school, report_id)?;
    conn.execute(
        "DELETE FROM subject_scores WHERE report_card_id = ?",
        [&key.id],
    )
    .map_err(|e| {
        GradingError::new("db_delete_failed", e.to_string())
            .with_details(json!({ "table": "subject_scores" }))
    })?;
    conn.execute("DELETE FROM report_cards WHERE id = ?", [&key.id])
        .map_err(|e| {
            GradingError::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "report_cards" }))
        })?;
    tracing::info!(report_id = %key.id, student_id = %key.student_id, "report card deleted");
    recalculate_positions(conn, &key.term_scope(school))
}

pub fn update_report_details(
    conn: &Connection,
    school: &SchoolScope,
    report_id: &str,
    patch: &ReportDetailsPatch,
) -> Result<(), GradingError> {
    let key = ReportKey::load(conn, school, report_id)?;
    patch.apply(conn, &key.id)
}

/// Sets or clears the promotion flag; returns the stored timestamp.
pub fn set_promotion(
    conn: &Connection,
    school: &SchoolScope,
    report_id: &str,
    promoted: bool,
) -> Result<Option<String>, GradingError> {
    let key = ReportKey::load(conn, school, report_id)?;
    let promoted_at = promoted.then(now_stamp);
    conn.execute(
        "UPDATE report_cards SET is_promoted = ?, promoted_at = ?, updated_at = ? WHERE id = ?",
        (promoted as i64, promoted_at.as_deref(), now_stamp(), &key.id),
    )
    .map_err(|e| {
        GradingError::new("db_update_failed", e.to_string())
            .with_details(json!({ "table": "report_cards" }))
    })?;
    tracing::info!(report_id = %key.id, promoted, "promotion updated");
    Ok(promoted_at)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreView {
    pub id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub ca1: f64,
    pub ca2: f64,
    pub exam: f64,
    pub total: f64,
    pub grade: Option<String>,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardView {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub class_id: String,
    pub session: String,
    pub term: String,
    pub total_score: f64,
    pub average: f64,
    pub position: Option<i64>,
    pub attendance_present: i64,
    pub attendance_total: i64,
    pub teacher_remark: String,
    pub principal_remark: String,
    pub is_promoted: bool,
    pub promoted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores: Option<Vec<ScoreView>>,
}

const REPORT_VIEW_SELECT: &str = "SELECT rc.id, rc.student_id, st.first_name, st.last_name, rc.class_id,
        rc.session, rc.term, rc.total_score, rc.average, rc.position,
        rc.attendance_present, rc.attendance_total, rc.teacher_remark, rc.principal_remark,
        rc.is_promoted, rc.promoted_at, rc.created_at, rc.updated_at
 FROM report_cards rc
 JOIN students st ON st.id = rc.student_id";

fn report_view_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ReportCardView> {
    let first: String = r.get(2)?;
    let last: String = r.get(3)?;
    Ok(ReportCardView {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_name: format!("{} {}", first, last),
        class_id: r.get(4)?,
        session: r.get(5)?,
        term: r.get(6)?,
        total_score: r.get(7)?,
        average: r.get(8)?,
        position: r.get(9)?,
        attendance_present: r.get(10)?,
        attendance_total: r.get(11)?,
        teacher_remark: r.get(12)?,
        principal_remark: r.get(13)?,
        is_promoted: r.get::<_, i64>(14)? != 0,
        promoted_at: r.get(15)?,
        created_at: r.get(16)?,
        updated_at: r.get(17)?,
        scores: None,
    })
}

pub fn load_report_card(
    conn: &Connection,
    school: &SchoolScope,
    report_id: &str,
) -> Result<ReportCardView, GradingError> {
    let sql = format!("{} WHERE rc.id = ? AND rc.school_id = ?", REPORT_VIEW_SELECT);
    let view = conn
        .query_row(&sql, (report_id, school.id()), report_view_from_row)
        .optional()
        .map_err(GradingError::db("db_query_failed"))?;
    let Some(mut view) = view else {
        return Err(GradingError::new("not_found", "report card not found")
            .with_details(json!({ "reportId": report_id })));
    };

    let mut stmt = conn
        .prepare(
            "SELECT sc.id, sc.subject_id, sub.name, sc.ca1, sc.ca2, sc.exam, sc.total, sc.grade, sc.comment
             FROM subject_scores sc
             JOIN subjects sub ON sub.id = sc.subject_id
             WHERE sc.report_card_id = ?
             ORDER BY sub.name",
        )
        .map_err(GradingError::db("db_query_failed"))?;
    let scores = stmt
        .query_map([report_id], |r| {
            Ok(ScoreView {
                id: r.get(0)?,
                subject_id: r.get(1)?,
                subject_name: r.get(2)?,
                ca1: r.get(3)?,
                ca2: r.get(4)?,
                exam: r.get(5)?,
                total: r.get(6)?,
                grade: r.get(7)?,
                comment: r.get(8)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(GradingError::db("db_query_failed"))?;
    view.scores = Some(scores);
    Ok(view)
}

#[derive(Debug, Clone, Default)]
pub struct ReportFilters {
    pub class_id: Option<String>,
    pub session: Option<String>,
    pub term: Option<String>,
}

impl ReportFilters {
    pub fn from_params(params: &serde_json::Value) -> Result<Self, GradingError> {
        let clean = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Ok(Self {
            class_id: clean(opt_str(params, "classId")?),
            session: clean(opt_str(params, "session")?),
            term: clean(opt_str(params, "term")?),
        })
    }
}

/// Lists report cards, best position first; unranked cards last.
pub fn list_report_cards(
    conn: &Connection,
    school: &SchoolScope,
    filters: &ReportFilters,
) -> Result<Vec<ReportCardView>, GradingError> {
    let sql = format!(
        "{} WHERE rc.school_id = ?1
           AND (?2 IS NULL OR rc.class_id = ?2)
           AND (?3 IS NULL OR rc.session = ?3)
           AND (?4 IS NULL OR rc.term = ?4)
         ORDER BY rc.session, rc.term, rc.class_id, rc.position IS NULL, rc.position, st.first_name, st.last_name",
        REPORT_VIEW_SELECT
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(GradingError::db("db_query_failed"))?;
    let rows = stmt
        .query_map(
            (
                school.id(),
                filters.class_id.as_deref(),
                filters.session.as_deref(),
                filters.term.as_deref(),
            ),
            report_view_from_row,
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(GradingError::db("db_query_failed"))?;
    Ok(rows)
}
