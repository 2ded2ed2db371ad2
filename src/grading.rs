use crate::tenant::SchoolScope;
use rusqlite::Connection;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Lower bounds (inclusive) of each letter grade, highest first.
pub const GRADE_THRESHOLDS: [(f64, &str); 4] = [(75.0, "A"), (65.0, "B"), (50.0, "C"), (40.0, "D")];
pub const FAILING_GRADE: &str = "F";

/// Marks carry two decimal places. Every sum is snapped back to that grid so
/// equal totals compare equal regardless of addition order.
pub fn round_marks(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GradingError {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl GradingError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Adapter for `map_err` on rusqlite calls.
    pub fn db(code: &'static str) -> impl Fn(rusqlite::Error) -> Self {
        move |e| Self::new(code, e.to_string())
    }
}

pub fn grade_for_total(total: f64) -> &'static str {
    GRADE_THRESHOLDS
        .iter()
        .find(|(min, _)| total >= *min)
        .map(|(_, grade)| *grade)
        .unwrap_or(FAILING_GRADE)
}

/// A grade is only derived when none exists yet: an explicit grade wins,
/// then whatever is already stored, then the threshold table.
pub fn resolve_grade(explicit: Option<&str>, stored: Option<&str>, total: f64) -> String {
    fn non_blank(g: Option<&str>) -> Option<&str> {
        g.map(str::trim).filter(|g| !g.is_empty())
    }
    non_blank(explicit)
        .or_else(|| non_blank(stored))
        .map(str::to_string)
        .unwrap_or_else(|| grade_for_total(total).to_string())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreComponents {
    pub ca1: f64,
    pub ca2: f64,
    pub exam: f64,
}

impl ScoreComponents {
    pub fn new(ca1: f64, ca2: f64, exam: f64) -> Result<Self, GradingError> {
        for (field, v) in [("ca1", ca1), ("ca2", ca2), ("exam", exam)] {
            if !v.is_finite() || v < 0.0 {
                return Err(
                    GradingError::new("bad_params", format!("{} must be a non-negative number", field))
                        .with_details(serde_json::json!({ "field": field, "value": v })),
                );
            }
        }
        Ok(Self { ca1, ca2, exam })
    }

    pub fn ca_total(&self) -> f64 {
        round_marks(self.ca1 + self.ca2)
    }

    pub fn total(&self) -> f64 {
        round_marks(self.ca1 + self.ca2 + self.exam)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTotals {
    pub total_score: f64,
    pub average: f64,
    pub score_count: usize,
}

pub fn aggregate_totals<I>(totals: I) -> ReportTotals
where
    I: IntoIterator<Item = f64>,
{
    let mut total_score = 0.0;
    let mut score_count = 0usize;
    for t in totals {
        total_score += t;
        score_count += 1;
    }
    let total_score = round_marks(total_score);
    let average = if score_count > 0 {
        total_score / (score_count as f64)
    } else {
        0.0
    };
    ReportTotals {
        total_score,
        average,
        score_count,
    }
}

/// Standard competition ranking ("1224") over totals fed in descending order.
#[derive(Debug, Default)]
pub struct CompetitionRanker {
    index: i64,
    rank: i64,
    prev_total: Option<f64>,
}

impl CompetitionRanker {
    pub fn next_rank(&mut self, total: f64) -> i64 {
        let total = round_marks(total);
        self.index += 1;
        match self.prev_total {
            Some(prev) if total >= prev => {}
            _ => self.rank = self.index,
        }
        self.prev_total = Some(total);
        self.rank
    }
}

/// The (class, session, term) a ranking or broadsheet request is bounded by,
/// within one school.
#[derive(Debug, Clone)]
pub struct TermScope<'a> {
    pub school: &'a SchoolScope,
    pub class_id: String,
    pub session: String,
    pub term: String,
}

impl<'a> TermScope<'a> {
    pub fn new(
        school: &'a SchoolScope,
        class_id: impl Into<String>,
        session: impl Into<String>,
        term: impl Into<String>,
    ) -> Self {
        Self {
            school,
            class_id: class_id.into(),
            session: session.into(),
            term: term.into(),
        }
    }

    /// Reads `classId`, `session` and `term`, failing with every missing
    /// field named rather than falling back to an empty scope.
    pub fn from_params(
        school: &'a SchoolScope,
        params: &serde_json::Value,
    ) -> Result<Self, GradingError> {
        let field = |key: &str| {
            params
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let class_id = field("classId");
        let session = field("session");
        let term = field("term");

        let missing: Vec<&str> = [
            ("classId", class_id.is_none()),
            ("session", session.is_none()),
            ("term", term.is_none()),
        ]
        .iter()
        .filter(|(_, absent)| *absent)
        .map(|(k, _)| *k)
        .collect();

        match (class_id, session, term) {
            (Some(class_id), Some(session), Some(term)) => {
                Ok(Self::new(school, class_id, session, term))
            }
            _ => Err(GradingError::new(
                "bad_params",
                format!("missing {}", missing.join(", ")),
            )
            .with_details(serde_json::json!({ "missing": missing }))),
        }
    }
}

/// Recomputes and stores a report card's total and average from its current
/// score records.
pub fn recompute_report_totals(
    conn: &Connection,
    report_id: &str,
) -> Result<ReportTotals, GradingError> {
    let mut stmt = conn
        .prepare("SELECT total FROM subject_scores WHERE report_card_id = ?")
        .map_err(GradingError::db("db_query_failed"))?;
    let totals = stmt
        .query_map([report_id], |r| r.get::<_, f64>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(GradingError::db("db_query_failed"))?;

    let agg = aggregate_totals(totals);
    let updated = conn
        .execute(
            "UPDATE report_cards SET total_score = ?, average = ?, updated_at = ? WHERE id = ?",
            (
                agg.total_score,
                agg.average,
                chrono::Utc::now().to_rfc3339(),
                report_id,
            ),
        )
        .map_err(GradingError::db("db_update_failed"))?;
    if updated == 0 {
        return Err(GradingError::new("not_found", "report card not found")
            .with_details(serde_json::json!({ "reportId": report_id })));
    }
    Ok(agg)
}

/// Re-ranks every report card in scope. Returns how many were ranked; an
/// empty scope is not an error.
pub fn recalculate_positions(conn: &Connection, scope: &TermScope<'_>) -> Result<usize, GradingError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, total_score
             FROM report_cards
             WHERE school_id = ? AND class_id = ? AND session = ? AND term = ?
             ORDER BY total_score DESC, average DESC, id",
        )
        .map_err(GradingError::db("db_query_failed"))?;
    let rows = stmt
        .query_map(
            (scope.school.id(), &scope.class_id, &scope.session, &scope.term),
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(GradingError::db("db_query_failed"))?;

    let mut ranker = CompetitionRanker::default();
    for (id, total) in &rows {
        let rank = ranker.next_rank(*total);
        conn.execute(
            "UPDATE report_cards SET position = ? WHERE id = ?",
            (rank, id),
        )
        .map_err(GradingError::db("db_update_failed"))?;
    }

    tracing::info!(
        school_id = scope.school.id(),
        class_id = %scope.class_id,
        session = %scope.session,
        term = %scope.term,
        ranked = rows.len(),
        "recalculated positions"
    );
    Ok(rows.len())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadsheetCell {
    pub ca_total: f64,
    pub exam: f64,
    pub total: f64,
    pub grade: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadsheetStudent {
    pub student_id: String,
    pub student_name: String,
    pub student_no: Option<String>,
    pub subjects: BTreeMap<String, BroadsheetCell>,
    pub grand_total: f64,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Broadsheet {
    pub school_name: String,
    pub subjects: Vec<String>,
    pub students: Vec<BroadsheetStudent>,
    pub class_id: String,
    pub session: String,
    pub term: String,
}

impl Broadsheet {
    /// Writes one CSV row per student: number, name, each subject's total
    /// (blank when the student has no record for it), grand total, position.
    /// Returns the number of student rows written.
    pub fn write_csv<W: std::io::Write>(&self, out: W) -> Result<usize, csv::Error> {
        let mut w = csv::Writer::from_writer(out);
        let mut header: Vec<&str> = vec!["studentNo", "studentName"];
        header.extend(self.subjects.iter().map(String::as_str));
        header.extend(["grandTotal", "position"]);
        w.write_record(&header)?;

        for student in &self.students {
            let mut record: Vec<String> = Vec::with_capacity(header.len());
            record.push(student.student_no.clone().unwrap_or_default());
            record.push(student.student_name.clone());
            for subject in &self.subjects {
                record.push(
                    student
                        .subjects
                        .get(subject)
                        .map(|cell| cell.total.to_string())
                        .unwrap_or_default(),
                );
            }
            record.push(student.grand_total.to_string());
            record.push(student.position.to_string());
            w.write_record(&record)?;
        }
        w.flush()?;
        Ok(self.students.len())
    }
}

/// One score record joined with its student and subject.
#[derive(Debug, Clone)]
pub struct BroadsheetScoreRow {
    pub student_id: String,
    pub student_name: String,
    pub student_no: Option<String>,
    pub subject_name: String,
    pub components: ScoreComponents,
    pub total: f64,
    pub grade: Option<String>,
}

/// Pivots score rows into one row per student. Grand totals are summed here
/// from the rows themselves, not read from the stored report totals, and
/// positions are plain order (no shared ranks on ties).
pub fn pivot_broadsheet(rows: Vec<BroadsheetScoreRow>, scope: &TermScope<'_>) -> Broadsheet {
    let mut subjects: BTreeSet<String> = BTreeSet::new();
    let mut by_student: HashMap<String, usize> = HashMap::new();
    let mut students: Vec<BroadsheetStudent> = Vec::new();

    for row in rows {
        subjects.insert(row.subject_name.clone());
        let idx = *by_student.entry(row.student_id.clone()).or_insert_with(|| {
            students.push(BroadsheetStudent {
                student_id: row.student_id.clone(),
                student_name: row.student_name.clone(),
                student_no: row.student_no.clone(),
                subjects: BTreeMap::new(),
                grand_total: 0.0,
                position: 0,
            });
            students.len() - 1
        });
        let student = &mut students[idx];
        student.grand_total += row.total;
        student.subjects.insert(
            row.subject_name,
            BroadsheetCell {
                ca_total: row.components.ca_total(),
                exam: row.components.exam,
                total: row.total,
                grade: row.grade,
            },
        );
    }

    for student in &mut students {
        student.grand_total = round_marks(student.grand_total);
    }
    students.sort_by(|a, b| a.student_name.cmp(&b.student_name));

    let mut order: Vec<usize> = (0..students.len()).collect();
    order.sort_by(|&a, &b| {
        students[b]
            .grand_total
            .partial_cmp(&students[a].grand_total)
            .unwrap_or(Ordering::Equal)
    });
    for (pos, idx) in order.into_iter().enumerate() {
        students[idx].position = pos as i64 + 1;
    }

    Broadsheet {
        school_name: scope.school.name().to_string(),
        subjects: subjects.into_iter().collect(),
        students,
        class_id: scope.class_id.clone(),
        session: scope.session.clone(),
        term: scope.term.clone(),
    }
}

/// Builds the broadsheet for a class. Membership is the student's current
/// class, not the class recorded on the report card.
pub fn build_broadsheet(conn: &Connection, scope: &TermScope<'_>) -> Result<Broadsheet, GradingError> {
    scope.school.ensure_class(conn, &scope.class_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT st.id, st.first_name, st.last_name, st.student_no, sub.name,
                    sc.ca1, sc.ca2, sc.exam, sc.total, sc.grade
             FROM subject_scores sc
             JOIN report_cards rc ON rc.id = sc.report_card_id
             JOIN students st ON st.id = rc.student_id
             JOIN subjects sub ON sub.id = sc.subject_id
             WHERE rc.school_id = ? AND st.class_id = ? AND rc.session = ? AND rc.term = ?
             ORDER BY st.id, sub.name",
        )
        .map_err(GradingError::db("db_query_failed"))?;
    let rows = stmt
        .query_map(
            (scope.school.id(), &scope.class_id, &scope.session, &scope.term),
            |r| {
                let first: String = r.get(1)?;
                let last: String = r.get(2)?;
                Ok(BroadsheetScoreRow {
                    student_id: r.get(0)?,
                    student_name: format!("{} {}", first, last),
                    student_no: r.get(3)?,
                    subject_name: r.get(4)?,
                    components: ScoreComponents {
                        ca1: r.get(5)?,
                        ca2: r.get(6)?,
                        exam: r.get(7)?,
                    },
                    total: r.get(8)?,
                    grade: r.get(9)?,
                })
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(GradingError::db("db_query_failed"))?;

    Ok(pivot_broadsheet(rows, scope))
}
