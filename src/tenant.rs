use crate::grading::GradingError;
use rusqlite::{Connection, OptionalExtension};

/// The school a request acts on. Resolved once per request from
/// `params.schoolId` and passed explicitly to every grading call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchoolScope {
    school_id: String,
    name: String,
}

impl SchoolScope {
    pub fn resolve(conn: &Connection, school_id: &str) -> Result<Self, GradingError> {
        let school_id = school_id.trim();
        if school_id.is_empty() {
            return Err(GradingError::new("bad_params", "missing schoolId"));
        }
        let name: Option<String> = conn
            .query_row("SELECT name FROM schools WHERE id = ?", [school_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(GradingError::db("db_query_failed"))?;
        match name {
            Some(name) => Ok(Self {
                school_id: school_id.to_string(),
                name,
            }),
            None => Err(GradingError::new("not_found", "school not found")
                .with_details(serde_json::json!({ "schoolId": school_id }))),
        }
    }

    pub fn id(&self) -> &str {
        &self.school_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fails with `not_found` unless the class belongs to this school.
    pub fn ensure_class(&self, conn: &Connection, class_id: &str) -> Result<(), GradingError> {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM classes WHERE id = ? AND school_id = ?",
                (class_id, &self.school_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(GradingError::db("db_query_failed"))?;
        if exists.is_none() {
            return Err(GradingError::new("not_found", "class not found")
                .with_details(serde_json::json!({ "classId": class_id })));
        }
        Ok(())
    }

    /// Returns the student's current class.
    pub fn student_class(&self, conn: &Connection, student_id: &str) -> Result<String, GradingError> {
        let class_id: Option<String> = conn
            .query_row(
                "SELECT class_id FROM students WHERE id = ? AND school_id = ?",
                (student_id, &self.school_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(GradingError::db("db_query_failed"))?;
        class_id.ok_or_else(|| {
            GradingError::new("not_found", "student not found")
                .with_details(serde_json::json!({ "studentId": student_id }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn resolve_rejects_unknown_and_blank_schools() {
        let conn = Connection::open_in_memory().expect("open db");
        db::init_schema(&conn).expect("schema");
        conn.execute(
            "INSERT INTO schools(id, name, created_at) VALUES('s1', 'Hillcrest', '2025-01-01T00:00:00Z')",
            [],
        )
        .expect("insert school");

        let scope = SchoolScope::resolve(&conn, " s1 ").expect("resolve");
        assert_eq!(scope.id(), "s1");
        assert_eq!(scope.name(), "Hillcrest");

        assert_eq!(SchoolScope::resolve(&conn, "").unwrap_err().code, "bad_params");
        assert_eq!(SchoolScope::resolve(&conn, "s2").unwrap_err().code, "not_found");
        assert_eq!(
            scope.ensure_class(&conn, "missing").unwrap_err().code,
            "not_found"
        );
    }
}
