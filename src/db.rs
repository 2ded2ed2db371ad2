use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "reportcard.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            teacher_name TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_school ON classes(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subjects(
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(class_id, subject_id),
            FOREIGN KEY(class_id) REFERENCES classes(id) ON DELETE CASCADE,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            student_no TEXT,
            updated_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_school ON students(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS report_cards(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            session TEXT NOT NULL,
            term TEXT NOT NULL,
            total_score REAL NOT NULL DEFAULT 0,
            average REAL NOT NULL DEFAULT 0,
            position INTEGER,
            attendance_present INTEGER NOT NULL DEFAULT 0,
            attendance_total INTEGER NOT NULL DEFAULT 0,
            teacher_remark TEXT NOT NULL DEFAULT '',
            principal_remark TEXT NOT NULL DEFAULT '',
            is_promoted INTEGER NOT NULL DEFAULT 0,
            promoted_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(student_id, session, term)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_report_cards_scope
         ON report_cards(school_id, class_id, session, term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_scores(
            id TEXT PRIMARY KEY,
            report_card_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            ca1 REAL NOT NULL DEFAULT 0,
            ca2 REAL NOT NULL DEFAULT 0,
            exam REAL NOT NULL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            grade TEXT,
            comment TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(report_card_id) REFERENCES report_cards(id) ON DELETE CASCADE,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(report_card_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_scores_report ON subject_scores(report_card_id)",
        [],
    )?;

    // Workspaces created before attendance tracking lack these columns.
    ensure_report_cards_attendance(conn)?;

    Ok(())
}

fn ensure_report_cards_attendance(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "report_cards", "attendance_present")? {
        conn.execute(
            "ALTER TABLE report_cards ADD COLUMN attendance_present INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "report_cards", "attendance_total")? {
        conn.execute(
            "ALTER TABLE report_cards ADD COLUMN attendance_total INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
