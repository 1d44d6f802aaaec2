use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("feedback.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS branches(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semesters(
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL UNIQUE,
            ordinal INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            department TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            roll_number TEXT NOT NULL UNIQUE,
            branch_id TEXT NOT NULL,
            year_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(year_id) REFERENCES academic_years(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_group ON students(branch_id, year_id, semester_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS admins(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL
        )",
        [],
    )?;

    // session_label defaults to '' rather than NULL so the uniqueness
    // constraint actually bites (SQLite treats NULLs in UNIQUE as distinct).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_assignments(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            year_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            session_label TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(year_id) REFERENCES academic_years(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            UNIQUE(teacher_id, subject_id, branch_id, year_id, semester_id, session_label)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_teacher ON teacher_assignments(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_group
         ON teacher_assignments(branch_id, year_id, semester_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feedbacks(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            rating_knowledge INTEGER NOT NULL,
            rating_communication INTEGER NOT NULL,
            rating_punctuality INTEGER NOT NULL,
            rating_overall INTEGER NOT NULL,
            comment TEXT,
            submitted_at TEXT NOT NULL,
            origin_addr TEXT,
            client_info TEXT,
            FOREIGN KEY(assignment_id) REFERENCES teacher_assignments(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(assignment_id, student_id)
        )",
        [],
    )?;
    ensure_feedbacks_provenance(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedbacks_assignment ON feedbacks(assignment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedbacks_student ON feedbacks(student_id)",
        [],
    )?;

    // Aggregate cache, one row per teacher, written only by
    // stats::recompute_teacher_stats.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_stats(
            teacher_id TEXT PRIMARY KEY,
            avg_overall REAL NOT NULL,
            avg_knowledge REAL NOT NULL,
            avg_communication REAL NOT NULL,
            avg_punctuality REAL NOT NULL,
            total_feedbacks INTEGER NOT NULL,
            computed_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    Ok(conn)
}

// Early workspaces stored feedback without request provenance. Add the
// columns if missing.
fn ensure_feedbacks_provenance(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "feedbacks", "origin_addr")? {
        conn.execute("ALTER TABLE feedbacks ADD COLUMN origin_addr TEXT", [])?;
    }
    if !table_has_column(conn, "feedbacks", "client_info")? {
        conn.execute("ALTER TABLE feedbacks ADD COLUMN client_info TEXT", [])?;
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
