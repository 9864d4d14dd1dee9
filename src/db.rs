use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("escola.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            user_type TEXT NOT NULL,
            school_id TEXT NOT NULL,
            address TEXT,
            phone TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_user_type ON users(user_type)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            registration_number TEXT NOT NULL UNIQUE,
            phone TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL,
            number_of_grades INTEGER NOT NULL,
            passing_average REAL NOT NULL,
            recovery_average REAL NOT NULL,
            teacher_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_teacher ON subjects(teacher_id)",
        [],
    )?;

    // No UNIQUE(student_id, subject_id): the upstream service allows
    // duplicate pairs and grouping passes them through unchanged.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_subject ON grades(subject_id)",
        [],
    )?;

    // Ordered score sequence; idx is the 0-based position addressed by
    // the index-based score operations.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_scores(
            grade_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            value REAL NOT NULL,
            PRIMARY KEY(grade_id, idx),
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_scores_grade ON grade_scores(grade_id)",
        [],
    )?;

    // Existing workspaces may predate the optional contact columns.
    ensure_students_phone(&conn)?;
    ensure_users_contact_columns(&conn)?;

    Ok(conn)
}

fn ensure_students_phone(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "phone")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN phone TEXT", [])?;
    Ok(())
}

fn ensure_users_contact_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "users", "address")? {
        conn.execute("ALTER TABLE users ADD COLUMN address TEXT", [])?;
    }
    if !table_has_column(conn, "users", "phone")? {
        conn.execute("ALTER TABLE users ADD COLUMN phone TEXT", [])?;
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

/// ISO-8601 UTC timestamp used for created_at/updated_at columns.
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
