use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn row_exists(
    conn: &Connection,
    sql: &str,
    id: &str,
) -> Result<bool, rusqlite::Error> {
    Ok(conn
        .query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };
    // Hashing is the identity component's job; we only store what we're given.
    let password_hash = match required_str(req, "passwordHash") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = optional_str(req, "lastName");
    let department = optional_str(req, "department");

    let teacher_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, first_name, last_name, email, password_hash, department)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &teacher_id,
            &first_name,
            &last_name,
            &email,
            &password_hash,
            &department,
        ),
    ) {
        if is_constraint_violation(&e) {
            return err(&req.id, "conflict", "teacher email already exists", None);
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teachers" })),
        );
    }

    ok(&req.id, json!({ "teacherId": teacher_id }))
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "teachers": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT id, first_name, COALESCE(last_name, ''), email, department
         FROM teachers ORDER BY first_name, last_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let first_name: String = row.get(1)?;
            let last_name: String = row.get(2)?;
            let email: String = row.get(3)?;
            let department: Option<String> = row.get(4)?;
            let name = format!("{} {}", first_name, last_name).trim().to_string();
            Ok(json!({
                "id": id,
                "name": name,
                "email": email,
                "department": department
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let password_hash = match required_str(req, "passwordHash") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let roll_number = match required_str(req, "rollNumber") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let branch_id = match required_str(req, "branchId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year_id = match required_str(req, "yearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester_id = match required_str(req, "semesterId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    for (sql, id, what) in [
        ("SELECT 1 FROM branches WHERE id = ?", &branch_id, "branch"),
        ("SELECT 1 FROM academic_years WHERE id = ?", &year_id, "year"),
        ("SELECT 1 FROM semesters WHERE id = ?", &semester_id, "semester"),
    ] {
        match row_exists(conn, sql, id) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    format!("{} not found", what),
                    Some(json!({ "id": id })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, first_name, email, password_hash, roll_number,
           branch_id, year_id, semester_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &first_name,
            &email,
            &password_hash,
            &roll_number,
            &branch_id,
            &year_id,
            &semester_id,
        ),
    ) {
        if is_constraint_violation(&e) {
            return err(
                &req.id,
                "conflict",
                "student email or roll number already exists",
                None,
            );
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT id, first_name, email, roll_number, branch_id, year_id, semester_id
         FROM students ORDER BY roll_number",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let first_name: String = row.get(1)?;
            let email: String = row.get(2)?;
            let roll_number: String = row.get(3)?;
            let branch_id: String = row.get(4)?;
            let year_id: String = row.get(5)?;
            let semester_id: String = row.get(6)?;
            Ok(json!({
                "id": id,
                "name": first_name,
                "email": email,
                "rollNumber": roll_number,
                "branchId": branch_id,
                "yearId": year_id,
                "semesterId": semester_id
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_admins_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let username = match required_str(req, "username") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let password_hash = match required_str(req, "passwordHash") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let admin_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO admins(id, username, password_hash) VALUES(?, ?, ?)",
        (&admin_id, &username, &password_hash),
    ) {
        if is_constraint_violation(&e) {
            return err(&req.id, "conflict", "admin username already exists", None);
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "admins" })),
        );
    }

    ok(&req.id, json!({ "adminId": admin_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "students.register" => Some(handle_students_register(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "admins.create" => Some(handle_admins_create(state, req)),
        _ => None,
    }
}
