use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::stats;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
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

fn row_exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, rusqlite::Error> {
    Ok(conn
        .query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

fn handle_assignments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
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
    // Stored as '' when absent so the tuple uniqueness constraint applies.
    let session_label = optional_str(req, "sessionLabel").unwrap_or_default();

    for (sql, id, what) in [
        ("SELECT 1 FROM teachers WHERE id = ?", &teacher_id, "teacher"),
        ("SELECT 1 FROM subjects WHERE id = ?", &subject_id, "subject"),
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

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teacher_assignments(id, teacher_id, subject_id, branch_id,
           year_id, semester_id, session_label, active)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1)",
        (
            &assignment_id,
            &teacher_id,
            &subject_id,
            &branch_id,
            &year_id,
            &semester_id,
            &session_label,
        ),
    ) {
        if is_constraint_violation(&e) {
            return err(
                &req.id,
                "conflict",
                "an identical assignment already exists",
                None,
            );
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teacher_assignments" })),
        );
    }

    ok(&req.id, json!({ "assignmentId": assignment_id }))
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "assignments": [] }));
    };

    let mut sql = String::from(
        "SELECT ta.id, ta.teacher_id,
                t.first_name || ' ' || COALESCE(t.last_name, ''),
                ta.subject_id, s.code, s.name,
                ta.branch_id, ta.year_id, ta.semester_id,
                ta.session_label, ta.active
         FROM teacher_assignments ta
         JOIN teachers t ON t.id = ta.teacher_id
         JOIN subjects s ON s.id = ta.subject_id
         WHERE 1 = 1",
    );
    let mut params: Vec<Value> = Vec::new();
    for (key, col) in [
        ("teacherId", "ta.teacher_id"),
        ("branchId", "ta.branch_id"),
        ("yearId", "ta.year_id"),
        ("semesterId", "ta.semester_id"),
    ] {
        if let Some(v) = optional_str(req, key) {
            sql.push_str(&format!(" AND {} = ?", col));
            params.push(Value::Text(v));
        }
    }
    sql.push_str(" ORDER BY s.code, t.first_name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(params), |row| {
            let id: String = row.get(0)?;
            let teacher_id: String = row.get(1)?;
            let teacher_name: String = row.get(2)?;
            let subject_id: String = row.get(3)?;
            let subject_code: String = row.get(4)?;
            let subject_name: String = row.get(5)?;
            let branch_id: String = row.get(6)?;
            let year_id: String = row.get(7)?;
            let semester_id: String = row.get(8)?;
            let session_label: String = row.get(9)?;
            let active: i64 = row.get(10)?;
            Ok(json!({
                "id": id,
                "teacherId": teacher_id,
                "teacherName": teacher_name.trim(),
                "subjectId": subject_id,
                "subjectCode": subject_code,
                "subjectName": subject_name,
                "branchId": branch_id,
                "yearId": year_id,
                "semesterId": semester_id,
                "sessionLabel": session_label,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assignments_set_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let active = match req.params.get("active").and_then(|v| v.as_bool()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing active", None),
    };

    let updated = match conn.execute(
        "UPDATE teacher_assignments SET active = ? WHERE id = ?",
        (active as i64, &assignment_id),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "teacher_assignments" })),
            )
        }
    };
    if updated == 0 {
        return err(&req.id, "not_found", "assignment not found", None);
    }

    ok(&req.id, json!({ "assignmentId": assignment_id, "active": active }))
}

fn handle_assignments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let force = req
        .params
        .get("force")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let teacher_id: Option<String> = match conn
        .query_row(
            "SELECT teacher_id FROM teacher_assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(teacher_id) = teacher_id else {
        return err(&req.id, "not_found", "assignment not found", None);
    };

    let feedback_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM feedbacks WHERE assignment_id = ?",
        [&assignment_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if feedback_count > 0 && !force {
        return err(
            &req.id,
            "conflict",
            "assignment has feedback; pass force to cascade",
            Some(json!({ "feedbackCount": feedback_count })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute("DELETE FROM feedbacks WHERE assignment_id = ?", [&assignment_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "feedbacks" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM teacher_assignments WHERE id = ?",
        [&assignment_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "teacher_assignments" })),
        );
    }

    // The ledger changed for this teacher, so the cache must follow before
    // anything commits.
    if let Err(e) = stats::recompute_teacher_stats(&tx, &teacher_id) {
        let _ = tx.rollback();
        return err(&req.id, &e.code, e.message, e.details);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "assignmentId": assignment_id, "deletedFeedbacks": feedback_count }),
    )
}

// What a logged-in student sees: the active assignments of their own
// branch/year/semester group, ready to rate.
fn handle_students_dashboard(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match row_exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut stmt = match conn.prepare(
        "SELECT ta.id, s.code, s.name,
                t.first_name || ' ' || COALESCE(t.last_name, ''),
                ta.session_label
         FROM students st
         JOIN teacher_assignments ta
           ON ta.branch_id = st.branch_id
          AND ta.year_id = st.year_id
          AND ta.semester_id = st.semester_id
         JOIN subjects s ON s.id = ta.subject_id
         JOIN teachers t ON t.id = ta.teacher_id
         WHERE st.id = ? AND ta.active = 1
         ORDER BY s.code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&student_id], |row| {
            let assignment_id: String = row.get(0)?;
            let subject_code: String = row.get(1)?;
            let subject_name: String = row.get(2)?;
            let teacher_name: String = row.get(3)?;
            let session_label: String = row.get(4)?;
            Ok(json!({
                "assignmentId": assignment_id,
                "subjectCode": subject_code,
                "subjectName": subject_name,
                "teacherName": teacher_name.trim(),
                "sessionLabel": session_label
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.create" => Some(handle_assignments_create(state, req)),
        "assignments.list" => Some(handle_assignments_list(state, req)),
        "assignments.setActive" => Some(handle_assignments_set_active(state, req)),
        "assignments.delete" => Some(handle_assignments_delete(state, req)),
        "students.dashboard" => Some(handle_students_dashboard(state, req)),
        _ => None,
    }
}
