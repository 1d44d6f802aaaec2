use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::stats;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }
}

fn handler_err(req: &Request, e: HandlerErr) -> serde_json::Value {
    err(&req.id, e.code, e.message, e.details)
}

fn required_str(req: &Request, key: &str) -> Result<String, HandlerErr> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

// Every rating dimension must be an integer in [1,5]. Anything else is a
// validation failure before any row is touched.
fn required_rating(req: &Request, key: &str) -> Result<i64, HandlerErr> {
    let Some(v) = req.params.get(key) else {
        return Err(HandlerErr::new("bad_params", format!("missing {}", key)));
    };
    let Some(n) = v.as_i64() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must be an integer", key),
            details: Some(json!({ key: v })),
        });
    };
    if !(1..=5).contains(&n) {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must be between 1 and 5", key),
            details: Some(json!({ key: n })),
        });
    }
    Ok(n)
}

fn optional_rating(req: &Request, key: &str) -> Result<Option<i64>, HandlerErr> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(_) => required_rating(req, key).map(Some),
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn resolve_assignment_teacher(
    conn: &Connection,
    assignment_id: &str,
) -> Result<String, HandlerErr> {
    let teacher_id: Option<String> = conn
        .query_row(
            "SELECT teacher_id FROM teacher_assignments WHERE id = ?",
            [assignment_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    teacher_id.ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "assignment not found".to_string(),
        details: Some(json!({ "assignmentId": assignment_id })),
    })
}

fn handle_feedback_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };
    let rating_knowledge = match required_rating(req, "ratingKnowledge") {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };
    let rating_communication = match required_rating(req, "ratingCommunication") {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };
    let rating_punctuality = match required_rating(req, "ratingPunctuality") {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };
    let rating_overall = match required_rating(req, "ratingOverall") {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };
    let comment = optional_str(req, "comment");
    let origin_addr = optional_str(req, "originAddr");
    let client_info = optional_str(req, "clientInfo");

    let student_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_exists.is_none() {
        return err(
            &req.id,
            "not_found",
            "student not found",
            Some(json!({ "studentId": student_id })),
        );
    }

    let teacher_id = match resolve_assignment_teacher(conn, &assignment_id) {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };

    // Duplicate check, insert, and recompute are one unit of work: either the
    // ledger and the cache both move, or neither does.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let already: Option<i64> = match tx
        .query_row(
            "SELECT 1 FROM feedbacks WHERE assignment_id = ? AND student_id = ?",
            (&assignment_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    };
    if already.is_some() {
        let _ = tx.rollback();
        return err(
            &req.id,
            "duplicate_submission",
            "student has already submitted feedback for this assignment",
            Some(json!({ "studentId": student_id, "assignmentId": assignment_id })),
        );
    }

    let feedback_id = Uuid::new_v4().to_string();
    let submitted_at = chrono::Utc::now().to_rfc3339();
    if let Err(e) = tx.execute(
        "INSERT INTO feedbacks(id, assignment_id, student_id,
           rating_knowledge, rating_communication, rating_punctuality, rating_overall,
           comment, submitted_at, origin_addr, client_info)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &feedback_id,
            &assignment_id,
            &student_id,
            rating_knowledge,
            rating_communication,
            rating_punctuality,
            rating_overall,
            &comment,
            &submitted_at,
            &origin_addr,
            &client_info,
        ),
    ) {
        let _ = tx.rollback();
        // Uniqueness backstop: a writer that lost the race gets a recoverable
        // conflict, not a crash.
        if is_constraint_violation(&e) {
            return err(
                &req.id,
                "conflict",
                "a concurrent submission already exists for this pair",
                Some(json!({ "studentId": student_id, "assignmentId": assignment_id })),
            );
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "feedbacks" })),
        );
    }

    if let Err(e) = stats::recompute_teacher_stats(&tx, &teacher_id) {
        let _ = tx.rollback();
        return err(&req.id, &e.code, e.message, e.details);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "feedbackId": feedback_id }))
}

// Administrative correction path. Ratings are re-validated, but the
// duplicate-submission invariant is not re-checked (the pair itself cannot
// change here).
fn handle_feedback_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let feedback_id = match required_str(req, "feedbackId") {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };

    let ratings = [
        ("ratingKnowledge", "rating_knowledge"),
        ("ratingCommunication", "rating_communication"),
        ("ratingPunctuality", "rating_punctuality"),
        ("ratingOverall", "rating_overall"),
    ];
    let mut updates: Vec<(&str, i64)> = Vec::new();
    for (key, col) in ratings {
        match optional_rating(req, key) {
            Ok(Some(v)) => updates.push((col, v)),
            Ok(None) => {}
            Err(e) => return handler_err(req, e),
        }
    }
    let comment = req.params.get("comment").map(|v| v.as_str().map(String::from));
    if updates.is_empty() && comment.is_none() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    let assignment_id: Option<String> = match conn
        .query_row(
            "SELECT assignment_id FROM feedbacks WHERE id = ?",
            [&feedback_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(assignment_id) = assignment_id else {
        return err(&req.id, "not_found", "feedback not found", None);
    };
    let teacher_id = match resolve_assignment_teacher(conn, &assignment_id) {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    for (col, v) in &updates {
        if let Err(e) = tx.execute(
            &format!("UPDATE feedbacks SET {} = ? WHERE id = ?", col),
            (*v, &feedback_id),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "feedbacks" })),
            );
        }
    }
    if let Some(comment) = comment {
        if let Err(e) = tx.execute(
            "UPDATE feedbacks SET comment = ? WHERE id = ?",
            (&comment, &feedback_id),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "feedbacks" })),
            );
        }
    }

    if let Err(e) = stats::recompute_teacher_stats(&tx, &teacher_id) {
        let _ = tx.rollback();
        return err(&req.id, &e.code, e.message, e.details);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "feedbackId": feedback_id }))
}

fn handle_feedback_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let feedback_id = match required_str(req, "feedbackId") {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };

    let assignment_id: Option<String> = match conn
        .query_row(
            "SELECT assignment_id FROM feedbacks WHERE id = ?",
            [&feedback_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(assignment_id) = assignment_id else {
        return err(&req.id, "not_found", "feedback not found", None);
    };
    let teacher_id = match resolve_assignment_teacher(conn, &assignment_id) {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute("DELETE FROM feedbacks WHERE id = ?", [&feedback_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "feedbacks" })),
        );
    }

    if let Err(e) = stats::recompute_teacher_stats(&tx, &teacher_id) {
        let _ = tx.rollback();
        return err(&req.id, &e.code, e.message, e.details);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "feedbackId": feedback_id }))
}

fn handle_feedback_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "feedbacks": [] }));
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, student_id, rating_knowledge, rating_communication,
                rating_punctuality, rating_overall, comment, submitted_at
         FROM feedbacks
         WHERE assignment_id = ?
         ORDER BY submitted_at",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&assignment_id], |row| {
            let id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let rating_knowledge: i64 = row.get(2)?;
            let rating_communication: i64 = row.get(3)?;
            let rating_punctuality: i64 = row.get(4)?;
            let rating_overall: i64 = row.get(5)?;
            let comment: Option<String> = row.get(6)?;
            let submitted_at: String = row.get(7)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "ratingKnowledge": rating_knowledge,
                "ratingCommunication": rating_communication,
                "ratingPunctuality": rating_punctuality,
                "ratingOverall": rating_overall,
                "comment": comment,
                "submittedAt": submitted_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(feedbacks) => ok(&req.id, json!({ "feedbacks": feedbacks })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn teacher_exists(conn: &Connection, teacher_id: &str) -> Result<bool, rusqlite::Error> {
    Ok(conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

fn handle_stats_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };
    match teacher_exists(conn, &teacher_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    match stats::cached_teacher_stats(conn, &teacher_id) {
        Ok(s) => ok(&req.id, json!(s)),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_stats_recompute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return handler_err(req, e),
    };
    match teacher_exists(conn, &teacher_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    match stats::recompute_teacher_stats(conn, &teacher_id) {
        Ok(s) => ok(&req.id, json!(s)),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "feedback.submit" => Some(handle_feedback_submit(state, req)),
        "feedback.update" => Some(handle_feedback_update(state, req)),
        "feedback.delete" => Some(handle_feedback_delete(state, req)),
        "feedback.list" => Some(handle_feedback_list(state, req)),
        "stats.get" => Some(handle_stats_get(state, req)),
        "stats.recompute" => Some(handle_stats_recompute(state, req)),
        _ => None,
    }
}
