use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::stats;
use rusqlite::Connection;
use serde_json::json;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn stats_err(req: &Request, e: stats::StatsError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

fn handle_teacher_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let filters = match stats::parse_summary_filters(&req.params) {
        Ok(v) => v,
        Err(e) => return stats_err(req, e),
    };

    match stats::compute_teacher_summary(conn, &teacher_id, &filters) {
        Ok(summary) => ok(&req.id, json!(summary)),
        Err(e) => stats_err(req, e),
    }
}

fn handle_top_teachers(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let limit = match req.params.get("limit").and_then(|v| v.as_i64()) {
        Some(v) if v > 0 => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                "limit must be a positive integer",
                Some(json!({ "limit": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing limit", None),
    };

    match stats::top_teachers(conn, limit) {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => stats_err(req, e),
    }
}

fn handle_group_ranks(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let branch_id = match req.params.get("branchId") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(_) => None,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "branchId must be a string or null",
                    None,
                )
            }
        },
    };

    match stats::rank_within_groups(conn, branch_id.as_deref()) {
        Ok(ranks) => ok(&req.id, json!({ "ranks": ranks })),
        Err(e) => stats_err(req, e),
    }
}

// Admin landing view: every teacher assigned in the group, with subject and
// cached stats (zeros until the teacher's first feedback lands).
fn handle_admin_dashboard(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
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

    let mut stmt = match conn.prepare(
        "SELECT t.id,
                t.first_name || ' ' || COALESCE(t.last_name, ''),
                s.id, s.name,
                COALESCE(ts.avg_overall, 0.0),
                COALESCE(ts.total_feedbacks, 0)
         FROM teacher_assignments ta
         JOIN teachers t ON t.id = ta.teacher_id
         JOIN subjects s ON s.id = ta.subject_id
         LEFT JOIN teacher_stats ts ON ts.teacher_id = t.id
         WHERE ta.branch_id = ? AND ta.year_id = ? AND ta.semester_id = ?
         ORDER BY s.name, t.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&branch_id, &year_id, &semester_id), |row| {
            let teacher_id: String = row.get(0)?;
            let teacher_name: String = row.get(1)?;
            let subject_id: String = row.get(2)?;
            let subject_name: String = row.get(3)?;
            let avg_overall: f64 = row.get(4)?;
            let total_feedbacks: i64 = row.get(5)?;
            Ok(json!({
                "teacherId": teacher_id,
                "teacherName": teacher_name.trim(),
                "subjectId": subject_id,
                "subjectName": subject_name,
                "avgOverallRating": avg_overall,
                "totalFeedbacks": total_feedbacks
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.teacherSummary" => Some(handle_teacher_summary(state, req)),
        "reports.topTeachers" => Some(handle_top_teachers(state, req)),
        "reports.groupRanks" => Some(handle_group_ranks(state, req)),
        "reports.adminDashboard" => Some(handle_admin_dashboard(state, req)),
        _ => None,
    }
}
