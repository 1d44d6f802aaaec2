use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
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

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn handle_branches_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let branch_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO branches(id, name) VALUES(?, ?)",
        (&branch_id, &name),
    ) {
        if is_constraint_violation(&e) {
            return err(&req.id, "conflict", "branch name already exists", None);
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "branches" })),
        );
    }

    ok(&req.id, json!({ "branchId": branch_id, "name": name }))
}

fn handle_branches_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "branches": [] }));
    };

    let mut stmt = match conn.prepare("SELECT id, name FROM branches ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            Ok(json!({ "id": id, "name": name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(branches) => ok(&req.id, json!({ "branches": branches })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let label = match required_str(req, "label") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let year_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO academic_years(id, label) VALUES(?, ?)",
        (&year_id, &label),
    ) {
        if is_constraint_violation(&e) {
            return err(&req.id, "conflict", "year label already exists", None);
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "academic_years" })),
        );
    }

    ok(&req.id, json!({ "yearId": year_id, "label": label }))
}

fn handle_years_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "years": [] }));
    };

    let mut stmt = match conn.prepare("SELECT id, label FROM academic_years ORDER BY rowid") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let label: String = row.get(1)?;
            Ok(json!({ "id": id, "label": label }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(years) => ok(&req.id, json!({ "years": years })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_semesters_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let label = match required_str(req, "label") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ordinal = match req.params.get("ordinal").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing ordinal", None),
    };

    let semester_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO semesters(id, label, ordinal) VALUES(?, ?, ?)",
        (&semester_id, &label, ordinal),
    ) {
        if is_constraint_violation(&e) {
            return err(&req.id, "conflict", "semester label already exists", None);
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "semesters" })),
        );
    }

    ok(
        &req.id,
        json!({ "semesterId": semester_id, "label": label, "ordinal": ordinal }),
    )
}

fn handle_semesters_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "semesters": [] }));
    };

    let mut stmt = match conn.prepare("SELECT id, label, ordinal FROM semesters ORDER BY ordinal") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let label: String = row.get(1)?;
            let ordinal: i64 = row.get(2)?;
            Ok(json!({ "id": id, "label": label, "ordinal": ordinal }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(semesters) => ok(&req.id, json!({ "semesters": semesters })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, code, name) VALUES(?, ?, ?)",
        (&subject_id, &code, &name),
    ) {
        if is_constraint_violation(&e) {
            return err(&req.id, "conflict", "subject code already exists", None);
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(
        &req.id,
        json!({ "subjectId": subject_id, "code": code, "name": name }),
    )
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };

    let mut stmt = match conn.prepare("SELECT id, code, name FROM subjects ORDER BY code") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let code: String = row.get(1)?;
            let name: String = row.get(2)?;
            Ok(json!({ "id": id, "code": code, "name": name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

// One round trip for the browser client's three selects.
fn handle_dropdowns(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let branches = conn
        .prepare("SELECT id, name FROM branches ORDER BY name")
        .and_then(|mut s| {
            s.query_map([], |row| {
                let id: String = row.get(0)?;
                let name: String = row.get(1)?;
                Ok(json!({ "id": id, "name": name }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        });
    let branches = match branches {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let years = conn
        .prepare("SELECT id, label FROM academic_years ORDER BY rowid")
        .and_then(|mut s| {
            s.query_map([], |row| {
                let id: String = row.get(0)?;
                let label: String = row.get(1)?;
                Ok(json!({ "id": id, "label": label }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        });
    let years = match years {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let semesters = conn
        .prepare("SELECT id, label FROM semesters ORDER BY ordinal")
        .and_then(|mut s| {
            s.query_map([], |row| {
                let id: String = row.get(0)?;
                let label: String = row.get(1)?;
                Ok(json!({ "id": id, "label": label }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        });
    let semesters = match semesters {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "branches": branches,
            "years": years,
            "semesters": semesters
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "branches.create" => Some(handle_branches_create(state, req)),
        "branches.list" => Some(handle_branches_list(state, req)),
        "years.create" => Some(handle_years_create(state, req)),
        "years.list" => Some(handle_years_list(state, req)),
        "semesters.create" => Some(handle_semesters_create(state, req)),
        "semesters.list" => Some(handle_semesters_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "catalog.dropdowns" => Some(handle_dropdowns(state, req)),
        _ => None,
    }
}
