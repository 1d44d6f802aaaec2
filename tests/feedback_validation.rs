use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_feedbackd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn feedbackd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

struct Seed {
    teacher_id: String,
    assignment_id: String,
    student_id: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seed {
    let branch = request_ok(stdin, reader, "s1", "branches.create", json!({ "name": "ECE" }));
    let branch_id = branch["branchId"].as_str().expect("branchId").to_string();
    let year = request_ok(stdin, reader, "s2", "years.create", json!({ "label": "Third Year" }));
    let year_id = year["yearId"].as_str().expect("yearId").to_string();
    let semester = request_ok(
        stdin,
        reader,
        "s3",
        "semesters.create",
        json!({ "label": "Semester 5", "ordinal": 5 }),
    );
    let semester_id = semester["semesterId"].as_str().expect("semesterId").to_string();
    let subject = request_ok(
        stdin,
        reader,
        "s4",
        "subjects.create",
        json!({ "code": "EC501", "name": "Signals" }),
    );
    let teacher = request_ok(
        stdin,
        reader,
        "s5",
        "teachers.create",
        json!({
            "firstName": "Ravi",
            "email": "ravi@example.edu",
            "passwordHash": "x"
        }),
    );
    let teacher_id = teacher["teacherId"].as_str().expect("teacherId").to_string();
    let student = request_ok(
        stdin,
        reader,
        "s6",
        "students.register",
        json!({
            "firstName": "Meera",
            "email": "meera@example.edu",
            "passwordHash": "x",
            "rollNumber": "R-001",
            "branchId": branch_id.clone(),
            "yearId": year_id.clone(),
            "semesterId": semester_id.clone()
        }),
    );
    let assignment = request_ok(
        stdin,
        reader,
        "s7",
        "assignments.create",
        json!({
            "teacherId": teacher_id.clone(),
            "subjectId": subject["subjectId"].clone(),
            "branchId": branch_id,
            "yearId": year_id,
            "semesterId": semester_id
        }),
    );

    Seed {
        teacher_id,
        assignment_id: assignment["assignmentId"].as_str().expect("assignmentId").to_string(),
        student_id: student["studentId"].as_str().expect("studentId").to_string(),
    }
}

fn submit_params(seed: &Seed, overall: serde_json::Value) -> serde_json::Value {
    json!({
        "studentId": seed.student_id.clone(),
        "assignmentId": seed.assignment_id.clone(),
        "ratingKnowledge": 4,
        "ratingCommunication": 4,
        "ratingPunctuality": 4,
        "ratingOverall": overall
    })
}

#[test]
fn out_of_range_or_malformed_ratings_are_rejected_without_side_effects() {
    let workspace = temp_dir("feedbackd-validation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed(&mut stdin, &mut reader);

    for (id, overall) in [
        ("2", json!(6)),
        ("3", json!(0)),
        ("4", json!(-1)),
        ("5", json!(4.5)),
        ("6", json!("five")),
    ] {
        let resp = request(
            &mut stdin,
            &mut reader,
            id,
            "feedback.submit",
            submit_params(&seed, overall),
        );
        assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
        assert_eq!(error_code(&resp), "bad_params");
    }

    // Missing dimension is a validation failure too.
    let missing = request(
        &mut stdin,
        &mut reader,
        "7",
        "feedback.submit",
        json!({
            "studentId": seed.student_id.clone(),
            "assignmentId": seed.assignment_id.clone(),
            "ratingKnowledge": 4,
            "ratingCommunication": 4,
            "ratingPunctuality": 4
        }),
    );
    assert_eq!(error_code(&missing), "bad_params");

    // Nothing was written and the aggregate never moved.
    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "feedback.list",
        json!({ "assignmentId": seed.assignment_id.clone() }),
    );
    assert_eq!(listing["feedbacks"].as_array().map(|a| a.len()), Some(0));

    let cached = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "stats.get",
        json!({ "teacherId": seed.teacher_id.clone() }),
    );
    assert_eq!(cached["totalFeedbacks"].as_i64(), Some(0));
    assert_eq!(cached["avgOverall"].as_f64(), Some(0.0));
}

#[test]
fn unknown_references_fail_with_not_found() {
    let workspace = temp_dir("feedbackd-validation-refs");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed(&mut stdin, &mut reader);

    let bad_assignment = request(
        &mut stdin,
        &mut reader,
        "2",
        "feedback.submit",
        json!({
            "studentId": seed.student_id.clone(),
            "assignmentId": "no-such-assignment",
            "ratingKnowledge": 4,
            "ratingCommunication": 4,
            "ratingPunctuality": 4,
            "ratingOverall": 4
        }),
    );
    assert_eq!(error_code(&bad_assignment), "not_found");

    let bad_student = request(
        &mut stdin,
        &mut reader,
        "3",
        "feedback.submit",
        json!({
            "studentId": "no-such-student",
            "assignmentId": seed.assignment_id.clone(),
            "ratingKnowledge": 4,
            "ratingCommunication": 4,
            "ratingPunctuality": 4,
            "ratingOverall": 4
        }),
    );
    assert_eq!(error_code(&bad_student), "not_found");

    let bad_update = request(
        &mut stdin,
        &mut reader,
        "4",
        "feedback.update",
        json!({ "feedbackId": "no-such-feedback", "ratingOverall": 3 }),
    );
    assert_eq!(error_code(&bad_update), "not_found");

    let bad_teacher = request(
        &mut stdin,
        &mut reader,
        "5",
        "stats.get",
        json!({ "teacherId": "no-such-teacher" }),
    );
    assert_eq!(error_code(&bad_teacher), "not_found");

    let bad_summary = request(
        &mut stdin,
        &mut reader,
        "6",
        "reports.teacherSummary",
        json!({ "teacherId": "no-such-teacher" }),
    );
    assert_eq!(error_code(&bad_summary), "not_found");
}

#[test]
fn update_revalidates_rating_ranges() {
    let workspace = temp_dir("feedbackd-validation-update");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed(&mut stdin, &mut reader);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "feedback.submit",
        submit_params(&seed, json!(4)),
    );
    let feedback_id = created["feedbackId"].as_str().expect("feedbackId").to_string();

    let rejected = request(
        &mut stdin,
        &mut reader,
        "3",
        "feedback.update",
        json!({ "feedbackId": feedback_id.clone(), "ratingOverall": 9 }),
    );
    assert_eq!(error_code(&rejected), "bad_params");

    let cached = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "stats.get",
        json!({ "teacherId": seed.teacher_id.clone() }),
    );
    assert_eq!(cached["avgOverall"].as_f64(), Some(4.0));
}
