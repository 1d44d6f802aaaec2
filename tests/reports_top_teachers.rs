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

#[test]
fn top_teachers_orders_by_average_then_count_and_skips_unrated() {
    let workspace = temp_dir("feedbackd-top-teachers");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let branch = request_ok(&mut stdin, &mut reader, "2", "branches.create", json!({ "name": "CSE" }));
    let branch_id = branch["branchId"].as_str().expect("branchId").to_string();
    let year = request_ok(&mut stdin, &mut reader, "3", "years.create", json!({ "label": "Final Year" }));
    let year_id = year["yearId"].as_str().expect("yearId").to_string();
    let semester = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "semesters.create",
        json!({ "label": "Semester 7", "ordinal": 7 }),
    );
    let semester_id = semester["semesterId"].as_str().expect("semesterId").to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.create",
        json!({ "code": "CS701", "name": "Compilers" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();

    let mut teacher_ids = Vec::new();
    for (i, name) in ["Alpha", "Beta", "Gamma", "Delta"].iter().enumerate() {
        let t = request_ok(
            &mut stdin,
            &mut reader,
            &format!("t-{}", i),
            "teachers.create",
            json!({
                "firstName": name.to_string(),
                "email": format!("{}@example.edu", name.to_lowercase()),
                "passwordHash": "x"
            }),
        );
        teacher_ids.push(t["teacherId"].as_str().expect("teacherId").to_string());
    }

    let mut student_ids = Vec::new();
    for i in 0..2 {
        let s = request_ok(
            &mut stdin,
            &mut reader,
            &format!("st-{}", i),
            "students.register",
            json!({
                "firstName": format!("Student {}", i),
                "email": format!("s{}@example.edu", i),
                "passwordHash": "x",
                "rollNumber": format!("R-{:03}", i),
                "branchId": branch_id.clone(),
                "yearId": year_id.clone(),
                "semesterId": semester_id.clone()
            }),
        );
        student_ids.push(s["studentId"].as_str().expect("studentId").to_string());
    }

    // One assignment per teacher, distinguished by session label.
    let mut assignment_ids = Vec::new();
    for (i, teacher_id) in teacher_ids.iter().enumerate() {
        let a = request_ok(
            &mut stdin,
            &mut reader,
            &format!("a-{}", i),
            "assignments.create",
            json!({
                "teacherId": teacher_id.clone(),
                "subjectId": subject_id.clone(),
                "branchId": branch_id.clone(),
                "yearId": year_id.clone(),
                "semesterId": semester_id.clone(),
                "sessionLabel": format!("section-{}", i)
            }),
        );
        assignment_ids.push(a["assignmentId"].as_str().expect("assignmentId").to_string());
    }

    // Alpha: one 5. Beta: two 4s. Gamma: one 4. Delta: nothing.
    let submissions: Vec<(usize, usize, i64)> = vec![
        (0, 0, 5),
        (1, 0, 4),
        (1, 1, 4),
        (2, 0, 4),
    ];
    for (i, (assignment, student, overall)) in submissions.into_iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("f-{}", i),
            "feedback.submit",
            json!({
                "studentId": student_ids[student].clone(),
                "assignmentId": assignment_ids[assignment].clone(),
                "ratingKnowledge": overall,
                "ratingCommunication": overall,
                "ratingPunctuality": overall,
                "ratingOverall": overall
            }),
        );
    }

    let top = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "reports.topTeachers",
        json!({ "limit": 10 }),
    );
    let teachers = top["teachers"].as_array().expect("teachers array");
    assert_eq!(teachers.len(), 3, "unrated teacher must be excluded");
    assert_eq!(teachers[0]["name"].as_str(), Some("Alpha"));
    assert_eq!(teachers[0]["avgOverallRating"].as_f64(), Some(5.0));
    // Beta and Gamma tie on average; Beta wins on feedback count.
    assert_eq!(teachers[1]["name"].as_str(), Some("Beta"));
    assert_eq!(teachers[1]["totalFeedbacks"].as_i64(), Some(2));
    assert_eq!(teachers[2]["name"].as_str(), Some("Gamma"));

    let limited = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "reports.topTeachers",
        json!({ "limit": 2 }),
    );
    assert_eq!(
        limited["teachers"].as_array().map(|a| a.len()),
        Some(2)
    );

    let bad_limit = request(
        &mut stdin,
        &mut reader,
        "12",
        "reports.topTeachers",
        json!({ "limit": 0 }),
    );
    assert_eq!(
        bad_limit["error"]["code"].as_str(),
        Some("bad_params")
    );
}
