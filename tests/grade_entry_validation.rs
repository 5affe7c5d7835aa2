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
    let exe = env!("CARGO_BIN_EXE_bulletind");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bulletind");
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

struct Setup {
    class_id: String,
    student_id: String,
    subject_id: String,
}

fn setup(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Setup {
    let class = request_ok(
        stdin,
        reader,
        "setup-class",
        "classes.create",
        json!({ "name": "Troisieme" }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let student = request_ok(
        stdin,
        reader,
        "setup-student",
        "students.create",
        json!({ "classId": class_id, "lastName": "Mbarga", "firstName": "Jean" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let unit = request_ok(
        stdin,
        reader,
        "setup-unit",
        "units.create",
        json!({ "classId": class_id, "name": "Sciences", "coefficient": 2.0 }),
    );
    let unit_id = unit
        .get("unitId")
        .and_then(|v| v.as_str())
        .expect("unitId")
        .to_string();

    let subject = request_ok(
        stdin,
        reader,
        "setup-subject",
        "subjects.create",
        json!({ "classId": class_id, "unitId": unit_id, "name": "SVT", "coefficient": 1.0 }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    Setup {
        class_id,
        student_id,
        subject_id,
    }
}

#[test]
fn out_of_range_grades_never_reach_storage() {
    let workspace = temp_dir("bulletind-grade-range");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = setup(&mut stdin, &mut reader);

    for (id, bad) in [("over", 25.0), ("under", -1.0)] {
        let resp = request(
            &mut stdin,
            &mut reader,
            id,
            "grades.set",
            json!({
                "classId": s.class_id,
                "studentId": s.student_id,
                "subjectId": s.subject_id,
                "value": bad
            }),
        );
        assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
        assert_eq!(
            resp.pointer("/error/code").and_then(|v| v.as_str()),
            Some("bad_params")
        );
        assert!(resp
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .contains("between 0 and 20"));
    }

    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "grid",
        "grades.grid",
        json!({ "classId": s.class_id }),
    );
    assert_eq!(grid.pointer("/cells/0/0"), Some(&serde_json::Value::Null));

    let _ = child.kill();
}

#[test]
fn bulk_set_reports_per_edit_diagnostics() {
    let workspace = temp_dir("bulletind-bulk-diagnostics");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = setup(&mut stdin, &mut reader);

    let raw = request(
        &mut stdin,
        &mut reader,
        "bulk",
        "grades.bulkSet",
        json!({
            "classId": s.class_id,
            "edits": [
                { "studentId": s.student_id, "subjectId": s.subject_id, "value": 12.0 },
                { "studentId": s.student_id, "subjectId": s.subject_id, "value": 25.0 },
                { "studentId": "missing-student", "subjectId": s.subject_id, "value": 10.0 },
                { "studentId": s.student_id, "subjectId": "missing-subject", "value": 10.0 },
                { "studentId": s.student_id, "subjectId": s.subject_id, "value": "douze" }
            ]
        }),
    );

    assert_eq!(raw.get("ok").and_then(|v| v.as_bool()), Some(true));
    let result = raw.get("result").cloned().unwrap_or_else(|| json!({}));
    assert_eq!(result.get("updated").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(result.get("rejected").and_then(|v| v.as_u64()), Some(4));

    let errors = result
        .get("errors")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(errors.len(), 4);
    assert!(errors.iter().any(|e| {
        e.get("code").and_then(|v| v.as_str()) == Some("bad_params")
            && e.get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .contains("between 0 and 20")
    }));
    assert!(errors.iter().any(|e| {
        e.get("code").and_then(|v| v.as_str()) == Some("not_found")
            && e.get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .contains("student")
    }));
    assert!(errors.iter().any(|e| {
        e.get("code").and_then(|v| v.as_str()) == Some("not_found")
            && e.get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .contains("subject")
    }));

    // The one good edit landed.
    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "grid",
        "grades.grid",
        json!({ "classId": s.class_id }),
    );
    assert_eq!(
        grid.pointer("/cells/0/0").and_then(|v| v.as_f64()),
        Some(12.0)
    );

    let _ = child.kill();
}

#[test]
fn repeated_evaluations_average_in_the_grid() {
    let workspace = temp_dir("bulletind-multi-evaluation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = setup(&mut stdin, &mut reader);

    for (i, value) in [15.0, 14.0].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("rec-{}", i),
            "grades.record",
            json!({
                "classId": s.class_id,
                "studentId": s.student_id,
                "subjectId": s.subject_id,
                "value": value
            }),
        );
    }

    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "grid",
        "grades.grid",
        json!({ "classId": s.class_id }),
    );
    assert_eq!(
        grid.pointer("/cells/0/0").and_then(|v| v.as_f64()),
        Some(14.5)
    );
    assert_eq!(
        grid.pointer("/evaluationCounts/0/0").and_then(|v| v.as_u64()),
        Some(2)
    );

    // grades.set collapses the pair back to a single evaluation.
    let set = request_ok(
        &mut stdin,
        &mut reader,
        "set",
        "grades.set",
        json!({
            "classId": s.class_id,
            "studentId": s.student_id,
            "subjectId": s.subject_id,
            "value": 13.0
        }),
    );
    assert_eq!(set.get("evaluationCount").and_then(|v| v.as_u64()), Some(1));
    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "grid2",
        "grades.grid",
        json!({ "classId": s.class_id }),
    );
    assert_eq!(
        grid.pointer("/cells/0/0").and_then(|v| v.as_f64()),
        Some(13.0)
    );
    assert_eq!(
        grid.pointer("/evaluationCounts/0/0").and_then(|v| v.as_u64()),
        Some(1)
    );

    let _ = child.kill();
}

#[test]
fn curriculum_rejects_non_positive_coefficients() {
    let workspace = temp_dir("bulletind-coefficient-rules");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = setup(&mut stdin, &mut reader);

    let unit_resp = request(
        &mut stdin,
        &mut reader,
        "unit-zero",
        "units.create",
        json!({ "classId": s.class_id, "name": "Arts", "coefficient": 0.0 }),
    );
    assert_eq!(unit_resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        unit_resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let units = request_ok(
        &mut stdin,
        &mut reader,
        "units",
        "units.list",
        json!({ "classId": s.class_id }),
    );
    let unit_id = units
        .pointer("/units/0/id")
        .and_then(|v| v.as_str())
        .expect("existing unit")
        .to_string();

    let subject_resp = request(
        &mut stdin,
        &mut reader,
        "subject-negative",
        "subjects.create",
        json!({ "classId": s.class_id, "unitId": unit_id, "name": "Dessin", "coefficient": -2.0 }),
    );
    assert_eq!(
        subject_resp.get("ok").and_then(|v| v.as_bool()),
        Some(false)
    );
    assert_eq!(
        subject_resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let _ = child.kill();
}
