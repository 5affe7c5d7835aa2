use serde_json::json;
use std::collections::HashMap;
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

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct ClassSetup {
    class_id: String,
    subject_id: String,
}

fn setup_single_subject_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    name: &str,
) -> ClassSetup {
    let class = request_ok(
        stdin,
        reader,
        &format!("class-{}", name),
        "classes.create",
        json!({ "name": name }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let unit = request_ok(
        stdin,
        reader,
        &format!("unit-{}", name),
        "units.create",
        json!({ "classId": class_id, "name": "Tronc commun", "coefficient": 1.0 }),
    );
    let unit_id = unit
        .get("unitId")
        .and_then(|v| v.as_str())
        .expect("unitId")
        .to_string();

    let subject = request_ok(
        stdin,
        reader,
        &format!("subject-{}", name),
        "subjects.create",
        json!({ "classId": class_id, "unitId": unit_id, "name": "Histoire", "coefficient": 1.0 }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    ClassSetup {
        class_id,
        subject_id,
    }
}

fn enroll(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    class_id: &str,
    last_name: &str,
) -> String {
    let s = request_ok(
        stdin,
        reader,
        &format!("enroll-{}-{}", class_id, last_name),
        "students.create",
        json!({ "classId": class_id, "lastName": last_name, "firstName": "T" }),
    );
    s.get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

fn ranks_by_student(bulletin: &serde_json::Value) -> HashMap<String, (Option<f64>, u64)> {
    let mut out = HashMap::new();
    for row in bulletin
        .get("perStudent")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
    {
        let sid = row
            .get("studentId")
            .and_then(|v| v.as_str())
            .expect("studentId")
            .to_string();
        let avg = row.get("generalAverage").and_then(|v| v.as_f64());
        let rank = row.get("rank").and_then(|v| v.as_u64()).expect("rank");
        out.insert(sid, (avg, rank));
    }
    out
}

#[test]
fn ungraded_student_folds_to_zero_in_cohort_and_ranks_last() {
    let workspace = temp_dir("bulletind-cohort-folding");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let setup = setup_single_subject_class(&mut stdin, &mut reader, "Seconde A");
    let graded_low = enroll(&mut stdin, &mut reader, &setup.class_id, "Abanda");
    let ungraded = enroll(&mut stdin, &mut reader, &setup.class_id, "Bella");
    let graded_high = enroll(&mut stdin, &mut reader, &setup.class_id, "Chantal");

    for (sid, value) in [(&graded_low, 12.0), (&graded_high, 15.0)] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("g-{}", sid),
            "grades.set",
            json!({
                "classId": setup.class_id,
                "studentId": sid,
                "subjectId": setup.subject_id,
                "value": value
            }),
        );
    }

    let bulletin = request_ok(
        &mut stdin,
        &mut reader,
        "cb",
        "bulletin.class",
        json!({ "classId": setup.class_id }),
    );

    // (12.0 + 0 + 15.0) / 3 = 9.0: the ungraded student has no average of
    // their own but still divides the cohort mean.
    assert_eq!(
        bulletin
            .get("cohortGeneralAverage")
            .and_then(|v| v.as_f64()),
        Some(9.0)
    );
    assert_eq!(
        bulletin.get("cohortSize").and_then(|v| v.as_u64()),
        Some(3)
    );

    let ranks = ranks_by_student(&bulletin);
    assert_eq!(ranks[&graded_high], (Some(15.0), 1));
    assert_eq!(ranks[&graded_low], (Some(12.0), 2));
    assert_eq!(ranks[&ungraded], (None, 3));

    let _ = child.kill();
}

#[test]
fn tied_averages_keep_register_order() {
    let workspace = temp_dir("bulletind-rank-ties");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let setup = setup_single_subject_class(&mut stdin, &mut reader, "Seconde B");
    // Enrollment order B then A: the tie must keep it, with no alphabetic
    // second key.
    let b = enroll(&mut stdin, &mut reader, &setup.class_id, "Bilong");
    let a = enroll(&mut stdin, &mut reader, &setup.class_id, "Atangana");

    for sid in [&b, &a] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("g-{}", sid),
            "grades.set",
            json!({
                "classId": setup.class_id,
                "studentId": sid,
                "subjectId": setup.subject_id,
                "value": 18.0
            }),
        );
    }

    let bulletin = request_ok(
        &mut stdin,
        &mut reader,
        "cb",
        "bulletin.class",
        json!({ "classId": setup.class_id }),
    );
    let ranks = ranks_by_student(&bulletin);
    assert_eq!(ranks[&b], (Some(18.0), 1));
    assert_eq!(ranks[&a], (Some(18.0), 2));

    let _ = child.kill();
}

#[test]
fn distinct_averages_rank_without_gaps_or_duplicates() {
    let workspace = temp_dir("bulletind-rank-permutation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let setup = setup_single_subject_class(&mut stdin, &mut reader, "Seconde C");
    let names = ["Dikongue", "Ebogo", "Fouda", "Germaine", "Hamadou"];
    let mut ids = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let sid = enroll(&mut stdin, &mut reader, &setup.class_id, name);
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("g-{}", sid),
            "grades.set",
            json!({
                "classId": setup.class_id,
                "studentId": sid,
                "subjectId": setup.subject_id,
                "value": 8.0 + 2.0 * i as f64
            }),
        );
        ids.push(sid);
    }

    let bulletin = request_ok(
        &mut stdin,
        &mut reader,
        "cb",
        "bulletin.class",
        json!({ "classId": setup.class_id }),
    );
    let ranks = ranks_by_student(&bulletin);

    let mut seen: Vec<u64> = ids.iter().map(|sid| ranks[sid].1).collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);

    // Highest grade entered last, so the last enrolled student leads.
    assert_eq!(ranks[ids.last().expect("ids")].1, 1);

    let _ = child.kill();
}
