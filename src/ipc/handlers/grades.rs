use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const GRADE_MIN: f64 = 0.0;
const GRADE_MAX: f64 = 20.0;
const BULK_SET_MAX_EDITS: usize = 5000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

// The entry form is the only gate on grade range; the aggregation engine
// propagates whatever is stored. Reject out-of-range values here.
fn validate_grade_value(v: f64) -> Result<f64, HandlerErr> {
    if !v.is_finite() || !(GRADE_MIN..=GRADE_MAX).contains(&v) {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("grade must be between {} and {}", GRADE_MIN, GRADE_MAX),
            details: Some(json!({ "value": v })),
        });
    }
    Ok(v)
}

fn resolve_student_in_class(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (student_id, class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    match found {
        Some(_) => Ok(()),
        None => Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: Some(json!({ "studentId": student_id })),
        }),
    }
}

fn resolve_subject_in_class(
    conn: &Connection,
    class_id: &str,
    subject_id: &str,
) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM subjects s
             JOIN teaching_units u ON u.id = s.unit_id
             WHERE s.id = ? AND u.class_id = ?",
            (subject_id, class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    match found {
        Some(_) => Ok(()),
        None => Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: Some(json!({ "subjectId": subject_id })),
        }),
    }
}

// grades.set semantics: one value per pair. Existing evaluations for the
// pair are replaced; a null value clears the pair back to "not evaluated"
// (row absence), which is distinct from storing a zero.
fn apply_set(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    value: Option<f64>,
    comment: Option<&str>,
) -> Result<usize, HandlerErr> {
    conn.execute(
        "DELETE FROM grades WHERE student_id = ? AND subject_id = ?",
        (student_id, subject_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_delete_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grades" })),
    })?;

    let Some(v) = value else {
        return Ok(0);
    };

    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, student_id, subject_id, value, comment, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            student_id,
            subject_id,
            v,
            comment,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grades" })),
    })?;
    Ok(1)
}

fn handle_grades_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let comment = req
        .params
        .get("comment")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let value = match req.params.get("value") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(n) => match validate_grade_value(n) {
                Ok(n) => Some(n),
                Err(e) => return e.response(&req.id),
            },
            None => return err(&req.id, "bad_params", "value must be a number or null", None),
        },
    };

    if let Err(e) = resolve_student_in_class(conn, &class_id, &student_id) {
        return e.response(&req.id);
    }
    if let Err(e) = resolve_subject_in_class(conn, &class_id, &subject_id) {
        return e.response(&req.id);
    }

    match apply_set(conn, &student_id, &subject_id, value, comment.as_deref()) {
        Ok(count) => ok(&req.id, json!({ "evaluationCount": count })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_grades_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let value = match req.params.get("value").and_then(|v| v.as_f64()) {
        Some(v) => match validate_grade_value(v) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        },
        None => return err(&req.id, "bad_params", "missing/invalid value", None),
    };
    let comment = req
        .params
        .get("comment")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Err(e) = resolve_student_in_class(conn, &class_id, &student_id) {
        return e.response(&req.id);
    }
    if let Err(e) = resolve_subject_in_class(conn, &class_id, &subject_id) {
        return e.response(&req.id);
    }

    let grade_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO grades(id, student_id, subject_id, value, comment, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            &student_id,
            &subject_id,
            value,
            comment.as_deref(),
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    ok(&req.id, json!({ "gradeId": grade_id }))
}

fn handle_grades_grid(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let mut student_stmt = match conn.prepare(
        "SELECT id FROM students WHERE class_id = ? ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let student_ids = match student_stmt
        .query_map([&class_id], |row| row.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut subject_stmt = match conn.prepare(
        "SELECT s.id FROM subjects s
         JOIN teaching_units u ON u.id = s.unit_id
         WHERE u.class_id = ?
         ORDER BY u.sort_order, s.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subject_ids = match subject_stmt
        .query_map([&class_id], |row| row.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut grades_stmt = match conn.prepare(
        "SELECT g.student_id, g.subject_id, g.value
         FROM grades g
         JOIN students st ON st.id = g.student_id
         WHERE st.class_id = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grades = match grades_stmt
        .query_map([&class_id], |row| {
            Ok(calc::GradeRow {
                student_id: row.get(0)?,
                subject_id: row.get(1)?,
                value: row.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Each cell shows the pair's aggregated value: the entered grade, or
    // the rounded mean when several evaluations were recorded.
    let mut cells: Vec<Vec<Option<f64>>> = Vec::with_capacity(student_ids.len());
    let mut counts: Vec<Vec<usize>> = Vec::with_capacity(student_ids.len());
    for sid in &student_ids {
        let mut value_row: Vec<Option<f64>> = Vec::with_capacity(subject_ids.len());
        let mut count_row: Vec<usize> = Vec::with_capacity(subject_ids.len());
        for sub in &subject_ids {
            value_row.push(calc::subject_average(sid, sub, &grades));
            count_row.push(
                grades
                    .iter()
                    .filter(|g| g.student_id == *sid && g.subject_id == *sub)
                    .count(),
            );
        }
        cells.push(value_row);
        counts.push(count_row);
    }

    ok(
        &req.id,
        json!({
            "students": student_ids,
            "subjects": subject_ids,
            "cells": cells,
            "evaluationCounts": counts
        }),
    )
}

fn handle_grades_bulk_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let Some(edits_arr) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing edits[]", None);
    };

    if edits_arr.len() > BULK_SET_MAX_EDITS {
        let rejected = edits_arr.len();
        return ok(
            &req.id,
            json!({
                "ok": true,
                "updated": 0,
                "rejected": rejected,
                "limitExceeded": true,
                "errors": [{
                    "index": -1,
                    "code": "too_many_edits",
                    "message": format!(
                        "bulk payload exceeds max edits: {} > {}",
                        rejected, BULK_SET_MAX_EDITS
                    )
                }]
            }),
        );
    }

    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, edit) in edits_arr.iter().enumerate() {
        let Some(obj) = edit.as_object() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("edit at index {} must be an object", i),
            }));
            continue;
        };

        let student_id = match obj.get("studentId").and_then(|v| v.as_str()) {
            Some(v) => v.to_string(),
            None => {
                errors.push(json!({
                    "index": i,
                    "code": "bad_params",
                    "message": format!("edit at index {} missing studentId", i),
                }));
                continue;
            }
        };
        let subject_id = match obj.get("subjectId").and_then(|v| v.as_str()) {
            Some(v) => v.to_string(),
            None => {
                errors.push(json!({
                    "index": i,
                    "code": "bad_params",
                    "message": format!("edit at index {} missing subjectId", i),
                }));
                continue;
            }
        };

        let value = match obj.get("value") {
            None => None,
            Some(v) if v.is_null() => None,
            Some(v) => match v.as_f64() {
                Some(n) => match validate_grade_value(n) {
                    Ok(n) => Some(n),
                    Err(e) => {
                        errors.push(json!({
                            "index": i,
                            "code": e.code,
                            "message": e.message,
                        }));
                        continue;
                    }
                },
                None => {
                    errors.push(json!({
                        "index": i,
                        "code": "bad_params",
                        "message": format!("edit at index {} value must be a number or null", i),
                    }));
                    continue;
                }
            },
        };

        if let Err(e) = resolve_student_in_class(conn, &class_id, &student_id) {
            errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            }));
            continue;
        }
        if let Err(e) = resolve_subject_in_class(conn, &class_id, &subject_id) {
            errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            }));
            continue;
        }

        match apply_set(conn, &student_id, &subject_id, value, None) {
            Ok(_) => updated += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    let rejected = errors.len();
    let mut result = json!({ "ok": true, "updated": updated });
    if rejected > 0 {
        result
            .as_object_mut()
            .expect("result should be object")
            .insert("rejected".into(), json!(rejected));
        result
            .as_object_mut()
            .expect("result should be object")
            .insert("errors".into(), json!(errors));
    }

    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.grid" => Some(handle_grades_grid(state, req)),
        "grades.set" => Some(handle_grades_set(state, req)),
        "grades.record" => Some(handle_grades_record(state, req)),
        "grades.bulkSet" => Some(handle_grades_bulk_set(state, req)),
        _ => None,
    }
}
