use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn calc_err(req: &Request, e: calc::CalcError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

fn handle_bulletin_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let model = match calc::compute_class_bulletin(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    match serde_json::to_value(&model) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
    }
}

fn handle_bulletin_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let model = match calc::compute_student_bulletin(conn, &class_id, &student_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    match serde_json::to_value(&model) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "bulletin.class" => Some(handle_bulletin_class(state, req)),
        "bulletin.student" => Some(handle_bulletin_student(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // json! sanity for the error mapping: CalcError details must surface
    // under error.details when present.
    #[test]
    fn calc_error_maps_to_ipc_error_shape() {
        let req = Request {
            id: "42".to_string(),
            method: "bulletin.class".to_string(),
            params: json!({}),
        };
        let e = calc::CalcError::new("not_found", "class not found");
        let resp = calc_err(&req, e);
        assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
        assert_eq!(
            resp.pointer("/error/code").and_then(|v| v.as_str()),
            Some("not_found")
        );
        assert_eq!(resp.get("id").and_then(|v| v.as_str()), Some("42"));
    }
}
