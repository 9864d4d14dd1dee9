use crate::calc::{SCORE_MAX, SCORE_MIN};
use crate::db;
use crate::ipc::error::{err, err_fields, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn threshold_in_range(v: f64) -> bool {
    v.is_finite() && (SCORE_MIN..=SCORE_MAX).contains(&v)
}

/// Inverted thresholds are accepted but reported, since the grading
/// service does not guarantee recovery <= passing.
fn threshold_warnings(passing: f64, recovery: f64) -> Vec<String> {
    if recovery > passing {
        vec![format!(
            "recovery average {} is above passing average {}",
            recovery, passing
        )]
    } else {
        Vec::new()
    }
}

fn subject_row_to_json(
    id: String,
    name: String,
    code: String,
    number_of_grades: i64,
    passing_average: f64,
    recovery_average: f64,
    teacher_id: String,
) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "code": code,
        "numberOfGrades": number_of_grades,
        "passingAverage": passing_average,
        "recoveryAverage": recovery_average,
        "teacherId": teacher_id,
    })
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, code, number_of_grades, passing_average, recovery_average, teacher_id
         FROM subjects
         ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(subject_row_to_json(
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let name = helpers::opt_str(req, "name");
    let code = helpers::opt_str(req, "code");
    let teacher_id = helpers::opt_str(req, "teacherId");
    let number_of_grades = req.params.get("numberOfGrades").and_then(|v| v.as_i64());
    let passing_average = req.params.get("passingAverage").and_then(|v| v.as_f64());
    let recovery_average = req.params.get("recoveryAverage").and_then(|v| v.as_f64());

    let mut errors: Vec<String> = Vec::new();
    if name.is_none() {
        errors.push("name is required".to_string());
    }
    if code.is_none() {
        errors.push("code is required".to_string());
    }
    if teacher_id.is_none() {
        errors.push("teacher is required".to_string());
    }
    match number_of_grades {
        Some(n) if n >= 1 => {}
        Some(_) => errors.push("number of grades must be at least 1".to_string()),
        None => errors.push("number of grades is required".to_string()),
    }
    match passing_average {
        Some(v) if threshold_in_range(v) => {}
        Some(_) => errors.push(format!(
            "passing average must be between {} and {}",
            SCORE_MIN, SCORE_MAX
        )),
        None => errors.push("passing average is required".to_string()),
    }
    match recovery_average {
        Some(v) if threshold_in_range(v) => {}
        Some(_) => errors.push(format!(
            "recovery average must be between {} and {}",
            SCORE_MIN, SCORE_MAX
        )),
        None => errors.push("recovery average is required".to_string()),
    }
    if !errors.is_empty() {
        return err_fields(&req.id, errors);
    }
    let (name, code, teacher_id) = (
        name.unwrap_or_default(),
        code.unwrap_or_default(),
        teacher_id.unwrap_or_default(),
    );
    let number_of_grades = number_of_grades.unwrap_or(1);
    let passing_average = passing_average.unwrap_or(0.0);
    let recovery_average = recovery_average.unwrap_or(0.0);

    let teacher_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if teacher_exists.is_none() {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    let subject_id = Uuid::new_v4().to_string();
    let now = db::now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, code, number_of_grades, passing_average, recovery_average, teacher_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &subject_id,
            &name,
            &code,
            number_of_grades,
            passing_average,
            recovery_average,
            &teacher_id,
            &now,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(
        &req.id,
        json!({
            "subject": subject_row_to_json(
                subject_id,
                name,
                code,
                number_of_grades,
                passing_average,
                recovery_average,
                teacher_id,
            ),
            "warnings": threshold_warnings(passing_average, recovery_average),
        }),
    )
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let subject_id = match helpers::require_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    for (key, column) in [("name", "name"), ("code", "code")] {
        if let Some(v) = patch.get(key) {
            let Some(s) = v.as_str() else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("patch.{} must be a string", key),
                    None,
                );
            };
            let t = s.trim().to_string();
            if t.is_empty() {
                return err_fields(&req.id, vec![format!("{} must not be empty", key)]);
            }
            set_parts.push(format!("{} = ?", column));
            bind_values.push(Value::Text(t));
        }
    }
    if let Some(v) = patch.get("numberOfGrades") {
        let Some(n) = v.as_i64() else {
            return err(
                &req.id,
                "bad_params",
                "patch.numberOfGrades must be an integer",
                None,
            );
        };
        if n < 1 {
            return err_fields(&req.id, vec!["number of grades must be at least 1".into()]);
        }
        set_parts.push("number_of_grades = ?".into());
        bind_values.push(Value::Integer(n));
    }
    for (key, column) in [
        ("passingAverage", "passing_average"),
        ("recoveryAverage", "recovery_average"),
    ] {
        if let Some(v) = patch.get(key) {
            let Some(n) = v.as_f64() else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("patch.{} must be a number", key),
                    None,
                );
            };
            if !threshold_in_range(n) {
                return err_fields(
                    &req.id,
                    vec![format!(
                        "{} must be between {} and {}",
                        key, SCORE_MIN, SCORE_MAX
                    )],
                );
            }
            set_parts.push(format!("{} = ?", column));
            bind_values.push(Value::Real(n));
        }
    }
    if let Some(v) = patch.get("teacherId") {
        let Some(s) = v.as_str() else {
            return err(
                &req.id,
                "bad_params",
                "patch.teacherId must be a string",
                None,
            );
        };
        let exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM users WHERE id = ?", [s], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(&req.id, "not_found", "teacher not found", None);
        }
        set_parts.push("teacher_id = ?".into());
        bind_values.push(Value::Text(s.to_string()));
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }
    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());

    let sql = format!("UPDATE subjects SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(subject_id.clone()));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "subjects" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "subject not found", None);
    }

    // Report inverted thresholds on the record as stored.
    let thresholds: Option<(f64, f64)> = match conn
        .query_row(
            "SELECT passing_average, recovery_average FROM subjects WHERE id = ?",
            [&subject_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let warnings = thresholds
        .map(|(p, r)| threshold_warnings(p, r))
        .unwrap_or_default();

    ok(&req.id, json!({ "ok": true, "warnings": warnings }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let subject_id = match helpers::require_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "DELETE FROM grade_scores
         WHERE grade_id IN (SELECT id FROM grades WHERE subject_id = ?)",
        [&subject_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grade_scores" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM grades WHERE subject_id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
