use crate::db;
use crate::ipc::error::{err, err_fields, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn student_row_to_json(
    id: String,
    name: String,
    email: String,
    registration_number: String,
    phone: Option<String>,
) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "email": email,
        "registrationNumber": registration_number,
        "phone": phone,
    })
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let search = helpers::opt_str(req, "search").map(|s| s.to_lowercase());

    let mut stmt = match conn.prepare(
        "SELECT id, name, email, registration_number, phone
         FROM students
         ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(all) => {
            let students: Vec<serde_json::Value> = all
                .into_iter()
                .filter(|(_, name, email, reg, _)| match &search {
                    // Same fields the list screen filters on.
                    Some(q) => {
                        name.to_lowercase().contains(q)
                            || email.to_lowercase().contains(q)
                            || reg.to_lowercase().contains(q)
                    }
                    None => true,
                })
                .map(|(id, name, email, reg, phone)| {
                    student_row_to_json(id, name, email, reg, phone)
                })
                .collect();
            ok(&req.id, json!({ "students": students }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let name = helpers::opt_str(req, "name");
    let email = helpers::opt_str(req, "email");
    let registration_number = helpers::opt_str(req, "registrationNumber");
    let phone = helpers::opt_str(req, "phone");

    let mut errors: Vec<String> = Vec::new();
    if name.is_none() {
        errors.push("name is required".to_string());
    }
    if email.is_none() {
        errors.push("email is required".to_string());
    }
    if registration_number.is_none() {
        errors.push("registration number is required".to_string());
    }
    if !errors.is_empty() {
        return err_fields(&req.id, errors);
    }
    let (name, email, registration_number) = (
        name.unwrap_or_default(),
        email.unwrap_or_default(),
        registration_number.unwrap_or_default(),
    );

    let taken: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE registration_number = ?",
            [&registration_number],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if taken.is_some() {
        return err(
            &req.id,
            "validation_error",
            "registration number already in use",
            Some(json!({ "field": "registrationNumber" })),
        );
    }

    let student_id = Uuid::new_v4().to_string();
    let now = db::now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, name, email, registration_number, phone, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &name,
            &email,
            &registration_number,
            &phone,
            &now,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({
            "student": student_row_to_json(student_id, name, email, registration_number, phone)
        }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match helpers::require_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    for (key, column) in [
        ("name", "name"),
        ("email", "email"),
        ("registrationNumber", "registration_number"),
    ] {
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
    if let Some(v) = patch.get("phone") {
        if v.is_null() {
            set_parts.push("phone = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(s) = v.as_str() {
            let t = s.trim().to_string();
            set_parts.push("phone = ?".into());
            if t.is_empty() {
                bind_values.push(Value::Null);
            } else {
                bind_values.push(Value::Text(t));
            }
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.phone must be a string or null",
                None,
            );
        }
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

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(student_id.clone()));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match helpers::require_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM grade_scores
         WHERE grade_id IN (SELECT id FROM grades WHERE student_id = ?)",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grade_scores" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM grades WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
