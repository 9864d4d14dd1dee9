use crate::auth::{self, USER_TYPE_TEACHER};
use crate::db;
use crate::ipc::error::{err, err_fields, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn teacher_row_to_json(
    id: String,
    name: String,
    email: String,
    school_id: String,
    address: Option<String>,
    phone: Option<String>,
) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "email": email,
        "schoolId": school_id,
        "address": address,
        "phone": phone,
    })
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(resp) = helpers::require_admin(state, req) {
        return resp;
    }
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, email, school_id, address, phone
         FROM users
         WHERE user_type = ?
         ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([USER_TYPE_TEACHER], |row| {
            Ok(teacher_row_to_json(
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let admin_school_id = match helpers::require_admin(state, req) {
        Ok(session) => session.user.school_id.clone(),
        Err(resp) => return resp,
    };
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let name = helpers::opt_str(req, "name");
    let email = helpers::opt_str(req, "email");
    let password = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let password_confirmation = req
        .params
        .get("passwordConfirmation")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let address = helpers::opt_str(req, "address");
    let phone = helpers::opt_str(req, "phone");
    // Teachers are enrolled under the admin's school unless stated.
    let school_id = helpers::opt_str(req, "schoolId").unwrap_or(admin_school_id);

    let mut errors: Vec<String> = Vec::new();
    if name.is_none() {
        errors.push("name is required".to_string());
    }
    if email.is_none() {
        errors.push("email is required".to_string());
    }
    if password.is_empty() {
        errors.push("password is required".to_string());
    }
    if password_confirmation.is_empty() {
        errors.push("password confirmation is required".to_string());
    } else if !password.is_empty() && password != password_confirmation {
        errors.push("passwords do not match".to_string());
    }
    if address.is_none() {
        errors.push("address is required".to_string());
    }
    if !errors.is_empty() {
        return err_fields(&req.id, errors);
    }
    let (name, email) = (name.unwrap_or_default(), email.unwrap_or_default());

    let taken: Option<i64> = match conn
        .query_row("SELECT 1 FROM users WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if taken.is_some() {
        return err(
            &req.id,
            "validation_error",
            "email already registered",
            Some(json!({ "field": "email" })),
        );
    }

    let teacher_id = Uuid::new_v4().to_string();
    let now = db::now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, name, email, password_hash, user_type, school_id, address, phone, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &teacher_id,
            &name,
            &email,
            &auth::hash_password(password),
            USER_TYPE_TEACHER,
            &school_id,
            &address,
            &phone,
            &now,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(
        &req.id,
        json!({
            "teacher": teacher_row_to_json(teacher_id, name, email, school_id, address, phone)
        }),
    )
}

fn handle_teachers_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(resp) = helpers::require_admin(state, req) {
        return resp;
    }
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let teacher_id = match helpers::require_str(req, "teacherId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    for (key, column) in [("name", "name"), ("email", "email"), ("address", "address")] {
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
    // Password changes only when explicitly provided, and always with a
    // matching confirmation.
    if let Some(v) = patch.get("password") {
        let Some(password) = v.as_str().filter(|s| !s.is_empty()) else {
            return err(
                &req.id,
                "bad_params",
                "patch.password must be a non-empty string",
                None,
            );
        };
        let confirmation = patch
            .get("passwordConfirmation")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if password != confirmation {
            return err_fields(&req.id, vec!["passwords do not match".to_string()]);
        }
        set_parts.push("password_hash = ?".into());
        bind_values.push(Value::Text(auth::hash_password(password)));
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

    let sql = format!(
        "UPDATE users SET {} WHERE id = ? AND user_type = ?",
        set_parts.join(", ")
    );
    bind_values.push(Value::Text(teacher_id.clone()));
    bind_values.push(Value::Text(USER_TYPE_TEACHER.to_string()));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "users" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_teachers_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(resp) = helpers::require_admin(state, req) {
        return resp;
    }
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let teacher_id = match helpers::require_str(req, "teacherId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM users WHERE id = ? AND user_type = ?",
            (&teacher_id, USER_TYPE_TEACHER),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    let assigned: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM subjects WHERE teacher_id = ?",
        [&teacher_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if assigned > 0 {
        return err(
            &req.id,
            "validation_error",
            "teacher still has subjects assigned",
            Some(json!({ "subjectCount": assigned })),
        );
    }

    if let Err(e) = conn.execute(
        "DELETE FROM users WHERE id = ? AND user_type = ?",
        (&teacher_id, USER_TYPE_TEACHER),
    ) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.update" => Some(handle_teachers_update(state, req)),
        "teachers.delete" => Some(handle_teachers_delete(state, req)),
        _ => None,
    }
}
