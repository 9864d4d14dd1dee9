use crate::auth::{self, User};
use crate::db;
use crate::ipc::error::{err, err_fields, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn user_to_json(user: &User) -> serde_json::Value {
    json!({
        "id": user.id,
        "name": user.name,
        "email": user.email,
        "userType": user.user_type,
        "schoolId": user.school_id,
        "address": user.address,
        "phone": user.phone,
    })
}

fn handle_register(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let user_type = helpers::opt_str(req, "userType");
    let school_id = helpers::opt_str(req, "schoolId");
    let address = helpers::opt_str(req, "address");
    let phone = helpers::opt_str(req, "phone");

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
    match user_type.as_deref() {
        None => errors.push("user type is required".to_string()),
        Some(t) if !auth::is_valid_user_type(t) => {
            errors.push("user type must be admin or teacher".to_string())
        }
        _ => {}
    }
    if school_id.is_none() {
        errors.push("school id is required".to_string());
    }
    if !errors.is_empty() {
        return err_fields(&req.id, errors);
    }
    let (name, email, user_type, school_id) = (
        name.unwrap_or_default(),
        email.unwrap_or_default(),
        user_type.unwrap_or_default(),
        school_id.unwrap_or_default(),
    );

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

    let user_id = Uuid::new_v4().to_string();
    let now = db::now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, name, email, password_hash, user_type, school_id, address, phone, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &name,
            &email,
            &auth::hash_password(password),
            &user_type,
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

    let user = User {
        id: user_id,
        name,
        email,
        user_type,
        school_id,
        address,
        phone,
    };
    ok(&req.id, json!({ "user": user_to_json(&user) }))
}

fn handle_sign_in(state: &mut AppState, req: &Request) -> serde_json::Value {
    let email = match helpers::require_str(req, "email") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let password = match req.params.get("password").and_then(|v| v.as_str()) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing password", None),
    };

    // Scope the connection borrow so the session can be written after.
    let looked_up = {
        let conn = match helpers::require_db(state, req) {
            Ok(c) => c,
            Err(resp) => return resp,
        };
        let row: Option<(String, String, String, String, String, Option<String>, Option<String>)> =
            match conn
                .query_row(
                    "SELECT id, name, password_hash, user_type, school_id, address, phone
                     FROM users
                     WHERE email = ?",
                    [&email],
                    |r| {
                        Ok((
                            r.get(0)?,
                            r.get(1)?,
                            r.get(2)?,
                            r.get(3)?,
                            r.get(4)?,
                            r.get(5)?,
                            r.get(6)?,
                        ))
                    },
                )
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
        row
    };

    let Some((id, name, password_hash, user_type, school_id, address, phone)) = looked_up else {
        return err(&req.id, "validation_error", "invalid email or password", None);
    };
    if !auth::verify_password(&password, &password_hash) {
        return err(&req.id, "validation_error", "invalid email or password", None);
    }

    let user = User {
        id,
        name,
        email,
        user_type,
        school_id,
        address,
        phone,
    };
    let token = auth::new_token();
    state.session = Some(auth::Session {
        token: token.clone(),
        user: user.clone(),
        signed_in_at: db::now_iso(),
    });

    ok(&req.id, json!({ "user": user_to_json(&user), "token": token }))
}

fn handle_sign_out(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.session = None;
    ok(&req.id, json!({ "ok": true }))
}

fn handle_current_user(state: &mut AppState, req: &Request) -> serde_json::Value {
    match helpers::require_session(state, req) {
        Ok(session) => ok(
            &req.id,
            json!({
                "user": user_to_json(&session.user),
                "token": session.token,
                "signedInAt": session.signed_in_at,
            }),
        ),
        Err(resp) => resp,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.register" => Some(handle_register(state, req)),
        "auth.signIn" => Some(handle_sign_in(state, req)),
        "auth.signOut" => Some(handle_sign_out(state, req)),
        "auth.currentUser" => Some(handle_current_user(state, req)),
        _ => None,
    }
}
