use rusqlite::Connection;

use crate::auth::{Session, USER_TYPE_ADMIN};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

/// Handler guards return the ready-to-send error response as Err so
/// call sites can early-return with `?`-free match arms.
pub fn require_db<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn require_session<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a Session, serde_json::Value> {
    state
        .session
        .as_ref()
        .ok_or_else(|| err(&req.id, "not_signed_in", "sign in first", None))
}

pub fn require_admin<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a Session, serde_json::Value> {
    let session = require_session(state, req)?;
    if session.user.user_type != USER_TYPE_ADMIN {
        return Err(err(
            &req.id,
            "forbidden",
            "admin access required",
            None,
        ));
    }
    Ok(session)
}

pub fn require_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(err(
            &req.id,
            "bad_params",
            format!("missing {}", key),
            None,
        )),
    }
}

/// Optional trimmed string; empty or null collapses to None.
pub fn opt_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn require_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_f64()) {
        Some(v) => Ok(v),
        None => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a number", key),
            None,
        )),
    }
}

pub fn require_index(req: &Request, key: &str) -> Result<usize, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_u64()) {
        Some(v) => Ok(v as usize),
        None => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a non-negative integer", key),
            None,
        )),
    }
}

/// Score list param: must be an array of numbers. Range validation is
/// left to the calc core.
pub fn require_score_array(req: &Request, key: &str) -> Result<Vec<f64>, serde_json::Value> {
    let Some(arr) = req.params.get(key).and_then(|v| v.as_array()) else {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be an array", key),
            None,
        ));
    };
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(n) = v.as_f64() else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("{} must contain only numbers", key),
                None,
            ));
        };
        out.push(n);
    }
    Ok(out)
}
