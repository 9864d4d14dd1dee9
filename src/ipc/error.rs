use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Multi-field validation failure. Carries the individual messages in
/// `errors` and a newline-joined `message` so consumers can display
/// either form without probing the shape.
pub fn err_fields(id: &str, errors: Vec<String>) -> serde_json::Value {
    json!({
        "id": id,
        "ok": false,
        "error": {
            "code": "validation_error",
            "message": errors.join("\n"),
            "errors": errors,
        },
    })
}
