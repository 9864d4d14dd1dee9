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
    let exe = env!("CARGO_BIN_EXE_escolad");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn escolad");
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
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn select_workspace(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, prefix: &str) {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
}

#[test]
fn students_create_list_update_delete_round_trip() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, "escolad-students-crud");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({
            "name": "Ana Souza",
            "email": "ana@example.com",
            "registrationNumber": "2024-001",
            "phone": "11 99999-0000"
        }),
    );
    let student_id = created
        .pointer("/student/id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string();
    assert_eq!(
        created.pointer("/student/registrationNumber").and_then(|v| v.as_str()),
        Some("2024-001")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({
            "name": "Bruno Lima",
            "email": "bruno@example.com",
            "registrationNumber": "2024-002"
        }),
    );

    let listed = request_ok(&mut stdin, &mut reader, "3", "students.list", json!({}));
    let students = listed
        .get("students")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(students.len(), 2);

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.update",
        json!({
            "studentId": student_id,
            "patch": { "name": "Ana S. Souza", "phone": null }
        }),
    );
    assert_eq!(updated.get("ok").and_then(|v| v.as_bool()), Some(true));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.list",
        json!({ "search": "ana s." }),
    );
    let students = listed
        .get("students")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(students.len(), 1);
    assert_eq!(
        students[0].get("name").and_then(|v| v.as_str()),
        Some("Ana S. Souza")
    );
    assert!(students[0].get("phone").unwrap().is_null());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "7", "students.list", json!({}));
    assert_eq!(
        listed
            .get("students")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );
}

#[test]
fn students_search_matches_email_and_registration() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, "escolad-students-search");

    for (i, (name, email, reg)) in [
        ("Ana Souza", "ana@escola.br", "2024-001"),
        ("Bruno Lima", "bruno@escola.br", "2024-002"),
        ("Carla Dias", "carla@outra.br", "2023-117"),
    ]
    .iter()
    .enumerate()
    {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("c{}", i),
            "students.create",
            json!({ "name": name, "email": email, "registrationNumber": reg }),
        );
    }

    let by_email = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.list",
        json!({ "search": "ESCOLA.BR" }),
    );
    assert_eq!(
        by_email
            .get("students")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(2)
    );

    let by_reg = request_ok(
        &mut stdin,
        &mut reader,
        "s2",
        "students.list",
        json!({ "search": "2023-" }),
    );
    let students = by_reg
        .get("students")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(students.len(), 1);
    assert_eq!(
        students[0].get("name").and_then(|v| v.as_str()),
        Some("Carla Dias")
    );
}

#[test]
fn students_create_collects_all_missing_fields() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, "escolad-students-validation");

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "phone": "11 98888-7777" }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("validation_error")
    );
    let errors = resp
        .pointer("/error/errors")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(errors.len(), 3);
    // The joined message is the newline display form of the same list.
    let message = resp
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    assert_eq!(message.lines().count(), 3);
}

#[test]
fn duplicate_registration_number_is_rejected() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, "escolad-students-dup");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "name": "Ana", "email": "ana@example.com", "registrationNumber": "R-1" }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "name": "Outra Ana", "email": "ana2@example.com", "registrationNumber": "R-1" }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("validation_error")
    );
    assert_eq!(
        resp.pointer("/error/details/field").and_then(|v| v.as_str()),
        Some("registrationNumber")
    );
}
