use crate::calc::{self, GradeRecord, SubjectRules};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn db(e: rusqlite::Error) -> Self {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

fn load_rules(conn: &Connection, subject_id: &str) -> Result<SubjectRules, HandlerErr> {
    let row: Option<(i64, f64, f64)> = conn
        .query_row(
            "SELECT number_of_grades, passing_average, recovery_average
             FROM subjects
             WHERE id = ?",
            [subject_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((number_of_grades, passing_average, recovery_average)) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: None,
        });
    };
    Ok(SubjectRules {
        expected_count: number_of_grades.max(0) as usize,
        passing_average,
        recovery_average,
    })
}

fn load_scores(conn: &Connection, grade_id: &str) -> Result<Vec<f64>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT value FROM grade_scores WHERE grade_id = ? ORDER BY idx")
        .map_err(HandlerErr::db)?;
    stmt.query_map([grade_id], |r| r.get::<_, f64>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)
}

/// Loads one grade with its ordered scores and the owning subject's
/// thresholds, recomputing average/status on the way out.
fn load_grade(conn: &Connection, grade_id: &str) -> Result<(GradeRecord, SubjectRules), HandlerErr> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT student_id, subject_id FROM grades WHERE id = ?",
            [grade_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((student_id, subject_id)) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "grade not found".to_string(),
            details: None,
        });
    };

    let rules = load_rules(conn, &subject_id)?;
    let scores = load_scores(conn, grade_id)?;
    let record = GradeRecord::from_stored(
        grade_id.to_string(),
        student_id,
        subject_id,
        scores,
        &rules,
    );
    Ok((record, rules))
}

/// Rewrites the full score sequence for a grade inside one transaction
/// and bumps updated_at.
fn persist_scores(conn: &Connection, grade_id: &str, scores: &[f64]) -> Result<(), HandlerErr> {
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    tx.execute("DELETE FROM grade_scores WHERE grade_id = ?", [grade_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "grade_scores" })),
        })?;
    for (idx, value) in scores.iter().enumerate() {
        tx.execute(
            "INSERT INTO grade_scores(grade_id, idx, value) VALUES(?, ?, ?)",
            (grade_id, idx as i64, *value),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "grade_scores" })),
        })?;
    }
    tx.execute(
        "UPDATE grades SET updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?",
        [grade_id],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grades" })),
    })?;

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })
}

fn list_grade_records(
    conn: &Connection,
    student_id: Option<&str>,
    subject_id: Option<&str>,
) -> Result<Vec<GradeRecord>, HandlerErr> {
    let mut where_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(sid) = student_id {
        where_parts.push("student_id = ?");
        bind_values.push(Value::Text(sid.to_string()));
    }
    if let Some(sid) = subject_id {
        where_parts.push("subject_id = ?");
        bind_values.push(Value::Text(sid.to_string()));
    }
    let where_sql = if where_parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", where_parts.join(" AND "))
    };

    // rowid order keeps creation order, which grouping relies on.
    let sql = format!(
        "SELECT id, student_id, subject_id FROM grades{} ORDER BY rowid",
        where_sql
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let grade_rows: Vec<(String, String, String)> = stmt
        .query_map(params_from_iter(bind_values), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    if grade_rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut scores_by_grade: HashMap<String, Vec<f64>> = HashMap::new();
    {
        let placeholders = std::iter::repeat("?")
            .take(grade_rows.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT grade_id, value FROM grade_scores
             WHERE grade_id IN ({})
             ORDER BY grade_id, idx",
            placeholders
        );
        let bind_values: Vec<Value> = grade_rows
            .iter()
            .map(|(id, _, _)| Value::Text(id.clone()))
            .collect();
        let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
        let rows = stmt
            .query_map(params_from_iter(bind_values), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
            })
            .map_err(HandlerErr::db)?;
        for row in rows {
            let (grade_id, value) = row.map_err(HandlerErr::db)?;
            scores_by_grade.entry(grade_id).or_default().push(value);
        }
    }

    let mut rules_by_subject: HashMap<String, SubjectRules> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT id, number_of_grades, passing_average, recovery_average
             FROM subjects",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })
        .map_err(HandlerErr::db)?;
    for row in rows {
        let (id, number_of_grades, passing_average, recovery_average) =
            row.map_err(HandlerErr::db)?;
        rules_by_subject.insert(
            id,
            SubjectRules {
                expected_count: number_of_grades.max(0) as usize,
                passing_average,
                recovery_average,
            },
        );
    }

    let mut records = Vec::with_capacity(grade_rows.len());
    for (id, student_id, subject_id) in grade_rows {
        let Some(rules) = rules_by_subject.get(&subject_id) else {
            return Err(HandlerErr {
                code: "not_found",
                message: format!("subject {} missing for grade {}", subject_id, id),
                details: None,
            });
        };
        let scores = scores_by_grade.remove(&id).unwrap_or_default();
        records.push(GradeRecord::from_stored(
            id, student_id, subject_id, scores, rules,
        ));
    }
    Ok(records)
}

fn grade_to_json(record: &GradeRecord) -> serde_json::Value {
    serde_json::to_value(record).unwrap_or_else(|_| json!({}))
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "grades": [] }));
    };
    let student_id = helpers::opt_str(req, "studentId");
    let subject_id = helpers::opt_str(req, "subjectId");

    match list_grade_records(conn, student_id.as_deref(), subject_id.as_deref()) {
        Ok(records) => {
            let grades: Vec<serde_json::Value> = records.iter().map(grade_to_json).collect();
            ok(&req.id, json!({ "grades": grades }))
        }
        Err(e) => e.response(&req.id),
    }
}

fn handle_grades_by_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };
    let subject_id = helpers::opt_str(req, "subjectId");

    match list_grade_records(conn, None, subject_id.as_deref()) {
        Ok(records) => {
            let groups = calc::group_by_student(&records);
            let students: Vec<serde_json::Value> = groups
                .iter()
                .map(|g| {
                    json!({
                        "studentId": g.student_id,
                        "grades": g.grades.iter().map(grade_to_json).collect::<Vec<_>>(),
                    })
                })
                .collect();
            ok(&req.id, json!({ "students": students }))
        }
        Err(e) => e.response(&req.id),
    }
}

fn handle_grades_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match helpers::require_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let subject_id = match helpers::require_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    // A grade may start with no scores; it classifies as incomplete.
    let scores = if req.params.get("scores").is_some() {
        match helpers::require_score_array(req, "scores") {
            Ok(v) => v,
            Err(resp) => return resp,
        }
    } else {
        Vec::new()
    };

    let student_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let rules = match load_rules(conn, &subject_id) {
        Ok(r) => r,
        Err(e) => return e.response(&req.id),
    };

    let grade_id = Uuid::new_v4().to_string();
    let record = match GradeRecord::new(
        grade_id.clone(),
        student_id.clone(),
        subject_id.clone(),
        scores,
        &rules,
    ) {
        Ok(r) => r,
        Err(e) => return err(&req.id, e.code(), e.message(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let now = crate::db::now_iso();
    if let Err(e) = tx.execute(
        "INSERT INTO grades(id, student_id, subject_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?)",
        (&grade_id, &student_id, &subject_id, &now, &now),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    for (idx, value) in record.scores.iter().enumerate() {
        if let Err(e) = tx.execute(
            "INSERT INTO grade_scores(grade_id, idx, value) VALUES(?, ?, ?)",
            (&grade_id, idx as i64, *value),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "grade_scores" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "grade": grade_to_json(&record) }))
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let grade_id = match helpers::require_str(req, "gradeId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM grades WHERE id = ?", [&grade_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "grade not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM grade_scores WHERE grade_id = ?", [&grade_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grade_scores" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM grades WHERE id = ?", [&grade_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_grades_add_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let grade_id = match helpers::require_str(req, "gradeId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let value = match helpers::require_f64(req, "value") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let (mut record, rules) = match load_grade(conn, &grade_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = record.add_score(value, &rules) {
        return err(&req.id, e.code(), e.message(), None);
    }
    if let Err(e) = persist_scores(conn, &grade_id, &record.scores) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "grade": grade_to_json(&record) }))
}

fn handle_grades_update_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let grade_id = match helpers::require_str(req, "gradeId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let index = match helpers::require_index(req, "index") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let value = match helpers::require_f64(req, "value") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let (mut record, rules) = match load_grade(conn, &grade_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = record.update_score_at(index, value, &rules) {
        return err(&req.id, e.code(), e.message(), None);
    }
    if let Err(e) = persist_scores(conn, &grade_id, &record.scores) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "grade": grade_to_json(&record) }))
}

fn handle_grades_replace_scores(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let grade_id = match helpers::require_str(req, "gradeId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let scores = match helpers::require_score_array(req, "scores") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let (mut record, rules) = match load_grade(conn, &grade_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = record.replace_all_scores(scores, &rules) {
        return err(&req.id, e.code(), e.message(), None);
    }
    if let Err(e) = persist_scores(conn, &grade_id, &record.scores) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "grade": grade_to_json(&record) }))
}

fn handle_grades_remove_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match helpers::require_db(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let grade_id = match helpers::require_str(req, "gradeId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let index = match helpers::require_index(req, "index") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let (mut record, rules) = match load_grade(conn, &grade_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = record.remove_score_at(index, &rules) {
        return err(&req.id, e.code(), e.message(), None);
    }
    if let Err(e) = persist_scores(conn, &grade_id, &record.scores) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "grade": grade_to_json(&record) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.byStudent" => Some(handle_grades_by_student(state, req)),
        "grades.create" => Some(handle_grades_create(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        "grades.addScore" => Some(handle_grades_add_score(state, req)),
        "grades.updateScore" => Some(handle_grades_update_score(state, req)),
        "grades.replaceScores" => Some(handle_grades_replace_scores(state, req)),
        "grades.removeScore" => Some(handle_grades_remove_score(state, req)),
        _ => None,
    }
}
