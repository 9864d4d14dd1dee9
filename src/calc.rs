use serde::{Deserialize, Serialize};

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 10.0;

/// Outcome classification for one grade record. Variant order is the
/// tier order used by monotonicity checks: incomplete < failed <
/// recovery < approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeStatus {
    Incomplete,
    Failed,
    Recovery,
    Approved,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScoreError {
    Validation { message: String },
    IndexOutOfRange { index: usize, len: usize },
}

impl ScoreError {
    pub fn code(&self) -> &'static str {
        match self {
            ScoreError::Validation { .. } => "validation_error",
            ScoreError::IndexOutOfRange { .. } => "index_out_of_range",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ScoreError::Validation { message } => message.clone(),
            ScoreError::IndexOutOfRange { index, len } => {
                format!("score index {} out of range for {} scores", index, len)
            }
        }
    }
}

fn validate_score(value: f64) -> Result<(), ScoreError> {
    if !value.is_finite() || value < SCORE_MIN || value > SCORE_MAX {
        return Err(ScoreError::Validation {
            message: format!("score must be between {} and {}", SCORE_MIN, SCORE_MAX),
        });
    }
    Ok(())
}

/// Arithmetic mean of the score sequence. An empty sequence averages to
/// 0.0 by contract; classification then resolves to incomplete anyway.
pub fn compute_average(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / (scores.len() as f64)
}

/// Pure threshold classification. A record with fewer scores than the
/// subject expects is incomplete regardless of its running average.
pub fn classify_status(
    average: f64,
    passing_average: f64,
    recovery_average: f64,
    score_count: usize,
    expected_count: usize,
) -> GradeStatus {
    if score_count == 0 || score_count < expected_count {
        return GradeStatus::Incomplete;
    }
    if average >= passing_average {
        GradeStatus::Approved
    } else if average >= recovery_average {
        GradeStatus::Recovery
    } else {
        GradeStatus::Failed
    }
}

/// Per-subject thresholds driving average/status derivation.
/// No ordering between recovery and passing is assumed; the backend
/// does not guarantee recovery_average <= passing_average.
#[derive(Debug, Clone, Copy)]
pub struct SubjectRules {
    pub expected_count: usize,
    pub passing_average: f64,
    pub recovery_average: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub id: String,
    pub student_id: String,
    pub subject_id: String,
    pub scores: Vec<f64>,
    pub average: f64,
    pub status: GradeStatus,
}

impl GradeRecord {
    pub fn new(
        id: String,
        student_id: String,
        subject_id: String,
        scores: Vec<f64>,
        rules: &SubjectRules,
    ) -> Result<Self, ScoreError> {
        for v in &scores {
            validate_score(*v)?;
        }
        let mut record = GradeRecord {
            id,
            student_id,
            subject_id,
            scores,
            average: 0.0,
            status: GradeStatus::Incomplete,
        };
        record.recompute(rules);
        Ok(record)
    }

    /// Rebuilds a record from already-persisted scores. Storage only
    /// ever holds values that passed validation, so none is repeated.
    pub fn from_stored(
        id: String,
        student_id: String,
        subject_id: String,
        scores: Vec<f64>,
        rules: &SubjectRules,
    ) -> Self {
        let mut record = GradeRecord {
            id,
            student_id,
            subject_id,
            scores,
            average: 0.0,
            status: GradeStatus::Incomplete,
        };
        record.recompute(rules);
        record
    }

    fn recompute(&mut self, rules: &SubjectRules) {
        self.average = compute_average(&self.scores);
        self.status = classify_status(
            self.average,
            rules.passing_average,
            rules.recovery_average,
            self.scores.len(),
            rules.expected_count,
        );
    }

    pub fn add_score(&mut self, value: f64, rules: &SubjectRules) -> Result<(), ScoreError> {
        validate_score(value)?;
        self.scores.push(value);
        self.recompute(rules);
        Ok(())
    }

    pub fn update_score_at(
        &mut self,
        index: usize,
        value: f64,
        rules: &SubjectRules,
    ) -> Result<(), ScoreError> {
        if index >= self.scores.len() {
            return Err(ScoreError::IndexOutOfRange {
                index,
                len: self.scores.len(),
            });
        }
        validate_score(value)?;
        self.scores[index] = value;
        self.recompute(rules);
        Ok(())
    }

    pub fn replace_all_scores(
        &mut self,
        new_scores: Vec<f64>,
        rules: &SubjectRules,
    ) -> Result<(), ScoreError> {
        if new_scores.is_empty() {
            return Err(ScoreError::Validation {
                message: "scores must not be empty".to_string(),
            });
        }
        for v in &new_scores {
            validate_score(*v)?;
        }
        self.scores = new_scores;
        self.recompute(rules);
        Ok(())
    }

    pub fn remove_score_at(
        &mut self,
        index: usize,
        rules: &SubjectRules,
    ) -> Result<(), ScoreError> {
        if index >= self.scores.len() {
            return Err(ScoreError::IndexOutOfRange {
                index,
                len: self.scores.len(),
            });
        }
        self.scores.remove(index);
        self.recompute(rules);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentGrades {
    pub student_id: String,
    pub grades: Vec<GradeRecord>,
}

/// Groups a flat grade list by student, preserving first-seen student
/// order and, within a student, the original relative order of records.
/// Duplicate (student, subject) pairs pass through undeduplicated.
pub fn group_by_student(grades: &[GradeRecord]) -> Vec<StudentGrades> {
    let mut groups: Vec<StudentGrades> = Vec::new();
    for g in grades {
        match groups.iter_mut().find(|sg| sg.student_id == g.student_id) {
            Some(sg) => sg.grades.push(g.clone()),
            None => groups.push(StudentGrades {
                student_id: g.student_id.clone(),
                grades: vec![g.clone()],
            }),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(expected: usize, passing: f64, recovery: f64) -> SubjectRules {
        SubjectRules {
            expected_count: expected,
            passing_average: passing,
            recovery_average: recovery,
        }
    }

    fn record(student: &str, subject: &str, scores: Vec<f64>, r: &SubjectRules) -> GradeRecord {
        GradeRecord::new(
            format!("g-{}-{}", student, subject),
            student.to_string(),
            subject.to_string(),
            scores,
            r,
        )
        .expect("valid record")
    }

    #[test]
    fn average_of_empty_is_zero() {
        assert_eq!(compute_average(&[]), 0.0);
    }

    #[test]
    fn average_is_arithmetic_mean() {
        assert_eq!(compute_average(&[7.0, 8.0, 6.0]), 7.0);
        assert_eq!(compute_average(&[4.0, 5.0]), 4.5);
        assert_eq!(compute_average(&[10.0]), 10.0);
    }

    #[test]
    fn empty_scores_classify_incomplete_regardless_of_thresholds() {
        // Thresholds far above the score scale must not matter.
        assert_eq!(
            classify_status(0.0, 60.0, 50.0, 0, 0),
            GradeStatus::Incomplete
        );
    }

    #[test]
    fn partial_scores_classify_incomplete() {
        assert_eq!(classify_status(9.0, 6.0, 5.0, 2, 3), GradeStatus::Incomplete);
    }

    #[test]
    fn complete_records_classify_by_thresholds() {
        // [7,8,6] over 3 expected: avg 7.0 >= passing 6.0.
        assert_eq!(classify_status(7.0, 6.0, 5.0, 3, 3), GradeStatus::Approved);
        // [4,5] over 2 expected: avg 4.5 < recovery 5.0.
        assert_eq!(classify_status(4.5, 6.0, 5.0, 2, 2), GradeStatus::Failed);
        // [5,6] over 2 expected: recovery 5.0 <= avg 5.5 < passing 6.0.
        assert_eq!(classify_status(5.5, 6.0, 5.0, 2, 2), GradeStatus::Recovery);
    }

    #[test]
    fn boundary_averages_land_on_the_higher_tier() {
        assert_eq!(classify_status(6.0, 6.0, 5.0, 2, 2), GradeStatus::Approved);
        assert_eq!(classify_status(5.0, 6.0, 5.0, 2, 2), GradeStatus::Recovery);
    }

    #[test]
    fn status_ordering_matches_tiers() {
        assert!(GradeStatus::Incomplete < GradeStatus::Failed);
        assert!(GradeStatus::Failed < GradeStatus::Recovery);
        assert!(GradeStatus::Recovery < GradeStatus::Approved);
    }

    #[test]
    fn raising_a_score_never_lowers_the_status_of_a_complete_record() {
        let r = rules(3, 6.0, 5.0);
        let base = [3.0_f64, 5.0, 7.0];
        for i in 0..base.len() {
            let before = classify_status(
                compute_average(&base),
                r.passing_average,
                r.recovery_average,
                base.len(),
                r.expected_count,
            );
            let mut raised = 0.2;
            while base[i] + raised <= SCORE_MAX {
                let mut bumped = base.to_vec();
                bumped[i] += raised;
                let after = classify_status(
                    compute_average(&bumped),
                    r.passing_average,
                    r.recovery_average,
                    bumped.len(),
                    r.expected_count,
                );
                assert!(after >= before, "raising score {} lowered status", i);
                raised += 0.2;
            }
        }
    }

    #[test]
    fn add_score_rejects_out_of_range_values() {
        let r = rules(3, 6.0, 5.0);
        let mut g = record("a", "math", vec![7.0], &r);
        assert!(matches!(
            g.add_score(11.0, &r),
            Err(ScoreError::Validation { .. })
        ));
        assert!(matches!(
            g.add_score(-1.0, &r),
            Err(ScoreError::Validation { .. })
        ));
        g.add_score(10.0, &r).expect("10 is a valid score");
        assert_eq!(g.scores, vec![7.0, 10.0]);
        assert_eq!(g.average, 8.5);
        // Two of three expected scores present.
        assert_eq!(g.status, GradeStatus::Incomplete);
    }

    #[test]
    fn add_score_completes_and_classifies() {
        let r = rules(3, 6.0, 5.0);
        let mut g = record("a", "math", vec![7.0, 8.0], &r);
        g.add_score(6.0, &r).expect("valid score");
        assert_eq!(g.average, 7.0);
        assert_eq!(g.status, GradeStatus::Approved);
    }

    #[test]
    fn update_score_at_checks_bounds_and_value() {
        let r = rules(2, 6.0, 5.0);
        let mut g = record("a", "math", vec![4.0, 5.0], &r);
        assert_eq!(
            g.update_score_at(5, 7.0, &r),
            Err(ScoreError::IndexOutOfRange { index: 5, len: 2 })
        );
        assert!(matches!(
            g.update_score_at(0, 10.5, &r),
            Err(ScoreError::Validation { .. })
        ));
        g.update_score_at(0, 7.0, &r).expect("in range");
        assert_eq!(g.average, 6.0);
        assert_eq!(g.status, GradeStatus::Approved);
    }

    #[test]
    fn replace_all_scores_rejects_empty_and_out_of_range() {
        let r = rules(2, 6.0, 5.0);
        let mut g = record("a", "math", vec![4.0, 5.0], &r);
        assert!(matches!(
            g.replace_all_scores(vec![], &r),
            Err(ScoreError::Validation { .. })
        ));
        assert!(matches!(
            g.replace_all_scores(vec![5.0, 12.0], &r),
            Err(ScoreError::Validation { .. })
        ));
        // Failed replace must leave the record untouched.
        assert_eq!(g.scores, vec![4.0, 5.0]);
        g.replace_all_scores(vec![5.0, 6.0], &r).expect("valid");
        assert_eq!(g.average, 5.5);
        assert_eq!(g.status, GradeStatus::Recovery);
    }

    #[test]
    fn remove_score_at_recomputes_and_may_reopen_record() {
        let r = rules(2, 6.0, 5.0);
        let mut g = record("a", "math", vec![6.0, 8.0], &r);
        assert_eq!(g.status, GradeStatus::Approved);
        assert_eq!(
            g.remove_score_at(3, &r),
            Err(ScoreError::IndexOutOfRange { index: 3, len: 2 })
        );
        g.remove_score_at(0, &r).expect("in range");
        assert_eq!(g.scores, vec![8.0]);
        assert_eq!(g.status, GradeStatus::Incomplete);
    }

    #[test]
    fn group_by_student_preserves_first_seen_order() {
        let r = rules(1, 6.0, 5.0);
        let grades = vec![
            record("a", "math", vec![7.0], &r),
            record("b", "math", vec![5.0], &r),
            record("a", "history", vec![9.0], &r),
        ];
        let groups = group_by_student(&grades);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].student_id, "a");
        assert_eq!(groups[1].student_id, "b");
        assert_eq!(groups[0].grades.len(), 2);
        assert_eq!(groups[0].grades[0].subject_id, "math");
        assert_eq!(groups[0].grades[1].subject_id, "history");
    }

    #[test]
    fn group_by_student_keeps_duplicate_pairs() {
        let r = rules(1, 6.0, 5.0);
        let grades = vec![
            record("a", "math", vec![7.0], &r),
            record("a", "math", vec![4.0], &r),
        ];
        let groups = group_by_student(&grades);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].grades.len(), 2);
        assert_eq!(groups[0].grades[0].average, 7.0);
        assert_eq!(groups[0].grades[1].average, 4.0);
    }

    #[test]
    fn inverted_thresholds_are_honored_as_given() {
        // recovery above passing is not rejected; classification still
        // walks passing first.
        assert_eq!(classify_status(6.5, 6.0, 7.0, 2, 2), GradeStatus::Approved);
        assert_eq!(classify_status(5.0, 6.0, 7.0, 2, 2), GradeStatus::Failed);
    }
}
