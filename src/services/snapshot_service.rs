use crate::error::{Error, Result};
use crate::models::snapshot::{
    QuestionCategory, QuestionPayload, QuestionStatus, SectionStatus, SnapshotQuestion,
    SnapshotSection, SnapshotSettings, TestSnapshot,
};
use crate::models::test_definition::{DefinitionQuestion, TestRow};
use crate::utils::seed::{derive_shuffle_seed, seed_to_hex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use uuid::Uuid;

pub struct SnapshotBuilder;

impl SnapshotBuilder {
    /// Freezes a resolved test definition into a per-attempt snapshot.
    pub fn build(test: &TestRow, user_id: Uuid) -> Result<TestSnapshot> {
        Self::build_with_seed(test, derive_shuffle_seed(user_id, test.id))
    }

    /// Seed-explicit variant: a given seed always produces the same order.
    pub fn build_with_seed(test: &TestRow, seed: u64) -> Result<TestSnapshot> {
        let settings = test.settings()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: i32 = 0;

        let mut snapshot = TestSnapshot {
            title: test.title.clone(),
            description: test.description.clone(),
            settings: SnapshotSettings {
                time_limit_minutes: settings.time_limit_minutes,
                attempts_allowed: settings.attempts_allowed,
                shuffle_questions: settings.shuffle_questions,
                use_sections: settings.use_sections,
                passing_score: settings.passing_score,
            },
            shuffle_seed: seed_to_hex(seed),
            sections: Vec::new(),
            questions: Vec::new(),
        };

        if settings.use_sections {
            for def in test.definition_sections()? {
                let mut questions = materialize(def.questions)?;
                if settings.shuffle_questions {
                    questions.shuffle(&mut rng);
                }
                stamp_final_order(&mut questions, &mut order);
                snapshot.sections.push(SnapshotSection {
                    name: def.name,
                    time_limit_minutes: def.time_limit_minutes,
                    status: SectionStatus::NotStarted,
                    started_at: None,
                    submitted_at: None,
                    questions,
                });
            }
        } else {
            let mut questions = materialize(test.definition_questions()?)?;
            if settings.shuffle_questions {
                questions.shuffle(&mut rng);
            }
            stamp_final_order(&mut questions, &mut order);
            snapshot.questions = questions;
        }

        Ok(snapshot)
    }
}

fn materialize(defs: Vec<DefinitionQuestion>) -> Result<Vec<SnapshotQuestion>> {
    defs.into_iter()
        .enumerate()
        .map(|(idx, def)| {
            validate_code_question(&def)?;
            Ok(SnapshotQuestion {
                question_id: if def.question_id > 0 {
                    def.question_id
                } else {
                    (idx as i32) + 1
                },
                prompt: def.prompt,
                language: def.language,
                difficulty: def.difficulty,
                category: def.category,
                points: def.points,
                final_order: 0,
                payload: def.payload,
                student_answer: None,
                status: QuestionStatus::NotViewed,
                time_spent_seconds: 0,
                view_count: 0,
                first_viewed_at: None,
                last_viewed_at: None,
                is_correct: None,
                points_earned: None,
            })
        })
        .collect()
}

/// Data-integrity guard: an auto-graded code question that cannot be
/// executed is an authoring bug, caught before any student sees it.
fn validate_code_question(def: &DefinitionQuestion) -> Result<()> {
    if def.category != Some(QuestionCategory::Logic) {
        return Ok(());
    }
    let code = match &def.payload {
        QuestionPayload::CodeChallenge(c) | QuestionPayload::Debugging(c) => c,
        _ => return Ok(()),
    };
    if code.entry_function.as_deref().unwrap_or("").is_empty() {
        return Err(Error::Validation(format!(
            "Code question '{}' is missing an entry function",
            def.prompt
        )));
    }
    if code.runtime.as_deref().unwrap_or("").is_empty() {
        return Err(Error::Validation(format!(
            "Code question '{}' is missing a runtime",
            def.prompt
        )));
    }
    if code.test_cases.is_empty() {
        return Err(Error::Validation(format!(
            "Code question '{}' has no test cases",
            def.prompt
        )));
    }
    Ok(())
}

fn stamp_final_order(questions: &mut [SnapshotQuestion], order: &mut i32) {
    for q in questions.iter_mut() {
        q.final_order = *order;
        *order += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_row(question_count: usize, shuffle: bool) -> TestRow {
        let questions: Vec<serde_json::Value> = (0..question_count)
            .map(|i| {
                json!({
                    "question_id": i + 1,
                    "prompt": format!("Question {}", i + 1),
                    "question_type": "true_false",
                    "correct_answer": 0,
                    "points": 1.0,
                })
            })
            .collect();
        TestRow {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            is_global: false,
            title: "Sample".into(),
            description: None,
            status: "active".into(),
            settings: json!({
                "time_limit_minutes": 30,
                "attempts_allowed": 2,
                "shuffle_questions": shuffle,
                "use_sections": false,
            }),
            sections: None,
            questions: Some(json!(questions)),
            created_by: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn order_of(snapshot: &TestSnapshot) -> Vec<i32> {
        snapshot.questions.iter().map(|q| q.question_id).collect()
    }

    #[test]
    fn same_seed_builds_identical_order() {
        let test = test_row(20, true);
        let a = SnapshotBuilder::build_with_seed(&test, 42).unwrap();
        let b = SnapshotBuilder::build_with_seed(&test, 42).unwrap();
        assert_eq!(order_of(&a), order_of(&b));
    }

    #[test]
    fn different_seeds_build_different_orders() {
        let test = test_row(20, true);
        let a = SnapshotBuilder::build_with_seed(&test, 1).unwrap();
        let b = SnapshotBuilder::build_with_seed(&test, 2).unwrap();
        assert_ne!(order_of(&a), order_of(&b));
    }

    #[test]
    fn shuffle_disabled_preserves_authored_order() {
        let test = test_row(10, false);
        let snap = SnapshotBuilder::build_with_seed(&test, 99).unwrap();
        assert_eq!(order_of(&snap), (1..=10).collect::<Vec<i32>>());
    }

    #[test]
    fn final_order_is_stamped_after_shuffling() {
        let test = test_row(12, true);
        let snap = SnapshotBuilder::build_with_seed(&test, 7).unwrap();
        let orders: Vec<i32> = snap.questions.iter().map(|q| q.final_order).collect();
        assert_eq!(orders, (0..12).collect::<Vec<i32>>());
    }

    #[test]
    fn student_fields_start_zeroed() {
        let test = test_row(3, false);
        let snap = SnapshotBuilder::build_with_seed(&test, 0).unwrap();
        for q in &snap.questions {
            assert_eq!(q.status, QuestionStatus::NotViewed);
            assert!(q.student_answer.is_none());
            assert_eq!(q.view_count, 0);
        }
    }

    #[test]
    fn logic_code_question_without_test_cases_is_rejected() {
        let mut test = test_row(1, false);
        test.questions = Some(json!([{
            "prompt": "Implement add",
            "question_type": "code_challenge",
            "category": "logic",
            "entry_function": "add",
            "runtime": "node18",
            "test_cases": [],
        }]));
        let err = SnapshotBuilder::build_with_seed(&test, 0).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn ui_code_question_without_runtime_is_allowed() {
        let mut test = test_row(1, false);
        test.questions = Some(json!([{
            "prompt": "Style the button",
            "question_type": "code_challenge",
            "category": "ui",
        }]));
        assert!(SnapshotBuilder::build_with_seed(&test, 0).is_ok());
    }
}
