//! Quiz definitions and completion records.

use std::path::Path;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::ledger::CredentialMetadata;

/// A single multiple-choice question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub prompt: String,
    pub options: Vec<String>,
    /// Zero-based index into `options`.
    pub correct_index: usize,
}

impl Question {
    /// Resolve a user's answer to a zero-based option index.
    ///
    /// Accepts a 1-based option number or the option text (case-insensitive).
    pub fn parse_selection(&self, input: &str) -> Option<usize> {
        let input = input.trim();
        if let Ok(n) = input.parse::<usize>() {
            return (1..=self.options.len()).contains(&n).then(|| n - 1);
        }
        self.options
            .iter()
            .position(|opt| opt.eq_ignore_ascii_case(input))
    }

    pub fn is_correct(&self, selection: usize) -> bool {
        selection == self.correct_index
    }
}

/// Metadata template for the credential minted on a pass.
///
/// `{score}`, `{total}` and `{quiz}` in `name` and `description` are
/// substituted at mint time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialTemplate {
    pub name: String,
    pub description: String,
    pub image_url: String,
    #[serde(default = "empty_object")]
    pub attributes: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl CredentialTemplate {
    pub fn render(&self, quiz: &Quiz, completion: &QuizCompletion) -> CredentialMetadata {
        let fill = |s: &str| {
            s.replace("{score}", &completion.score.to_string())
                .replace("{total}", &completion.total.to_string())
                .replace("{quiz}", &quiz.name)
        };

        let mut attributes = match &self.attributes {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        attributes.insert(
            "score".into(),
            serde_json::Value::String(format!("{}/{}", completion.score, completion.total)),
        );
        attributes.insert(
            "completed_at".into(),
            serde_json::Value::String(completion.completed_at.to_rfc3339()),
        );

        CredentialMetadata {
            name: fill(&self.name),
            description: fill(&self.description),
            image_url: self.image_url.clone(),
            attributes: serde_json::Value::Object(attributes),
        }
    }
}

/// A read-only quiz definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quiz {
    pub id: i64,
    pub name: String,
    pub questions: Vec<Question>,
    pub pass_threshold: u32,
    /// Native-currency reward, kept as a decimal string on the wire.
    #[serde(with = "rust_decimal::serde::str")]
    pub reward_amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_template: Option<CredentialTemplate>,
}

impl Quiz {
    pub fn total(&self) -> u32 {
        self.questions.len() as u32
    }

    pub fn passes(&self, score: u32) -> bool {
        score >= self.pass_threshold
    }

    pub fn question(&self, index: usize) -> Option<&Question> {
        self.questions.get(index)
    }
}

/// On-disk quiz definition. `passThreshold` defaults to all-correct and
/// `rewardAmount` may be a string or a number.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizDefinition {
    pub id: i64,
    pub name: String,
    pub questions: Vec<Question>,
    #[serde(default)]
    pub pass_threshold: Option<u32>,
    pub reward_amount: serde_json::Value,
    #[serde(default)]
    pub credential_template: Option<CredentialTemplate>,
}

impl QuizDefinition {
    /// Validate and convert into a `Quiz`.
    pub fn into_quiz(self) -> Result<Quiz, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidQuiz {
            quiz: self.id.to_string(),
            reason,
        };

        if self.questions.is_empty() {
            return Err(invalid("quiz has no questions".into()));
        }
        for (i, q) in self.questions.iter().enumerate() {
            if q.options.len() < 2 {
                return Err(invalid(format!("question {} needs at least two options", i + 1)));
            }
            if q.correct_index >= q.options.len() {
                return Err(invalid(format!(
                    "question {} correctIndex {} out of range",
                    i + 1,
                    q.correct_index
                )));
            }
        }

        let total = self.questions.len() as u32;
        let pass_threshold = self.pass_threshold.unwrap_or(total);
        if pass_threshold == 0 || pass_threshold > total {
            return Err(invalid(format!(
                "passThreshold {pass_threshold} must be within 1..={total}"
            )));
        }

        let raw_amount = match &self.reward_amount {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            other => return Err(invalid(format!("rewardAmount {other} is not numeric"))),
        };
        let reward_amount: Decimal = raw_amount
            .trim()
            .parse()
            .map_err(|_| invalid(format!("rewardAmount {raw_amount:?} is not numeric")))?;
        if reward_amount <= Decimal::ZERO {
            return Err(invalid("rewardAmount must be positive".into()));
        }

        Ok(Quiz {
            id: self.id,
            name: self.name,
            questions: self.questions,
            pass_threshold,
            reward_amount,
            credential_template: self.credential_template,
        })
    }
}

/// Load and validate a JSON array of quiz definitions.
pub fn load_quiz_file(path: &Path) -> Result<Vec<Quiz>, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    parse_quiz_definitions(&raw)
}

pub fn parse_quiz_definitions(raw: &str) -> Result<Vec<Quiz>, ConfigError> {
    let defs: Vec<QuizDefinition> =
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    defs.into_iter().map(QuizDefinition::into_quiz).collect()
}

/// Reference to a minted credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    pub token_id: String,
    pub transaction_ref: String,
}

/// One quiz attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizCompletion {
    pub id: Uuid,
    pub user_key: String,
    pub quiz_id: i64,
    pub score: u32,
    pub total: u32,
    pub passed: bool,
    /// Set while this attempt owns the reward for its (user, quiz) pair.
    pub reward_claimed: bool,
    pub reward_tx: Option<String>,
    pub credential: Option<CredentialRef>,
    pub completed_at: DateTime<Utc>,
}

impl QuizCompletion {
    pub fn new(user_key: &str, quiz: &Quiz, score: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_key: user_key.to_string(),
            quiz_id: quiz.id,
            score,
            total: quiz.total(),
            passed: quiz.passes(score),
            reward_claimed: false,
            reward_tx: None,
            credential: None,
            completed_at: Utc::now(),
        }
    }

    pub fn is_rewarded(&self) -> bool {
        self.reward_tx.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SOLAR: &str = r#"[{
        "id": 1,
        "name": "Solar Panel Cleaning",
        "questions": [
            {"prompt": "Best time to clean?", "options": ["Noon", "Early morning"], "correctIndex": 1},
            {"prompt": "Use a pressure washer?", "options": ["Yes", "No"], "correctIndex": 1},
            {"prompt": "Switch the system off first?", "options": ["Yes", "No"], "correctIndex": 0}
        ],
        "rewardAmount": "0.02",
        "credentialTemplate": {
            "name": "{quiz} Expert",
            "description": "Scored {score}/{total}",
            "imageUrl": "https://example.com/solar-badge.png",
            "attributes": {"category": "Solar Maintenance"}
        }
    }]"#;

    fn solar() -> Quiz {
        parse_quiz_definitions(SOLAR).unwrap().remove(0)
    }

    #[test]
    fn threshold_defaults_to_all_correct() {
        let quiz = solar();
        assert_eq!(quiz.pass_threshold, 3);
        assert_eq!(quiz.reward_amount, dec!(0.02));
        assert!(quiz.passes(3));
        assert!(!quiz.passes(2));
    }

    #[test]
    fn selection_by_number_or_text() {
        let q = &solar().questions[0];
        assert_eq!(q.parse_selection("2"), Some(1));
        assert_eq!(q.parse_selection("early MORNING"), Some(1));
        assert_eq!(q.parse_selection("0"), None);
        assert_eq!(q.parse_selection("3"), None);
        assert_eq!(q.parse_selection("dusk"), None);
    }

    #[test]
    fn non_numeric_reward_rejected() {
        let raw = SOLAR.replace("\"0.02\"", "\"lots\"");
        let err = parse_quiz_definitions(&raw).unwrap_err();
        assert!(err.to_string().contains("not numeric"), "{err}");
    }

    #[test]
    fn numeric_reward_accepted() {
        let raw = SOLAR.replace("\"0.02\"", "0.5");
        let quiz = parse_quiz_definitions(&raw).unwrap().remove(0);
        assert_eq!(quiz.reward_amount, dec!(0.5));
    }

    #[test]
    fn out_of_range_correct_index_rejected() {
        let raw = SOLAR.replace("\"correctIndex\": 0", "\"correctIndex\": 5");
        assert!(parse_quiz_definitions(&raw).is_err());
    }

    #[test]
    fn threshold_above_total_rejected() {
        let raw = SOLAR.replace("\"rewardAmount\"", "\"passThreshold\": 4, \"rewardAmount\"");
        assert!(parse_quiz_definitions(&raw).is_err());
    }

    #[test]
    fn template_renders_placeholders_and_score() {
        let quiz = solar();
        let completion = QuizCompletion::new("42", &quiz, 3);
        let meta = quiz.credential_template.as_ref().unwrap().render(&quiz, &completion);
        assert_eq!(meta.name, "Solar Panel Cleaning Expert");
        assert_eq!(meta.description, "Scored 3/3");
        assert_eq!(meta.attributes["category"], "Solar Maintenance");
        assert_eq!(meta.attributes["score"], "3/3");
        assert!(meta.attributes.get("completed_at").is_some());
    }

    #[test]
    fn quiz_serde_keeps_amount_as_string() {
        let quiz = solar();
        let json = serde_json::to_value(&quiz).unwrap();
        assert_eq!(json["rewardAmount"], "0.02");
        let back: Quiz = serde_json::from_value(json).unwrap();
        assert_eq!(back, quiz);
    }
}
