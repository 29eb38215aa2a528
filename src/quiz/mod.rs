//! Quizzes and reward settlement.

pub mod model;
pub mod reward;

pub use model::{CredentialTemplate, Question, Quiz, QuizCompletion, load_quiz_file, parse_quiz_definitions};
pub use reward::{RewardWorkflow, Settlement};
