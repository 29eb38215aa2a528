//! Conversation state machine.
//!
//! `transition` is a pure function of the current state, the parsed input
//! and a read-only snapshot of what the engine looked up for this message.
//! Anything that touches storage or the ledger comes back as an `Effect`.

use chrono::NaiveDate;

use crate::conversation::prompts;
use crate::kyc::model::{
    Profile, User, validate_birthdate, validate_email, validate_name, validate_phone,
};
use crate::quiz::model::Quiz;

/// Identity collection, one variant per field still to ask for. Each
/// variant carries the fields collected so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KycStep {
    Name,
    Birthdate {
        full_name: String,
    },
    Phone {
        full_name: String,
        birthdate: NaiveDate,
    },
    Email {
        full_name: String,
        birthdate: NaiveDate,
        phone: String,
    },
}

/// Quiz progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuizStep {
    /// Waiting for the user to accept.
    Offered { quiz_id: i64 },
    /// Waiting for the answer to question `index` (zero-based).
    Question { quiz_id: i64, index: usize, score: u32 },
}

impl QuizStep {
    pub fn quiz_id(&self) -> i64 {
        match self {
            Self::Offered { quiz_id } | Self::Question { quiz_id, .. } => *quiz_id,
        }
    }
}

/// Per-user session state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Kyc(KycStep),
    Quiz(QuizStep),
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// The quiz this session is in, if any.
    pub fn quiz_id(&self) -> Option<i64> {
        match self {
            Self::Quiz(step) => Some(step.quiz_id()),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Kyc(KycStep::Name) => "kyc_name",
            Self::Kyc(KycStep::Birthdate { .. }) => "kyc_birthdate",
            Self::Kyc(KycStep::Phone { .. }) => "kyc_phone",
            Self::Kyc(KycStep::Email { .. }) => "kyc_email",
            Self::Quiz(QuizStep::Offered { .. }) => "quiz_offered",
            Self::Quiz(QuizStep::Question { .. }) => "quiz_question",
        };
        write!(f, "{s}")
    }
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Start,
    Cancel,
    Help,
    ListQuizzes,
    PickQuiz(i64),
    Wallet,
    Text(String),
}

impl Input {
    pub fn parse(raw: &str) -> Self {
        let text = raw.trim();
        if text.eq_ignore_ascii_case("cancel") {
            return Self::Cancel;
        }
        let Some(command) = text.strip_prefix('/') else {
            return Self::Text(text.to_string());
        };

        let mut parts = command.split_whitespace();
        // Group chats append the bot name: /start@learn_earn_bot
        let name = parts
            .next()
            .unwrap_or_default()
            .split('@')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let arg = parts.next();

        match (name.as_str(), arg) {
            ("start", _) => Self::Start,
            ("cancel", _) => Self::Cancel,
            ("help", _) => Self::Help,
            ("wallet", _) => Self::Wallet,
            ("quiz", None) => Self::ListQuizzes,
            ("quiz", Some(id)) => match id.parse() {
                Ok(id) => Self::PickQuiz(id),
                Err(_) => Self::Text(text.to_string()),
            },
            _ => Self::Text(text.to_string()),
        }
    }
}

/// What the engine looked up before running the transition.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub today: NaiveDate,
    pub user: Option<&'a User>,
    /// The quiz named by the input, or the one the session is in.
    pub quiz: Option<&'a Quiz>,
    /// Whether the user already passed `quiz`.
    pub quiz_passed: bool,
}

impl Context<'_> {
    fn is_approved(&self) -> bool {
        self.user.is_some_and(User::is_approved)
    }
}

/// Side effect the engine must run after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Reply(String),
    /// Persist the collected profile and confirm.
    SubmitProfile(Profile),
    ListQuizzes,
    ShowWallet,
    /// Score the finished quiz and pay out on a pass.
    Settle { quiz_id: i64, score: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: SessionState,
    pub effect: Effect,
}

impl Transition {
    fn reply(next: SessionState, text: impl Into<String>) -> Self {
        Self {
            next,
            effect: Effect::Reply(text.into()),
        }
    }

    fn stay(state: &SessionState, text: impl Into<String>) -> Self {
        Self::reply(state.clone(), text)
    }
}

/// The prompt that is waiting for an answer in `state`.
pub fn pending_prompt(state: &SessionState, ctx: &Context<'_>) -> String {
    match state {
        SessionState::Idle => prompts::HELP.to_string(),
        SessionState::Kyc(step) => kyc_prompt(step).to_string(),
        SessionState::Quiz(QuizStep::Offered { .. }) => prompts::ANSWER_YES_NO.to_string(),
        SessionState::Quiz(QuizStep::Question { index, .. }) => match ctx.quiz {
            Some(quiz) => prompts::question(quiz, *index),
            None => prompts::TRY_AGAIN_LATER.to_string(),
        },
    }
}

fn kyc_prompt(step: &KycStep) -> &'static str {
    match step {
        KycStep::Name => prompts::ASK_NAME,
        KycStep::Birthdate { .. } => prompts::ASK_BIRTHDATE,
        KycStep::Phone { .. } => prompts::ASK_PHONE,
        KycStep::Email { .. } => prompts::ASK_EMAIL,
    }
}

/// `state × input → (next state, effect)`.
pub fn transition(state: &SessionState, input: Input, ctx: &Context<'_>) -> Transition {
    match (state, input) {
        // ── Commands valid everywhere ───────────────────────────────
        (SessionState::Idle, Input::Cancel) => {
            Transition::reply(SessionState::Idle, prompts::NOTHING_TO_CANCEL)
        }
        (_, Input::Cancel) => Transition::reply(SessionState::Idle, prompts::CANCELLED),
        (_, Input::Help) => Transition::stay(state, prompts::HELP),
        (_, Input::Start) if ctx.is_approved() => {
            Transition::stay(state, prompts::ALREADY_VERIFIED)
        }
        (_, Input::Start) => Transition::reply(SessionState::Kyc(KycStep::Name), prompts::ASK_NAME),

        // ── Idle ────────────────────────────────────────────────────
        (SessionState::Idle, Input::ListQuizzes) => Transition {
            next: SessionState::Idle,
            effect: Effect::ListQuizzes,
        },
        (SessionState::Idle, Input::Wallet) if ctx.is_approved() => Transition {
            next: SessionState::Idle,
            effect: Effect::ShowWallet,
        },
        (SessionState::Idle, Input::Wallet) => {
            Transition::reply(SessionState::Idle, prompts::NOT_VERIFIED)
        }
        (SessionState::Idle, Input::PickQuiz(id)) => offer_quiz(id, ctx),
        (SessionState::Idle, Input::Text(_)) => {
            Transition::reply(SessionState::Idle, prompts::HELP)
        }

        // ── Mid-dialogue commands wait for the current step ─────────
        (_, Input::ListQuizzes | Input::Wallet | Input::PickQuiz(_)) => Transition::stay(
            state,
            format!("{}\n\n{}", prompts::BUSY, pending_prompt(state, ctx)),
        ),

        // ── Identity collection ─────────────────────────────────────
        (SessionState::Kyc(step), Input::Text(text)) => kyc_step(step, &text, ctx),

        // ── Quiz ────────────────────────────────────────────────────
        (SessionState::Quiz(step), Input::Text(text)) => quiz_step(state, *step, &text, ctx),
    }
}

fn offer_quiz(id: i64, ctx: &Context<'_>) -> Transition {
    if !ctx.is_approved() {
        return Transition::reply(SessionState::Idle, prompts::NOT_VERIFIED);
    }
    let Some(quiz) = ctx.quiz.filter(|q| q.id == id) else {
        return Transition::reply(SessionState::Idle, prompts::QUIZ_NOT_FOUND);
    };
    if ctx.quiz_passed {
        return Transition::reply(SessionState::Idle, prompts::already_completed(quiz));
    }
    Transition::reply(
        SessionState::Quiz(QuizStep::Offered { quiz_id: id }),
        prompts::offer(quiz),
    )
}

fn kyc_step(step: &KycStep, text: &str, ctx: &Context<'_>) -> Transition {
    let invalid = |reason: String| {
        Transition::reply(
            SessionState::Kyc(step.clone()),
            prompts::invalid_field(&reason, kyc_prompt(step)),
        )
    };

    match step {
        KycStep::Name => match validate_name(text) {
            Ok(full_name) => Transition::reply(
                SessionState::Kyc(KycStep::Birthdate { full_name }),
                prompts::ASK_BIRTHDATE,
            ),
            Err(e) => invalid(e.to_string()),
        },
        KycStep::Birthdate { full_name } => match validate_birthdate(text, ctx.today) {
            Ok(birthdate) => Transition::reply(
                SessionState::Kyc(KycStep::Phone {
                    full_name: full_name.clone(),
                    birthdate,
                }),
                prompts::ASK_PHONE,
            ),
            Err(e) => invalid(e.to_string()),
        },
        KycStep::Phone {
            full_name,
            birthdate,
        } => match validate_phone(text) {
            Ok(phone) => Transition::reply(
                SessionState::Kyc(KycStep::Email {
                    full_name: full_name.clone(),
                    birthdate: *birthdate,
                    phone,
                }),
                prompts::ASK_EMAIL,
            ),
            Err(e) => invalid(e.to_string()),
        },
        KycStep::Email {
            full_name,
            birthdate,
            phone,
        } => match validate_email(text) {
            Ok(email) => Transition {
                next: SessionState::Idle,
                effect: Effect::SubmitProfile(Profile {
                    full_name: full_name.clone(),
                    birthdate: *birthdate,
                    phone: phone.clone(),
                    email,
                }),
            },
            Err(e) => invalid(e.to_string()),
        },
    }
}

fn quiz_step(state: &SessionState, step: QuizStep, text: &str, ctx: &Context<'_>) -> Transition {
    let Some(quiz) = ctx.quiz.filter(|q| q.id == step.quiz_id()) else {
        return Transition::reply(SessionState::Idle, prompts::QUIZ_NOT_FOUND);
    };

    match step {
        QuizStep::Offered { quiz_id } => match text.to_ascii_lowercase().as_str() {
            "yes" | "y" | "start" => Transition::reply(
                SessionState::Quiz(QuizStep::Question {
                    quiz_id,
                    index: 0,
                    score: 0,
                }),
                prompts::question(quiz, 0),
            ),
            "no" | "n" => Transition::reply(SessionState::Idle, prompts::DECLINED),
            _ => Transition::stay(state, prompts::ANSWER_YES_NO),
        },
        QuizStep::Question {
            quiz_id,
            index,
            score,
        } => {
            let Some(question) = quiz.question(index) else {
                return Transition::reply(SessionState::Idle, prompts::TRY_AGAIN_LATER);
            };
            let Some(selection) = question.parse_selection(text) else {
                return Transition::stay(state, prompts::invalid_answer(quiz, index));
            };

            let correct = question.is_correct(selection);
            let score = score + u32::from(correct);
            let next_index = index + 1;

            if next_index < quiz.questions.len() {
                Transition::reply(
                    SessionState::Quiz(QuizStep::Question {
                        quiz_id,
                        index: next_index,
                        score,
                    }),
                    format!(
                        "{}\n\n{}",
                        prompts::answer_feedback(correct),
                        prompts::question(quiz, next_index)
                    ),
                )
            } else {
                Transition {
                    next: SessionState::Idle,
                    effect: Effect::Settle { quiz_id, score },
                }
            }
        }
    }
}
