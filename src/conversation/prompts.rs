//! User-facing message text.

use rust_decimal::Decimal;

use crate::quiz::model::{Quiz, QuizCompletion};

pub const ASK_NAME: &str =
    "Welcome to the identity verification process! 🚀\n\nPlease enter your full name:";
pub const ASK_BIRTHDATE: &str = "Thanks! Now please enter your birthdate (YYYY-MM-DD):";
pub const ASK_PHONE: &str = "Great! Now please enter your phone number:";
pub const ASK_EMAIL: &str = "Almost done! Finally, please enter your email address:";

pub const SUBMITTED: &str = "Thank you! Your information has been submitted for review. \
     You will be notified once it's approved. ✅";
pub const RESUBMITTED: &str = "Thank you! Your updated information replaces your earlier \
     submission and is waiting for review. ✅";
pub const ALREADY_VERIFIED: &str =
    "You are already verified. Send /quiz to see available quizzes or /wallet to see your wallet.";

pub const CANCELLED: &str = "Cancelled. You can start again at any time.";
pub const NOTHING_TO_CANCEL: &str = "There is nothing to cancel.";

pub const HELP: &str = "Here is what I can do:\n\
     /start - verify your identity\n\
     /quiz - list quizzes you can take\n\
     /quiz <id> - take a quiz\n\
     /wallet - show your wallet address and balance\n\
     /cancel - stop the current conversation\n\
     /help - show this message";

pub const NOT_VERIFIED: &str =
    "You need to complete identity verification and be approved first. Send /start to begin.";
pub const QUIZ_NOT_FOUND: &str = "I couldn't find that quiz. Send /quiz to see what's available.";
pub const NO_QUIZZES: &str = "There are no quizzes available right now.";
pub const ANSWER_YES_NO: &str = "Please reply *yes* to start the quiz or *no* to skip it.";
pub const DECLINED: &str = "No problem. Send /quiz whenever you're ready.";
pub const BUSY: &str = "Let's finish what we started first, or send /cancel to stop.";

pub const TRY_AGAIN_LATER: &str =
    "Sorry, something went wrong on our side. Please try again later.";
pub const WALLET_UNAVAILABLE: &str =
    "Your wallet balance is unavailable right now. Please try again later.";

pub fn invalid_field(reason: &str, prompt: &str) -> String {
    format!("That doesn't look right: {reason}.\n\n{prompt}")
}

pub fn offer(quiz: &Quiz) -> String {
    let badge = if quiz.credential_template.is_some() {
        " and a completion badge"
    } else {
        ""
    };
    format!(
        "📚 *{}*\n{} questions. Get {} right to earn {}{badge}.\n\n{ANSWER_YES_NO}",
        quiz.name,
        quiz.total(),
        quiz.pass_threshold,
        quiz.reward_amount,
    )
}

pub fn already_completed(quiz: &Quiz) -> String {
    format!("You have already completed *{}*. Well done! 🎉", quiz.name)
}

pub fn question(quiz: &Quiz, index: usize) -> String {
    let Some(q) = quiz.question(index) else {
        return TRY_AGAIN_LATER.to_string();
    };
    let options: Vec<String> = q
        .options
        .iter()
        .enumerate()
        .map(|(i, opt)| format!("{}. {opt}", i + 1))
        .collect();
    format!(
        "Question {}/{}: {}\n{}",
        index + 1,
        quiz.total(),
        q.prompt,
        options.join("\n")
    )
}

pub fn invalid_answer(quiz: &Quiz, index: usize) -> String {
    format!(
        "Please answer with an option number or the option text.\n\n{}",
        question(quiz, index)
    )
}

pub fn answer_feedback(correct: bool) -> &'static str {
    if correct { "✅ Correct!" } else { "❌ Not quite." }
}

pub fn quiz_list(quizzes: &[Quiz]) -> String {
    if quizzes.is_empty() {
        return NO_QUIZZES.to_string();
    }
    let lines: Vec<String> = quizzes
        .iter()
        .map(|q| {
            format!(
                "/quiz {} - {} ({} questions, reward {})",
                q.id,
                q.name,
                q.total(),
                q.reward_amount
            )
        })
        .collect();
    format!("Available quizzes:\n{}", lines.join("\n"))
}

pub fn not_passed(quiz: &Quiz, completion: &QuizCompletion) -> String {
    format!(
        "You scored {}/{} on *{}*. You need {} correct answers to pass. Send /quiz {} to try again.",
        completion.score, completion.total, quiz.name, quiz.pass_threshold, quiz.id
    )
}

pub fn rewarded(quiz: &Quiz, completion: &QuizCompletion) -> String {
    let mut text = format!(
        "🎉 You passed *{}* with {}/{}! {} has been sent to your wallet.",
        quiz.name, completion.score, completion.total, quiz.reward_amount
    );
    if let Some(tx) = &completion.reward_tx {
        text.push_str(&format!("\nTransaction: {tx}"));
    }
    match (&completion.credential, &quiz.credential_template) {
        (Some(credential), _) => {
            text.push_str(&format!(
                "\nYour badge has been minted (token #{}).",
                credential.token_id
            ));
        }
        (None, Some(_)) => {
            text.push_str("\nYour badge is pending and will be issued later.");
        }
        (None, None) => {}
    }
    text
}

pub fn already_rewarded(
    quiz: &Quiz,
    completion: &QuizCompletion,
    original: &QuizCompletion,
) -> String {
    if original.reward_tx.is_none() {
        return payment_under_review(quiz);
    }
    format!(
        "You passed *{}* again with {}/{}! You were already rewarded for this quiz.",
        quiz.name, completion.score, completion.total
    )
}

/// Reply after a failed transfer. `retryable` means nothing was paid and
/// sending `/quiz <id>` again will retry the payment.
pub fn reward_failed(quiz: &Quiz, retryable: bool) -> String {
    if retryable {
        format!(
            "You passed *{}*! Your reward could not be sent right now. \
             Send /quiz {} later to retry the payment.",
            quiz.name, quiz.id
        )
    } else {
        payment_under_review(quiz)
    }
}

fn payment_under_review(quiz: &Quiz) -> String {
    format!(
        "You passed *{}*! Your reward payment for this quiz is under review.",
        quiz.name
    )
}

pub fn wallet(address: &str, balance: Option<Decimal>) -> String {
    match balance {
        Some(balance) => format!("💼 Wallet address: {address}\nBalance: {balance}"),
        None => format!("💼 Wallet address: {address}\n{WALLET_UNAVAILABLE}"),
    }
}
