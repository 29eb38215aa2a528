//! Chat conversations: the per-user state machine and the workers that
//! run it one message at a time.

pub mod dispatcher;
pub mod engine;
pub mod prompts;
pub mod state;

pub use dispatcher::{EngineResponder, SessionDispatcher, SessionHandler};
pub use engine::ConversationEngine;
pub use state::{Input, SessionState};
