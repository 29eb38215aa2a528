//! Persistence layer: libSQL-backed storage for users, quizzes and
//! completions.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, ProvisionClaim, RewardClaim};
