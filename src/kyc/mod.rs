//! Identity verification: user records and approval.

pub mod approval;
pub mod model;

pub use approval::{Approval, ApprovalCoordinator};
pub use model::{Profile, ProfileUpsert, User, VerificationStatus};
