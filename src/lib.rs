//! Learn & Earn: identity verification, quizzes and on-ledger rewards
//! delivered over chat.

pub mod api;
pub mod channels;
pub mod config;
pub mod conversation;
pub mod error;
pub mod kyc;
pub mod ledger;
pub mod notify;
pub mod quiz;
pub mod store;

#[cfg(test)]
mod testing;
