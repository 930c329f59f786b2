//! The dashboard relay: topics, subscriptions and terminal sessions.

pub mod broker;
mod dispatcher;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod socket;
pub mod terminal;
pub mod topic;
mod utf8;

pub use hub::RelayHub;
