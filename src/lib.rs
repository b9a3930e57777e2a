//! Inbox Policy: policy-driven action proposals with human approval.

pub mod api;
pub mod approval;
pub mod audit;
pub mod config;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod policy;
pub mod store;
