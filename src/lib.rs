//! # sakhi-rs
//!
//! Query job lifecycle and notification pipeline for the Sakhi
//! legal-assistance chat.
//!
//! A user's question becomes a job with a compare-and-swap state machine
//! (exactly one worker claims it), every committed transition flows through
//! an ordered, resumable change feed, a dispatcher fans it out to
//! subscribers, and a per-session reconciler merges optimistic local entries
//! with what the store confirms.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod llm;
pub mod machine;
pub mod model;
pub mod reconciler;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod worker;
