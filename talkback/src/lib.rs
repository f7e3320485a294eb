//! talkback library crate.
//!
//! Asynchronous conversational replies: a durable job queue, a worker pool
//! that turns a chat message into speech segments with lip-sync cues, and a
//! small HTTP surface for submitting messages and polling job status.

pub mod api;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod utils;

pub use error::{Error, Result};
