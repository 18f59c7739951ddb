//! Anti-fraud document verification pipeline.
//!
//! Documents move through a fixed sequence of stages, each backed by a
//! priority queue. Workers pull from their stage's queue, run the stage
//! handler and either advance the document, schedule a retry with
//! exponential backoff, or dead-letter it.

pub mod cli;
pub mod config;
pub mod health;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod server;
pub mod services;
pub mod stages;
pub mod worker;
