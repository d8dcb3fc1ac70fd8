//! tonelab-lab library interface
//!
//! The laboratory service: durable store, incremental scanner, job queue
//! and worker pool, probe, audio analysis pipeline and metadata writer.
//! The binary in `main.rs` wires these together; integration tests drive
//! them directly.

pub mod analyzer;
pub mod audioscan;
pub mod db;
pub mod jobs;
pub mod metadata;
pub mod models;
pub mod probe;
pub mod scanner;
pub mod scheduler;
pub mod tools;
