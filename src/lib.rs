//! # portalflow
//!
//! Orchestration and deduplication engine for long-running, failure-prone
//! tax portal workflows.
//!
//! Requests are fingerprinted so a duplicate submission never starts a
//! second live execution. Each admitted execution runs in its own task under
//! a classified retry policy, its state lives in an execution store
//! (in-memory or Postgres), and a terminal event is appended to an event log
//! (pgmq) once it completes or fails.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod fingerprint;
pub mod model;
pub mod retry;
pub mod runner;
pub mod store;
pub mod telemetry;
pub mod workflow;
