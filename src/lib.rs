//! # reqtrack
//!
//! Tracks user-submitted requests through an asynchronous status lifecycle.
//!
//! The HTTP API writes status synchronously and publishes a status-changed
//! event to a pgmq queue; the worker applies those events to the request's
//! history idempotently, acknowledging only on success. Store and queue are
//! injected capabilities, with Postgres and in-memory implementations.

pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;
