//! Request engine and status-change worker.
//!
//! [`Engine`] is the synchronous path: create, token-gated read, admin
//! transition + enqueue. [`Worker`] is the asynchronous path: it folds
//! status-changed events back into request history.

pub mod requests;
pub mod worker;

pub use requests::{Created, Engine, EngineConfig};
pub use worker::{BatchReport, Disposition, Handled, Worker, WorkerConfig};
