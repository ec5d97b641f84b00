//! The query pipeline.
//!
//! Every request passes the same stages: validate against the schema,
//! authenticate, check class-level permissions, normalize literals, then
//! compile and execute. Results are redacted before they leave the engine,
//! and triggers run around the writes that took effect.

mod batch;
mod engine;
mod executor;
mod session;

pub use engine::{Engine, EngineBuilder};
pub use session::TxHandle;
