//! Worker runtime.
//!
//! A worker connects a DEALER socket to a broker backend, announces its
//! service with READY, and then runs whatever jobs the broker dispatches:
//!
//! - [`handler`]: the [`JobHandler`] trait application code implements
//! - [`liveness`]: heartbeat pacing, broker liveness and the idle hook
//! - [`failover`]: rotation through the configured broker list
//! - [`runtime`]: the socket loop tying them together
//!
//! Heartbeats keep flowing while a handler runs, so long jobs do not get
//! the worker purged.

pub mod failover;
pub mod handler;
pub mod liveness;
pub mod runtime;

pub use failover::BrokerRotation;
pub use handler::{handler_fn, Answer, Assignment, EchoHandler, JobHandler, Responder, WorkError};
pub use liveness::Liveness;
pub use runtime::Worker;
