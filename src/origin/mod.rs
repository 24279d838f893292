//! Data-driven mock HTTP origin.
//!
//! Requests are routed by exact (method, path) to an [`Action`]; unmatched
//! requests get an empty 404. Matched actions are answered by a
//! [`ChunkedResponder`] that writes the action's prebuilt buffer
//! `num_chunks` times with the configured pacing.

mod action;
mod request;
mod responder;
mod server;

pub use action::{Action, ActionConfig, ActionTable};
pub use request::RequestHead;
pub use responder::{ChunkedResponder, ResponderState};
pub use server::MockOriginServer;
