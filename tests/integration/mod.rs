//! Integration tests for the stagehand harness.
//!
//! `infrastructure` holds the helpers (raw HTTP client, port allocation,
//! log capture, binary location); `scenarios` holds the tests.

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::{free_port, http_get, LogCapture, StagehandBinary};
