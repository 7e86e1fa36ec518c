//! The transport-and-orchestration half of the replay engine: everything
//! `shinycannon-core` deliberately leaves out because it needs sockets,
//! cookies, or threads. Split into a library so `tests/` can drive the
//! session run-loop against a mock server without going through the CLI.

pub mod auth;
pub mod cli;
pub mod http;
pub mod orchestrator;
pub mod output;
pub mod session;
pub mod ws;
