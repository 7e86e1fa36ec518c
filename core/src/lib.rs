//! Pure, side-effect-free building blocks of the replay engine: the typed
//! event model, token substitution, the SockJS/Shiny message filter, the
//! recording loader, and the session stats counters. No networking and no
//! threads live in this crate — those belong to the `shinycannon` binary.

pub mod error;
pub mod event;
pub mod message;
pub mod stats;
pub mod token;

pub use error::{ShinyError, ShinyResult};
