//! An offline emulator for a chat-platform bot backend: it terminates bot
//! socket connections, serves the platform's REST-style Web API, persists
//! messages and files, and streams state changes to a UI over SSE.

pub mod config;
pub mod error;
pub mod gateway;
pub mod ids;
pub mod model;
pub mod persistence;
pub mod socketbus;
pub mod state;
pub mod webapi;

pub use error::{Error, Result};
