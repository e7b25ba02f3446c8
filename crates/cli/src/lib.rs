//! APGMS CLI - operator commands
//!
//! The binary is a thin clap layer; everything it runs lives here so the
//! integration tests can drive it without spawning a process.

pub mod commands;
pub mod context;

pub use context::AppContext;
