//! Agent runtime: the agentic loop, its event stream, suspend/resume
//! protocol, sessions, model switching and local/remote execution.

pub mod config;
pub mod core;
pub mod logging;
pub mod providers;
pub mod remote;
pub mod runtime;
pub mod session;
pub mod team;
pub mod tools;
