//! Runtime execution modes.
//!
//! - `exec`: one streamed turn on stdout/stderr with prompts on stdin

pub mod exec;
