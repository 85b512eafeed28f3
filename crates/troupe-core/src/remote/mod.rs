//! HTTP transport for the runtime.
//!
//! [`server`] exposes sessions and turns over an axum router, streaming
//! events as SSE. [`RemoteClient`] speaks that API and [`RemoteRuntime`]
//! turns it back into a [`crate::runtime::Runtime`], so drivers work the
//! same against a local loop or a server.

mod client;
mod runtime;
pub mod server;
pub mod wire;

pub use client::{RemoteClient, RemoteError, RemoteEventStream};
pub use runtime::RemoteRuntime;
pub use server::{ServerState, router, serve};
