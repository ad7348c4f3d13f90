//! Agent HTTP API: allocation filesystem browsing and log streaming.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   GET /v1/client/fs/...   ┌──────────────┐
//! │   CLI    │──────────────────────────▶│  HTTP Server │
//! │ (client) │  JSON / chunked bytes     │  (axum)      │
//! └──────────┘                           └──┬────────┬──┘
//!                                ls/stat/cat │        │ logs
//!                                   ┌────────▼──┐  ┌──▼─────────┐
//!                                   │  AllocFs  │  │ LogBridge  │
//!                                   └───────────┘  └──┬─────────┘
//!                                                     │ pipe
//!                                               ┌─────▼──────────┐
//!                                               │FileSystem.Logs │
//!                                               └────────────────┘
//! ```

pub mod body;
pub mod client;
pub mod params;
pub mod server;
pub mod types;

pub use client::{AgentClient, ClientError};
pub use params::ParamError;
pub use server::{HttpState, router};
pub use types::*;
