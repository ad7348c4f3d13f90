#![deny(unsafe_code)]

//! Shared test utilities for the allocfs workspace.
//!
//! Provides scripted streaming handlers, temporary allocation directories,
//! config builders, and tracing helpers so that individual crate tests stay
//! concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! allocfs-test-utils = { workspace = true }
//! ```

pub mod agent;
pub mod alloc;
pub mod config;
pub mod handler;
pub mod io;
pub mod tracing_setup;

pub use agent::TestAgent;
pub use alloc::TestAllocDir;
pub use config::TestConfigBuilder;
pub use handler::{ScriptedHandler, Step};
pub use io::{CaptureWriter, FailingWriter, SlowWriter};
