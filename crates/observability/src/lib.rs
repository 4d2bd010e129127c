//! Process-wide logging setup shared by the binaries.
//!
//! Filtering follows `RUST_LOG` (default `info`). Output is JSON unless
//! `LOG_FORMAT=pretty` asks for human-readable lines.

pub mod logging;

pub use logging::{LogFormat, init, init_with};
