//! Halcyon Common Library
//!
//! Shared utilities for the Halcyon collector workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`HalcyonError`] and the crate [`Result`] alias
//! - **Logging**: tracing subscriber setup for console/file, text/JSON output
//! - **Time**: lenient vendor timestamp parsing
//! - **Files**: crash-safe write-then-rename helpers for state files
//!
//! # Example
//!
//! ```no_run
//! use halcyon_common::fs::write_json_atomic;
//! use halcyon_common::time::parse_timestamp;
//!
//! fn save() -> halcyon_common::Result<()> {
//!     let ts = parse_timestamp(&serde_json::json!("2024-03-01T10:00:00Z"));
//!     write_json_atomic("state/marker.json", &ts)?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod fs;
pub mod logging;
pub mod time;

// Re-export commonly used types
pub use error::{HalcyonError, Result};
