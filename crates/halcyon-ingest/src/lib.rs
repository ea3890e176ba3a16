//! Halcyon Ingest Library
//!
//! Periodic, checkpointed collection of Halcyon anti-ransomware API objects
//! into a JSON-lines event stream.
//!
//! # Components
//!
//! - **Config**: layered settings from file, `.env` and `HALCYON__*` variables
//! - **Client**: authenticated, retrying HTTP access with pagination
//! - **Checkpoints**: per object type cursor and dedup state, written atomically
//! - **Collector**: one collection run per object type, emitting normalized records
//! - **Scheduler**: one task per enabled object type on its own interval
//! - **Health**: run outcomes as events plus a status snapshot on disk
//!
//! # Example
//!
//! ```no_run
//! use halcyon_ingest::{App, Settings};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = App::from_settings(Settings::load(None)?)?;
//!     for run in app.scheduler.run_once_all(true, &[]).await? {
//!         println!("{}: {} records", run.object_type, run.records_emitted);
//!     }
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod app;
pub mod auth;
pub mod checkpoint;
pub mod client;
pub mod collector;
pub mod config;
pub mod emitter;
pub mod error;
pub mod health;
pub mod keyed;
pub mod object_types;
pub mod pagination;
pub mod scheduler;
pub mod schema;
pub mod sink;

pub use app::App;
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use client::HalcyonClient;
pub use collector::{CollectionRun, Collector};
pub use config::Settings;
pub use emitter::{NormalizedRecord, RecordEmitter};
pub use error::{IngestError, Result};
pub use health::{HealthReport, HealthReporter};
pub use object_types::{ObjectTypeRegistry, ObjectTypeSpec};
pub use scheduler::Scheduler;
pub use sink::{Envelope, RecordSink};
