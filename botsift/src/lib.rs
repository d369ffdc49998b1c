// botsift/src/lib.rs
//
// botsift: per-client request timing statistics and bot classification.
//
// Web request log events are buffered durably per (host, address) key,
// drained by a partitioned worker pool into streaming timing statistics, and
// scored by an external classifier whose verdicts land in a prediction cache.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod state;
pub mod stats;
pub mod storage;
pub mod verdict;

pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle, IngestReport};
pub use error::{EngineError, ErrorKind};
pub use events::{ClassLabel, IngestRecord, Key, LogEvent};
