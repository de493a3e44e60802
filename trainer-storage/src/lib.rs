//! # Trainer Storage
//!
//! Storage-backend-agnostic persistence for training runs: a blob
//! [`StorageDriver`] over S3 or the local filesystem, a
//! [`CheckpointManager`] for step-ordered checkpoint discovery and resume,
//! and the JSONL line-split contract used by the framework launchers.

pub mod checkpoint;
pub mod dataset;
pub mod error;
pub mod storage;

pub use checkpoint::{CheckpointCandidate, CheckpointManager, CheckpointRecord, latest_candidate};
pub use dataset::{fetch_dataset, read_text_lines, split_corpus};
pub use error::{Result, StorageError};
pub use storage::{StorageDriver, StorageLocation};
