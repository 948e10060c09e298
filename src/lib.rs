#![forbid(unsafe_code)]

//! Append-only document-store file format with salvage tooling.
//!
//! A driftwood database is a single `.couch` file of 4096-byte blocks. Every
//! mutation appends serialized terms (document bodies, B-tree nodes) and
//! finishes by appending a header that anchors two B-trees: one keyed by
//! document id, one keyed by update sequence. Because old data is never
//! rewritten, a crashed or damaged file usually still carries intact tree
//! nodes past the last good header; the [`repair`] module recovers them by
//! scanning the raw bytes for node signatures.

pub mod btree;
pub mod config;
pub mod db;
pub mod error;
pub mod file;
pub mod repair;
pub mod term;

pub use crate::config::ToolConfig;
pub use crate::db::{Db, SyncPolicy};
pub use crate::error::{DriftError, Result};
pub use crate::repair::{
    find_nodes_quickly, find_nodes_quickly_at, make_lost_and_found, merge_to_file, repair,
    RepairOutcome, RepairReport,
};
