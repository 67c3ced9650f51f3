//! Ranked: dense per-group ordering over a relational table
//!
//! Rows of a table are partitioned into groups by a key derived from their
//! own fields, and every group keeps its ranks gapless and unique while
//! concurrent writers append, move, transfer and delete rows.
//! - `store`: the transactional substrate (SQLite or in-process)
//! - `engine`: the rank maintenance protocol
//! - `collection`: async facade for tokio callers
//! - `forms`: the form builder's sequenced entities

pub mod collection;
pub mod config;
pub mod engine;
pub mod error;
pub mod forms;
pub mod model;
pub mod sequenced;
pub mod store;
pub mod telemetry;

// Re-exports for convenience
pub use collection::{RankedCollection, Sequencer};
pub use config::{EngineConfig, RankOrigin, RankedConfig};
pub use engine::{GroupAudit, Placement, RankEngine};
pub use error::{RankError, RankResult};
pub use model::{GroupKey, Rank, RowId};
pub use sequenced::Sequenced;
pub use store::{MemoryRankStore, RankStore, SqliteRankStore, TableSpec};
