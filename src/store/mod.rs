//! Storage substrate interface
//!
//! The engine talks to the relational layer only through these primitives.
//! An implementation must enforce `(group, rank)` uniqueness synchronously,
//! offer select-for-update row locks, and roll back any transaction that is
//! dropped without `commit`.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryRankStore;
pub use sqlite::{SqliteRankStore, TableSpec};

use crate::error::RankResult;
use crate::model::{Direction, GroupKey, GroupSchema, Rank, RankSpan, RowId, StoredRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxIntent {
    Read,
    Write,
}

pub trait RankStore: Send + Sync {
    /// Shape of the group key rows in this store are partitioned by.
    fn schema(&self) -> &GroupSchema;

    /// Short name used in logs.
    fn name(&self) -> &str;

    fn begin(&self, intent: TxIntent) -> RankResult<Box<dyn RankTx + '_>>;
}

/// One open transaction.
pub trait RankTx {
    /// Inserts a new row. Blocks while another writer holds an uncommitted
    /// row with the same `(group, rank)`.
    fn insert(&mut self, group: &GroupKey, rank: Rank, payload: &str) -> RankResult<RowId>;

    /// Select-for-update of a single row.
    fn lock_row(&mut self, id: RowId) -> RankResult<Option<StoredRow>>;

    fn max_rank(&mut self, group: &GroupKey, exclude: RowId) -> RankResult<Option<Rank>>;

    /// Locks every row of `group` whose rank lies in `span`, acquiring them
    /// in `order`, and returns `(id, rank)` pairs in that order.
    fn lock_span(
        &mut self,
        group: &GroupKey,
        span: RankSpan,
        order: Direction,
    ) -> RankResult<Vec<(RowId, Rank)>>;

    /// Updates group and rank (and the payload when given).
    fn write_row(
        &mut self,
        id: RowId,
        group: &GroupKey,
        rank: Rank,
        payload: Option<&str>,
    ) -> RankResult<()>;

    /// `rank := pivot - rank` for every row of `group` inside `span`.
    /// Returns the number of rows touched.
    fn reflect_span(&mut self, group: &GroupKey, span: RankSpan, pivot: Rank) -> RankResult<usize>;

    fn delete_row(&mut self, id: RowId) -> RankResult<bool>;

    fn delete_group(&mut self, group: &GroupKey) -> RankResult<usize>;

    /// Members of `group` ordered by rank.
    fn rows(&mut self, group: &GroupKey) -> RankResult<Vec<StoredRow>>;

    fn commit(self: Box<Self>) -> RankResult<()>;
}
