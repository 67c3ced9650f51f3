//! The facet an owning entity exposes to the engine
//!
//! Entities keep their own fields; the engine only needs identity, rank and
//! the group key. Everything else travels as an opaque JSON payload, so the
//! `id` and `rank` fields should be `#[serde(skip)]`ed.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::model::{GroupKey, Rank, RowId};

pub trait Sequenced: Serialize + DeserializeOwned {
    /// `None` until the row has been appended.
    fn id(&self) -> Option<RowId>;

    fn set_id(&mut self, id: RowId);

    /// `None` means unplaced. For a saved row, this is the rank the caller
    /// wants (and may be stale).
    fn rank(&self) -> Option<Rank>;

    fn set_rank(&mut self, rank: Rank);

    /// Which sequence this row belongs to, derived from its own fields.
    fn group_key(&self) -> GroupKey;
}
