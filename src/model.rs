//! Core value types shared by the engine and the storage substrates

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RankError, RankResult};

/// Primary key of a sequenced row. Opaque and stable once assigned.
pub type RowId = i64;

/// Stored rank value, expressed in the configured origin.
pub type Rank = i64;

/// One component of a group key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Int(i64),
    Text(String),
}

impl KeyValue {
    pub fn kind(&self) -> ColumnKind {
        match self {
            KeyValue::Int(_) => ColumnKind::Integer,
            KeyValue::Text(_) => ColumnKind::Text,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Text(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Text(v)
    }
}

/// Tuple of values identifying which sequence a row belongs to.
/// Two rows are siblings iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey(Vec<KeyValue>);

impl GroupKey {
    pub fn new(parts: Vec<KeyValue>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, ")")
    }
}

/// Builds a [`GroupKey`] from anything convertible into [`KeyValue`].
#[macro_export]
macro_rules! group_key {
    ($($part:expr),* $(,)?) => {
        $crate::model::GroupKey::new(vec![$($crate::model::KeyValue::from($part)),*])
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Text,
}

/// Declared shape of a store's group key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSchema {
    columns: Vec<ColumnKind>,
}

impl GroupSchema {
    pub fn new(columns: Vec<ColumnKind>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnKind] {
        &self.columns
    }

    /// Rejects keys whose arity or component kinds do not match.
    pub fn validate(&self, key: &GroupKey) -> RankResult<()> {
        if key.len() != self.columns.len() {
            return Err(RankError::InvalidState(format!(
                "group key {} has {} parts, expected {}",
                key,
                key.len(),
                self.columns.len()
            )));
        }
        for (i, (part, kind)) in key.parts().iter().zip(&self.columns).enumerate() {
            if part.kind() != *kind {
                return Err(RankError::InvalidState(format!(
                    "group key {} part {} is {:?}, expected {:?}",
                    key,
                    i,
                    part.kind(),
                    kind
                )));
            }
        }
        Ok(())
    }
}

/// A row as the store sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: RowId,
    pub group: GroupKey,
    pub rank: Rank,
    pub payload: String,
    pub updated_at: DateTime<Utc>,
}

/// Inclusive rank range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankSpan {
    pub lo: Rank,
    pub hi: Rank,
}

impl RankSpan {
    /// Span covering both endpoints, whichever order they come in.
    pub fn between(a: Rank, b: Rank) -> Self {
        Self { lo: a.min(b), hi: a.max(b) }
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.lo <= rank && rank <= self.hi
    }

    pub fn is_empty(&self) -> bool {
        self.lo > self.hi
    }

    /// Image of the span under `rank -> pivot - rank`.
    pub fn reflect(&self, pivot: Rank) -> Self {
        Self { lo: pivot - self.hi, hi: pivot - self.lo }
    }
}

/// Direction of travel; also the order in which a band is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards higher ranks (later in the sequence).
    Ascending,
    /// Towards lower ranks.
    Descending,
}

impl Direction {
    pub fn of(delta: Rank) -> Self {
        if delta > 0 {
            Direction::Ascending
        } else {
            Direction::Descending
        }
    }

    pub fn step(&self) -> Rank {
        match self {
            Direction::Ascending => 1,
            Direction::Descending => -1,
        }
    }
}
