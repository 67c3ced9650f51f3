//! Sequenced entities of a form builder
//!
//! Blocks are ordered within a page of a form; uploaded items are ordered
//! within one collection block of one submission.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::group_key;
use crate::model::{ColumnKind, GroupKey, Rank, RowId};
use crate::sequenced::Sequenced;
use crate::store::TableSpec;

/// What a block renders as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    /// A built-in input (text, choice, email...).
    Stock { widget: String },
    /// Free-form markup placed between inputs.
    Custom { content: String },
    /// Accepts a list of uploaded files.
    Collection {
        max_files: Option<u32>,
        file_types: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormBlock {
    #[serde(skip)]
    pub id: Option<RowId>,
    #[serde(skip)]
    pub rank: Option<Rank>,
    pub form_id: i64,
    pub page: i64,
    pub name: String,
    pub kind: BlockKind,
}

impl FormBlock {
    pub fn new(form_id: i64, page: i64, name: impl Into<String>, kind: BlockKind) -> Self {
        Self {
            id: None,
            rank: None,
            form_id,
            page,
            name: name.into(),
            kind,
        }
    }

    pub fn table() -> TableSpec {
        TableSpec::new("form_blocks")
            .group_column("form_id", ColumnKind::Integer)
            .group_column("page", ColumnKind::Integer)
    }
}

impl Sequenced for FormBlock {
    fn id(&self) -> Option<RowId> {
        self.id
    }

    fn set_id(&mut self, id: RowId) {
        self.id = Some(id);
    }

    fn rank(&self) -> Option<Rank> {
        self.rank
    }

    fn set_rank(&mut self, rank: Rank) {
        self.rank = Some(rank);
    }

    fn group_key(&self) -> GroupKey {
        group_key![self.form_id, self.page]
    }
}

/// One uploaded file inside a submission's collection block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionItem {
    #[serde(skip)]
    pub id: Option<RowId>,
    #[serde(skip)]
    pub rank: Option<Rank>,
    pub submission_id: Uuid,
    pub collection: String,
    pub block_id: i64,
    pub file_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub message: String,
}

impl SubmissionItem {
    pub fn new(
        submission_id: Uuid,
        collection: impl Into<String>,
        block_id: i64,
        file_name: impl Into<String>,
        file_size: u64,
    ) -> Self {
        Self {
            id: None,
            rank: None,
            submission_id,
            collection: collection.into(),
            block_id,
            file_name: file_name.into(),
            file_size,
            error: false,
            message: String::new(),
        }
    }

    /// Marks the upload as failed.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = true;
        self.message = message.into();
    }

    pub fn table() -> TableSpec {
        TableSpec::new("submission_items")
            .group_column("submission_id", ColumnKind::Text)
            .group_column("collection", ColumnKind::Text)
            .group_column("block_id", ColumnKind::Integer)
    }
}

impl Sequenced for SubmissionItem {
    fn id(&self) -> Option<RowId> {
        self.id
    }

    fn set_id(&mut self, id: RowId) {
        self.id = Some(id);
    }

    fn rank(&self) -> Option<Rank> {
        self.rank
    }

    fn set_rank(&mut self, rank: Rank) {
        self.rank = Some(rank);
    }

    fn group_key(&self) -> GroupKey {
        group_key![self.submission_id.to_string(), self.collection.as_str(), self.block_id]
    }
}
