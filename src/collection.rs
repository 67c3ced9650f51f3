//! Async facade over the rank engine
//!
//! Every engine call blocks on the substrate's locks, so each one runs on
//! tokio's blocking pool. Rows are passed in by value and handed back with
//! their committed id and rank.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task;

use crate::engine::{GroupAudit, Placement, RankEngine};
use crate::error::{RankError, RankResult};
use crate::model::GroupKey;
use crate::sequenced::Sequenced;
use crate::store::RankStore;

/// Ordered collection of `R` rows, partitioned by group.
#[async_trait]
pub trait Sequencer<R>: Send + Sync
where
    R: Sequenced + Send + 'static,
{
    async fn append(&self, row: R) -> RankResult<R>;
    async fn move_to(&self, row: R, placement: Placement) -> RankResult<R>;
    async fn save(&self, row: R) -> RankResult<R>;
    async fn delete(&self, row: R) -> RankResult<()>;
    async fn transfer_all(&self, rows: Vec<R>) -> RankResult<Vec<R>>;
    async fn list(&self, group: GroupKey) -> RankResult<Vec<R>>;
    async fn audit(&self, group: GroupKey) -> RankResult<GroupAudit>;
}

pub struct RankedCollection<S> {
    engine: Arc<RankEngine<S>>,
}

impl<S> Clone for RankedCollection<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<S: RankStore + 'static> RankedCollection<S> {
    pub fn new(engine: RankEngine<S>) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &RankEngine<S> {
        &self.engine
    }

    async fn run<T, F>(&self, op: F) -> RankResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&RankEngine<S>) -> RankResult<T> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        task::spawn_blocking(move || op(&engine))
            .await
            .map_err(|e| RankError::Storage(format!("blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl<S, R> Sequencer<R> for RankedCollection<S>
where
    S: RankStore + 'static,
    R: Sequenced + Send + 'static,
{
    async fn append(&self, mut row: R) -> RankResult<R> {
        self.run(move |engine| {
            engine.append(&mut row)?;
            Ok(row)
        })
        .await
    }

    async fn move_to(&self, mut row: R, placement: Placement) -> RankResult<R> {
        self.run(move |engine| {
            engine.move_to(&mut row, placement)?;
            Ok(row)
        })
        .await
    }

    async fn save(&self, mut row: R) -> RankResult<R> {
        self.run(move |engine| {
            engine.save(&mut row)?;
            Ok(row)
        })
        .await
    }

    async fn delete(&self, row: R) -> RankResult<()> {
        self.run(move |engine| engine.delete(&row)).await
    }

    async fn transfer_all(&self, mut rows: Vec<R>) -> RankResult<Vec<R>> {
        self.run(move |engine| {
            engine.transfer_all(&mut rows)?;
            Ok(rows)
        })
        .await
    }

    async fn list(&self, group: GroupKey) -> RankResult<Vec<R>> {
        self.run(move |engine| engine.list(&group)).await
    }

    async fn audit(&self, group: GroupKey) -> RankResult<GroupAudit> {
        self.run(move |engine| engine.audit(&group)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, MemoryConfig};
    use crate::forms::{BlockKind, FormBlock};
    use crate::group_key;
    use crate::store::MemoryRankStore;

    fn blocks() -> RankedCollection<MemoryRankStore> {
        let spec = FormBlock::table();
        let store = MemoryRankStore::new(spec.table(), spec.schema(), MemoryConfig::default());
        RankedCollection::new(RankEngine::new(store, EngineConfig::default()))
    }

    fn text(page: i64, name: &str) -> FormBlock {
        FormBlock::new(1, page, name, BlockKind::Stock { widget: "text".into() })
    }

    #[tokio::test]
    async fn test_append_move_and_list() {
        let blocks = blocks();
        let a = blocks.append(text(1, "a")).await.unwrap();
        let _b = blocks.append(text(1, "b")).await.unwrap();
        let c = blocks.append(text(1, "c")).await.unwrap();
        assert_eq!((a.rank, c.rank), (Some(1), Some(3)));

        let c = blocks.move_to(c, Placement::At(1)).await.unwrap();
        assert_eq!(c.rank, Some(1));

        let listed = Sequencer::<FormBlock>::list(&blocks, group_key![1, 1]).await.unwrap();
        let names: Vec<&str> = listed.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert_eq!(listed[0].id, c.id);
    }

    #[tokio::test]
    async fn test_concurrent_appends_stay_dense() {
        let blocks = blocks();
        let mut handles = Vec::new();
        for i in 0..8 {
            let blocks = blocks.clone();
            handles.push(tokio::spawn(async move { blocks.append(text(1, &format!("b{}", i))).await }));
        }
        let mut ranks = Vec::new();
        for handle in handles {
            ranks.push(handle.await.unwrap().unwrap().rank.unwrap());
        }
        ranks.sort();
        assert_eq!(ranks, (1..=8).collect::<Vec<_>>());

        let audit = Sequencer::<FormBlock>::audit(&blocks, group_key![1, 1]).await.unwrap();
        assert!(audit.dense);
    }

    #[tokio::test]
    async fn test_save_moves_between_pages_and_delete_compacts() {
        let blocks = blocks();
        let a = blocks.append(text(1, "a")).await.unwrap();
        let mut b = blocks.append(text(1, "b")).await.unwrap();
        let c = blocks.append(text(1, "c")).await.unwrap();

        b.page = 2;
        let b = blocks.save(b).await.unwrap();
        assert_eq!(b.rank, Some(1));

        blocks.delete(a).await.unwrap();
        let page1 = Sequencer::<FormBlock>::list(&blocks, group_key![1, 1]).await.unwrap();
        assert_eq!(page1.len(), 1);
        assert_eq!(page1[0].id, c.id);
        assert_eq!(page1[0].rank, Some(1));
    }
}
