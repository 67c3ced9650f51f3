//! Randomized Operation Suite
//!
//! Replays seeded sequences of appends, moves, transfers, saves and deletes
//! against both substrates and both rank origins, checking every group
//! against a plain `Vec` model after each step.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::NamedTempFile;

use ranked::config::{EngineConfig, MemoryConfig, SqliteConfig};
use ranked::forms::{BlockKind, FormBlock};
use ranked::store::RankStore;
use ranked::{group_key, MemoryRankStore, Placement, RankEngine, RankOrigin, RowId, SqliteRankStore};

const PAGES: [i64; 2] = [1, 2];

struct Model {
    pages: HashMap<i64, Vec<RowId>>,
    blocks: HashMap<RowId, FormBlock>,
}

impl Model {
    fn new() -> Self {
        Self {
            pages: PAGES.iter().map(|&p| (p, Vec::new())).collect(),
            blocks: HashMap::new(),
        }
    }

    fn page_mut(&mut self, page: i64) -> &mut Vec<RowId> {
        self.pages.entry(page).or_default()
    }

    fn remove(&mut self, id: RowId) -> i64 {
        let page = self.blocks[&id].page;
        self.page_mut(page).retain(|&other| other != id);
        page
    }

    fn pick(&self, rng: &mut StdRng) -> Option<RowId> {
        let mut ids: Vec<RowId> = self.blocks.keys().copied().collect();
        ids.sort();
        if ids.is_empty() {
            None
        } else {
            Some(ids[rng.gen_range(0..ids.len())])
        }
    }
}

fn check<S: RankStore>(engine: &RankEngine<S>, model: &Model, step: usize) -> anyhow::Result<()> {
    let first = engine.origin().first();
    for page in PAGES {
        let listed = engine.list::<FormBlock>(&group_key![1, page])?;
        let ids: Vec<RowId> = listed.iter().filter_map(|b| b.id).collect();
        let ranks: Vec<i64> = listed.iter().filter_map(|b| b.rank).collect();
        let expected_ranks: Vec<i64> = (0..listed.len() as i64).map(|i| first + i).collect();
        assert_eq!(ids, model.pages[&page], "order diverged on page {} at step {}", page, step);
        assert_eq!(ranks, expected_ranks, "page {} not dense at step {}", page, step);
    }
    Ok(())
}

fn replay<S: RankStore>(engine: &RankEngine<S>, seed: u64, steps: usize) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut model = Model::new();
    let first = engine.origin().first();

    for step in 0..steps {
        let roll = rng.gen_range(0..100);
        match (roll, model.pick(&mut rng)) {
            (0..=29, _) | (_, None) => {
                let page = PAGES[rng.gen_range(0..PAGES.len())];
                let mut block = FormBlock::new(1, page, format!("s{}", step), BlockKind::Stock { widget: "text".into() });
                engine.append(&mut block)?;
                let id = block.id.unwrap_or_default();
                model.page_mut(page).push(id);
                model.blocks.insert(id, block);
            }
            (30..=59, Some(id)) => {
                // same-page move, sometimes past the end
                let mut block = model.blocks[&id].clone();
                let len = model.pages[&block.page].len() as i64;
                let requested = first + rng.gen_range(0..len + 2);
                engine.move_to(&mut block, Placement::At(requested))?;

                let page = model.remove(id);
                let members = model.page_mut(page);
                let index = ((requested - first) as usize).min(members.len());
                members.insert(index, id);
                assert_eq!(block.rank, Some(first + index as i64), "reported rank at step {}", step);
                model.blocks.insert(id, block);
            }
            (60..=74, Some(id)) => {
                // page transfer, to the end or to a position
                let mut block = model.blocks[&id].clone();
                let dest = if block.page == 1 { 2 } else { 1 };
                block.page = dest;
                let placement = if rng.gen_bool(0.5) {
                    Placement::Last
                } else {
                    Placement::At(first + rng.gen_range(0..4))
                };
                engine.move_to(&mut block, placement)?;

                model.remove(id);
                let members = model.page_mut(dest);
                let index = match placement {
                    Placement::At(rank) => ((rank - first) as usize).min(members.len()),
                    _ => members.len(),
                };
                members.insert(index, id);
                model.blocks.insert(id, block);
            }
            (75..=84, Some(id)) => {
                // pass-through save with a cleared rank
                let mut block = model.blocks[&id].clone();
                block.rank = None;
                block.name = format!("renamed{}", step);
                engine.save(&mut block)?;
                model.blocks.insert(id, block);
            }
            (_, Some(id)) => {
                let block = model.blocks[&id].clone();
                engine.delete(&block)?;
                model.remove(id);
                model.blocks.remove(&id);
            }
        }
        check(engine, &model, step)?;
    }
    Ok(())
}

fn memory_engine(origin: RankOrigin) -> RankEngine<MemoryRankStore> {
    let spec = FormBlock::table();
    let store = MemoryRankStore::new(spec.table(), spec.schema(), MemoryConfig::default());
    RankEngine::new(store, EngineConfig { origin })
}

#[test]
fn test_random_ops_memory_one_based() -> anyhow::Result<()> {
    for seed in 0..8 {
        replay(&memory_engine(RankOrigin::One), seed, 200)?;
    }
    Ok(())
}

#[test]
fn test_random_ops_memory_zero_based() -> anyhow::Result<()> {
    for seed in 100..108 {
        replay(&memory_engine(RankOrigin::Zero), seed, 200)?;
    }
    Ok(())
}

#[test]
fn test_random_ops_sqlite() -> anyhow::Result<()> {
    for (seed, origin) in [(7, RankOrigin::One), (8, RankOrigin::Zero)] {
        let db = NamedTempFile::new()?;
        let store = SqliteRankStore::open(SqliteConfig::new(db.path()), FormBlock::table())?;
        replay(&RankEngine::new(store, EngineConfig { origin }), seed, 120)?;
    }
    Ok(())
}

#[test]
fn test_no_op_move_leaves_siblings_untouched() -> anyhow::Result<()> {
    let engine = memory_engine(RankOrigin::One);
    let mut blocks = Vec::new();
    for name in ["a", "b", "c"] {
        let mut block = FormBlock::new(1, 1, name, BlockKind::Stock { widget: "text".into() });
        engine.append(&mut block)?;
        blocks.push(block);
    }
    let before = engine.audit(&group_key![1, 1])?;
    let rank = engine.move_to(&mut blocks[1], Placement::At(2))?;
    assert_eq!(rank, 2);
    assert_eq!(engine.audit(&group_key![1, 1])?, before);
    Ok(())
}
