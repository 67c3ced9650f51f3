//! SQLite Concurrency Suite
//!
//! Many writers on one group, each in its own thread and connection, must
//! leave the group dense with no duplicate ranks.

use std::sync::{Arc, Barrier};
use std::thread;

use ranked::config::{EngineConfig, SqliteConfig};
use ranked::forms::{BlockKind, FormBlock};
use ranked::store::{RankStore, TxIntent};
use ranked::{group_key, Placement, RankEngine, RankError, RankOrigin, RankedCollection, Sequencer, SqliteRankStore};
use tempfile::NamedTempFile;

fn engine(db: &NamedTempFile, origin: RankOrigin) -> anyhow::Result<RankEngine<SqliteRankStore>> {
    let store = SqliteRankStore::open(SqliteConfig::new(db.path()), FormBlock::table())?;
    Ok(RankEngine::new(store, EngineConfig { origin }))
}

fn block(page: i64, name: &str) -> FormBlock {
    FormBlock::new(7, page, name, BlockKind::Stock { widget: "text".into() })
}

fn names(engine: &RankEngine<SqliteRankStore>, page: i64) -> anyhow::Result<Vec<(String, i64)>> {
    Ok(engine
        .list::<FormBlock>(&group_key![7, page])?
        .into_iter()
        .map(|b| (b.name, b.rank.unwrap_or_default()))
        .collect())
}

#[test]
fn test_concurrent_appends_get_distinct_dense_ranks() -> anyhow::Result<()> {
    let db = NamedTempFile::new()?;
    let engine = Arc::new(engine(&db, RankOrigin::One)?);
    let writers = 8;
    let barrier = Arc::new(Barrier::new(writers));

    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut b = block(1, &format!("w{}", i));
                engine.append(&mut b).map(|_| b.rank)
            })
        })
        .collect();

    let mut ranks = Vec::new();
    for handle in handles {
        ranks.push(handle.join().expect("writer panicked")?.unwrap_or_default());
    }
    ranks.sort();
    assert_eq!(ranks, (1..=8).collect::<Vec<_>>());
    assert!(engine.audit(&group_key![7, 1])?.dense);
    Ok(())
}

#[test]
fn test_concurrent_moves_keep_group_dense() -> anyhow::Result<()> {
    let db = NamedTempFile::new()?;
    let engine = Arc::new(engine(&db, RankOrigin::One)?);
    let mut blocks = Vec::new();
    for i in 0..10 {
        let mut b = block(1, &format!("b{}", i));
        engine.append(&mut b)?;
        blocks.push(b);
    }

    let barrier = Arc::new(Barrier::new(blocks.len()));
    let handles: Vec<_> = blocks
        .into_iter()
        .enumerate()
        .map(|(i, mut b)| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                // everyone moves to the mirror position, most of them with a stale rank
                let target = 10 - i as i64;
                engine.move_to(&mut b, Placement::At(target)).map(|_| ())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("mover panicked")?;
    }

    let audit = engine.audit(&group_key![7, 1])?;
    assert_eq!(audit.ranks, (1..=10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_append_and_delete_race() -> anyhow::Result<()> {
    let db = NamedTempFile::new()?;
    let engine = Arc::new(engine(&db, RankOrigin::One)?);
    let mut doomed = Vec::new();
    for i in 0..6 {
        let mut b = block(1, &format!("old{}", i));
        engine.append(&mut b)?;
        if i % 2 == 0 {
            doomed.push(b);
        }
    }

    let barrier = Arc::new(Barrier::new(doomed.len() * 2));
    let mut handles = Vec::new();
    for (i, b) in doomed.into_iter().enumerate() {
        let engine_delete = Arc::clone(&engine);
        let barrier_delete = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier_delete.wait();
            engine_delete.delete(&b)
        }));
        let engine_append = Arc::clone(&engine);
        let barrier_append = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier_append.wait();
            let mut b = block(1, &format!("new{}", i));
            engine_append.append(&mut b).map(|_| ())
        }));
    }
    for handle in handles {
        handle.join().expect("writer panicked")?;
    }

    let audit = engine.audit(&group_key![7, 1])?;
    assert_eq!(audit.ranks, (1..=6).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_held_write_lock_surfaces_as_transient() -> anyhow::Result<()> {
    let db = NamedTempFile::new()?;
    let mut config = SqliteConfig::new(db.path());
    config.busy_timeout_ms = 50;
    let engine = RankEngine::new(SqliteRankStore::open(config, FormBlock::table())?, EngineConfig::default());
    let mut first = block(1, "first");
    engine.append(&mut first)?;

    let holder = engine.store().begin(TxIntent::Write)?;
    let mut second = block(1, "second");
    let err = engine.append(&mut second).unwrap_err();
    assert!(matches!(err, RankError::TransientLockConflict(_)), "got {err:?}");
    assert!(err.is_retryable());
    assert!(second.id.is_none());
    drop(holder);

    // retry after the holder is gone
    assert_eq!(engine.append(&mut second)?, 2);
    Ok(())
}

#[test]
fn test_documented_scenarios_on_sqlite() -> anyhow::Result<()> {
    let db = NamedTempFile::new()?;
    let engine = engine(&db, RankOrigin::One)?;

    let mut page1: Vec<FormBlock> = Vec::new();
    for name in ["A", "B", "C", "D"] {
        let mut b = block(1, name);
        engine.append(&mut b)?;
        page1.push(b);
    }
    // D to the front
    engine.move_to(&mut page1[3], Placement::At(1))?;
    let expected: Vec<(String, i64)> = vec![("D".into(), 1), ("A".into(), 2), ("B".into(), 3), ("C".into(), 4)];
    assert_eq!(names(&engine, 1)?, expected);

    // A to the back: it was at 2, ask for 4
    engine.move_to(&mut page1[0], Placement::At(4))?;
    let expected: Vec<(String, i64)> = vec![("D".into(), 1), ("B".into(), 2), ("C".into(), 3), ("A".into(), 4)];
    assert_eq!(names(&engine, 1)?, expected);

    // delete from the middle
    engine.delete(&page1[1])?;
    let expected: Vec<(String, i64)> = vec![("D".into(), 1), ("C".into(), 2), ("A".into(), 3)];
    assert_eq!(names(&engine, 1)?, expected);

    // transfer to another page
    let mut other = block(2, "X");
    engine.append(&mut other)?;
    page1[2].page = 2;
    engine.move_to(&mut page1[2], Placement::Last)?;
    let expected: Vec<(String, i64)> = vec![("D".into(), 1), ("A".into(), 2)];
    assert_eq!(names(&engine, 1)?, expected);
    let expected: Vec<(String, i64)> = vec![("X".into(), 1), ("C".into(), 2)];
    assert_eq!(names(&engine, 2)?, expected);
    Ok(())
}

#[test]
fn test_zero_origin_on_sqlite() -> anyhow::Result<()> {
    let db = NamedTempFile::new()?;
    let engine = engine(&db, RankOrigin::Zero)?;
    let mut blocks = Vec::new();
    for name in ["a", "b", "c"] {
        let mut b = block(1, name);
        engine.append(&mut b)?;
        blocks.push(b);
    }
    engine.move_to(&mut blocks[0], Placement::Last)?;
    engine.delete(&blocks[1])?;
    let expected: Vec<(String, i64)> = vec![("c".into(), 0), ("a".into(), 1)];
    assert_eq!(names(&engine, 1)?, expected);
    Ok(())
}

#[tokio::test]
async fn test_bulk_page_move_through_facade() -> anyhow::Result<()> {
    let db = NamedTempFile::new()?;
    let blocks = RankedCollection::new(engine(&db, RankOrigin::One)?);

    let mut page1 = Vec::new();
    for name in ["a", "b", "c", "d"] {
        page1.push(blocks.append(block(1, name)).await?);
    }
    blocks.append(block(3, "z")).await?;

    let mut moving = vec![page1[2].clone(), page1[0].clone()];
    for b in moving.iter_mut() {
        b.page = 3;
    }
    let moved = blocks.transfer_all(moving).await?;
    assert_eq!(moved.iter().map(|b| b.rank).collect::<Vec<_>>(), vec![Some(3), Some(2)]);

    let page3 = Sequencer::<FormBlock>::list(&blocks, group_key![7, 3]).await?;
    let order: Vec<&str> = page3.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(order, vec!["z", "a", "c"]);
    let remaining = Sequencer::<FormBlock>::audit(&blocks, group_key![7, 1]).await?;
    assert_eq!(remaining.ranks, vec![1, 2]);
    Ok(())
}
