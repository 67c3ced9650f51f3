//! Ranked Smoke Test
//!
//! Walks a form through the whole rank lifecycle against a throwaway SQLite
//! file and prints each page's audit along the way.

use anyhow::{bail, Result};
use futures::future::join_all;
use tempfile::NamedTempFile;
use tracing::info;
use uuid::Uuid;

use ranked::config::SqliteConfig;
use ranked::forms::{BlockKind, FormBlock, SubmissionItem};
use ranked::{group_key, telemetry};
use ranked::{GroupAudit, GroupKey, Placement, RankEngine, RankedCollection, RankedConfig, Sequencer, SqliteRankStore};

fn report(label: &str, audit: &GroupAudit) -> Result<()> {
    println!("   {:<28} {} -> {:?}", label, audit.group, audit.ranks);
    if !audit.dense {
        bail!("{} is not dense: {:?}", audit.group, audit.ranks);
    }
    Ok(())
}

async fn names(blocks: &RankedCollection<SqliteRankStore>, page: GroupKey) -> Result<Vec<String>> {
    let listed: Vec<FormBlock> = Sequencer::<FormBlock>::list(blocks, page).await?;
    Ok(listed.into_iter().map(|b| b.name).collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_logging("ranked=info");
    let config = RankedConfig::from_env()?;
    let origin = config.engine.origin;

    println!("\n{}", "═".repeat(60));
    println!("RANKED SMOKE TEST (origin: {:?})", origin);
    println!("{}", "═".repeat(60));

    let db = NamedTempFile::new()?;
    let mut sqlite = config.sqlite.clone().unwrap_or_else(|| SqliteConfig::new(db.path()));
    sqlite.path = db.path().to_path_buf();
    let first = origin.first();
    let page1 = group_key![1, 1];
    let page2 = group_key![1, 2];

    // 1. Appends
    println!("\n[1/5] Appending blocks...");
    let blocks = RankedCollection::new(RankEngine::new(
        SqliteRankStore::open(sqlite.clone(), FormBlock::table())?,
        config.engine.clone(),
    ));
    let mut appended = Vec::new();
    for name in ["name", "email", "about", "photos"] {
        let kind = match name {
            "photos" => BlockKind::Collection { max_files: Some(4), file_types: vec!["image/png".into()] },
            "about" => BlockKind::Custom { content: "<p>Tell us about yourself</p>".into() },
            _ => BlockKind::Stock { widget: name.into() },
        };
        appended.push(blocks.append(FormBlock::new(1, 1, name, kind)).await?);
    }
    report("after appends", &Sequencer::<FormBlock>::audit(&blocks, page1.clone()).await?)?;

    // 2. Moves
    println!("\n[2/5] Moving blocks...");
    let Some(photos) = appended.pop() else {
        bail!("no blocks were appended");
    };
    let photos = blocks.move_to(photos, Placement::At(first + 1)).await?;
    println!("   photos now at {:?}: {:?}", photos.rank, names(&blocks, page1.clone()).await?);
    let name = appended.remove(0);
    let name = blocks.move_to(name, Placement::At(first + 99)).await?;
    println!("   name clamped to {:?}: {:?}", name.rank, names(&blocks, page1.clone()).await?);
    report("after moves", &Sequencer::<FormBlock>::audit(&blocks, page1.clone()).await?)?;

    // 3. Group transfer
    println!("\n[3/5] Moving photos to page 2...");
    let mut photos = photos;
    photos.page = 2;
    let photos = blocks.save(photos).await?;
    info!(rank = ?photos.rank, "photos transferred");
    report("page 1", &Sequencer::<FormBlock>::audit(&blocks, page1.clone()).await?)?;
    report("page 2", &Sequencer::<FormBlock>::audit(&blocks, page2.clone()).await?)?;

    // 4. Delete
    println!("\n[4/5] Deleting a block...");
    let email = appended.remove(0);
    blocks.delete(email).await?;
    println!("   page 1: {:?}", names(&blocks, page1.clone()).await?);
    report("after delete", &Sequencer::<FormBlock>::audit(&blocks, page1.clone()).await?)?;

    // 5. Concurrent uploads
    println!("\n[5/5] Concurrent uploads into one collection...");
    let items = RankedCollection::new(RankEngine::new(
        SqliteRankStore::open(sqlite, SubmissionItem::table())?,
        config.engine.clone(),
    ));
    let submission = Uuid::new_v4();
    let uploads = (0..6).map(|i| {
        let items = items.clone();
        tokio::spawn(async move {
            let item = SubmissionItem::new(submission, "photos", 4, format!("img_{}.png", i), 2048 + i);
            items.append(item).await
        })
    });
    let mut ranks = Vec::new();
    for joined in join_all(uploads).await {
        ranks.push(joined??.rank);
    }
    println!("   upload ranks: {:?}", ranks);
    let group = group_key![submission.to_string(), "photos", 4];
    report("uploads", &Sequencer::<SubmissionItem>::audit(&items, group).await?)?;

    println!("\n{}", "═".repeat(60));
    println!("✅ ALL RANK CHECKS PASSED");
    println!("{}", "═".repeat(60));
    Ok(())
}
