//! In-process substrate with row-level locking
//!
//! Read-committed visibility: a transaction sees committed values plus its
//! own pending writes. Every written or selected-for-update row is
//! exclusively locked until commit/rollback. Uniqueness on `(group, rank)`
//! is checked synchronously; a collision with another transaction's
//! uncommitted row waits for that transaction to finish. Every key a row
//! held during a transaction stays reserved until that transaction ends,
//! the way a unique index keeps superseded entries until commit.
//!
//! Locks are per row, so transactions on disjoint groups never wait on each
//! other. Waits are bounded by the configured lock timeout, and a wait that
//! would close a cycle in the wait-for graph fails immediately.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::error::{RankError, RankResult};
use crate::model::{Direction, GroupKey, GroupSchema, Rank, RankSpan, RowId, StoredRow};
use crate::store::{RankStore, RankTx, TxIntent};

type TxId = u64;

#[derive(Debug, Clone)]
struct Version {
    group: GroupKey,
    rank: Rank,
    payload: String,
    updated_at: DateTime<Utc>,
}

impl Version {
    fn has_key(&self, group: &GroupKey, rank: Rank) -> bool {
        self.rank == rank && &self.group == group
    }

    fn to_stored(&self, id: RowId) -> StoredRow {
        StoredRow {
            id,
            group: self.group.clone(),
            rank: self.rank,
            payload: self.payload.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Uncommitted state of a row. `value: None` marks a pending delete.
#[derive(Debug)]
struct Pending {
    owner: TxId,
    value: Option<Version>,
    claimed: Vec<(GroupKey, Rank)>,
}

impl Pending {
    fn claims(&self, group: &GroupKey, rank: Rank) -> bool {
        self.claimed.iter().any(|(g, r)| *r == rank && g == group)
    }
}

#[derive(Debug, Default)]
struct Slot {
    committed: Option<Version>,
    pending: Option<Pending>,
}

impl Slot {
    fn visible(&self, tx: TxId) -> Option<&Version> {
        match &self.pending {
            Some(p) if p.owner == tx => p.value.as_ref(),
            _ => self.committed.as_ref(),
        }
    }
}

enum Lock {
    Held,
    Busy(TxId),
    Missing,
}

enum Conflict {
    Free,
    Busy(TxId),
    Taken(RowId),
}

enum Attempt<T> {
    Done(T),
    Wait(TxId),
}

#[derive(Debug)]
struct Table {
    rows: BTreeMap<RowId, Slot>,
    next_id: RowId,
    waits_for: HashMap<TxId, TxId>,
}

impl Table {
    fn try_lock(&mut self, tx: TxId, id: RowId, touched: &mut BTreeSet<RowId>) -> Lock {
        let Some(slot) = self.rows.get_mut(&id) else {
            return Lock::Missing;
        };
        match &slot.pending {
            Some(p) if p.owner == tx => {
                if p.value.is_some() {
                    Lock::Held
                } else {
                    Lock::Missing
                }
            }
            Some(p) => Lock::Busy(p.owner),
            None => match &slot.committed {
                Some(committed) => {
                    slot.pending = Some(Pending {
                        owner: tx,
                        value: Some(committed.clone()),
                        claimed: Vec::new(),
                    });
                    touched.insert(id);
                    Lock::Held
                }
                None => Lock::Missing,
            },
        }
    }

    /// Who, if anyone, stands in the way of `tx` writing `(group, rank)`.
    fn key_conflict(
        &self,
        tx: TxId,
        group: &GroupKey,
        rank: Rank,
        skip: impl Fn(RowId) -> bool,
    ) -> Conflict {
        for (&id, slot) in &self.rows {
            if skip(id) {
                continue;
            }
            match &slot.pending {
                Some(p) if p.owner == tx => {
                    if p.value.as_ref().is_some_and(|v| v.has_key(group, rank)) {
                        return Conflict::Taken(id);
                    }
                }
                Some(p) => {
                    let committed = slot.committed.as_ref().is_some_and(|v| v.has_key(group, rank));
                    let pending = p.value.as_ref().is_some_and(|v| v.has_key(group, rank));
                    if committed || pending || p.claims(group, rank) {
                        return Conflict::Busy(p.owner);
                    }
                }
                None => {
                    if slot.committed.as_ref().is_some_and(|v| v.has_key(group, rank)) {
                        return Conflict::Taken(id);
                    }
                }
            }
        }
        Conflict::Free
    }

    /// Rows of `group` visible to `tx` whose rank satisfies `keep`, ordered.
    fn matching(
        &self,
        tx: TxId,
        group: &GroupKey,
        keep: impl Fn(Rank) -> bool,
        order: Direction,
    ) -> Vec<(RowId, Rank)> {
        let mut hits: Vec<(RowId, Rank)> = self
            .rows
            .iter()
            .filter_map(|(&id, slot)| slot.visible(tx).map(|v| (id, v)))
            .filter(|(_, v)| &v.group == group && keep(v.rank))
            .map(|(id, v)| (id, v.rank))
            .collect();
        match order {
            Direction::Ascending => hits.sort_by_key(|&(_, rank)| rank),
            Direction::Descending => hits.sort_by_key(|&(_, rank)| std::cmp::Reverse(rank)),
        }
        hits
    }

    /// Locks every hit in order; `Some(holder)` if one of them is taken.
    fn lock_all(&mut self, tx: TxId, hits: &[(RowId, Rank)], touched: &mut BTreeSet<RowId>) -> Option<TxId> {
        for &(id, _) in hits {
            if let Lock::Busy(holder) = self.try_lock(tx, id, touched) {
                return Some(holder);
            }
        }
        None
    }

    /// Rewrites the key of a row `tx` already holds, reserving the new key.
    fn rekey(&mut self, tx: TxId, id: RowId, group: &GroupKey, rank: Rank) -> RankResult<&mut Version> {
        let pending = self
            .rows
            .get_mut(&id)
            .and_then(|slot| slot.pending.as_mut())
            .filter(|p| p.owner == tx && p.value.is_some())
            .ok_or(RankError::NotFound(id))?;
        pending.claimed.push((group.clone(), rank));
        let version = pending.value.as_mut().ok_or(RankError::NotFound(id))?;
        version.group = group.clone();
        version.rank = rank;
        version.updated_at = Utc::now();
        Ok(version)
    }
}

fn would_deadlock(waits_for: &HashMap<TxId, TxId>, me: TxId, holder: TxId) -> bool {
    let mut cursor = holder;
    for _ in 0..=waits_for.len() {
        if cursor == me {
            return true;
        }
        match waits_for.get(&cursor) {
            Some(&next) => cursor = next,
            None => return false,
        }
    }
    false
}

#[derive(Debug)]
struct Shared {
    table: Mutex<Table>,
    released: Condvar,
    next_tx: AtomicU64,
}

impl Shared {
    fn lock(&self) -> RankResult<MutexGuard<'_, Table>> {
        self.table
            .lock()
            .map_err(|_| RankError::Storage("memory store mutex poisoned".to_string()))
    }

    fn wait<'g>(
        &'g self,
        mut table: MutexGuard<'g, Table>,
        me: TxId,
        holder: TxId,
        deadline: Instant,
    ) -> RankResult<MutexGuard<'g, Table>> {
        if would_deadlock(&table.waits_for, me, holder) {
            warn!(tx = me, holder, "deadlock detected");
            return Err(RankError::TransientLockConflict(format!(
                "deadlock detected: transaction {} waits on {}",
                me, holder
            )));
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(tx = me, holder, "lock wait timed out");
            return Err(RankError::TransientLockConflict(format!(
                "lock wait timed out: transaction {} waits on {}",
                me, holder
            )));
        }

        table.waits_for.insert(me, holder);
        let (mut table, _) = self
            .released
            .wait_timeout(table, deadline - now)
            .map_err(|_| RankError::Storage("memory store mutex poisoned".to_string()))?;
        table.waits_for.remove(&me);
        Ok(table)
    }
}

/// Rank store living in process memory.
#[derive(Debug, Clone)]
pub struct MemoryRankStore {
    name: String,
    schema: GroupSchema,
    config: MemoryConfig,
    shared: Arc<Shared>,
}

impl MemoryRankStore {
    pub fn new(name: impl Into<String>, schema: GroupSchema, config: MemoryConfig) -> Self {
        Self {
            name: name.into(),
            schema,
            config,
            shared: Arc::new(Shared {
                table: Mutex::new(Table {
                    rows: BTreeMap::new(),
                    next_id: 1,
                    waits_for: HashMap::new(),
                }),
                released: Condvar::new(),
                next_tx: AtomicU64::new(1),
            }),
        }
    }
}

impl RankStore for MemoryRankStore {
    fn schema(&self) -> &GroupSchema {
        &self.schema
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&self, _intent: TxIntent) -> RankResult<Box<dyn RankTx + '_>> {
        Ok(Box::new(MemoryTx {
            store: self,
            id: self.shared.next_tx.fetch_add(1, Ordering::Relaxed),
            touched: BTreeSet::new(),
            finished: false,
        }))
    }
}

struct MemoryTx<'a> {
    store: &'a MemoryRankStore,
    id: TxId,
    touched: BTreeSet<RowId>,
    finished: bool,
}

impl MemoryTx<'_> {
    /// Retries `attempt` until it completes, waiting on whichever
    /// transaction it reports as in the way.
    fn run<T>(
        &mut self,
        mut attempt: impl FnMut(&mut Table, TxId, &mut BTreeSet<RowId>) -> RankResult<Attempt<T>>,
    ) -> RankResult<T> {
        let store = self.store;
        let deadline = Instant::now() + store.config.lock_timeout();
        let mut table = store.shared.lock()?;
        loop {
            match attempt(&mut *table, self.id, &mut self.touched)? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Wait(holder) => table = store.shared.wait(table, self.id, holder, deadline)?,
            }
        }
    }

    /// Publishes (or discards) every pending version owned by this
    /// transaction and wakes all waiters.
    fn finish(&mut self, publish: bool) {
        let mut table = match self.store.shared.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for id in std::mem::take(&mut self.touched) {
            let Some(slot) = table.rows.get_mut(&id) else {
                continue;
            };
            if slot.pending.as_ref().is_some_and(|p| p.owner == self.id) {
                let pending = slot.pending.take();
                if publish {
                    slot.committed = pending.and_then(|p| p.value);
                }
                if slot.committed.is_none() {
                    table.rows.remove(&id);
                }
            }
        }
        table.waits_for.remove(&self.id);
        self.finished = true;
        drop(table);
        self.store.shared.released.notify_all();
    }
}

impl RankTx for MemoryTx<'_> {
    fn insert(&mut self, group: &GroupKey, rank: Rank, payload: &str) -> RankResult<RowId> {
        self.run(|table, tx, touched| match table.key_conflict(tx, group, rank, |_| false) {
            Conflict::Busy(holder) => Ok(Attempt::Wait(holder)),
            Conflict::Taken(other) => Err(RankError::ConstraintViolation(format!(
                "rank {} in group {} already held by row {}",
                rank, group, other
            ))),
            Conflict::Free => {
                let id = table.next_id;
                table.next_id += 1;
                table.rows.insert(
                    id,
                    Slot {
                        committed: None,
                        pending: Some(Pending {
                            owner: tx,
                            claimed: vec![(group.clone(), rank)],
                            value: Some(Version {
                                group: group.clone(),
                                rank,
                                payload: payload.to_string(),
                                updated_at: Utc::now(),
                            }),
                        }),
                    },
                );
                touched.insert(id);
                Ok(Attempt::Done(id))
            }
        })
    }

    fn lock_row(&mut self, id: RowId) -> RankResult<Option<StoredRow>> {
        self.run(|table, tx, touched| match table.try_lock(tx, id, touched) {
            Lock::Busy(holder) => Ok(Attempt::Wait(holder)),
            Lock::Missing => Ok(Attempt::Done(None)),
            Lock::Held => Ok(Attempt::Done(
                table.rows.get(&id).and_then(|slot| slot.visible(tx)).map(|v| v.to_stored(id)),
            )),
        })
    }

    fn max_rank(&mut self, group: &GroupKey, exclude: RowId) -> RankResult<Option<Rank>> {
        let table = self.store.shared.lock()?;
        Ok(table
            .rows
            .iter()
            .filter(|(id, _)| **id != exclude)
            .filter_map(|(_, slot)| slot.visible(self.id))
            .filter(|v| &v.group == group)
            .map(|v| v.rank)
            .max())
    }

    fn lock_span(
        &mut self,
        group: &GroupKey,
        span: RankSpan,
        order: Direction,
    ) -> RankResult<Vec<(RowId, Rank)>> {
        self.run(|table, tx, touched| {
            let hits = table.matching(tx, group, |rank| span.contains(rank), order);
            match table.lock_all(tx, &hits, touched) {
                Some(holder) => Ok(Attempt::Wait(holder)),
                None => Ok(Attempt::Done(hits)),
            }
        })
    }

    fn write_row(
        &mut self,
        id: RowId,
        group: &GroupKey,
        rank: Rank,
        payload: Option<&str>,
    ) -> RankResult<()> {
        self.run(|table, tx, touched| {
            match table.try_lock(tx, id, touched) {
                Lock::Busy(holder) => return Ok(Attempt::Wait(holder)),
                Lock::Missing => return Err(RankError::NotFound(id)),
                Lock::Held => {}
            }
            match table.key_conflict(tx, group, rank, |other| other == id) {
                Conflict::Busy(holder) => Ok(Attempt::Wait(holder)),
                Conflict::Taken(other) => Err(RankError::ConstraintViolation(format!(
                    "rank {} in group {} already held by row {}",
                    rank, group, other
                ))),
                Conflict::Free => {
                    let version = table.rekey(tx, id, group, rank)?;
                    if let Some(payload) = payload {
                        version.payload = payload.to_string();
                    }
                    Ok(Attempt::Done(()))
                }
            }
        })
    }

    fn reflect_span(&mut self, group: &GroupKey, span: RankSpan, pivot: Rank) -> RankResult<usize> {
        if span.is_empty() {
            return Ok(0);
        }
        let moved = self.run(|table, tx, touched| {
            let hits = table.matching(tx, group, |rank| span.contains(rank), Direction::Ascending);
            if let Some(holder) = table.lock_all(tx, &hits, touched) {
                return Ok(Attempt::Wait(holder));
            }
            let batch: BTreeSet<RowId> = hits.iter().map(|&(id, _)| id).collect();
            for &(_, rank) in &hits {
                match table.key_conflict(tx, group, pivot - rank, |other| batch.contains(&other)) {
                    Conflict::Busy(holder) => return Ok(Attempt::Wait(holder)),
                    Conflict::Taken(other) => {
                        return Err(RankError::ConstraintViolation(format!(
                            "rank {} in group {} already held by row {}",
                            pivot - rank,
                            group,
                            other
                        )))
                    }
                    Conflict::Free => {}
                }
            }
            for &(id, rank) in &hits {
                table.rekey(tx, id, group, pivot - rank)?;
            }
            Ok(Attempt::Done(hits.len()))
        })?;
        debug!(store = %self.store.name, %group, lo = span.lo, hi = span.hi, pivot, moved, "reflected span");
        Ok(moved)
    }

    fn delete_row(&mut self, id: RowId) -> RankResult<bool> {
        self.run(|table, tx, touched| match table.try_lock(tx, id, touched) {
            Lock::Busy(holder) => Ok(Attempt::Wait(holder)),
            Lock::Missing => Ok(Attempt::Done(false)),
            Lock::Held => {
                if let Some(pending) = table.rows.get_mut(&id).and_then(|slot| slot.pending.as_mut()) {
                    pending.value = None;
                }
                Ok(Attempt::Done(true))
            }
        })
    }

    fn delete_group(&mut self, group: &GroupKey) -> RankResult<usize> {
        self.run(|table, tx, touched| {
            let hits = table.matching(tx, group, |_| true, Direction::Ascending);
            if let Some(holder) = table.lock_all(tx, &hits, touched) {
                return Ok(Attempt::Wait(holder));
            }
            for &(id, _) in &hits {
                if let Some(pending) = table.rows.get_mut(&id).and_then(|slot| slot.pending.as_mut()) {
                    pending.value = None;
                }
            }
            Ok(Attempt::Done(hits.len()))
        })
    }

    fn rows(&mut self, group: &GroupKey) -> RankResult<Vec<StoredRow>> {
        let table = self.store.shared.lock()?;
        let mut rows: Vec<StoredRow> = table
            .rows
            .iter()
            .filter_map(|(&id, slot)| slot.visible(self.id).map(|v| (id, v)))
            .filter(|(_, v)| &v.group == group)
            .map(|(id, v)| v.to_stored(id))
            .collect();
        rows.sort_by_key(|row| row.rank);
        Ok(rows)
    }

    fn commit(mut self: Box<Self>) -> RankResult<()> {
        debug!(store = %self.store.name, tx = self.id, rows = self.touched.len(), "commit");
        self.finish(true);
        Ok(())
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(false);
        }
    }
}
