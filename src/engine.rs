//! Rank maintenance engine
//!
//! Keeps every group's ranks dense and unique (`first..first+N-1`) under
//! concurrent writers. Each public operation is exactly one transaction;
//! the caller's entity is only updated after a successful commit.
//!
//! Serialization per group comes from two places: writing the sentinel rank
//! (the `(group, rank)` uniqueness constraint makes concurrent writers of
//! the same group queue up behind each other), and select-for-update over
//! the band of ranks a move passes through. Shifting siblings never goes
//! through a transiently duplicated rank: displaced rows are parked in a
//! reflected value space below the sentinel and brought back shifted by one.

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{EngineConfig, RankOrigin};
use crate::error::{RankError, RankResult};
use crate::model::{Direction, GroupKey, Rank, RankSpan, RowId, StoredRow};
use crate::sequenced::Sequenced;
use crate::store::{RankStore, RankTx, TxIntent};

/// Where a move should leave the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// A specific rank; past-the-end requests clamp to the last position.
    At(Rank),
    /// The end of the (possibly new) group.
    Last,
    /// Stay put within the same group; go to the end of a new one.
    Current,
}

/// Snapshot of one group's ranks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupAudit {
    pub group: GroupKey,
    pub ranks: Vec<Rank>,
    pub dense: bool,
}

impl GroupAudit {
    pub fn size(&self) -> usize {
        self.ranks.len()
    }
}

pub struct RankEngine<S> {
    store: S,
    config: EngineConfig,
}

impl<S: RankStore> RankEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn origin(&self) -> RankOrigin {
        self.config.origin
    }

    /// Assigns a brand-new row the next rank in its group and persists it.
    pub fn append<R: Sequenced>(&self, row: &mut R) -> RankResult<Rank> {
        if let Some(id) = row.id() {
            return Err(RankError::InvalidState(format!("row {} is already sequenced", id)));
        }
        if let Some(rank) = row.rank() {
            if rank != self.origin().sentinel() {
                return Err(RankError::InvalidState(format!(
                    "new row already ranked at {}; pre-ranked inserts are not supported",
                    rank
                )));
            }
        }
        let group = self.group_of(row)?;
        let payload = serde_json::to_string(row)?;

        let (id, rank) = self.transaction(TxIntent::Write, |tx| self.place_new(tx, &group, &payload))?;
        debug!(store = self.store.name(), id, %group, rank, "appended");

        row.set_id(id);
        row.set_rank(rank);
        Ok(rank)
    }

    /// Repositions a sequenced row. If its group key no longer matches the
    /// stored one, the row is transferred into the new group first.
    pub fn move_to<R: Sequenced>(&self, row: &mut R, placement: Placement) -> RankResult<Rank> {
        let id = self.id_of(row)?;
        if let Placement::At(rank) = placement {
            if !self.origin().is_placed(rank) {
                return Err(RankError::InvalidState(format!(
                    "rank {} is below the first position {}",
                    rank,
                    self.origin().first()
                )));
            }
        }
        let dest = self.group_of(row)?;
        let payload = serde_json::to_string(row)?;

        let rank = self.transaction(TxIntent::Write, |tx| {
            let stored = tx.lock_row(id)?.ok_or(RankError::NotFound(id))?;
            self.relocate(tx, &stored, &dest, placement, Some(&payload))
        })?;
        debug!(store = self.store.name(), id, group = %dest, rank, ?placement, "moved");

        row.set_rank(rank);
        Ok(rank)
    }

    /// The owning entity's single write path: appends unsaved rows, moves
    /// saved ones to `row.rank()`, sends rows whose group changed to the end
    /// of the new group, and otherwise just persists non-rank fields.
    pub fn save<R: Sequenced>(&self, row: &mut R) -> RankResult<Rank> {
        let Some(id) = row.id() else {
            return self.append(row);
        };
        let wanted = row.rank().filter(|&rank| self.origin().is_placed(rank));
        let dest = self.group_of(row)?;
        let payload = serde_json::to_string(row)?;

        let rank = self.transaction(TxIntent::Write, |tx| {
            let stored = tx.lock_row(id)?.ok_or(RankError::NotFound(id))?;
            let placement = match wanted {
                _ if stored.group != dest => Placement::Last,
                Some(rank) => Placement::At(rank),
                None => Placement::Current,
            };
            self.relocate(tx, &stored, &dest, placement, Some(&payload))
        })?;
        debug!(store = self.store.name(), id, group = %dest, rank, "saved");

        row.set_rank(rank);
        Ok(rank)
    }

    /// Removes a row and closes the gap it leaves.
    pub fn delete<R: Sequenced>(&self, row: &R) -> RankResult<()> {
        let id = self.id_of(row)?;
        let removed = self.transaction(TxIntent::Write, |tx| self.remove(tx, id))?;
        debug!(store = self.store.name(), id, group = %removed.group, rank = removed.rank, "deleted");
        Ok(())
    }

    /// Sends every row to the end of its own `group_key()` in one
    /// transaction. Rows leave in ascending (source group, rank) order so the
    /// destination keeps their relative order, and each source group is
    /// compact after every departure.
    pub fn transfer_all<R: Sequenced>(&self, rows: &mut [R]) -> RankResult<Vec<Rank>> {
        let mut plans = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            plans.push((self.id_of(row)?, self.group_of(row)?, serde_json::to_string(row)?));
        }

        let ranks = self.transaction(TxIntent::Write, |tx| {
            let mut order = Vec::with_capacity(plans.len());
            for (i, (id, _, _)) in plans.iter().enumerate() {
                let stored = tx.lock_row(*id)?.ok_or(RankError::NotFound(*id))?;
                order.push((i, stored.group, stored.rank));
            }
            order.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

            let mut ranks = vec![self.origin().sentinel(); plans.len()];
            for (i, _, _) in order {
                let (id, dest, payload) = &plans[i];
                // earlier departures may have shifted this row
                let stored = tx.lock_row(*id)?.ok_or(RankError::NotFound(*id))?;
                ranks[i] = self.relocate(tx, &stored, dest, Placement::Last, Some(payload))?;
            }
            Ok(ranks)
        })?;
        debug!(store = self.store.name(), rows = ranks.len(), "transferred");

        for (row, rank) in rows.iter_mut().zip(&ranks) {
            row.set_rank(*rank);
        }
        Ok(ranks)
    }

    /// Members of `group`, ordered by rank.
    pub fn list<R: Sequenced>(&self, group: &GroupKey) -> RankResult<Vec<R>> {
        self.store.schema().validate(group)?;
        let stored = self.transaction(TxIntent::Read, |tx| tx.rows(group))?;
        stored
            .into_iter()
            .map(|s| {
                let mut row: R = serde_json::from_str(&s.payload)?;
                row.set_id(s.id);
                row.set_rank(s.rank);
                Ok(row)
            })
            .collect()
    }

    pub fn audit(&self, group: &GroupKey) -> RankResult<GroupAudit> {
        self.store.schema().validate(group)?;
        let stored = self.transaction(TxIntent::Read, |tx| tx.rows(group))?;
        let ranks: Vec<Rank> = stored.iter().map(|s| s.rank).collect();
        let first = self.origin().first();
        let dense = ranks.iter().enumerate().all(|(i, &rank)| rank == first + i as Rank);
        if !dense {
            warn!(store = self.store.name(), %group, ?ranks, "group is not dense");
        }
        Ok(GroupAudit {
            group: group.clone(),
            ranks,
            dense,
        })
    }

    /// Deletes every member of `group`. Nothing is left to compact.
    pub fn clear_group(&self, group: &GroupKey) -> RankResult<usize> {
        self.store.schema().validate(group)?;
        let origin = self.origin();
        let removed = self.transaction(TxIntent::Write, |tx| {
            let members = tx.lock_span(group, RankSpan { lo: origin.first(), hi: Rank::MAX }, Direction::Ascending)?;
            // park one member on the sentinel so in-flight appends finish first
            if let Some(&(id, _)) = members.first() {
                tx.write_row(id, group, origin.sentinel(), None)?;
            }
            tx.delete_group(group)
        })?;
        debug!(store = self.store.name(), %group, removed, "cleared group");
        Ok(removed)
    }

    fn transaction<T>(
        &self,
        intent: TxIntent,
        op: impl FnOnce(&mut dyn RankTx) -> RankResult<T>,
    ) -> RankResult<T> {
        let mut tx = self.store.begin(intent)?;
        let value = match op(&mut *tx) {
            Ok(value) => value,
            Err(err) => {
                if err.is_retryable() {
                    warn!(store = self.store.name(), error = %err, "transaction rolled back on lock conflict");
                }
                return Err(err);
            }
        };
        tx.commit()?;
        Ok(value)
    }

    fn id_of<R: Sequenced>(&self, row: &R) -> RankResult<RowId> {
        row.id()
            .ok_or_else(|| RankError::InvalidState("row has not been appended yet".to_string()))
    }

    fn group_of<R: Sequenced>(&self, row: &R) -> RankResult<GroupKey> {
        let group = row.group_key();
        self.store.schema().validate(&group)?;
        Ok(group)
    }

    fn next_rank(&self, tx: &mut dyn RankTx, group: &GroupKey, exclude: RowId) -> RankResult<Rank> {
        let origin = self.origin();
        Ok(match tx.max_rank(group, exclude)? {
            Some(top) if origin.is_placed(top) => top + 1,
            _ => origin.first(),
        })
    }

    /// Insert at the sentinel (taking the group lock), then claim the slot
    /// after the current maximum.
    fn place_new(&self, tx: &mut dyn RankTx, group: &GroupKey, payload: &str) -> RankResult<(RowId, Rank)> {
        let id = tx.insert(group, self.origin().sentinel(), payload)?;
        let rank = self.next_rank(tx, group, id)?;
        tx.write_row(id, group, rank, None)?;
        Ok((id, rank))
    }

    /// Gives a stored-but-unplaced row a real rank at the end of its group.
    fn settle(&self, tx: &mut dyn RankTx, stored: &StoredRow) -> RankResult<Rank> {
        if self.origin().is_placed(stored.rank) {
            return Ok(stored.rank);
        }
        let rank = self.next_rank(tx, &stored.group, stored.id)?;
        tx.write_row(stored.id, &stored.group, rank, None)?;
        Ok(rank)
    }

    fn relocate(
        &self,
        tx: &mut dyn RankTx,
        stored: &StoredRow,
        dest: &GroupKey,
        placement: Placement,
        payload: Option<&str>,
    ) -> RankResult<Rank> {
        if &stored.group == dest {
            let current = self.settle(tx, stored)?;
            let requested = match placement {
                Placement::At(rank) => rank,
                Placement::Current => current,
                Placement::Last => tx
                    .max_rank(dest, stored.id)?
                    .map_or(current, |top| top.max(current)),
            };
            return self.shift_within(tx, stored.id, dest, current, requested, payload);
        }

        let end = self.transfer(tx, stored, dest, payload)?;
        match placement {
            Placement::At(rank) if rank < end => self.shift_within(tx, stored.id, dest, end, rank, None),
            _ => Ok(end),
        }
    }

    /// Same-group move from `current` towards `requested`. Returns the rank
    /// actually reached, which is clamped to the end of the group.
    fn shift_within(
        &self,
        tx: &mut dyn RankTx,
        id: RowId,
        group: &GroupKey,
        current: Rank,
        requested: Rank,
        payload: Option<&str>,
    ) -> RankResult<Rank> {
        let delta = requested - current;
        if delta == 0 {
            tx.write_row(id, group, current, payload)?;
            return Ok(current);
        }

        let direction = Direction::of(delta);
        let band = tx.lock_span(group, RankSpan::between(current, requested), direction)?;
        match band.first() {
            Some(&(first, rank)) if first == id && rank == current => {}
            _ => {
                return Err(RankError::ConstraintViolation(format!(
                    "row {} is no longer at rank {} in group {}",
                    id, current, group
                )))
            }
        }
        // we could have hit the end early
        let count = band.len() as Rank - 1;
        let target = band.last().map_or(current, |&(_, rank)| rank);
        if target != current + direction.step() * count {
            return Err(RankError::ConstraintViolation(format!(
                "group {} is not dense between ranks {} and {}",
                group, current, target
            )));
        }
        if count == 0 {
            tx.write_row(id, group, current, payload)?;
            return Ok(current);
        }

        let pivot = self.origin().pivot();
        let displaced = match direction {
            Direction::Ascending => RankSpan { lo: current + 1, hi: target },
            Direction::Descending => RankSpan { lo: target, hi: current - 1 },
        };
        tx.reflect_span(group, displaced, pivot)?;
        tx.write_row(id, group, target, payload)?;
        // siblings come back one step against the mover's direction
        tx.reflect_span(group, displaced.reflect(pivot), pivot - direction.step())?;
        Ok(target)
    }

    /// Group transfer: out of the source the way a delete leaves it, in
    /// through the sentinel of the destination, then appended there.
    fn transfer(
        &self,
        tx: &mut dyn RankTx,
        stored: &StoredRow,
        dest: &GroupKey,
        payload: Option<&str>,
    ) -> RankResult<Rank> {
        let origin = self.origin();
        if origin.is_placed(stored.rank) {
            self.vacate(tx, stored.id, &stored.group, stored.rank)?;
        }
        tx.write_row(stored.id, dest, origin.sentinel(), payload)?;
        let rank = self.next_rank(tx, dest, stored.id)?;
        tx.write_row(stored.id, dest, rank, None)?;
        debug!(id = stored.id, from = %stored.group, to = %dest, rank, "row changed group");
        Ok(rank)
    }

    fn remove(&self, tx: &mut dyn RankTx, id: RowId) -> RankResult<StoredRow> {
        let stored = tx.lock_row(id)?.ok_or(RankError::NotFound(id))?;
        if self.origin().is_placed(stored.rank) {
            self.vacate(tx, id, &stored.group, stored.rank)?;
        }
        tx.delete_row(id)?;
        Ok(stored)
    }

    /// Takes `group`'s sentinel for the row leaving `rank`, then pulls every
    /// row above it down one. The maximum is read after the sentinel is held,
    /// so appends that were in flight are already counted.
    fn vacate(&self, tx: &mut dyn RankTx, id: RowId, group: &GroupKey, rank: Rank) -> RankResult<()> {
        let origin = self.origin();
        // same lock an append would take
        tx.write_row(id, group, origin.sentinel(), None)?;
        if let Some(top) = tx.max_rank(group, id)?.filter(|&top| top > rank) {
            let pivot = origin.pivot();
            let above = RankSpan { lo: rank + 1, hi: top };
            tx.reflect_span(group, above, pivot)?;
            tx.reflect_span(group, above.reflect(pivot), pivot - 1)?;
        }
        Ok(())
    }
}
