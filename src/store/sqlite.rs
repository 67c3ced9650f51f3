//! SQLite substrate
//!
//! One table per entity type. Each transaction opens its own connection and
//! writers start with `BEGIN IMMEDIATE`, so SQLite's busy handler does the
//! waiting and the `UNIQUE(group.., rank)` constraint is checked row by row.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::config::SqliteConfig;
use crate::error::{RankError, RankResult};
use crate::model::{
    ColumnKind, Direction, GroupKey, GroupSchema, KeyValue, Rank, RankSpan, RowId, StoredRow,
};
use crate::store::{RankStore, RankTx, TxIntent};

/// Table layout for one sequenced entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    table: String,
    group_columns: Vec<(String, ColumnKind)>,
}

impl TableSpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            group_columns: Vec::new(),
        }
    }

    pub fn group_column(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.group_columns.push((name.into(), kind));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> GroupSchema {
        GroupSchema::new(self.group_columns.iter().map(|(_, kind)| *kind).collect())
    }

    fn validate(&self) -> RankResult<()> {
        if !is_identifier(&self.table) {
            return Err(RankError::Config(format!("invalid table name '{}'", self.table)));
        }
        if self.group_columns.is_empty() {
            return Err(RankError::Config(format!("table '{}' has no group columns", self.table)));
        }
        for (name, _) in &self.group_columns {
            if !is_identifier(name) || matches!(name.as_str(), "id" | "rank" | "payload" | "updated_at") {
                return Err(RankError::Config(format!("invalid group column '{}'", name)));
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// SQL text rendered once per table.
#[derive(Debug, Clone)]
struct Statements {
    create: String,
    insert: String,
    select_row: String,
    max_rank: String,
    span_asc: String,
    span_desc: String,
    write_row: String,
    reflect: String,
    delete_row: String,
    delete_group: String,
    rows: String,
}

impl Statements {
    fn render(spec: &TableSpec) -> Self {
        let table = format!("\"{}\"", spec.table);
        let k = spec.group_columns.len();
        let cols: Vec<String> = spec.group_columns.iter().map(|(name, _)| format!("\"{}\"", name)).collect();
        let col_list = cols.join(", ");
        let where_group = cols
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c, i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let column_defs = spec
            .group_columns
            .iter()
            .map(|(name, kind)| {
                let ty = match kind {
                    ColumnKind::Integer => "INTEGER",
                    ColumnKind::Text => "TEXT",
                };
                format!("\"{}\" {} NOT NULL", name, ty)
            })
            .collect::<Vec<_>>()
            .join(",\n    ");
        let set_group = cols
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c, i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let select = format!("SELECT id, {}, \"rank\", payload, updated_at FROM {}", col_list, table);

        Self {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {table} (\n    id INTEGER PRIMARY KEY AUTOINCREMENT,\n    {column_defs},\n    \"rank\" INTEGER NOT NULL,\n    payload TEXT NOT NULL,\n    updated_at TEXT NOT NULL,\n    UNIQUE ({col_list}, \"rank\")\n);"
            ),
            insert: format!(
                "INSERT INTO {} ({}, \"rank\", payload, updated_at) VALUES ({}, ?{}, ?{}, ?{})",
                table,
                col_list,
                (1..=k).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", "),
                k + 1,
                k + 2,
                k + 3
            ),
            select_row: format!("{} WHERE id = ?1", select),
            max_rank: format!("SELECT MAX(\"rank\") FROM {} WHERE {} AND id <> ?{}", table, where_group, k + 1),
            span_asc: format!(
                "SELECT id, \"rank\" FROM {} WHERE {} AND \"rank\" BETWEEN ?{} AND ?{} ORDER BY \"rank\" ASC",
                table,
                where_group,
                k + 1,
                k + 2
            ),
            span_desc: format!(
                "SELECT id, \"rank\" FROM {} WHERE {} AND \"rank\" BETWEEN ?{} AND ?{} ORDER BY \"rank\" DESC",
                table,
                where_group,
                k + 1,
                k + 2
            ),
            write_row: format!(
                "UPDATE {} SET {}, \"rank\" = ?{}, updated_at = ?{}, payload = COALESCE(?{}, payload) WHERE id = ?{}",
                table,
                set_group,
                k + 1,
                k + 2,
                k + 3,
                k + 4
            ),
            reflect: format!(
                "UPDATE {} SET \"rank\" = ?{} - \"rank\" WHERE {} AND \"rank\" BETWEEN ?{} AND ?{}",
                table,
                k + 3,
                where_group,
                k + 1,
                k + 2
            ),
            delete_row: format!("DELETE FROM {} WHERE id = ?1", table),
            delete_group: format!("DELETE FROM {} WHERE {}", table, where_group),
            rows: format!("{} WHERE {} ORDER BY \"rank\" ASC", select, where_group),
        }
    }
}

/// Rank store backed by a SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteRankStore {
    config: SqliteConfig,
    spec: TableSpec,
    schema: GroupSchema,
    sql: Statements,
}

impl SqliteRankStore {
    /// Opens (creating if needed) the table described by `spec`.
    pub fn open(config: SqliteConfig, spec: TableSpec) -> RankResult<Self> {
        spec.validate()?;
        let sql = Statements::render(&spec);
        let store = Self {
            schema: spec.schema(),
            config,
            spec,
            sql,
        };

        let conn = store.connect()?;
        conn.execute_batch(&store.sql.create)?;
        info!(
            table = store.spec.table(),
            path = %store.config.path.display(),
            "sequenced table ready"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    fn connect(&self) -> RankResult<Connection> {
        let conn = Connection::open(&self.config.path)?;
        conn.busy_timeout(self.config.busy_timeout())?;
        let pragma = format!("PRAGMA journal_mode = {}", self.config.journal_mode.pragma_value());
        conn.query_row(&pragma, [], |row| row.get::<_, String>(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }
}

impl RankStore for SqliteRankStore {
    fn schema(&self) -> &GroupSchema {
        &self.schema
    }

    fn name(&self) -> &str {
        self.spec.table()
    }

    fn begin(&self, intent: TxIntent) -> RankResult<Box<dyn RankTx + '_>> {
        let conn = self.connect()?;
        match intent {
            TxIntent::Write => conn.execute_batch("BEGIN IMMEDIATE")?,
            TxIntent::Read => conn.execute_batch("BEGIN DEFERRED")?,
        }
        Ok(Box::new(SqliteTx {
            store: self,
            conn,
            finished: false,
        }))
    }
}

struct SqliteTx<'a> {
    store: &'a SqliteRankStore,
    conn: Connection,
    finished: bool,
}

impl SqliteTx<'_> {
    fn group_params(group: &GroupKey) -> Vec<Value> {
        group
            .parts()
            .iter()
            .map(|part| match part {
                KeyValue::Int(v) => Value::Integer(*v),
                KeyValue::Text(v) => Value::Text(v.clone()),
            })
            .collect()
    }

    fn read_row(&self, row: &Row<'_>) -> rusqlite::Result<(RowId, GroupKey, Rank, String, String)> {
        let columns = self.store.schema.columns();
        let mut parts = Vec::with_capacity(columns.len());
        for (i, kind) in columns.iter().enumerate() {
            let part = match kind {
                ColumnKind::Integer => KeyValue::Int(row.get(i + 1)?),
                ColumnKind::Text => KeyValue::Text(row.get(i + 1)?),
            };
            parts.push(part);
        }
        let k = columns.len();
        Ok((row.get(0)?, GroupKey::new(parts), row.get(k + 1)?, row.get(k + 2)?, row.get(k + 3)?))
    }

    fn stored(raw: (RowId, GroupKey, Rank, String, String)) -> RankResult<StoredRow> {
        let (id, group, rank, payload, updated_at) = raw;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| RankError::Storage(format!("row {} has bad updated_at: {}", id, e)))?
            .with_timezone(&Utc);
        Ok(StoredRow {
            id,
            group,
            rank,
            payload,
            updated_at,
        })
    }
}

impl RankTx for SqliteTx<'_> {
    fn insert(&mut self, group: &GroupKey, rank: Rank, payload: &str) -> RankResult<RowId> {
        let mut params = Self::group_params(group);
        params.push(Value::Integer(rank));
        params.push(Value::Text(payload.to_string()));
        params.push(Value::Text(Utc::now().to_rfc3339()));
        self.conn.execute(&self.store.sql.insert, params_from_iter(params))?;
        Ok(self.conn.last_insert_rowid())
    }

    fn lock_row(&mut self, id: RowId) -> RankResult<Option<StoredRow>> {
        // BEGIN IMMEDIATE already holds the write lock; a plain read is
        // as good as FOR UPDATE here.
        let raw = self
            .conn
            .query_row(&self.store.sql.select_row, [id], |row| self.read_row(row))
            .optional()?;
        raw.map(Self::stored).transpose()
    }

    fn max_rank(&mut self, group: &GroupKey, exclude: RowId) -> RankResult<Option<Rank>> {
        let mut params = Self::group_params(group);
        params.push(Value::Integer(exclude));
        let max: Option<Rank> = self
            .conn
            .query_row(&self.store.sql.max_rank, params_from_iter(params), |row| row.get(0))?;
        Ok(max)
    }

    fn lock_span(
        &mut self,
        group: &GroupKey,
        span: RankSpan,
        order: Direction,
    ) -> RankResult<Vec<(RowId, Rank)>> {
        let sql = match order {
            Direction::Ascending => &self.store.sql.span_asc,
            Direction::Descending => &self.store.sql.span_desc,
        };
        let mut params = Self::group_params(group);
        params.push(Value::Integer(span.lo));
        params.push(Value::Integer(span.hi));

        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut locked = Vec::new();
        for row in rows {
            locked.push(row?);
        }
        Ok(locked)
    }

    fn write_row(
        &mut self,
        id: RowId,
        group: &GroupKey,
        rank: Rank,
        payload: Option<&str>,
    ) -> RankResult<()> {
        let mut params = Self::group_params(group);
        params.push(Value::Integer(rank));
        params.push(Value::Text(Utc::now().to_rfc3339()));
        params.push(payload.map_or(Value::Null, |p| Value::Text(p.to_string())));
        params.push(Value::Integer(id));
        let changed = self.conn.execute(&self.store.sql.write_row, params_from_iter(params))?;
        if changed == 0 {
            return Err(RankError::NotFound(id));
        }
        Ok(())
    }

    fn reflect_span(&mut self, group: &GroupKey, span: RankSpan, pivot: Rank) -> RankResult<usize> {
        if span.is_empty() {
            return Ok(0);
        }
        let mut params = Self::group_params(group);
        params.push(Value::Integer(span.lo));
        params.push(Value::Integer(span.hi));
        params.push(Value::Integer(pivot));
        let changed = self.conn.execute(&self.store.sql.reflect, params_from_iter(params))?;
        debug!(table = self.store.spec.table(), %group, lo = span.lo, hi = span.hi, pivot, changed, "reflected span");
        Ok(changed)
    }

    fn delete_row(&mut self, id: RowId) -> RankResult<bool> {
        Ok(self.conn.execute(&self.store.sql.delete_row, [id])? > 0)
    }

    fn delete_group(&mut self, group: &GroupKey) -> RankResult<usize> {
        Ok(self
            .conn
            .execute(&self.store.sql.delete_group, params_from_iter(Self::group_params(group)))?)
    }

    fn rows(&mut self, group: &GroupKey) -> RankResult<Vec<StoredRow>> {
        let mut stmt = self.conn.prepare(&self.store.sql.rows)?;
        let raw = stmt.query_map(params_from_iter(Self::group_params(group)), |row| self.read_row(row))?;
        let mut rows = Vec::new();
        for r in raw {
            rows.push(Self::stored(r?)?);
        }
        Ok(rows)
    }

    fn commit(mut self: Box<Self>) -> RankResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}
