//! SQLite-backed per-user store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  One [`SyncDb`] owns one connection; callers
//! serialise access (the user-handler holds its own lock), so there is
//! no internal locking here.
//!
//! TTLs are stored as absolute expiry times in ms; expired rows are
//! excluded from every read and count, and physically removed only as a
//! side effect of later writes to the same key.

use std::collections::BTreeMap;

use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};

use super::{Bso, BsoInput, Page, PostResults, Sort, StorageError};

/// The well-known Sync collections, pre-seeded with dense ids so that
/// fresh databases agree on the numbering.
const STANDARD_COLLECTIONS: [&str; 11] = [
    "clients", "crypto", "forms", "history", "keys", "meta", "bookmarks", "prefs", "tabs",
    "passwords", "addons",
];

/// A single user's storage database.
pub struct SyncDb {
    conn: Connection,
}

impl SyncDb {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (used by tests
    /// and the `:memory:` datadir mode).
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        if path != ":memory:" {
            db.conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
        }
        db.init_schema()?;
        Ok(db)
    }

    /// Create tables and seed the well-known collections. Idempotent.
    fn init_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS collections (
                id       INTEGER PRIMARY KEY,
                name     TEXT NOT NULL UNIQUE,
                modified INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS bsos (
                collection_id INTEGER NOT NULL,
                id            TEXT NOT NULL,
                sortindex     INTEGER,
                payload       TEXT NOT NULL DEFAULT '',
                modified      INTEGER NOT NULL,
                ttl           INTEGER,

                PRIMARY KEY (collection_id, id)
            );

            CREATE INDEX IF NOT EXISTS idx_bsos_modified
                ON bsos(collection_id, modified);
            ",
        )?;
        self.seed_collections()?;
        Ok(())
    }

    fn seed_collections(&self) -> Result<(), StorageError> {
        let mut stmt = self
            .conn
            .prepare("INSERT OR IGNORE INTO collections (id, name, modified) VALUES (?, ?, 0)")?;
        for (i, name) in STANDARD_COLLECTIONS.iter().enumerate() {
            stmt.execute(params![i as i64 + 1, name])?;
        }
        Ok(())
    }

    /// Wall-clock ms, clamped so collection timestamps never go backwards
    /// even if the system clock does.
    fn timestamp(&self) -> Result<u64, StorageError> {
        let wall = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let floor: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(modified), 0) FROM collections", [], |r| {
                r.get(0)
            })?;
        Ok(wall.max(floor as u64))
    }

    // ── collection metadata ─────────────────────────────────────────

    /// Map of collection name to last-modified ms, for collections that
    /// have seen at least one write.
    pub fn info_collections(&self) -> Result<BTreeMap<String, u64>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, modified FROM collections WHERE modified > 0")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (name, modified) = row?;
            out.insert(name, modified as u64);
        }
        Ok(out)
    }

    /// Map of collection name to live (non-expired) BSO count.
    pub fn info_collection_counts(&self) -> Result<BTreeMap<String, u64>, StorageError> {
        self.aggregate_per_collection("COUNT(*)")
    }

    /// Map of collection name to live payload bytes.
    pub fn info_collection_usage(&self) -> Result<BTreeMap<String, u64>, StorageError> {
        self.aggregate_per_collection("SUM(LENGTH(b.payload))")
    }

    fn aggregate_per_collection(&self, agg: &str) -> Result<BTreeMap<String, u64>, StorageError> {
        let sql = format!(
            "SELECT c.name, {agg} FROM bsos b
             JOIN collections c ON c.id = b.collection_id
             WHERE b.ttl IS NULL OR b.ttl >= ?
             GROUP BY c.name"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let now = self.timestamp()? as i64;
        let rows = stmt.query_map([now], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (name, value) = row?;
            out.insert(name, value as u64);
        }
        Ok(out)
    }

    /// Look up a collection id by name.
    pub fn get_collection_id(&self, name: &str) -> Result<Option<i64>, StorageError> {
        let id = self
            .conn
            .query_row("SELECT id FROM collections WHERE name = ?", [name], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(id)
    }

    /// Create a collection, allocating the next dense id. Returns the
    /// existing id if the name is already present.
    pub fn create_collection(&mut self, name: &str) -> Result<i64, StorageError> {
        if let Some(id) = self.get_collection_id(name)? {
            return Ok(id);
        }
        self.conn.execute(
            "INSERT INTO collections (id, name, modified)
             SELECT COALESCE(MAX(id), 0) + 1, ?, 0 FROM collections",
            [name],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // ── BSO reads ───────────────────────────────────────────────────

    /// Fetch a single live BSO.
    pub fn get_bso(&self, cid: i64, bid: &str) -> Result<Option<Bso>, StorageError> {
        let now = self.timestamp()? as i64;
        let bso = self
            .conn
            .query_row(
                "SELECT id, modified, payload, sortindex FROM bsos
                 WHERE collection_id = ? AND id = ? AND (ttl IS NULL OR ttl >= ?)",
                params![cid, bid, now],
                row_to_bso,
            )
            .optional()?;
        Ok(bso)
    }

    /// List live BSOs matching the filter, sorted and paginated.
    ///
    /// `total` counts every match before pagination; ties in every sort
    /// order break by ascending id so pagination is deterministic.
    pub fn get_bsos(
        &self,
        cid: i64,
        ids: &[String],
        newer: Option<u64>,
        sort: Sort,
        limit: usize,
        offset: usize,
    ) -> Result<Page, StorageError> {
        let now = self.timestamp()? as i64;

        let mut filter = String::from("collection_id = ? AND (ttl IS NULL OR ttl >= ?)");
        let mut args: Vec<Value> = vec![Value::Integer(cid), Value::Integer(now)];

        if !ids.is_empty() {
            let marks = vec!["?"; ids.len()].join(",");
            filter.push_str(&format!(" AND id IN ({marks})"));
            args.extend(ids.iter().map(|id| Value::Text(id.clone())));
        }

        if let Some(newer) = newer {
            filter.push_str(" AND modified > ?");
            args.push(Value::Integer(newer as i64));
        }

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM bsos WHERE {filter}"),
            rusqlite::params_from_iter(args.iter()),
            |r| r.get(0),
        )?;
        let total = total as usize;

        let order = match sort {
            Sort::Newest => "modified DESC, id ASC",
            Sort::Oldest => "modified ASC, id ASC",
            Sort::Index => "sortindex IS NULL, sortindex DESC, id ASC",
        };

        let sql = format!(
            "SELECT id, modified, payload, sortindex FROM bsos
             WHERE {filter} ORDER BY {order} LIMIT ? OFFSET ?"
        );
        args.push(Value::Integer(limit as i64));
        args.push(Value::Integer(offset as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_bso)?;

        let mut bsos = Vec::new();
        for row in rows {
            bsos.push(row?);
        }

        let more = total > offset + limit;
        Ok(Page {
            bsos,
            total,
            more,
            next_offset: offset + limit,
        })
    }

    // ── BSO writes ──────────────────────────────────────────────────

    /// Insert or partially update one BSO. Returns the new collection
    /// modified timestamp in ms.
    pub fn put_bso(
        &mut self,
        cid: i64,
        bid: &str,
        payload: Option<&str>,
        sortindex: Option<i32>,
        ttl_ms: Option<u64>,
    ) -> Result<u64, StorageError> {
        if payload.map_or(0, str::len) > super::MAX_BSO_PAYLOAD_SIZE {
            return Err(StorageError::PayloadTooBig);
        }

        let ts = self.timestamp()?;
        upsert_bso(&self.conn, cid, bid, payload, sortindex, ttl_ms, ts)?;
        self.touch_collection(cid, ts)?;
        Ok(ts)
    }

    /// Apply a batch of BSOs in one transaction.
    ///
    /// Per-item insert failures land in `failed`; the batch never fails
    /// as a whole for an item-level problem. Callers are expected to have
    /// validated ids and payload sizes already.
    pub fn post_bsos(&mut self, cid: i64, items: &[BsoInput]) -> Result<PostResults, StorageError> {
        let ts = self.timestamp()?;
        let tx = self.conn.transaction()?;

        let mut results = PostResults {
            modified: ts,
            ..Default::default()
        };

        for item in items {
            let id = item.id.clone().unwrap_or_default();
            match upsert_bso(
                &tx,
                cid,
                &id,
                item.payload.as_deref(),
                item.sortindex,
                item.ttl,
                ts,
            ) {
                Ok(()) => results.success.push(id),
                Err(err) => {
                    results.failed.entry(id).or_default().push(err.to_string());
                }
            }
        }

        tx.execute(
            "UPDATE collections SET modified = ? WHERE id = ?",
            params![ts as i64, cid],
        )?;
        tx.commit()?;
        Ok(results)
    }

    /// Delete one BSO. Returns the new collection modified timestamp.
    pub fn delete_bso(&mut self, cid: i64, bid: &str) -> Result<u64, StorageError> {
        let ts = self.timestamp()?;
        let changed = self.conn.execute(
            "DELETE FROM bsos WHERE collection_id = ? AND id = ? AND (ttl IS NULL OR ttl >= ?)",
            params![cid, bid, ts as i64],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound);
        }
        self.touch_collection(cid, ts)?;
        Ok(ts)
    }

    /// Delete a collection and everything in it.
    pub fn delete_collection(&mut self, cid: i64) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM bsos WHERE collection_id = ?", [cid])?;
        tx.execute("DELETE FROM collections WHERE id = ?", [cid])?;
        tx.commit()?;
        Ok(())
    }

    /// Drop every row and reseed the well-known collections.
    pub fn delete_everything(&mut self) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM bsos", [])?;
        tx.execute("DELETE FROM collections", [])?;
        tx.commit()?;
        self.seed_collections()?;
        Ok(())
    }

    fn touch_collection(&self, cid: i64, ts: u64) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE collections SET modified = ? WHERE id = ?",
            params![ts as i64, cid],
        )?;
        Ok(())
    }
}

fn row_to_bso(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bso> {
    Ok(Bso {
        id: row.get(0)?,
        modified: row.get::<_, i64>(1)? as u64,
        payload: row.get(2)?,
        sortindex: row.get(3)?,
    })
}

/// Shared upsert used by PUT and the bulk POST transaction.
///
/// Absent fields keep their stored values on update; on insert the
/// payload defaults to empty. A provided `ttl_ms` is relative and is
/// stored as the absolute expiry `ts + ttl_ms`.
fn upsert_bso(
    conn: &Connection,
    cid: i64,
    bid: &str,
    payload: Option<&str>,
    sortindex: Option<i32>,
    ttl_ms: Option<u64>,
    ts: u64,
) -> Result<(), StorageError> {
    let expiry = ttl_ms.map(|ttl| (ts + ttl) as i64);
    conn.execute(
        "INSERT INTO bsos (collection_id, id, sortindex, payload, modified, ttl)
         VALUES (?1, ?2, ?3, COALESCE(?4, ''), ?5, ?6)
         ON CONFLICT (collection_id, id) DO UPDATE SET
             sortindex = COALESCE(?3, bsos.sortindex),
             payload   = COALESCE(?4, bsos.payload),
             ttl       = COALESCE(?6, bsos.ttl),
             modified  = ?5",
        params![cid, bid, sortindex, payload, ts as i64, expiry],
    )?;
    Ok(())
}
