//! Durable relay event store on SQLite.
//!
//! Replaceable kinds keep only their newest version, kind-5 requests
//! delete the author's referenced events, and a full-text index over
//! content backs the `search` filter field.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection};
use serde_json::Value;

use crate::error::Result;
use crate::event::{Event, Tag};

/// Filter accepted by both the WebSocket frontend and the store.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
    pub search: Option<String>,
    /// `#X` predicates with single-character names.
    pub tags: Vec<(String, Vec<String>)>,
}

impl Filter {
    /// Build a `Filter` from a Nostr filter JSON object.
    pub fn from_value(val: &Value) -> Self {
        let strings = |key: &str| {
            val.get(key).and_then(|v| v.as_array()).map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
            })
        };
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|u| u as u32))
                .collect()
        });
        let mut tags = vec![];
        if let Some(obj) = val.as_object() {
            for (key, v) in obj {
                if let Some(name) = key.strip_prefix('#') {
                    if name.chars().count() == 1 {
                        let values: Vec<String> = v
                            .as_array()
                            .map(|arr| {
                                arr.iter()
                                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                                    .collect()
                            })
                            .unwrap_or_default();
                        if !values.is_empty() {
                            tags.push((name.to_string(), values));
                        }
                    }
                }
            }
        }
        Filter {
            ids: strings("ids"),
            authors: strings("authors"),
            kinds,
            since: val.get("since").and_then(|v| v.as_u64()),
            until: val.get("until").and_then(|v| v.as_u64()),
            limit: val
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
            search: val
                .get("search")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            tags,
        }
    }

    /// In-memory match, used for live fan-out to subscribers.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|s| ev.created_at < s) {
            return false;
        }
        if self.until.is_some_and(|u| ev.created_at > u) {
            return false;
        }
        if let Some(search) = &self.search {
            if !ev
                .content
                .to_lowercase()
                .contains(&search.to_lowercase())
            {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let hit = ev.tags.iter().any(|t| {
                t.name() == Some(name.as_str())
                    && t.value().is_some_and(|v| values.iter().any(|w| w == v))
            });
            if !hit {
                return false;
            }
        }
        true
    }
}

/// SQLite-backed event store shared across connections.
#[derive(Clone)]
pub struct RelayStore {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id          TEXT PRIMARY KEY,
    pubkey      TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    kind        INTEGER NOT NULL,
    content     TEXT NOT NULL,
    sig         TEXT NOT NULL,
    magnet_uri  TEXT
);
CREATE TABLE IF NOT EXISTS tags (
    event_id    TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    value       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_pubkey_kind ON events(pubkey, kind);
CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);
CREATE INDEX IF NOT EXISTS idx_tags_lookup ON tags(name, value);
CREATE VIRTUAL TABLE IF NOT EXISTS content_fts USING fts5(id UNINDEXED, content);
";

/// Replaceable per (pubkey, kind): profile, contacts, and the 1xxxx range.
fn is_replaceable(kind: u32) -> bool {
    kind == 0 || kind == 3 || (10000..20000).contains(&kind)
}

/// Replaceable per (pubkey, kind, d-tag).
fn is_param_replaceable(kind: u32) -> bool {
    (30000..40000).contains(&kind)
}

/// Tag rows worth indexing: single-character names and the literal `d`.
fn is_indexed_tag(name: &str) -> bool {
    name.chars().count() == 1 || name == "d"
}

impl RelayStore {
    /// Open (and initialize) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory store for tests and ephemeral relays.
    pub fn memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Persist an event, applying replacement and deletion semantics.
    /// Returns the number of inserted rows (0 when the id already exists
    /// or the event was superseded).
    pub fn save_event(&self, ev: &Event) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if is_replaceable(ev.kind) {
            let stale: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM events WHERE pubkey = ?1 AND kind = ?2 AND created_at < ?3",
                )?;
                let rows = stmt.query_map(
                    params![ev.pubkey, ev.kind, ev.created_at],
                    |row| row.get::<_, String>(0),
                )?;
                rows.collect::<std::result::Result<_, _>>()?
            };
            delete_ids(&tx, &stale)?;
            // an older version must not shadow-insert under a new id
            let newer: i64 = tx.query_row(
                "SELECT COUNT(*) FROM events WHERE pubkey = ?1 AND kind = ?2 AND created_at >= ?3",
                params![ev.pubkey, ev.kind, ev.created_at],
                |row| row.get(0),
            )?;
            if newer > 0 {
                tx.commit()?;
                return Ok(0);
            }
        }

        if is_param_replaceable(ev.kind) {
            if let Some(d) = ev.d_tag() {
                let stale: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT e.id FROM events e JOIN tags t ON t.event_id = e.id \
                         WHERE e.pubkey = ?1 AND e.kind = ?2 AND e.created_at < ?3 \
                         AND t.name = 'd' AND t.value = ?4",
                    )?;
                    let rows = stmt.query_map(
                        params![ev.pubkey, ev.kind, ev.created_at, d],
                        |row| row.get::<_, String>(0),
                    )?;
                    rows.collect::<std::result::Result<_, _>>()?
                };
                delete_ids(&tx, &stale)?;
            }
        }

        if ev.kind == 5 {
            let targets: Vec<String> = ev
                .tags
                .iter()
                .filter(|t| t.name() == Some("e"))
                .filter_map(|t| t.value().map(|v| v.to_string()))
                .collect();
            let own: Vec<String> = {
                let mut own = vec![];
                let mut stmt =
                    tx.prepare("SELECT pubkey FROM events WHERE id = ?1")?;
                for id in &targets {
                    let author: Option<String> =
                        stmt.query_row(params![id], |row| row.get(0)).ok();
                    if author.as_deref() == Some(ev.pubkey.as_str()) {
                        own.push(id.clone());
                    }
                }
                own
            };
            delete_ids(&tx, &own)?;
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO events (id, pubkey, created_at, kind, content, sig) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![ev.id, ev.pubkey, ev.created_at, ev.kind, ev.content, ev.sig],
        )?;
        if inserted > 0 {
            for Tag(fields) in &ev.tags {
                if fields.len() >= 2 && is_indexed_tag(&fields[0]) {
                    tx.execute(
                        "INSERT INTO tags (event_id, name, value) VALUES (?1, ?2, ?3)",
                        params![ev.id, fields[0], fields[1]],
                    )?;
                }
            }
            tx.execute(
                "INSERT INTO content_fts (id, content) VALUES (?1, ?2)",
                params![ev.id, ev.content],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Remember which magnet an event was seeded under.
    pub fn set_magnet(&self, id: &str, uri: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE events SET magnet_uri = ?2 WHERE id = ?1",
            params![id, uri],
        )?;
        Ok(())
    }

    /// Stored magnet URI for an event, if any.
    pub fn magnet(&self, id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let uri = conn
            .query_row(
                "SELECT magnet_uri FROM events WHERE id = ?1",
                params![id],
                |row| row.get::<_, Option<String>>(0),
            )
            .unwrap_or(None);
        Ok(uri)
    }

    /// Query stored events, newest first. Tags are reassembled from the
    /// tag index.
    pub fn query_events(&self, filter: &Filter) -> Result<Vec<Event>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, pubkey, created_at, kind, content, sig FROM events WHERE 1 = 1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                return Ok(vec![]);
            }
            sql.push_str(&format!(" AND id IN ({})", placeholders(ids.len())));
            args.extend(ids.iter().map(|v| Box::new(v.clone()) as _));
        }
        if let Some(authors) = &filter.authors {
            if authors.is_empty() {
                return Ok(vec![]);
            }
            sql.push_str(&format!(" AND pubkey IN ({})", placeholders(authors.len())));
            args.extend(authors.iter().map(|v| Box::new(v.clone()) as _));
        }
        if let Some(kinds) = &filter.kinds {
            if kinds.is_empty() {
                return Ok(vec![]);
            }
            sql.push_str(&format!(" AND kind IN ({})", placeholders(kinds.len())));
            args.extend(kinds.iter().map(|v| Box::new(*v) as _));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND created_at >= ?");
            args.push(Box::new(since as i64));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND created_at <= ?");
            args.push(Box::new(until as i64));
        }
        for (name, values) in &filter.tags {
            if values.is_empty() {
                return Ok(vec![]);
            }
            sql.push_str(&format!(
                " AND id IN (SELECT event_id FROM tags WHERE name = ? AND value IN ({}))",
                placeholders(values.len())
            ));
            args.push(Box::new(name.clone()));
            args.extend(values.iter().map(|v| Box::new(v.clone()) as _));
        }
        if let Some(search) = &filter.search {
            sql.push_str(" AND id IN (SELECT id FROM content_fts WHERE content_fts MATCH ?)");
            args.push(Box::new(search.clone()));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit as i64));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            Ok(Event {
                id: row.get(0)?,
                pubkey: row.get(1)?,
                created_at: row.get::<_, i64>(2)? as u64,
                kind: row.get::<_, i64>(3)? as u32,
                content: row.get(4)?,
                sig: row.get(5)?,
                tags: vec![],
            })
        })?;
        let mut events: Vec<Event> = rows.collect::<std::result::Result<_, _>>()?;

        let mut tag_stmt =
            conn.prepare("SELECT name, value FROM tags WHERE event_id = ?1 ORDER BY rowid")?;
        for ev in &mut events {
            let tags = tag_stmt.query_map(params![ev.id], |row| {
                Ok(Tag(vec![row.get(0)?, row.get(1)?]))
            })?;
            ev.tags = tags.collect::<std::result::Result<_, _>>()?;
        }
        Ok(events)
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Delete events by id, keeping the full-text index in sync.
fn delete_ids(tx: &rusqlite::Transaction<'_>, ids: &[String]) -> Result<()> {
    for id in ids {
        tx.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        tx.execute("DELETE FROM content_fts WHERE id = ?1", params![id])?;
    }
    Ok(())
}
