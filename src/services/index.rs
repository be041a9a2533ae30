use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::note::{Graph, GraphEdge, GraphNode, NoteSummary, SearchHit};

/// Everything the index stores about one note.
#[derive(Debug, Clone)]
pub struct NoteRecord {
    pub path: String,
    pub title: String,
    pub checksum: String,
    pub tags: Vec<String>,
    pub body: String,
    pub links: Vec<String>,
    pub updated_at: i64,
}

/// Raw index row, as stored.
#[derive(Debug, Clone)]
pub struct IndexRow {
    pub path: String,
    pub title: String,
    pub checksum: String,
    pub tags: Vec<String>,
    pub updated_at: i64,
}

/// One tag with the number of notes carrying it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TagCount {
    pub tag: String,
    pub count: u32,
}

/// List ordering. Anything else a client sends maps to the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    UpdatedDesc,
    TitleAsc,
    PathAsc,
}

impl SortKey {
    pub fn parse(raw: Option<&str>) -> SortKey {
        match raw {
            Some("title") => SortKey::TitleAsc,
            Some("path") => SortKey::PathAsc,
            _ => SortKey::UpdatedDesc,
        }
    }

    fn order_clause(self) -> &'static str {
        match self {
            SortKey::UpdatedDesc => "updated_at DESC",
            SortKey::TitleAsc => "title ASC",
            SortKey::PathAsc => "path ASC",
        }
    }
}

pub const DEFAULT_LIST_LIMIT: u32 = 50;

/// SQLite-backed secondary index over the vault: note metadata, outgoing
/// link edges and a full-text table. A disposable cache — delete the file
/// and the reconciler rebuilds it.
pub struct Index {
    conn: Mutex<Connection>,
    fts: bool,
}

impl Index {
    /// Open (or create) the index database, apply pragmas and schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// In-memory index for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS notes (
                path TEXT PRIMARY KEY,
                title TEXT NOT NULL DEFAULT '',
                checksum TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                body TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS links (
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'inline',
                UNIQUE(source, target)
            );

            CREATE INDEX IF NOT EXISTS idx_links_source ON links(source);
            CREATE INDEX IF NOT EXISTS idx_links_target ON links(target);
            ",
        )?;

        // FTS5 may be missing from the linked SQLite; search then degrades
        // to substring matching over the notes table.
        let fts = match conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS files_fts USING fts5(
                path UNINDEXED, title, body, tags,
                tokenize='unicode61 remove_diacritics 2'
            );",
        ) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("FTS5 unavailable, search falls back to LIKE: {e}");
                false
            }
        };

        Ok(Index {
            conn: Mutex::new(conn),
            fts,
        })
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; propagating the
        // panic is the only sound option.
        self.conn.lock().expect("index mutex poisoned")
    }

    /// Replace one note's row, FTS entry and outgoing links in a single
    /// transaction.
    pub fn upsert_note(&self, record: &NoteRecord) -> Result<()> {
        let tags_json = serde_json::to_string(&record.tags)
            .map_err(|e| Error::Internal(format!("tags serialization: {e}")))?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO notes (path, title, checksum, tags, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.path,
                record.title,
                record.checksum,
                tags_json,
                record.body,
                record.updated_at,
            ],
        )?;

        if self.fts {
            tx.execute("DELETE FROM files_fts WHERE path = ?1", [&record.path])?;
            tx.execute(
                "INSERT INTO files_fts (path, title, body, tags) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.path,
                    record.title,
                    record.body,
                    record.tags.join(" "),
                ],
            )?;
        }

        tx.execute("DELETE FROM links WHERE source = ?1", [&record.path])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO links (source, target, kind) VALUES (?1, ?2, 'inline')",
            )?;
            for target in &record.links {
                stmt.execute(params![record.path, target])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Remove a note from all three tables. Idempotent.
    pub fn delete_note(&self, path: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        if self.fts {
            tx.execute("DELETE FROM files_fts WHERE path = ?1", [path])?;
        }
        tx.execute("DELETE FROM links WHERE source = ?1", [path])?;
        tx.execute("DELETE FROM notes WHERE path = ?1", [path])?;
        tx.commit()?;
        Ok(())
    }

    /// `Ok(None)` when the note is not indexed — absence is not an error.
    pub fn get_row(&self, path: &str) -> Result<Option<IndexRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT path, title, checksum, tags, updated_at FROM notes WHERE path = ?1",
                [path],
                |row| {
                    Ok(IndexRow {
                        path: row.get(0)?,
                        title: row.get(1)?,
                        checksum: row.get(2)?,
                        tags: parse_tags(row.get::<_, String>(3)?),
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_checksum(&self, path: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let checksum = conn
            .query_row(
                "SELECT checksum FROM notes WHERE path = ?1",
                [path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(checksum)
    }

    /// Whole-index `path → (checksum, updated_at)` in one query. The
    /// reconciler uses the stored mtime as a cheap change proxy.
    pub fn all_checksums(&self) -> Result<HashMap<String, (String, i64)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT path, checksum, updated_at FROM notes")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, (row.get(1)?, row.get(2)?)))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (path, value) = row?;
            map.insert(path, value);
        }
        Ok(map)
    }

    /// List note summaries. Tag filtering is array membership over the
    /// stored JSON, not substring matching on the serialized form.
    pub fn list_notes(
        &self,
        limit: u32,
        offset: u32,
        tag: Option<&str>,
        sort: SortKey,
    ) -> Result<Vec<NoteSummary>> {
        let sql = format!(
            "SELECT path, title, tags, updated_at FROM notes
             WHERE ?1 IS NULL
                OR EXISTS (SELECT 1 FROM json_each(notes.tags) WHERE json_each.value = ?1)
             ORDER BY {} LIMIT ?2 OFFSET ?3",
            sort.order_clause()
        );

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![tag, limit, offset], |row| {
            Ok(NoteSummary {
                path: row.get(0)?,
                title: row.get(1)?,
                tags: parse_tags(row.get::<_, String>(2)?),
                updated_at: rfc3339(row.get(3)?),
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Full-text search with `<b>…</b>` snippet markers; LIKE fallback
    /// without FTS5.
    pub fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        if self.fts {
            self.search_fts(query, limit)
        } else {
            self.search_like(query, limit)
        }
    }

    fn search_fts(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT path, title, snippet(files_fts, 2, '<b>', '</b>', '…', 64)
             FROM files_fts
             WHERE files_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![escape_fts_query(query), limit], |row| {
            Ok(SearchHit {
                path: row.get(0)?,
                title: row.get(1)?,
                snippet: row.get(2)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    fn search_like(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>> {
        let needle = format!("%{}%", query.to_lowercase());
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT path, title, body FROM notes
             WHERE lower(title) LIKE ?1 OR lower(body) LIKE ?1 OR lower(tags) LIKE ?1
             ORDER BY updated_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![needle, limit], |row| {
            let body: String = row.get(2)?;
            Ok(SearchHit {
                path: row.get(0)?,
                title: row.get(1)?,
                snippet: body_prefix(&body, 200),
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Whole-vault graph: indexed notes plus any link target that does not
    /// resolve to an indexed path, the latter with an empty title.
    pub fn graph(&self) -> Result<Graph> {
        let conn = self.lock();

        let mut nodes = Vec::new();
        let mut stmt = conn.prepare("SELECT path, title FROM notes ORDER BY path")?;
        let note_rows = stmt.query_map([], |row| {
            Ok(GraphNode {
                id: row.get(0)?,
                title: row.get(1)?,
                resolved: true,
            })
        })?;
        for node in note_rows {
            nodes.push(node?);
        }

        let mut stmt = conn.prepare(
            "SELECT DISTINCT target FROM links
             WHERE target NOT IN (SELECT path FROM notes)
             ORDER BY target",
        )?;
        let dangling = stmt.query_map([], |row| {
            Ok(GraphNode {
                id: row.get(0)?,
                title: String::new(),
                resolved: false,
            })
        })?;
        for node in dangling {
            nodes.push(node?);
        }

        let mut stmt = conn.prepare("SELECT source, target, kind FROM links ORDER BY source")?;
        let edge_rows = stmt.query_map([], |row| {
            Ok(GraphEdge {
                source: row.get(0)?,
                target: row.get(1)?,
                kind: row.get(2)?,
            })
        })?;
        let mut edges = Vec::new();
        for edge in edge_rows {
            edges.push(edge?);
        }

        Ok(Graph { nodes, edges })
    }

    /// All sources linking to `target`. The stored target is whatever the
    /// author wrote inside `[[…]]`, so callers pass the raw token.
    pub fn backlinks(&self, target: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT source FROM links WHERE target = ?1 ORDER BY source")?;
        let rows = stmt.query_map([target], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Every distinct tag with its note count, most used first.
    pub fn all_tags(&self) -> Result<Vec<TagCount>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT json_each.value, COUNT(*) AS cnt
             FROM notes, json_each(notes.tags)
             GROUP BY json_each.value
             ORDER BY cnt DESC, json_each.value ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TagCount {
                tag: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Backlinks for an indexed note: authors usually write `[[b]]` for
    /// `b.md`, so match both the full path and its stem.
    pub fn backlinks_for_note(&self, path: &str) -> Result<Vec<String>> {
        let stem = path.strip_suffix(".md").unwrap_or(path);
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT source FROM links WHERE target = ?1 OR target = ?2 ORDER BY source",
        )?;
        let rows = stmt.query_map(params![path, stem], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

fn parse_tags(json: String) -> Vec<String> {
    serde_json::from_str(&json).unwrap_or_default()
}

/// First `max` bytes of the body, cut back to a char boundary.
fn body_prefix(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

pub fn rfc3339(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

/// Quote user tokens so FTS5 query syntax characters cannot break the
/// statement. Whitespace still splits into separate terms.
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, body: &str, tags: &[&str], links: &[&str]) -> NoteRecord {
        NoteRecord {
            path: path.to_string(),
            title: path.trim_end_matches(".md").to_string(),
            checksum: crate::services::vault::sha256_hex(body.as_bytes()),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            body: body.to_string(),
            links: links.iter().map(|s| s.to_string()).collect(),
            updated_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn upsert_then_get_row() {
        let index = Index::open_in_memory().unwrap();
        index.upsert_note(&record("a.md", "hello", &["x"], &[])).unwrap();

        let row = index.get_row("a.md").unwrap().unwrap();
        assert_eq!(row.title, "a");
        assert_eq!(row.tags, vec!["x"]);
        assert!(index.get_row("missing.md").unwrap().is_none());
    }

    #[test]
    fn upsert_replaces_links() {
        let index = Index::open_in_memory().unwrap();
        index
            .upsert_note(&record("a.md", "v1", &[], &["b", "c"]))
            .unwrap();
        index.upsert_note(&record("a.md", "v2", &[], &["c"])).unwrap();

        assert_eq!(index.backlinks("b").unwrap(), Vec::<String>::new());
        assert_eq!(index.backlinks("c").unwrap(), vec!["a.md"]);
    }

    #[test]
    fn duplicate_links_collapse() {
        let index = Index::open_in_memory().unwrap();
        index
            .upsert_note(&record("a.md", "x", &[], &["b", "b"]))
            .unwrap();
        assert_eq!(index.backlinks("b").unwrap(), vec!["a.md"]);
    }

    #[test]
    fn delete_is_idempotent() {
        let index = Index::open_in_memory().unwrap();
        index.upsert_note(&record("a.md", "x", &[], &["b"])).unwrap();
        index.delete_note("a.md").unwrap();
        index.delete_note("a.md").unwrap();
        assert!(index.get_row("a.md").unwrap().is_none());
        assert!(index.backlinks("b").unwrap().is_empty());
    }

    #[test]
    fn all_checksums_single_query() {
        let index = Index::open_in_memory().unwrap();
        index.upsert_note(&record("a.md", "1", &[], &[])).unwrap();
        index.upsert_note(&record("b.md", "2", &[], &[])).unwrap();

        let map = index.all_checksums().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["a.md"].0, crate::services::vault::sha256_hex(b"1"));
    }

    #[test]
    fn tag_filter_is_membership_not_substring() {
        let index = Index::open_in_memory().unwrap();
        index.upsert_note(&record("a.md", "", &["rust"], &[])).unwrap();
        index
            .upsert_note(&record("b.md", "", &["rustacean"], &[]))
            .unwrap();

        let hits = index
            .list_notes(50, 0, Some("rust"), SortKey::PathAsc)
            .unwrap();
        let paths: Vec<_> = hits.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["a.md"]);
    }

    #[test]
    fn list_sort_and_pagination() {
        let index = Index::open_in_memory().unwrap();
        for (path, at) in [("b.md", 2), ("a.md", 3), ("c.md", 1)] {
            let mut rec = record(path, "", &[], &[]);
            rec.updated_at = at;
            index.upsert_note(&rec).unwrap();
        }

        let by_updated = index.list_notes(50, 0, None, SortKey::UpdatedDesc).unwrap();
        let paths: Vec<_> = by_updated.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "b.md", "c.md"]);

        let by_path = index.list_notes(2, 1, None, SortKey::PathAsc).unwrap();
        let paths: Vec<_> = by_path.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["b.md", "c.md"]);
    }

    #[test]
    fn fts_search_returns_snippet() {
        let index = Index::open_in_memory().unwrap();
        assert!(index.fts_enabled());
        index
            .upsert_note(&record("hello.md", "# Hello\nworld", &[], &[]))
            .unwrap();

        let hits = index.search("world", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "hello.md");
        assert!(hits[0].snippet.contains("<b>world</b>"));
    }

    #[test]
    fn fts_search_folds_case_and_diacritics() {
        let index = Index::open_in_memory().unwrap();
        index
            .upsert_note(&record("k.md", "Кенас is a rune", &[], &[]))
            .unwrap();

        assert_eq!(index.search("кенас", 10).unwrap().len(), 1);
        assert_eq!(index.search("кена́с", 10).unwrap().len(), 1);
    }

    #[test]
    fn fts_query_metacharacters_are_escaped() {
        let index = Index::open_in_memory().unwrap();
        index
            .upsert_note(&record("a.md", "plain text", &[], &[]))
            .unwrap();
        // Must not error out on FTS5 syntax characters.
        assert!(index.search("\"unbalanced AND (", 10).is_ok());
    }

    #[test]
    fn all_tags_counts_membership() {
        let index = Index::open_in_memory().unwrap();
        index
            .upsert_note(&record("a.md", "", &["rust", "notes"], &[]))
            .unwrap();
        index.upsert_note(&record("b.md", "", &["rust"], &[])).unwrap();

        let tags = index.all_tags().unwrap();
        assert_eq!(tags[0].tag, "rust");
        assert_eq!(tags[0].count, 2);
        assert_eq!(tags[1].tag, "notes");
        assert_eq!(tags[1].count, 1);
    }

    #[test]
    fn graph_includes_unresolved_targets() {
        let index = Index::open_in_memory().unwrap();
        index
            .upsert_note(&record("a.md", "", &[], &["b.md", "ghost"]))
            .unwrap();
        index.upsert_note(&record("b.md", "", &[], &[])).unwrap();

        let graph = index.graph().unwrap();
        let ids: Vec<_> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a.md", "b.md", "ghost"]);
        let ghost = graph.nodes.iter().find(|n| n.id == "ghost").unwrap();
        assert!(!ghost.resolved);
        assert!(ghost.title.is_empty());
        assert_eq!(graph.edges.len(), 2);
    }

    #[test]
    fn search_empty_query_is_empty() {
        let index = Index::open_in_memory().unwrap();
        assert!(index.search("   ", 10).unwrap().is_empty());
    }
}
