use serde::Serialize;

/// Full note payload for editor views and tool callers.
/// Content is the raw on-disk text; everything else is derived from it.
#[derive(Debug, Clone, Serialize)]
pub struct Note {
    pub path: String,
    pub title: String,
    pub content: String,
    pub checksum: String,
    pub frontmatter: serde_yaml::Mapping,
    pub tags: Vec<String>,
    pub links: Vec<String>,
    pub backlinks: Vec<String>,
    /// RFC 3339 file modification time.
    pub updated_at: String,
}

/// Lightweight note representation for list views.
/// Read-only, served from the index.
#[derive(Debug, Clone, Serialize)]
pub struct NoteSummary {
    pub path: String,
    pub title: String,
    pub tags: Vec<String>,
    pub updated_at: String,
}

/// One full-text search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub title: String,
    /// Matched window with `<b>…</b>` markers (FTS) or a body prefix (fallback).
    pub snippet: String,
}

/// Node of the link graph. Unresolved wikilink targets appear with an
/// empty title and `resolved == false`.
#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub title: String,
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub kind: String,
}

/// Whole-vault link graph.
#[derive(Debug, Clone, Serialize)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}
