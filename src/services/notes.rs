use std::sync::Arc;

use crate::broker::{Broker, EventKind};
use crate::error::{Error, Result};
use crate::models::note::Note;
use crate::services::index::{rfc3339, Index, NoteRecord};
use crate::services::parser;
use crate::services::vault::{sha256_hex, Vault};

/// Coordinates Vault and Index for note CRUD. The vault write always
/// happens first; the index follows. If the index write is missed, the
/// watcher and the startup reconciler restore consistency.
pub struct NoteService {
    vault: Arc<Vault>,
    index: Arc<Index>,
    broker: Broker,
}

impl NoteService {
    pub fn new(vault: Arc<Vault>, index: Arc<Index>, broker: Broker) -> Self {
        NoteService {
            vault,
            index,
            broker,
        }
    }

    /// Create a new note. Fails with `AlreadyExists` if the file is
    /// already on disk.
    pub fn create(&self, path: &str, content: &str) -> Result<Note> {
        validate_note_path(path)?;
        if self.vault.exists(path)? {
            return Err(Error::AlreadyExists(path.to_string()));
        }

        self.vault.write(path, content.as_bytes())?;
        let note = self.index_and_project(path, content)?;
        self.broker.publish_note_event(EventKind::NoteCreated, path);
        Ok(note)
    }

    /// Read a note straight from disk, with backlinks from the index.
    pub fn get(&self, path: &str) -> Result<Note> {
        validate_note_path(path)?;
        let bytes = self.vault.read(path)?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        self.project(path, content)
    }

    /// Overwrite a note. A non-empty `if_match` must equal the current
    /// checksum or the update fails with `Conflict`.
    pub fn update(&self, path: &str, content: &str, if_match: Option<&str>) -> Result<Note> {
        validate_note_path(path)?;
        let current = self.vault.read(path)?;

        if let Some(expected) = if_match.filter(|m| !m.is_empty()) {
            let actual = sha256_hex(&current);
            if expected != actual {
                return Err(Error::Conflict(path.to_string()));
            }
        }

        self.vault.write(path, content.as_bytes())?;
        let note = self.index_and_project(path, content)?;
        self.broker.publish_note_event(EventKind::NoteUpdated, path);
        Ok(note)
    }

    /// Delete from disk, then from the index. The two are not atomic:
    /// a failed index delete is logged and later repaired by the watcher
    /// or the reconciler.
    pub fn delete(&self, path: &str) -> Result<()> {
        validate_note_path(path)?;
        self.vault.delete(path)?;
        if let Err(e) = self.index.delete_note(path) {
            tracing::warn!("index delete for {path} failed, reconciler will catch up: {e}");
        }
        self.broker.publish_note_event(EventKind::NoteDeleted, path);
        Ok(())
    }

    /// Move a note to a new path. Link targets keep the raw strings their
    /// authors wrote, so edges pointing at the old name simply become
    /// unresolved graph nodes.
    pub fn rename(&self, old: &str, new: &str) -> Result<Note> {
        validate_note_path(old)?;
        validate_note_path(new)?;

        self.vault.rename(old, new)?;

        let bytes = self.vault.read(new)?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        let note = self.index_and_project(new, &content)?;

        if let Err(e) = self.index.delete_note(old) {
            tracing::warn!("index delete for {old} failed, reconciler will catch up: {e}");
        }

        self.broker.publish_note_event(EventKind::NoteDeleted, old);
        self.broker.publish_note_event(EventKind::NoteCreated, new);
        Ok(note)
    }

    fn index_and_project(&self, path: &str, content: &str) -> Result<Note> {
        let updated_at = self.vault.mtime(path)?;
        let parsed = parser::parse(content);

        self.index.upsert_note(&NoteRecord {
            path: path.to_string(),
            title: parsed.title.clone(),
            checksum: sha256_hex(content.as_bytes()),
            tags: parsed.tags.clone(),
            body: parsed.body.clone(),
            links: parsed.links.clone(),
            updated_at,
        })?;

        self.assemble(path, content.to_string(), parsed, updated_at)
    }

    fn project(&self, path: &str, content: String) -> Result<Note> {
        let updated_at = self.vault.mtime(path)?;
        let parsed = parser::parse(&content);
        self.assemble(path, content, parsed, updated_at)
    }

    fn assemble(
        &self,
        path: &str,
        content: String,
        parsed: parser::ParsedNote,
        updated_at: i64,
    ) -> Result<Note> {
        let backlinks = self.index.backlinks_for_note(path)?;
        Ok(Note {
            path: path.to_string(),
            title: parsed.title,
            checksum: sha256_hex(content.as_bytes()),
            content,
            frontmatter: parsed.frontmatter,
            tags: parsed.tags,
            links: parsed.links,
            backlinks,
            updated_at: rfc3339(updated_at),
        })
    }
}

fn validate_note_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::Invalid("empty note path".into()));
    }
    if !path.ends_with(".md") {
        return Err(Error::Invalid(format!("not a markdown path: {path}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use std::time::Duration;
    use tempfile::TempDir;

    fn service() -> (TempDir, NoteService) {
        let dir = TempDir::new().unwrap();
        let vault = Arc::new(Vault::open(dir.path()).unwrap());
        let index = Arc::new(Index::open_in_memory().unwrap());
        let broker = Broker::start(Duration::from_secs(3600));
        (dir, NoteService::new(vault, index, broker))
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (_dir, svc) = service();
        let created = svc.create("hello.md", "# Hello\nworld").unwrap();
        assert_eq!(created.title, "Hello");

        let got = svc.get("hello.md").unwrap();
        assert_eq!(got.content, "# Hello\nworld");
        assert_eq!(got.checksum, sha256_hex(b"# Hello\nworld"));
        assert_eq!(got.checksum, created.checksum);
    }

    #[tokio::test]
    async fn create_existing_is_already_exists() {
        let (_dir, svc) = service();
        svc.create("a.md", "one").unwrap();
        assert!(matches!(
            svc.create("a.md", "two"),
            Err(Error::AlreadyExists(_))
        ));
        // Original content untouched.
        assert_eq!(svc.get("a.md").unwrap().content, "one");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (_dir, svc) = service();
        assert!(matches!(svc.get("nope.md"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn non_markdown_path_is_invalid() {
        let (_dir, svc) = service();
        assert!(matches!(svc.create("a.txt", "x"), Err(Error::Invalid(_))));
        assert!(matches!(svc.get(""), Err(Error::Invalid(_))));
    }

    #[tokio::test]
    async fn update_checks_optimistic_checksum() {
        let (_dir, svc) = service();
        let v1 = svc.create("lock.md", "v1").unwrap();

        let v2 = svc.update("lock.md", "v2", Some(&v1.checksum)).unwrap();
        assert_ne!(v2.checksum, v1.checksum);

        // Stale checksum loses; disk keeps v2.
        assert!(matches!(
            svc.update("lock.md", "v3", Some(&v1.checksum)),
            Err(Error::Conflict(_))
        ));
        assert_eq!(svc.get("lock.md").unwrap().content, "v2");

        // Empty If-Match means unconditional.
        svc.update("lock.md", "v4", Some("")).unwrap();
        svc.update("lock.md", "v5", None).unwrap();
    }

    #[tokio::test]
    async fn update_is_idempotent_via_new_checksum() {
        let (_dir, svc) = service();
        svc.create("a.md", "v0").unwrap();
        let first = svc.update("a.md", "same", None).unwrap();
        let second = svc
            .update("a.md", "same", Some(&first.checksum))
            .unwrap();
        assert_eq!(first.checksum, second.checksum);
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let (_dir, svc) = service();
        assert!(matches!(
            svc.update("ghost.md", "x", None),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_twice_reports_not_found() {
        let (_dir, svc) = service();
        svc.create("x.md", "x").unwrap();
        svc.delete("x.md").unwrap();
        assert!(matches!(svc.delete("x.md"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn rename_moves_note_and_index_row() {
        let (_dir, svc) = service();
        svc.create("old.md", "# Moved").unwrap();

        let note = svc.rename("old.md", "sub/new.md").unwrap();
        assert_eq!(note.path, "sub/new.md");
        assert_eq!(note.title, "Moved");

        assert!(matches!(svc.get("old.md"), Err(Error::NotFound(_))));
        assert_eq!(svc.get("sub/new.md").unwrap().content, "# Moved");
    }

    #[tokio::test]
    async fn rename_refuses_existing_destination() {
        let (_dir, svc) = service();
        svc.create("a.md", "a").unwrap();
        svc.create("b.md", "b").unwrap();
        assert!(matches!(
            svc.rename("a.md", "b.md"),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn backlinks_follow_wikilinks() {
        let (_dir, svc) = service();
        svc.create("a.md", "links to [[b]]").unwrap();
        svc.create("b.md", "# B").unwrap();

        let b = svc.get("b.md").unwrap();
        assert_eq!(b.backlinks, vec!["a.md"]);

        svc.delete("a.md").unwrap();
        let b = svc.get("b.md").unwrap();
        assert!(b.backlinks.is_empty());
    }

    #[tokio::test]
    async fn frontmatter_and_tags_appear_in_projection() {
        let (_dir, svc) = service();
        let note = svc
            .create("t.md", "---\ntitle: Tagged\ntags: [x]\n---\nBody #y")
            .unwrap();
        assert_eq!(note.title, "Tagged");
        assert_eq!(note.tags, vec!["x", "y"]);
    }
}
