use std::collections::HashSet;

use crate::broker::{Broker, EventKind};
use crate::error::Result;
use crate::services::index::{Index, NoteRecord};
use crate::services::parser;
use crate::services::vault::{sha256_hex, Vault};

/// Outcome of one reconciliation sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileStats {
    pub indexed: usize,
    pub removed: usize,
    pub skipped: usize,
}

/// Make the index match the vault.
///
/// Runs once at startup (before the server accepts requests) and again
/// from the watcher after rename storms. Files whose stored mtime matches
/// the disk mtime are skipped without reading; everything else is
/// re-hashed and upserted. Index rows without a file are removed.
///
/// With a broker, mutations are published as note events; the startup
/// sweep passes `None` since nothing is subscribed yet. Per-file errors
/// are logged and the sweep continues.
pub fn reconcile(vault: &Vault, index: &Index, broker: Option<&Broker>) -> Result<ReconcileStats> {
    let disk = vault.list("")?;
    let indexed = index.all_checksums()?;

    let mut stats = ReconcileStats::default();
    let mut seen: HashSet<String> = HashSet::with_capacity(disk.len());

    for entry in disk {
        seen.insert(entry.path.clone());

        let prior = indexed.get(&entry.path);
        if let Some((_, stored_mtime)) = prior {
            // Unchanged mtime is a cheap proxy for unchanged content.
            if *stored_mtime == entry.updated_at {
                stats.skipped += 1;
                continue;
            }
        }

        let bytes = match vault.read(&entry.path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("reconcile: read {} failed: {e}", entry.path);
                continue;
            }
        };
        let checksum = sha256_hex(&bytes);
        let changed = prior.map(|(c, _)| *c != checksum).unwrap_or(true);

        let content = String::from_utf8_lossy(&bytes);
        let parsed = parser::parse(&content);
        let record = NoteRecord {
            path: entry.path.clone(),
            title: parsed.title,
            checksum,
            tags: parsed.tags,
            body: parsed.body,
            links: parsed.links,
            updated_at: entry.updated_at,
        };
        if let Err(e) = index.upsert_note(&record) {
            tracing::warn!("reconcile: index {} failed: {e}", entry.path);
            continue;
        }
        stats.indexed += 1;

        if changed {
            if let Some(broker) = broker {
                let kind = if prior.is_some() {
                    EventKind::NoteUpdated
                } else {
                    EventKind::NoteCreated
                };
                broker.publish_note_event(kind, &entry.path);
            }
        }
    }

    for path in indexed.keys() {
        if seen.contains(path) {
            continue;
        }
        if let Err(e) = index.delete_note(path) {
            tracing::warn!("reconcile: remove stale row {path} failed: {e}");
            continue;
        }
        stats.removed += 1;
        if let Some(broker) = broker {
            broker.publish_note_event(EventKind::NoteDeleted, path);
        }
    }

    Ok(stats)
}
