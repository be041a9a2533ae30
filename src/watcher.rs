use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind as FsEventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use notify_debouncer_full::{new_debouncer, DebouncedEvent, Debouncer, FileIdMap};
use tokio::sync::mpsc;

use crate::broker::{Broker, EventKind};
use crate::error::{Error, Result};
use crate::services::index::{Index, NoteRecord};
use crate::services::parser;
use crate::services::reconciler;
use crate::services::vault::{self, sha256_hex, Vault};

/// Debounce window for raw filesystem notifications.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Delay before a rename-triggered reconciliation sweep; further renames
/// within the window coalesce into one sweep.
const RECONCILE_DELAY: Duration = Duration::from_millis(200);

/// One retry after a read that raced an external editor's own rename.
const READ_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Running watcher. `shutdown` stops it gracefully; just dropping the
/// handle also signals the loop to stop, without waiting for it.
pub struct WatcherHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
    /// Stop watching: drains any pending reconcile sweep, then closes the
    /// OS watch.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.try_send(());
        let _ = self.task.await;
    }
}

/// Watch the vault root recursively and keep the index and broker in step
/// with external edits.
pub fn start(vault: Arc<Vault>, index: Arc<Index>, broker: Broker) -> Result<WatcherHandle> {
    let (tx, rx) = mpsc::channel::<Vec<DebouncedEvent>>(100);

    let mut debouncer = new_debouncer(
        DEBOUNCE,
        None,
        move |result: std::result::Result<Vec<DebouncedEvent>, Vec<notify::Error>>| {
            if let Ok(events) = result {
                let _ = tx.blocking_send(events);
            }
        },
    )
    .map_err(|e| Error::Internal(format!("create file watcher: {e}")))?;

    debouncer
        .watcher()
        .watch(vault.root(), RecursiveMode::Recursive)
        .map_err(|e| Error::Internal(format!("watch {}: {e}", vault.root().display())))?;

    tracing::info!("file watcher started for {}", vault.root().display());

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let task = tokio::spawn(run_loop(debouncer, rx, shutdown_rx, vault, index, broker));

    Ok(WatcherHandle { shutdown_tx, task })
}

async fn run_loop(
    debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
    mut rx: mpsc::Receiver<Vec<DebouncedEvent>>,
    mut shutdown_rx: mpsc::Receiver<()>,
    vault: Arc<Vault>,
    index: Arc<Index>,
    broker: Broker,
) {
    // Keep the OS watch alive for the lifetime of the loop.
    let _debouncer = debouncer;
    let mut reconcile_at: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                if reconcile_at.is_some() {
                    run_sweep(&vault, &index, &broker);
                }
                break;
            }
            batch = rx.recv() => match batch {
                Some(events) => {
                    for event in &events {
                        if process_event(event, &vault, &index, &broker).await {
                            reconcile_at =
                                Some(tokio::time::Instant::now() + RECONCILE_DELAY);
                        }
                    }
                }
                None => break,
            },
            _ = sleep_until_opt(reconcile_at), if reconcile_at.is_some() => {
                reconcile_at = None;
                run_sweep(&vault, &index, &broker);
            }
        }
    }

    tracing::info!("file watcher stopped");
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn run_sweep(vault: &Vault, index: &Index, broker: &Broker) {
    match reconciler::reconcile(vault, index, Some(broker)) {
        Ok(stats) => tracing::debug!(
            indexed = stats.indexed,
            removed = stats.removed,
            "rename reconcile sweep done"
        ),
        Err(e) => tracing::warn!("rename reconcile sweep failed: {e}"),
    }
}

/// Apply one debounced event. Returns true when a reconciliation sweep
/// should be scheduled (rename fallout).
async fn process_event(
    event: &DebouncedEvent,
    vault: &Vault,
    index: &Index,
    broker: &Broker,
) -> bool {
    let mut wants_reconcile = false;

    match &event.kind {
        FsEventKind::Create(_) => {
            for path in &event.paths {
                if path.is_dir() {
                    index_new_directory(path, vault, index, broker).await;
                } else {
                    upsert_path(path, vault, index, broker).await;
                }
            }
        }
        FsEventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if event.paths.len() == 2 => {
                remove_path(&event.paths[0], vault, index, broker);
                upsert_path(&event.paths[1], vault, index, broker).await;
                wants_reconcile = true;
            }
            RenameMode::From => {
                for path in &event.paths {
                    remove_path(path, vault, index, broker);
                }
                wants_reconcile = true;
            }
            RenameMode::To => {
                for path in &event.paths {
                    upsert_path(path, vault, index, broker).await;
                }
            }
            _ => {
                // Ambiguous rename half: resolve by what is on disk now.
                for path in &event.paths {
                    if path.exists() {
                        upsert_path(path, vault, index, broker).await;
                    } else {
                        remove_path(path, vault, index, broker);
                    }
                }
                wants_reconcile = true;
            }
        },
        FsEventKind::Modify(_) => {
            for path in &event.paths {
                upsert_path(path, vault, index, broker).await;
            }
        }
        FsEventKind::Remove(_) => {
            for path in &event.paths {
                remove_path(path, vault, index, broker);
            }
        }
        _ => {}
    }

    wants_reconcile
}

fn is_markdown(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("md")
}

fn is_ignored(path: &Path) -> bool {
    vault::is_tmp_file(path)
        || path.components().any(|c| {
            c.as_os_str()
                .to_str()
                .map(|s| s.starts_with('.'))
                .unwrap_or(false)
        })
}

/// A directory appeared (created or moved in): index every `.md` beneath
/// it, since their individual events may never arrive.
async fn index_new_directory(path: &Path, vault: &Vault, index: &Index, broker: &Broker) {
    if is_ignored(path) {
        return;
    }
    let rel = vault.relative(path);
    let entries = match vault.list(&rel) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("walk new directory {rel}: {e}");
            return;
        }
    };
    for entry in entries {
        let abs = vault.root().join(&entry.path);
        upsert_path(&abs, vault, index, broker).await;
    }
}

async fn upsert_path(path: &Path, vault: &Vault, index: &Index, broker: &Broker) {
    if !is_markdown(path) || is_ignored(path) {
        return;
    }
    let rel = vault.relative(path);
    if vault.is_recent_self_write(&rel) {
        // Echo of our own API write; the service already indexed it.
        return;
    }

    // External editors often save via their own temp-and-rename; a read
    // can race that and miss. Retry once.
    let bytes = match vault.read(&rel) {
        Ok(bytes) => bytes,
        Err(_) => {
            tokio::time::sleep(READ_RETRY_DELAY).await;
            match vault.read(&rel) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("watcher: read {rel} failed after retry: {e}");
                    return;
                }
            }
        }
    };

    let checksum = sha256_hex(&bytes);
    let prior = match index.get_checksum(&rel) {
        Ok(prior) => prior,
        Err(e) => {
            tracing::warn!("watcher: checksum lookup for {rel} failed: {e}");
            None
        }
    };
    if prior.as_deref() == Some(checksum.as_str()) {
        return;
    }

    let updated_at = vault.mtime(&rel).unwrap_or(0);
    let content = String::from_utf8_lossy(&bytes);
    let parsed = parser::parse(&content);
    let record = NoteRecord {
        path: rel.clone(),
        title: parsed.title,
        checksum,
        tags: parsed.tags,
        body: parsed.body,
        links: parsed.links,
        updated_at,
    };
    if let Err(e) = index.upsert_note(&record) {
        tracing::warn!("watcher: index {rel} failed: {e}");
        return;
    }

    let kind = if prior.is_some() {
        EventKind::NoteUpdated
    } else {
        tracing::debug!("external file indexed: {rel}");
        EventKind::NoteCreated
    };
    broker.publish_note_event(kind, &rel);
}

fn remove_path(path: &Path, vault: &Vault, index: &Index, broker: &Broker) {
    if !is_markdown(path) || is_ignored(path) {
        return;
    }
    let rel = vault.relative(path);
    if vault.is_recent_self_write(&rel) {
        return;
    }

    let was_indexed = matches!(index.get_checksum(&rel), Ok(Some(_)));
    if let Err(e) = index.delete_note(&rel) {
        tracing::warn!("watcher: remove {rel} from index failed: {e}");
        return;
    }
    if was_indexed {
        tracing::debug!("external file removed: {rel}");
        broker.publish_note_event(EventKind::NoteDeleted, &rel);
    }
}
